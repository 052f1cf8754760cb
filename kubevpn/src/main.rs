use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use cluster::Mode;
use kubevpn::{
    config,
    daemon::{Daemon, DaemonClient, Request},
    logging,
    platform::LinuxPlatform,
    signals,
};

#[derive(Parser)]
#[command(author, version, about = "A VPN into your Kubernetes cluster", long_about = None)]
struct Cli {
    /// Verbose logging.
    #[arg(long, global = true)]
    debug: bool,

    /// Path to the kubeconfig file.
    #[arg(long, global = true, env = "KUBECONFIG", default_value = "")]
    kubeconfig: String,

    /// Namespace to connect to.
    #[arg(short = 'n', long, global = true, default_value = "")]
    namespace: String,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the background daemon in the foreground.
    Daemon,
    /// Connect the workstation into the cluster.
    Connect,
    /// Disconnect from the cluster.
    Disconnect,
    /// Show what the daemon currently manages.
    Status,
    /// Redirect traffic for workloads to this workstation.
    Reverse {
        /// Workloads, e.g. `deployment/productpage`.
        workloads: Vec<String>,
        /// Only redirect requests carrying the routing tag.
        #[arg(long)]
        mesh: bool,
        /// `key=value` pairs; the first value becomes the routing tag.
        #[arg(long = "headers", value_parser = parse_key_val)]
        headers: Vec<(String, String)>,
    },
    /// Undo `reverse` for the given workloads (all of them if none given).
    Leave { workloads: Vec<String> },
    /// Follow the daemon's logs.
    Logs,
    /// Stop the daemon.
    Stop,
    /// Stop the daemon so a newer binary can take over.
    Upgrade,
    /// Print the daemon's start timestamp.
    Uptime,
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .ok_or_else(|| format!("`{raw}` is not a key=value pair"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    config::set_debug(cli.debug);

    match cli.command {
        Cmd::Daemon => run_daemon().await,
        command => {
            logging::init_client()?;
            run_client(command, cli.kubeconfig, cli.namespace).await
        }
    }
}

async fn run_daemon() -> Result<()> {
    // A previous daemon may still be alive, or may have left a stale
    // socket behind; only the former is a reason not to start.
    let client = DaemonClient::new();
    if client.sock_exists() {
        if client.uptime().await.is_ok() {
            bail!("daemon server already running");
        }
        let _ = std::fs::remove_file(config::daemon_sock());
    }

    let logs = logging::init_daemon()?;
    let daemon = Arc::new(Daemon::new(
        config::daemon_sock(),
        logs,
        Arc::new(LinuxPlatform),
    ));

    let shutdown = daemon.shutdown_token();
    tokio::spawn(async move {
        let mut terminate = match signals::Terminate::new() {
            Ok(terminate) => terminate,
            Err(e) => {
                tracing::error!("Failed to install signal handlers: {e:#}");
                return;
            }
        };
        terminate.recv().await;
        tracing::info!("Caught SIGINT / SIGTERM, shutting down");
        shutdown.cancel();
    });

    daemon.start().await
}

async fn run_client(command: Cmd, kubeconfig_path: String, namespace: String) -> Result<()> {
    let client = DaemonClient::new();
    let mut stdout = tokio::io::stdout();

    match command {
        Cmd::Daemon => unreachable!("handled in main"),
        Cmd::Connect => {
            client
                .send_stream(
                    &Request::ConnectStart {
                        kubeconfig_path,
                        namespace,
                    },
                    &mut stdout,
                )
                .await
        }
        Cmd::Disconnect => client.send_stream(&Request::ConnectStop {}, &mut stdout).await,
        Cmd::Status => client.send_stream(&Request::ConnectInfo {}, &mut stdout).await,
        Cmd::Reverse {
            workloads,
            mesh,
            headers,
        } => {
            let mode = if mesh { Mode::Mesh } else { Mode::Reverse };

            client
                .send_stream(
                    &Request::ReverseStart {
                        kubeconfig_path,
                        namespace,
                        mode,
                        headers: headers.into_iter().collect::<BTreeMap<_, _>>(),
                        workloads,
                    },
                    &mut stdout,
                )
                .await
        }
        Cmd::Leave { workloads } => {
            client
                .send_stream(
                    &Request::ReverseStop {
                        kubeconfig_path,
                        namespace,
                        workloads,
                    },
                    &mut stdout,
                )
                .await
        }
        Cmd::Logs => client.send_stream(&Request::DaemonLogs {}, &mut stdout).await,
        Cmd::Stop => client.stop().await,
        Cmd::Upgrade => client.upgrade().await,
        Cmd::Uptime => {
            use tokio::io::AsyncWriteExt as _;

            let uptime = client.uptime().await?;
            stdout
                .write_all(format!("{uptime}\n").as_bytes())
                .await
                .context("Failed to write to stdout")?;

            Ok(())
        }
    }
}
