//! The daemon's actions: one internally-tagged enum instead of a handler
//! registry. Each arm knows whether it answers with a single JSON blob or
//! a stream.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context as _, Result, bail};
use cluster::Mode;
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt as _, net::unix::OwnedWriteHalf, sync::broadcast};
use tokio_util::sync::CancellationToken;

use super::{ConnectState, Daemon, Progress};
use crate::{connect::ConnectOptions, reverse::ReverseOptions};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Request {
    DaemonUptime {},
    DaemonStop {},
    DaemonUpgrade {},
    DaemonLogs {},
    #[serde(rename_all = "camelCase")]
    ConnectStart {
        #[serde(default)]
        kubeconfig_path: String,
        #[serde(default)]
        namespace: String,
    },
    ConnectStop {},
    ConnectInfo {},
    #[serde(rename_all = "camelCase")]
    ReverseStart {
        #[serde(default)]
        kubeconfig_path: String,
        #[serde(default)]
        namespace: String,
        #[serde(default = "default_mode")]
        mode: Mode,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        workloads: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    ReverseStop {
        #[serde(default)]
        kubeconfig_path: String,
        #[serde(default)]
        namespace: String,
        #[serde(default)]
        workloads: Vec<String>,
    },
    /// Waits for up to ten seconds or until cancelled; only the protocol
    /// tests speak it.
    #[cfg(test)]
    Sleep {},
}

fn default_mode() -> Mode {
    Mode::Reverse
}

const KNOWN_ACTIONS: &[&str] = &[
    "DaemonUptime",
    "DaemonStop",
    "DaemonUpgrade",
    "DaemonLogs",
    "ConnectStart",
    "ConnectStop",
    "ConnectInfo",
    "ReverseStart",
    "ReverseStop",
    #[cfg(test)]
    "Sleep",
];

pub(super) fn is_known_action(action: &str) -> bool {
    KNOWN_ACTIONS.contains(&action)
}

impl Request {
    pub(super) async fn handle(
        self,
        daemon: &Arc<Daemon>,
        cancel: CancellationToken,
        conn: &mut OwnedWriteHalf,
    ) -> Result<()> {
        match self {
            Request::DaemonUptime {} => {
                conn.write_all(daemon.started_at().to_string().as_bytes())
                    .await?;

                Ok(())
            }
            Request::DaemonStop {} | Request::DaemonUpgrade {} => {
                if let Err(e) = daemon.platform().uninstall_tun().await {
                    tracing::warn!("Failed to uninstall TUN driver: {e:#}");
                }
                daemon.shutdown_token().cancel();

                conn.write_all(b"{}").await?;

                Ok(())
            }
            Request::DaemonLogs {} => {
                let mut logs = daemon.subscribe_logs();

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        line = logs.recv() => match line {
                            Ok(line) => conn.write_all(&line).await?,
                            Err(broadcast::error::RecvError::Lagged(dropped)) => {
                                tracing::debug!(%dropped, "Log follower fell behind");
                            }
                            Err(broadcast::error::RecvError::Closed) => return Ok(()),
                        },
                    }
                }
            }
            Request::ConnectStart {
                kubeconfig_path,
                namespace,
            } => {
                let mut progress = Progress::new(conn);
                connect_start(daemon, &kubeconfig_path, &namespace, &mut progress).await?;

                progress
                    .say("Now you can access resources in the kubernetes cluster, enjoy it :)")
                    .await;

                Ok(())
            }
            Request::ConnectStop {} => {
                let mut progress = Progress::new(conn);

                match daemon.state().lock().await.take() {
                    None => {
                        progress.say("not needs to disconnect from cluster").await;
                    }
                    Some(current) => {
                        current.cancel.cancel();
                        current.options.cleanup().await;
                        progress.say("success disconnect from cluster").await;
                    }
                }

                Ok(())
            }
            Request::ConnectInfo {} => {
                let mut progress = Progress::new(conn);
                let state = daemon.state().lock().await;

                let Some(current) = state.as_ref() else {
                    progress.say("not connected yet").await;
                    return Ok(());
                };

                progress
                    .say(format!("namespace: {}", current.options.namespace))
                    .await;
                progress
                    .say(format!("namespace id: {}", current.options.namespace_id))
                    .await;
                if let Some((ip, prefix)) = current.options.local_tun_ip() {
                    progress.say(format!("tunnel ip: {ip}/{prefix}")).await;
                }
                let cidrs = current
                    .options
                    .cidrs()
                    .iter()
                    .map(|cidr| cidr.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                progress.say(format!("routed cidrs: {cidrs}")).await;
                for workload in &current.reversed {
                    progress
                        .say(format!(
                            "reversed: {} -> {}",
                            workload.deployment, workload.shadow_ip
                        ))
                        .await;
                }

                Ok(())
            }
            Request::ReverseStart {
                kubeconfig_path,
                namespace,
                mode,
                headers,
                workloads,
            } => {
                let mut progress = Progress::new(conn);

                let connected = daemon.state().lock().await.is_some();
                if !connected {
                    progress.say("not connect to cluster, call connect ...").await;
                    connect_start(daemon, &kubeconfig_path, &namespace, &mut progress).await?;
                }

                let mut state = daemon.state().lock().await;
                let Some(current) = state.as_mut() else {
                    bail!("connect to cluster failed");
                };

                let (local_tun_ip, _) = current
                    .options
                    .local_tun_ip()
                    .context("tunnel has no local IP")?;

                let options = ReverseOptions::new(
                    current.options.client(),
                    &current.options.namespace,
                    mode,
                    headers,
                    workloads,
                );
                let reversed = options
                    .do_reverse(current.options.dhcp(), local_tun_ip, &mut progress)
                    .await?;
                current.reversed.extend(reversed);

                progress
                    .say(
                        "Now you can access resources in the kubernetes cluster, the traffic \
                         with your tag is routed to your local computer :)",
                    )
                    .await;

                Ok(())
            }
            Request::ReverseStop {
                kubeconfig_path: _,
                namespace: _,
                workloads,
            } => {
                let mut progress = Progress::new(conn);
                let mut state = daemon.state().lock().await;

                let Some(current) = state.as_mut() else {
                    progress.say("not connect to cluster").await;
                    return Ok(());
                };

                let options = ReverseOptions::new(
                    current.options.client(),
                    &current.options.namespace,
                    Mode::Reverse,
                    BTreeMap::new(),
                    workloads,
                );
                let released = options
                    .do_reverse_stop(current.options.dhcp(), &current.reversed, &mut progress)
                    .await?;

                current
                    .reversed
                    .retain(|workload| !released.contains(&workload.shadow_ip));
                progress.say("workloads restored").await;

                Ok(())
            }
            #[cfg(test)]
            Request::Sleep {} => {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(std::time::Duration::from_secs(10)) => {}
                }

                conn.write_all(b"\"well done\"").await?;

                Ok(())
            }
        }
    }
}

/// Shared by `ConnectStart` and the auto-connect of `ReverseStart`.
///
/// Idempotent for the same namespace ID; a different namespace stops the
/// current connection first.
async fn connect_start(
    daemon: &Arc<Daemon>,
    kubeconfig_path: &str,
    namespace: &str,
    progress: &mut Progress<'_>,
) -> Result<()> {
    let mut options =
        ConnectOptions::init_client(kubeconfig_path, namespace, daemon.platform()).await?;
    progress
        .say(format!(
            "kubeconfig path: {kubeconfig_path}, namespace: {}",
            options.namespace
        ))
        .await;

    let mut state = daemon.state().lock().await;

    if let Some(current) = state.as_ref() {
        if current.options.namespace_id == options.namespace_id {
            progress.say("already connected").await;
            return Ok(());
        }

        // Switching namespaces is stop-then-start.
        progress.say("disconnecting from the previous namespace").await;
        if let Some(current) = state.take() {
            current.cancel.cancel();
            current.options.cleanup().await;
        }
    }

    let cancel = daemon.shutdown_token().child_token();

    match options.do_connect(cancel.clone(), progress).await {
        Ok(()) => {
            *state = Some(ConnectState {
                options,
                cancel,
                reversed: Vec::new(),
            });

            Ok(())
        }
        Err(e) => {
            cancel.cancel();
            options.cleanup().await;

            Err(e)
        }
    }
}
