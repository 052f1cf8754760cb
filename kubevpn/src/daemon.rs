//! The background daemon and its wire protocol.
//!
//! One Unix stream socket; requests are a `u16` big-endian length prefix
//! followed by that many bytes of JSON. After the request body the client
//! may send ASCII signal numbers, one per line, to forward cancellation.
//! Responses are either one JSON blob or a raw stream, depending on the
//! action; a handler error is written as the final bytes before close.

use std::{
    os::unix::fs::PermissionsExt as _,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context as _, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _, BufReader},
    net::{UnixListener, UnixStream, unix::OwnedReadHalf, unix::OwnedWriteHalf},
    sync::{Mutex, broadcast},
};
use tokio_util::sync::CancellationToken;

use crate::{
    connect::ConnectOptions,
    platform::Platform,
    reverse::ReversedWorkload,
};

mod actions;
mod client;

pub use actions::Request;
pub use client::DaemonClient;

const SIGKILL: i32 = 9;
const SIGQUIT: i32 = 3;
const SIGSTOP: i32 = 19;

/// The daemon-side record of the one active connection.
pub struct ConnectState {
    pub options: ConnectOptions,
    pub cancel: CancellationToken,
    pub reversed: Vec<ReversedWorkload>,
}

pub struct Daemon {
    sock_path: PathBuf,
    header_timeout: Duration,
    started_at: AtomicI64,
    shutdown: CancellationToken,
    state: Mutex<Option<ConnectState>>,
    logs: broadcast::Sender<Vec<u8>>,
    platform: Arc<dyn Platform>,
}

impl Daemon {
    pub fn new(
        sock_path: PathBuf,
        logs: broadcast::Sender<Vec<u8>>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        Self {
            sock_path,
            header_timeout: crate::config::DAEMON_HEADER_TIMEOUT,
            started_at: AtomicI64::new(0),
            shutdown: CancellationToken::new(),
            state: Mutex::new(None),
            logs,
            platform,
        }
    }

    #[cfg(test)]
    fn header_timeout(mut self, timeout: Duration) -> Self {
        self.header_timeout = timeout;
        self
    }

    /// Unix seconds at which the listener came up.
    pub fn started_at(&self) -> i64 {
        self.started_at.load(Ordering::Relaxed)
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<Vec<u8>> {
        self.logs.subscribe()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn platform(&self) -> Arc<dyn Platform> {
        self.platform.clone()
    }

    pub(crate) fn state(&self) -> &Mutex<Option<ConnectState>> {
        &self.state
    }

    /// Binds the socket and serves until asked to stop.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        if let Some(dir) = self.sock_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .context("Failed to create daemon directory")?;
        }
        // Remove the socket if a previous run left it there.
        let _ = tokio::fs::remove_file(&self.sock_path).await;

        let listener = UnixListener::bind(&self.sock_path).context("Couldn't bind UDS")?;
        let perms = std::fs::Permissions::from_mode(0o666);
        tokio::fs::set_permissions(&self.sock_path, perms).await?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        self.started_at.store(now, Ordering::Relaxed);

        tracing::info!("Daemon listening on {}", self.sock_path.display());

        loop {
            let stream = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::error!("Failed to accept connection: {e}");
                        continue;
                    }
                },
            };

            tokio::spawn(handle_connection(self.clone(), stream));
        }

        // An active connection does not survive the daemon.
        if let Some(current) = self.state.lock().await.take() {
            current.cancel.cancel();
            current.options.cleanup().await;
        }

        let _ = tokio::fs::remove_file(&self.sock_path).await;

        Ok(())
    }
}

async fn handle_connection(daemon: Arc<Daemon>, stream: UnixStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // The length prefix must arrive promptly; afterwards the stream may
    // stay open for as long as the handler runs.
    let mut len_buf = [0u8; 2];
    match tokio::time::timeout(daemon.header_timeout, reader.read_exact(&mut len_buf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            tracing::debug!("Failed to read request header: {e}");
            return;
        }
        Err(_) => {
            tracing::debug!("Timed out waiting for request header, closing");
            return;
        }
    }

    let mut body = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    if let Err(e) = reader.read_exact(&mut body).await {
        tracing::debug!("Failed to read request body: {e}");
        return;
    }

    let cancel = daemon.shutdown.child_token();
    let signal_task = tokio::spawn(forward_signals(reader, cancel.clone()));

    if let Err(e) = dispatch(&daemon, &body, cancel, &mut write_half).await {
        let _ = write_half.write_all(format!("{e:#}").as_bytes()).await;
    }

    let _ = write_half.shutdown().await;
    signal_task.abort();
}

/// Watches for trailing `"<signal>\n"` lines; a terminating signal cancels
/// the in-flight handler.
async fn forward_signals(reader: BufReader<OwnedReadHalf>, cancel: CancellationToken) {
    let mut lines = reader.lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(signal) = line.trim().parse::<i32>() else {
            continue;
        };

        if matches!(signal, SIGKILL | SIGQUIT | SIGSTOP) {
            tracing::debug!(%signal, "Client forwarded a terminating signal");
            cancel.cancel();
            return;
        }
    }
}

async fn dispatch(
    daemon: &Arc<Daemon>,
    body: &[u8],
    cancel: CancellationToken,
    conn: &mut OwnedWriteHalf,
) -> Result<()> {
    #[derive(serde::Deserialize)]
    struct Probe {
        #[serde(default)]
        action: String,
    }

    let probe: Probe = serde_json::from_slice(body).context("Failed to decode request")?;

    let request: Request = serde_json::from_slice(body).map_err(|e| {
        if actions::is_known_action(&probe.action) {
            anyhow!(e).context(format!("Failed to decode {} request", probe.action))
        } else {
            anyhow!("not support action: {}", probe.action)
        }
    })?;

    request.handle(daemon, cancel, conn).await
}

/// Streams handler progress both into the log and to the client.
pub struct Progress<'a> {
    out: Option<&'a mut OwnedWriteHalf>,
}

impl<'a> Progress<'a> {
    pub fn new(out: &'a mut OwnedWriteHalf) -> Self {
        Self { out: Some(out) }
    }

    /// A progress sink that only logs, for internally triggered actions.
    pub fn sink() -> Progress<'static> {
        Progress { out: None }
    }

    pub async fn say(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!("{message}");

        if let Some(out) = self.out.as_mut() {
            let _ = out.write_all(message.as_bytes()).await;
            let _ = out.write_all(b"\n").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    use super::*;
    use crate::platform::NoopPlatform;

    fn daemon(sock: PathBuf) -> Arc<Daemon> {
        let (logs, _) = broadcast::channel(16);
        Arc::new(Daemon::new(sock, logs, Arc::new(NoopPlatform)))
    }

    async fn start_daemon(daemon: &Arc<Daemon>) -> tokio::task::JoinHandle<Result<()>> {
        let task = tokio::spawn(daemon.clone().start());
        tokio::time::sleep(Duration::from_millis(200)).await;
        task
    }

    async fn raw_request(sock: &PathBuf, body: &[u8]) -> UnixStream {
        let mut stream = UnixStream::connect(sock).await.unwrap();
        stream
            .write_all(&(body.len() as u16).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(body).await.unwrap();
        stream
    }

    #[tokio::test]
    async fn uptime_reports_a_stable_start_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("daemon.sock");
        let daemon = daemon(sock.clone());
        let _task = start_daemon(&daemon).await;

        let client = DaemonClient::with_path(sock);
        let first = client.uptime().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = client.uptime().await.unwrap();

        assert_eq!(first, second);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        assert!((now - first) < 10);

        daemon.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn forwarded_signal_cancels_a_sleeping_handler() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("daemon.sock");
        let daemon = daemon(sock.clone());
        let _task = start_daemon(&daemon).await;

        let started = Instant::now();
        let mut stream = raw_request(&sock, br#"{"action":"Sleep"}"#).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        stream.write_all(b"9\n").await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();

        assert_eq!(response, b"\"well done\"");
        assert!(started.elapsed() < Duration::from_secs(8));

        daemon.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn unknown_actions_get_an_error_string() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("daemon.sock");
        let daemon = daemon(sock.clone());
        let _task = start_daemon(&daemon).await;

        let mut stream = raw_request(&sock, br#"{"action":"MakeCoffee"}"#).await;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"not support action: MakeCoffee");

        daemon.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn slow_header_closes_the_connection() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("daemon.sock");
        let (logs, _) = broadcast::channel(16);
        let daemon = Arc::new(
            Daemon::new(sock.clone(), logs, Arc::new(NoopPlatform))
                .header_timeout(Duration::from_millis(200)),
        );
        let _task = start_daemon(&daemon).await;

        let mut stream = UnixStream::connect(&sock).await.unwrap();

        // Send nothing; the server must hang up on us.
        let mut response = Vec::new();
        let read = tokio::time::timeout(
            Duration::from_secs(5),
            stream.read_to_end(&mut response),
        )
        .await;
        assert!(read.is_ok(), "server should have closed the connection");

        daemon.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn stop_shuts_the_daemon_down_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("daemon.sock");
        let daemon = daemon(sock.clone());
        let task = start_daemon(&daemon).await;

        let client = DaemonClient::with_path(sock);
        client.stop().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("daemon should shut down")
            .unwrap()
            .unwrap();

        // A second stop finds no daemon and still succeeds.
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn daemon_logs_streams_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("daemon.sock");
        let (logs, _keep) = broadcast::channel(16);
        let daemon = Arc::new(Daemon::new(
            sock.clone(),
            logs.clone(),
            Arc::new(NoopPlatform),
        ));
        let _task = start_daemon(&daemon).await;

        let mut stream = raw_request(&sock, br#"{"action":"DaemonLogs"}"#).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        logs.send(b"a log line\n".to_vec()).unwrap();

        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"a log line\n");

        stream.write_all(b"9\n").await.unwrap();
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();

        daemon.shutdown_token().cancel();
    }
}
