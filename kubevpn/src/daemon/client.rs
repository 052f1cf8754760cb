//! The command side of the daemon protocol.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context as _, Result, bail};
use serde::de::DeserializeOwned;
use tokio::{
    io::{AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _},
    net::UnixStream,
};

use super::Request;
use crate::config;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DaemonClient {
    sock_path: PathBuf,
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonClient {
    pub fn new() -> Self {
        Self {
            sock_path: config::daemon_sock(),
        }
    }

    pub fn with_path(sock_path: PathBuf) -> Self {
        Self { sock_path }
    }

    pub fn sock_exists(&self) -> bool {
        self.sock_path.exists()
    }

    async fn connect_and_send(&self, request: &Request) -> Result<UnixStream> {
        let body = serde_json::to_vec(request).context("Failed to serialize request")?;
        let len = u16::try_from(body.len()).context("request too large")?;

        let mut stream = tokio::time::timeout(
            CONNECT_TIMEOUT,
            UnixStream::connect(&self.sock_path),
        )
        .await
        .context("Timed out dialing the daemon")?
        .context("Failed to dial the daemon")?;

        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(&body).await?;

        Ok(stream)
    }

    /// One-shot request, one JSON blob back. An empty response is `None`;
    /// a non-JSON response is the handler's error string.
    pub async fn send_json<R: DeserializeOwned>(&self, request: &Request) -> Result<Option<R>> {
        anyhow::ensure!(self.sock_exists(), "daemon socket does not exist");

        let mut stream = self.connect_and_send(request).await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;

        if response.is_empty() {
            return Ok(None);
        }

        match serde_json::from_slice(&response) {
            Ok(value) => Ok(Some(value)),
            Err(_) => bail!("{}", String::from_utf8_lossy(&response)),
        }
    }

    /// Streaming request; the response is copied into `out` until the
    /// daemon closes the stream. Ctrl+C is forwarded as a pseudo-signal
    /// line so the handler can unwind.
    pub async fn send_stream(
        &self,
        request: &Request,
        out: &mut (impl AsyncWrite + Unpin),
    ) -> Result<()> {
        let stream = self.connect_and_send(request).await?;
        let (mut read, mut write) = stream.into_split();

        tokio::select! {
            copied = tokio::io::copy(&mut read, out) => {
                copied.context("Failed to read response stream")?;
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = write.write_all(b"9\n").await;
                let _ = tokio::io::copy(&mut read, out).await;
            }
        }

        Ok(())
    }

    /// The daemon's start timestamp, in Unix seconds.
    pub async fn uptime(&self) -> Result<i64> {
        let mut stream = self.connect_and_send(&Request::DaemonUptime {}).await?;

        let mut response = String::new();
        stream.read_to_string(&mut response).await?;

        response
            .trim()
            .parse()
            .with_context(|| format!("daemon answered uptime with `{response}`"))
    }

    /// Stops the daemon. A daemon that is already gone counts as stopped.
    pub async fn stop(&self) -> Result<()> {
        self.stop_with(&Request::DaemonStop {}).await
    }

    /// Asks the daemon to exit so a newer binary can take over.
    pub async fn upgrade(&self) -> Result<()> {
        self.stop_with(&Request::DaemonUpgrade {}).await
    }

    async fn stop_with(&self, request: &Request) -> Result<()> {
        if !self.sock_exists() {
            return Ok(());
        }

        match self.send_json::<serde_json::Value>(request).await {
            Ok(_) => Ok(()),
            Err(e) if is_daemon_gone(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn is_daemon_gone(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| {
                matches!(
                    io.kind(),
                    std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound
                )
            })
    })
}
