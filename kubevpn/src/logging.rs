//! Logging setup.
//!
//! The daemon installs two layers over the same filter: one for its own
//! stderr and one that tees formatted events into a broadcast channel so
//! `DaemonLogs` clients can follow along.

use std::io;

use anyhow::{Context as _, Result};
use tokio::sync::broadcast;
use tracing_subscriber::{
    EnvFilter, Layer as _, Registry, fmt, fmt::MakeWriter, layer::SubscriberExt as _,
};

use crate::config;

/// Capacity of the log tee; slow `DaemonLogs` readers drop lines rather
/// than stall the process.
const TEE_CAPACITY: usize = 1024;

pub fn filter() -> EnvFilter {
    if let Ok(directives) = std::env::var(EnvFilter::DEFAULT_ENV) {
        return EnvFilter::new(directives);
    }

    if config::debug() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    }
}

/// Logging for the daemon process. Returns the sender feeding
/// `DaemonLogs` streams.
pub fn init_daemon() -> Result<broadcast::Sender<Vec<u8>>> {
    let (tee_tx, _) = broadcast::channel(TEE_CAPACITY);

    let stderr_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_filter(filter());
    let tee_layer = fmt::layer()
        .with_writer(Tee {
            tx: tee_tx.clone(),
        })
        .with_ansi(false)
        .with_filter(filter());

    let subscriber = Registry::default().with(stderr_layer).with(tee_layer);
    tracing::subscriber::set_global_default(subscriber)
        .context("Could not set global default subscriber")?;

    Ok(tee_tx)
}

/// Logging for the thin client commands.
pub fn init_client() -> Result<()> {
    let layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(filter());

    tracing::subscriber::set_global_default(Registry::default().with(layer))
        .context("Could not set global default subscriber")?;

    Ok(())
}

#[derive(Clone)]
pub struct Tee {
    tx: broadcast::Sender<Vec<u8>>,
}

impl Tee {
    pub fn new(tx: broadcast::Sender<Vec<u8>>) -> Self {
        Self { tx }
    }
}

impl io::Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Nobody listening is fine; `DaemonLogs` subscribers come and go.
        let _ = self.tx.send(buf.to_vec());

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Tee {
    type Writer = Tee;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::util::SubscriberInitExt as _;

    use super::*;

    #[test]
    fn tee_layer_captures_formatted_events() {
        let (tx, mut rx) = broadcast::channel(16);
        let layer = fmt::layer().with_writer(Tee::new(tx)).with_ansi(false);
        let subscriber = Registry::default().with(layer);
        let _guard = subscriber.set_default();

        tracing::info!("hello from the daemon");

        let line = rx.try_recv().expect("event should have been teed");
        assert!(String::from_utf8(line).unwrap().contains("hello from the daemon"));
    }
}
