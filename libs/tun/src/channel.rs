//! An in-memory TUN backed by channels, for exercising the engine in tests.

use std::{
    io,
    task::{Context, Poll},
};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::Tun;

pub struct ChannelTun {
    name: String,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// The "operating system" side of a [`ChannelTun`].
///
/// Packets sent on `inject` show up as device reads; packets the engine
/// writes to the device arrive on `written`.
pub struct ChannelTunHandle {
    pub inject: mpsc::Sender<Vec<u8>>,
    pub written: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ChannelTun {
    pub fn new(name: impl Into<String>) -> (Self, ChannelTunHandle) {
        let (inject_tx, inject_rx) = mpsc::channel(64);
        let (written_tx, written_rx) = mpsc::unbounded_channel();

        let tun = Self {
            name: name.into(),
            inbound: Mutex::new(inject_rx),
            outbound: written_tx,
        };
        let handle = ChannelTunHandle {
            inject: inject_tx,
            written: written_rx,
        };

        (tun, handle)
    }
}

impl Tun for ChannelTun {
    fn poll_recv(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        let mut inbound = self.inbound.lock();

        match std::task::ready!(inbound.poll_recv(cx)) {
            Some(packet) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);

                Poll::Ready(Ok(len))
            }
            None => Poll::Ready(Ok(0)), // Closed, behaves like EOF.
        }
    }

    fn poll_send(&self, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.outbound
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;

        Poll::Ready(Ok(buf.len()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip() {
        let (tun, mut handle) = ChannelTun::new("utun-test");

        handle.inject.send(vec![1, 2, 3]).await.unwrap();

        let mut buf = [0u8; 16];
        let n = crate::recv(&tun, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);

        crate::send(&tun, &[4, 5, 6]).await.unwrap();
        assert_eq!(handle.written.recv().await.unwrap(), vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn closed_injector_reads_as_eof() {
        let (tun, handle) = ChannelTun::new("utun-test");
        drop(handle.inject);

        let mut buf = [0u8; 16];
        assert_eq!(crate::recv(&tun, &mut buf).await.unwrap(), 0);
    }
}
