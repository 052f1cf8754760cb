//! TUN device abstraction.
//!
//! The tunnel engine only needs poll-based reads and writes of whole IP
//! packets; everything else about the device (address assignment, routes,
//! driver installation) is done by the platform layer. The poll shape keeps
//! the trait object-safe so the engine can hold a `dyn Tun`.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::{
    future::poll_fn,
    io,
    task::{Context, Poll},
};

pub mod channel;
#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub use linux::TunDevice;

pub trait Tun: Send + Sync + 'static {
    /// Attempt to read one packet into `buf`.
    ///
    /// A result of `Ok(0)` means the device is gone.
    fn poll_recv(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>>;

    /// Attempt to write one packet.
    fn poll_send(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>>;

    /// The name of the TUN device.
    fn name(&self) -> &str;
}

pub async fn recv(tun: &dyn Tun, buf: &mut [u8]) -> io::Result<usize> {
    poll_fn(|cx| tun.poll_recv(cx, buf)).await
}

pub async fn send(tun: &dyn Tun, buf: &[u8]) -> io::Result<usize> {
    poll_fn(|cx| tun.poll_send(cx, buf)).await
}
