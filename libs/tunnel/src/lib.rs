//! The tunnel engine.
//!
//! One engine instance serves one TUN device. In the server role it
//! exchanges raw IP packets with any number of peers over a single UDP
//! socket, learning which peer speaks for which tunnel IP as traffic
//! arrives. In the client role it bridges the device to a remote endpoint
//! dialed through a [`chain::Chain`].
//!
//! Individual packet errors never terminate the engine; only a failure of
//! the TUN device or an explicit shutdown does.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::{net::IpAddr, sync::LazyLock};

use bufferpool::BufferPool;

pub mod chain;
mod device;
mod handler;
mod nat;
mod peer;
pub mod route;

pub use device::{Device, DeviceConfig};
pub use handler::TunHandler;
pub use nat::NatTable;
pub use route::{Route, Server};

/// Depth of every queue on the packet path.
pub(crate) const QUEUE_SIZE: usize = 1024;

/// Number of header parsers per fan-out pool.
pub(crate) const PARSER_THREADS: usize = 10;

/// MTU plus headroom.
const BUFFER_SIZE: usize = 2048;

pub(crate) type Buffer = bufferpool::Buffer<Vec<u8>>;

/// The process-wide pool backing every buffer on the data path.
pub(crate) fn pool() -> &'static BufferPool<Vec<u8>> {
    static POOL: LazyLock<BufferPool<Vec<u8>>> = LazyLock::new(|| BufferPool::new(BUFFER_SIZE));

    &POOL
}

/// A parsed IP packet in a pool-owned buffer.
pub struct Packet {
    buf: Buffer,
    len: usize,
    pub src: IpAddr,
    pub dst: IpAddr,
}

impl Packet {
    pub(crate) fn new(buf: Buffer, len: usize) -> Option<Self> {
        let (src, dst) = ip_header::endpoints(&buf[..len])?;

        Some(Self { buf, len, src, dst })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}
