//! Linux TUN device via `/dev/net/tun`.

use std::{
    ffi::CString,
    io,
    os::fd::{AsRawFd, FromRawFd as _, OwnedFd},
    task::{Context, Poll, ready},
};

use anyhow::{Context as _, Result};
use tokio::io::unix::AsyncFd;

use crate::Tun;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

const IFNAMSIZ: usize = 16;

#[repr(C)]
union IfrIfru {
    ifru_flags: libc::c_short,
    _ifru_pad: [u8; 24],
}

#[repr(C)]
struct Ifreq {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_ifru: IfrIfru,
}

pub struct TunDevice {
    fd: AsyncFd<OwnedFd>,
    name: String,
}

impl TunDevice {
    /// Opens (and creates if necessary) the named TUN device.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(name: &str) -> Result<Self> {
        anyhow::ensure!(
            name.len() < IFNAMSIZ,
            "TUN device name `{name}` is too long"
        );

        // SAFETY: We pass a valid, NUL-terminated path.
        let fd = unsafe {
            libc::open(
                c"/dev/net/tun".as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context("Failed to open /dev/net/tun");
        }

        // SAFETY: `fd` is a freshly opened, owned file descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut ifr = Ifreq {
            ifr_name: [0; IFNAMSIZ],
            ifr_ifru: IfrIfru {
                ifru_flags: IFF_TUN | IFF_NO_PI,
            },
        };
        let c_name = CString::new(name).context("TUN device name contains a NUL byte")?;
        for (dst, src) in ifr.ifr_name.iter_mut().zip(c_name.as_bytes_with_nul()) {
            *dst = *src as libc::c_char;
        }

        // SAFETY: `ifr` is a valid `ifreq` for the lifetime of the call.
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("Failed to attach to TUN device `{name}`"));
        }

        tracing::debug!(%name, "Opened TUN device");

        Ok(Self {
            fd: AsyncFd::new(fd).context("Failed to register TUN fd with the runtime")?,
            name: name.to_owned(),
        })
    }
}

impl Tun for TunDevice {
    fn poll_recv(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;

            match guard.try_io(|fd| {
                // SAFETY: `buf` outlives the call and we pass its real length.
                let n = unsafe {
                    libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(n as usize)
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_send(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;

            match guard.try_io(|fd| {
                // SAFETY: `buf` outlives the call and we pass its real length.
                let n = unsafe {
                    libc::write(fd.as_raw_fd(), buf.as_ptr() as *const libc::c_void, buf.len())
                };
                if n < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(n as usize)
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
