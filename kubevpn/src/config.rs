//! Process-wide constants and the few knobs the environment controls.

use std::{
    net::{Ipv4Addr, Ipv6Addr},
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use ip_network::Ipv4Network;

/// Verbose logging for the whole process.
pub static DEBUG: AtomicBool = AtomicBool::new(false);

pub fn debug() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

pub fn set_debug(value: bool) {
    DEBUG.store(value, Ordering::Relaxed);
}

/// The reserved tunnel net. `.100` belongs to the cluster-side router and
/// is never leased to a client.
pub const ROUTER_IP: Ipv4Addr = Ipv4Addr::new(223, 254, 254, 100);
pub const ROUTER_IP6: Ipv6Addr = Ipv6Addr::new(0xfd3d, 0x4c41, 0x4e2f, 0, 0, 0, 0, 0x64);

pub fn cidr() -> Ipv4Network {
    Ipv4Network::new(Ipv4Addr::new(223, 254, 254, 0), 24).expect("/24 is a valid prefix")
}

/// `<router ip>/<prefix>`, the `net=` the relay serves under.
pub fn router_net() -> String {
    format!("{ROUTER_IP}/{}", cidr().netmask())
}

/// Local TCP port the port-forward to the traffic-manager occupies.
pub const PORT: u16 = 10800;

/// UDP endpoint of the local TUN serve node.
pub const TUN_UDP_ADDR: &str = "127.0.0.1:8422";

/// IP header 20 bytes, UDP header 8 bytes, stream framing overhead.
pub const DEFAULT_MTU: usize = 1500 - 20 - 8 - 21;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DAEMON_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable naming the TUN device.
pub const ENV_TUN_NAME: &str = "tunName";

pub fn tun_name() -> String {
    std::env::var(ENV_TUN_NAME).unwrap_or_else(|_| "kubevpn".to_owned())
}

fn daemon_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".kubevpn")
}

/// The daemon's socket, in a private subfolder of the home directory.
pub fn daemon_sock() -> PathBuf {
    daemon_dir().join("daemon.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_is_inside_the_reserved_net() {
        assert!(cidr().contains(ROUTER_IP));
        assert_eq!(router_net(), "223.254.254.100/24");
    }

    #[test]
    fn daemon_sock_lives_in_a_private_subfolder() {
        let sock = daemon_sock();

        assert!(sock.ends_with(".kubevpn/daemon.sock"));
    }
}
