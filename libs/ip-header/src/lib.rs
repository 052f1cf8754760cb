//! Minimal IP header inspection for the packet path.
//!
//! The tunnel only ever needs three things from a packet: which address
//! family it belongs to, who sent it and where it wants to go. Those live at
//! fixed offsets, so this crate reads them straight out of the buffer
//! instead of running a full parse on the hot path. Heartbeat packets are
//! the one place we construct packets, via `etherparse`.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::{Context as _, Result};
use etherparse::PacketBuilder;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;

/// Identifier carried by every heartbeat echo request.
pub const HEARTBEAT_ICMP_ID: u16 = 3842;

pub fn is_ipv4(buf: &[u8]) -> bool {
    buf.first().is_some_and(|b| b >> 4 == 4)
}

pub fn is_ipv6(buf: &[u8]) -> bool {
    buf.first().is_some_and(|b| b >> 4 == 6)
}

/// Extracts `(src, dst)` from a raw IP packet.
///
/// IPv4 carries them at bytes 12–15 and 16–19, IPv6 at 8–23 and 24–39.
/// Returns `None` for truncated buffers or unknown version nibbles.
pub fn endpoints(buf: &[u8]) -> Option<(IpAddr, IpAddr)> {
    if is_ipv4(buf) {
        if buf.len() < IPV4_MIN_HEADER {
            return None;
        }

        let src: [u8; 4] = buf[12..16].try_into().ok()?;
        let dst: [u8; 4] = buf[16..20].try_into().ok()?;

        return Some((Ipv4Addr::from(src).into(), Ipv4Addr::from(dst).into()));
    }

    if is_ipv6(buf) {
        if buf.len() < IPV6_HEADER {
            return None;
        }

        let src: [u8; 16] = buf[8..24].try_into().ok()?;
        let dst: [u8; 16] = buf[24..40].try_into().ok()?;

        return Some((Ipv6Addr::from(src).into(), Ipv6Addr::from(dst).into()));
    }

    None
}

/// Builds an ICMPv4 echo request from `src` to `dst`.
pub fn icmp_echo_v4(src: Ipv4Addr, dst: Ipv4Addr) -> Result<Vec<u8>> {
    let builder =
        PacketBuilder::ipv4(src.octets(), dst.octets(), 64).icmpv4_echo_request(HEARTBEAT_ICMP_ID, 1);

    let mut packet = Vec::with_capacity(builder.size(0));
    builder
        .write(&mut packet, &[])
        .context("Failed to serialize ICMPv4 echo request")?;

    Ok(packet)
}

/// Builds an ICMPv6 echo request from `src` to `dst`.
pub fn icmp_echo_v6(src: Ipv6Addr, dst: Ipv6Addr) -> Result<Vec<u8>> {
    let builder = PacketBuilder::ipv6(src.octets(), dst.octets(), 255)
        .icmpv6_echo_request(HEARTBEAT_ICMP_ID, 1);

    let mut packet = Vec::with_capacity(builder.size(0));
    builder
        .write(&mut packet, &[])
        .context("Failed to serialize ICMPv6 echo request")?;

    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_endpoints_come_from_fixed_offsets() {
        let src = Ipv4Addr::new(223, 254, 254, 2);
        let dst = Ipv4Addr::new(223, 254, 254, 100);
        let packet = icmp_echo_v4(src, dst).unwrap();

        assert!(is_ipv4(&packet));
        assert!(!is_ipv6(&packet));
        assert_eq!(&packet[12..16], &src.octets());
        assert_eq!(&packet[16..20], &dst.octets());

        let (parsed_src, parsed_dst) = endpoints(&packet).unwrap();
        assert_eq!(parsed_src, IpAddr::from(src));
        assert_eq!(parsed_dst, IpAddr::from(dst));
    }

    #[test]
    fn ipv6_endpoints_come_from_fixed_offsets() {
        let src: Ipv6Addr = "fd3d:4c41:4e2f::2".parse().unwrap();
        let dst: Ipv6Addr = "fd3d:4c41:4e2f::64".parse().unwrap();
        let packet = icmp_echo_v6(src, dst).unwrap();

        assert!(is_ipv6(&packet));
        assert_eq!(&packet[8..24], &src.octets());
        assert_eq!(&packet[24..40], &dst.octets());

        let (parsed_src, parsed_dst) = endpoints(&packet).unwrap();
        assert_eq!(parsed_src, IpAddr::from(src));
        assert_eq!(parsed_dst, IpAddr::from(dst));
    }

    #[test]
    fn garbage_is_not_classified() {
        assert_eq!(endpoints(&[]), None);
        assert_eq!(endpoints(&[0x00; 40]), None);

        // Correct version nibble but truncated header.
        assert_eq!(endpoints(&[0x45; 8]), None);
        assert_eq!(endpoints(&[0x60; 20]), None);
    }
}
