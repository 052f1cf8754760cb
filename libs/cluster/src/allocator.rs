//! Contiguous bitmap allocator over a CIDR.
//!
//! The bitmap is what the lease record's `DHCP` key stores; every mutation
//! of cluster state restores it, changes it and snapshots it back, so the
//! persisted form is the source of truth.

use anyhow::{Context as _, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ip_network::Ipv4Network;
use std::net::Ipv4Addr;

use crate::Error;

pub struct IpAllocator {
    cidr: Ipv4Network,
    /// One bit per host ordinal; bit 0 is unused.
    bitmap: Vec<u8>,
    max: u32,
}

impl IpAllocator {
    /// An empty allocator over `cidr`.
    ///
    /// Allocatable ordinals are `1..=size-3`: the network address, the
    /// broadcast address and the top host stay out of the pool, which makes
    /// a `/24` hold 253 hosts.
    pub fn new(cidr: Ipv4Network) -> Self {
        let size = 1u64 << (32 - cidr.netmask());
        let max = (size.saturating_sub(3)) as u32;

        Self {
            cidr,
            bitmap: vec![0; (max as usize + 8) / 8],
            max,
        }
    }

    /// Restores an allocator from a snapshot; an empty snapshot is a fresh
    /// allocator.
    pub fn restore(cidr: Ipv4Network, snapshot: &str) -> Result<Self> {
        if snapshot.is_empty() {
            return Ok(Self::new(cidr));
        }

        let (stored_cidr, data) = snapshot
            .split_once(',')
            .context("allocator snapshot has no CIDR prefix")?;
        if stored_cidr != cidr.to_string() {
            bail!("allocator snapshot is for {stored_cidr}, expected {cidr}");
        }

        let mut allocator = Self::new(cidr);
        let bitmap = BASE64
            .decode(data)
            .context("allocator snapshot is not valid base64")?;
        if bitmap.len() != allocator.bitmap.len() {
            bail!("allocator snapshot has the wrong size");
        }
        allocator.bitmap = bitmap;

        Ok(allocator)
    }

    pub fn snapshot(&self) -> String {
        format!("{},{}", self.cidr, BASE64.encode(&self.bitmap))
    }

    /// Allocates the lowest free IP.
    pub fn allocate_next(&mut self) -> Result<Ipv4Addr, Error> {
        for ordinal in 1..=self.max {
            if !self.bit(ordinal) {
                self.set_bit(ordinal, true);

                return Ok(self.ip_at(ordinal));
            }
        }

        Err(Error::NoIpAvailable(self.cidr))
    }

    /// Marks a specific IP as allocated.
    pub fn allocate(&mut self, ip: Ipv4Addr) -> Result<()> {
        let ordinal = self.ordinal(ip)?;
        if self.bit(ordinal) {
            bail!("{ip} is already allocated");
        }
        self.set_bit(ordinal, true);

        Ok(())
    }

    /// Releases an IP. Releasing a free IP is a no-op.
    pub fn release(&mut self, ip: Ipv4Addr) -> Result<()> {
        let ordinal = self.ordinal(ip)?;
        self.set_bit(ordinal, false);

        Ok(())
    }

    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        self.ordinal(ip).map(|o| self.bit(o)).unwrap_or(false)
    }

    pub fn allocated(&self) -> Vec<Ipv4Addr> {
        (1..=self.max)
            .filter(|o| self.bit(*o))
            .map(|o| self.ip_at(o))
            .collect()
    }

    pub fn cidr(&self) -> Ipv4Network {
        self.cidr
    }

    fn ordinal(&self, ip: Ipv4Addr) -> Result<u32> {
        let base = u32::from(self.cidr.network_address());
        let ordinal = u32::from(ip).wrapping_sub(base);
        if ordinal == 0 || ordinal > self.max {
            bail!("{ip} is not an allocatable host of {}", self.cidr);
        }

        Ok(ordinal)
    }

    fn ip_at(&self, ordinal: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.cidr.network_address()) + ordinal)
    }

    fn bit(&self, ordinal: u32) -> bool {
        self.bitmap[(ordinal / 8) as usize] & (1 << (ordinal % 8)) != 0
    }

    fn set_bit(&mut self, ordinal: u32, value: bool) {
        let byte = &mut self.bitmap[(ordinal / 8) as usize];
        if value {
            *byte |= 1 << (ordinal % 8);
        } else {
            *byte &= !(1 << (ordinal % 8));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr() -> Ipv4Network {
        "223.254.254.0/24".parse().unwrap()
    }

    #[test]
    fn allocates_the_lowest_free_host_first() {
        let mut allocator = IpAllocator::new(cidr());

        assert_eq!(
            allocator.allocate_next().unwrap(),
            Ipv4Addr::new(223, 254, 254, 1)
        );
        assert_eq!(
            allocator.allocate_next().unwrap(),
            Ipv4Addr::new(223, 254, 254, 2)
        );
    }

    #[test]
    fn slash_24_with_reserved_router_holds_252_leases() {
        let mut allocator = IpAllocator::new(cidr());
        allocator
            .allocate(Ipv4Addr::new(223, 254, 254, 100))
            .unwrap();

        for _ in 0..252 {
            allocator.allocate_next().unwrap();
        }

        assert!(matches!(
            allocator.allocate_next(),
            Err(Error::NoIpAvailable(_))
        ));
    }

    #[test]
    fn released_ips_can_be_allocated_again() {
        let mut allocator = IpAllocator::new(cidr());

        let ip = allocator.allocate_next().unwrap();
        assert!(allocator.is_allocated(ip));

        allocator.release(ip).unwrap();
        assert!(!allocator.is_allocated(ip));
        assert_eq!(allocator.allocate_next().unwrap(), ip);
    }

    #[test]
    fn network_broadcast_and_top_host_are_not_allocatable() {
        let mut allocator = IpAllocator::new(cidr());

        assert!(allocator.allocate(Ipv4Addr::new(223, 254, 254, 0)).is_err());
        assert!(
            allocator
                .allocate(Ipv4Addr::new(223, 254, 254, 254))
                .is_err()
        );
        assert!(
            allocator
                .allocate(Ipv4Addr::new(223, 254, 254, 255))
                .is_err()
        );
        assert!(allocator.allocate(Ipv4Addr::new(223, 254, 253, 1)).is_err());
    }

    #[test]
    fn snapshot_round_trips() {
        let mut allocator = IpAllocator::new(cidr());
        allocator
            .allocate(Ipv4Addr::new(223, 254, 254, 100))
            .unwrap();
        let a = allocator.allocate_next().unwrap();
        let b = allocator.allocate_next().unwrap();

        let restored = IpAllocator::restore(cidr(), &allocator.snapshot()).unwrap();
        assert_eq!(restored.allocated(), allocator.allocated());
        assert!(restored.is_allocated(a));
        assert!(restored.is_allocated(b));
        assert!(restored.is_allocated(Ipv4Addr::new(223, 254, 254, 100)));
    }

    #[test]
    fn empty_snapshot_is_a_fresh_allocator() {
        let allocator = IpAllocator::restore(cidr(), "").unwrap();

        assert!(allocator.allocated().is_empty());
    }

    #[test]
    fn snapshot_for_another_cidr_is_rejected() {
        let allocator = IpAllocator::new(cidr());

        assert!(IpAllocator::restore("10.0.0.0/24".parse().unwrap(), &allocator.snapshot()).is_err());
    }
}
