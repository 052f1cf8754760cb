use std::{collections::HashMap, net::IpAddr, net::SocketAddr, sync::Arc};

use parking_lot::RwLock;
use rand::Rng as _;

/// Learned routes: which UDP peers speak for which tunnel IP.
///
/// Ingress learns (`load_or_store`), egress picks (`route_to`). A tunnel IP
/// can be backed by several peers; selection is uniform random so connected
/// workstations share the load.
#[derive(Clone, Default)]
pub struct NatTable {
    routes: Arc<RwLock<HashMap<IpAddr, Vec<SocketAddr>>>>,
}

impl NatTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `ip` is reachable at `addr`.
    ///
    /// Returns `true` if the route was already known. Insertion order is
    /// preserved; a peer is listed at most once per tunnel IP.
    pub fn load_or_store(&self, ip: IpAddr, addr: SocketAddr) -> (SocketAddr, bool) {
        let mut routes = self.routes.write();
        let list = routes.entry(ip).or_default();

        if list.contains(&addr) {
            return (addr, true);
        }

        list.push(addr);

        (addr, false)
    }

    /// Picks a peer for `ip`, uniformly at random among all learned ones.
    pub fn route_to(&self, ip: IpAddr) -> Option<SocketAddr> {
        let routes = self.routes.read();
        let list = routes.get(&ip)?;

        if list.is_empty() {
            return None;
        }

        let index = rand::thread_rng().gen_range(0..list.len());

        Some(list[index])
    }

    /// Forgets that `ip` is reachable at `addr`.
    pub fn remove(&self, ip: IpAddr, addr: SocketAddr) {
        let mut routes = self.routes.write();

        if let Some(list) = routes.get_mut(&ip) {
            list.retain(|a| *a != addr);
        }
    }

    /// Drops `addr` from every tunnel IP, returning how many routes died.
    pub fn remove_addr(&self, addr: SocketAddr) -> usize {
        let mut count = 0;
        let mut routes = self.routes.write();

        for list in routes.values_mut() {
            let before = list.len();
            list.retain(|a| *a != addr);
            count += before - list.len();
        }

        count
    }

    pub fn for_each(&self, mut f: impl FnMut(&IpAddr, &[SocketAddr])) {
        let routes = self.routes.read();

        for (ip, list) in routes.iter() {
            f(ip, list);
        }
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn load_or_store_is_idempotent() {
        let nat = NatTable::new();
        let t = ip("223.254.254.2");
        let a = addr("10.0.0.1:8422");

        let (stored, loaded) = nat.load_or_store(t, a);
        assert_eq!(stored, a);
        assert!(!loaded);

        let (stored, loaded) = nat.load_or_store(t, a);
        assert_eq!(stored, a);
        assert!(loaded);

        let mut seen = Vec::new();
        nat.for_each(|_, list| seen.extend_from_slice(list));
        assert_eq!(seen, vec![a]);
    }

    #[test]
    fn route_to_is_none_until_learned() {
        let nat = NatTable::new();
        let t = ip("223.254.254.2");
        let a = addr("10.0.0.1:8422");

        assert_eq!(nat.route_to(t), None);

        nat.load_or_store(t, a);
        assert_eq!(nat.route_to(t), Some(a));

        nat.remove(t, a);
        assert_eq!(nat.route_to(t), None);
    }

    #[test]
    fn route_to_balances_between_peers() {
        let nat = NatTable::new();
        let t = ip("223.254.254.2");
        let a = addr("10.0.0.1:8422");
        let b = addr("10.0.0.2:8422");

        nat.load_or_store(t, a);
        nat.load_or_store(t, b);

        let mut saw_a = false;
        let mut saw_b = false;
        for _ in 0..200 {
            match nat.route_to(t) {
                Some(x) if x == a => saw_a = true,
                Some(x) if x == b => saw_b = true,
                other => panic!("unexpected route {other:?}"),
            }
        }
        assert!(saw_a && saw_b);

        nat.remove(t, a);
        for _ in 0..50 {
            assert_eq!(nat.route_to(t), Some(b));
        }
    }

    #[test]
    fn remove_addr_drops_the_peer_everywhere() {
        let nat = NatTable::new();
        let a = addr("10.0.0.1:8422");
        let b = addr("10.0.0.2:8422");

        nat.load_or_store(ip("223.254.254.2"), a);
        nat.load_or_store(ip("223.254.254.3"), a);
        nat.load_or_store(ip("223.254.254.3"), b);

        assert_eq!(nat.remove_addr(a), 2);
        assert_eq!(nat.route_to(ip("223.254.254.2")), None);
        assert_eq!(nat.route_to(ip("223.254.254.3")), Some(b));
    }
}
