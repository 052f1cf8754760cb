//! String codecs for the lease record's `UsedIP` and `MAC2IP` keys.
//!
//! `UsedIP` lines are `mac#ip1,ip2`; `MAC2IP` lines are
//! `mac#ip#rfc3339-deadline`. Both survive unknown garbage lines, since
//! the record is shared by every client of a namespace.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::Ipv4Addr,
};

use chrono::{DateTime, Duration, SecondsFormat, Utc};

pub(crate) const SPLITTER: &str = "#";

/// Upper bound written on a fresh stable lease.
const LEASE_DEADLINE_MINUTES: i64 = 30;

pub type UsedIpMap = BTreeMap<String, BTreeSet<Ipv4Addr>>;

pub fn used_ip_to_string(map: &UsedIpMap) -> String {
    let mut out = String::new();
    for (mac, ips) in map {
        let list = ips
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(mac);
        out.push_str(SPLITTER);
        out.push_str(&list);
        out.push('\n');
    }

    out
}

pub fn used_ip_from_string(s: &str) -> UsedIpMap {
    let mut map = UsedIpMap::new();
    for line in s.lines() {
        let Some((mac, ips)) = line.split_once(SPLITTER) else {
            continue;
        };

        let parsed = ips
            .split(',')
            .filter_map(|ip| ip.parse::<Ipv4Addr>().ok())
            .collect();
        map.insert(mac.to_owned(), parsed);
    }

    map
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub mac: String,
    pub ip: Ipv4Addr,
    pub deadline: DateTime<Utc>,
}

/// The stable MAC → IP leases of a namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseTable {
    inner: BTreeMap<String, LeaseRecord>,
}

impl LeaseTable {
    pub fn from_string(s: &str) -> Self {
        let mut inner = BTreeMap::new();
        for line in s.lines() {
            let split: Vec<&str> = line.split(SPLITTER).collect();
            let [mac, ip, deadline] = split[..] else {
                continue;
            };

            let Ok(ip) = ip.parse::<Ipv4Addr>() else {
                continue;
            };
            let deadline = DateTime::parse_from_rfc3339(deadline)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now() + Duration::minutes(LEASE_DEADLINE_MINUTES));

            inner.insert(
                mac.to_owned(),
                LeaseRecord {
                    mac: mac.to_owned(),
                    ip,
                    deadline,
                },
            );
        }

        Self { inner }
    }

    pub fn to_record_string(&self) -> String {
        let mut out = String::new();
        for record in self.inner.values() {
            out.push_str(&record.mac);
            out.push_str(SPLITTER);
            out.push_str(&record.ip.to_string());
            out.push_str(SPLITTER);
            out.push_str(&record.deadline.to_rfc3339_opts(SecondsFormat::Secs, true));
            out.push('\n');
        }

        out
    }

    pub fn ip_by_mac(&self, mac: &str) -> Option<Ipv4Addr> {
        self.inner.get(mac).map(|record| record.ip)
    }

    pub fn insert(&mut self, mac: &str, ip: Ipv4Addr) {
        self.inner.insert(
            mac.to_owned(),
            LeaseRecord {
                mac: mac.to_owned(),
                ip,
                deadline: Utc::now() + Duration::minutes(LEASE_DEADLINE_MINUTES),
            },
        );
    }

    pub fn remove(&mut self, mac: &str) {
        self.inner.remove(mac);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_ip_round_trips_as_sets() {
        let mut map = UsedIpMap::new();
        map.insert(
            "aa:bb:cc:dd:ee:ff".to_owned(),
            BTreeSet::from([
                Ipv4Addr::new(223, 254, 254, 2),
                Ipv4Addr::new(223, 254, 254, 7),
            ]),
        );
        map.insert(
            "ee:ee:ee:ee:ee:ee".to_owned(),
            BTreeSet::from([Ipv4Addr::new(223, 254, 254, 100)]),
        );

        let encoded = used_ip_to_string(&map);
        assert_eq!(used_ip_from_string(&encoded), map);
    }

    #[test]
    fn used_ip_skips_garbage() {
        let decoded = used_ip_from_string("not a line\naa:bb#223.254.254.2,nonsense\n");

        assert_eq!(decoded.len(), 1);
        assert_eq!(
            decoded["aa:bb"],
            BTreeSet::from([Ipv4Addr::new(223, 254, 254, 2)])
        );
    }

    #[test]
    fn lease_table_round_trips() {
        let mut table = LeaseTable::default();
        table.insert("aa:bb:cc:dd:ee:ff", Ipv4Addr::new(223, 254, 254, 2));
        table.insert("11:22:33:44:55:66", Ipv4Addr::new(223, 254, 254, 3));

        let parsed = LeaseTable::from_string(&table.to_record_string());

        assert_eq!(
            parsed.ip_by_mac("aa:bb:cc:dd:ee:ff"),
            Some(Ipv4Addr::new(223, 254, 254, 2))
        );
        assert_eq!(
            parsed.ip_by_mac("11:22:33:44:55:66"),
            Some(Ipv4Addr::new(223, 254, 254, 3))
        );
    }

    #[test]
    fn unparseable_deadline_defaults_into_the_future() {
        let table =
            LeaseTable::from_string("aa:bb:cc:dd:ee:ff#223.254.254.2#yesterday-ish\n");

        let record = &table.inner["aa:bb:cc:dd:ee:ff"];
        assert!(record.deadline > Utc::now());
    }

    #[test]
    fn removed_mac_is_gone() {
        let mut table = LeaseTable::default();
        table.insert("aa:bb:cc:dd:ee:ff", Ipv4Addr::new(223, 254, 254, 2));
        table.remove("aa:bb:cc:dd:ee:ff");

        assert_eq!(table.ip_by_mac("aa:bb:cc:dd:ee:ff"), None);
    }
}
