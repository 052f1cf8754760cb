//! The ConfigMap-backed lease manager.
//!
//! The record is shared by every client of a namespace, so every mutation
//! reads the current state, changes it locally and writes it back under
//! retry-on-conflict. Allocation and the write-back are one patch computed
//! from freshly read state; a failed write persists nothing, so no lease
//! can leak.

use std::{collections::BTreeSet, net::Ipv4Addr};

use anyhow::{Context as _, Result};
use ip_network::Ipv4Network;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    Api,
    api::{ObjectMeta, Patch, PatchParams, PostParams},
};

use crate::{
    Error, IpAllocator, KEY_DHCP, KEY_ENVOY, KEY_MAC2IP, KEY_USED_IP, LeaseTable, ROUTER_MAC,
    TRAFFIC_MANAGER, is_already_exists, is_not_found,
    lease::{UsedIpMap, used_ip_from_string, used_ip_to_string},
    retry,
};

pub struct DhcpManager {
    api: Api<ConfigMap>,
    namespace: String,
    cidr: Ipv4Network,
    router_ip: Ipv4Addr,
    mac: String,
}

impl DhcpManager {
    pub fn new(
        client: kube::Client,
        namespace: &str,
        cidr: Ipv4Network,
        router_ip: Ipv4Addr,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_owned(),
            cidr,
            router_ip,
            mac: crate::mac_address(),
        }
    }

    pub fn cidr(&self) -> Ipv4Network {
        self.cidr
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    /// Creates the lease record if it does not exist, with the router IP
    /// pre-leased to its synthetic MAC. Concurrent creates collapse into
    /// success.
    pub async fn init_if_necessary(&self) -> Result<()> {
        match self.api.get(TRAFFIC_MANAGER).await {
            Ok(_) => return Ok(()),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e).context("Failed to read lease record"),
        }

        let mut allocator = IpAllocator::new(self.cidr);
        allocator
            .allocate(self.router_ip)
            .context("Failed to reserve the router IP")?;

        let mut used = UsedIpMap::new();
        used.insert(ROUTER_MAC.to_owned(), BTreeSet::from([self.router_ip]));

        let record = ConfigMap {
            metadata: ObjectMeta {
                name: Some(TRAFFIC_MANAGER.to_owned()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            data: Some(
                [
                    (KEY_USED_IP.to_owned(), used_ip_to_string(&used)),
                    (KEY_DHCP.to_owned(), allocator.snapshot()),
                    (KEY_MAC2IP.to_owned(), String::new()),
                    (KEY_ENVOY.to_owned(), String::new()),
                ]
                .into(),
            ),
            ..Default::default()
        };

        match self.api.create(&PostParams::default(), &record).await {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e).context("Failed to create lease record"),
        }
    }

    /// Leases the next free IP to this workstation.
    pub async fn rent_ip(&self) -> Result<(Ipv4Addr, u8)> {
        let ip = retry::on_conflict(|| async {
            let record = self.get_record().await?;

            let mut allocator =
                IpAllocator::restore(self.cidr, record.data_str(KEY_DHCP))?;
            let ip = allocator.allocate_next()?;

            let mut used = used_ip_from_string(record.data_str(KEY_USED_IP));
            used.entry(self.mac.clone()).or_default().insert(ip);

            self.patch_data(
                &record,
                &[
                    (KEY_DHCP, allocator.snapshot()),
                    (KEY_USED_IP, used_ip_to_string(&used)),
                ],
            )
            .await?;

            Ok(ip)
        })
        .await?;

        tracing::debug!(%ip, "Leased tunnel IP");

        Ok((ip, self.cidr.netmask()))
    }

    /// Returns leases to the pool.
    pub async fn release_ip(&self, ips: &[Ipv4Addr]) -> Result<()> {
        retry::on_conflict(|| async {
            let record = self.get_record().await?;

            let mut allocator =
                IpAllocator::restore(self.cidr, record.data_str(KEY_DHCP))?;
            let mut used = used_ip_from_string(record.data_str(KEY_USED_IP));

            for ip in ips {
                allocator.release(*ip)?;
                for leases in used.values_mut() {
                    leases.remove(ip);
                }
            }

            self.patch_data(
                &record,
                &[
                    (KEY_DHCP, allocator.snapshot()),
                    (KEY_USED_IP, used_ip_to_string(&used)),
                ],
            )
            .await
        })
        .await
    }

    /// The workstation's stable tunnel IP: the existing `MAC2IP` lease if
    /// there is one, otherwise a fresh rent persisted under this MAC.
    pub async fn generate_tun_ip(&self) -> Result<(Ipv4Addr, u8)> {
        let record = self.get_record().await?;

        let table = LeaseTable::from_string(record.data_str(KEY_MAC2IP));
        if let Some(ip) = table.ip_by_mac(&self.mac) {
            return Ok((ip, self.cidr.netmask()));
        }

        let (ip, netmask) = self.rent_ip().await?;

        retry::on_conflict(|| async {
            let record = self.get_record().await?;

            let mut table = LeaseTable::from_string(record.data_str(KEY_MAC2IP));
            table.insert(&self.mac, ip);

            self.patch_data(&record, &[(KEY_MAC2IP, table.to_record_string())])
                .await
        })
        .await?;

        Ok((ip, netmask))
    }

    /// Releases every lease held by this workstation and removes its
    /// entries from the record.
    pub async fn release(&self) -> Result<()> {
        let record = self.get_record().await?;
        let used = used_ip_from_string(record.data_str(KEY_USED_IP));

        if let Some(leases) = used.get(&self.mac) {
            let ips: Vec<Ipv4Addr> = leases.iter().copied().collect();
            self.release_ip(&ips).await?;
        }

        retry::on_conflict(|| async {
            let record = self.get_record().await?;

            let mut used = used_ip_from_string(record.data_str(KEY_USED_IP));
            used.remove(&self.mac);

            let mut table = LeaseTable::from_string(record.data_str(KEY_MAC2IP));
            table.remove(&self.mac);

            self.patch_data(
                &record,
                &[
                    (KEY_USED_IP, used_ip_to_string(&used)),
                    (KEY_MAC2IP, table.to_record_string()),
                ],
            )
            .await
        })
        .await
    }

    /// The leases currently held by this workstation.
    pub async fn rented_ips(&self) -> Result<Vec<Ipv4Addr>> {
        let record = self.get_record().await?;
        let used = used_ip_from_string(record.data_str(KEY_USED_IP));

        Ok(used
            .get(&self.mac)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn get_record(&self) -> Result<ConfigMap> {
        self.api.get(TRAFFIC_MANAGER).await.map_err(|e| {
            if is_not_found(&e) {
                anyhow::Error::new(Error::RecordNotFound(self.namespace.clone()))
            } else {
                anyhow::Error::new(e).context("Failed to read lease record")
            }
        })
    }

    async fn patch_data(&self, record: &ConfigMap, entries: &[(&str, String)]) -> Result<()> {
        let mut data = serde_json::Map::new();
        for (key, value) in entries {
            data.insert((*key).to_owned(), serde_json::Value::String(value.clone()));
        }

        // Guarded by the resource version read above so concurrent writers
        // conflict instead of clobbering each other.
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": record.metadata.resource_version },
            "data": data,
        });

        self.api
            .patch(
                TRAFFIC_MANAGER,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .context("Failed to patch lease record")?;

        Ok(())
    }
}

trait DataStr {
    fn data_str(&self, key: &str) -> &str;
}

impl DataStr for ConfigMap {
    fn data_str(&self, key: &str) -> &str {
        self.data
            .as_ref()
            .and_then(|data| data.get(key))
            .map(String::as_str)
            .unwrap_or_default()
    }
}
