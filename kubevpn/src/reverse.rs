//! The reverse controller: renting shadow IPs and steering workloads at
//! the workstation.

use std::{collections::BTreeMap, net::Ipv4Addr};

use anyhow::{Context as _, Result};
use cluster::{DhcpManager, Mode, PodRouteConfig, ReverseController, TRAFFIC_MANAGER};
use k8s_openapi::api::core::v1::Service;
use kube::Api;

use crate::{config, daemon::Progress};

/// One workload currently steered at the workstation.
#[derive(Debug, Clone)]
pub struct ReversedWorkload {
    pub deployment: String,
    pub shadow_ip: Ipv4Addr,
}

pub struct ReverseOptions {
    pub namespace: String,
    pub mode: Mode,
    pub headers: BTreeMap<String, String>,
    pub workloads: Vec<String>,
    client: kube::Client,
}

impl ReverseOptions {
    pub fn new(
        client: kube::Client,
        namespace: &str,
        mode: Mode,
        headers: BTreeMap<String, String>,
        workloads: Vec<String>,
    ) -> Self {
        Self {
            namespace: namespace.to_owned(),
            mode,
            headers,
            workloads,
            client,
        }
    }

    /// Rents a shadow IP per workload and injects the sidecars.
    ///
    /// Returns what was reversed so `ReverseStop` can undo exactly that.
    pub async fn do_reverse(
        &self,
        dhcp: &DhcpManager,
        local_tun_ip: Ipv4Addr,
        progress: &mut Progress<'_>,
    ) -> Result<Vec<ReversedWorkload>> {
        let controller = ReverseController::new(self.client.clone(), &self.namespace);
        let router_ip = self.outbound_service_ip().await?;

        let mut reversed = Vec::new();
        for workload in &self.workloads {
            if workload.is_empty() {
                continue;
            }

            let deployment = controller.normalize(workload).await?;
            let (shadow_ip, prefix) = dhcp.rent_ip().await?;

            let route_config = PodRouteConfig {
                local_tun_ip: local_tun_ip.to_string(),
                inbound_pod_tun_ip: format!("{shadow_ip}/{prefix}"),
                traffic_manager_real_ip: router_ip.clone(),
                route: config::cidr().to_string(),
            };

            progress
                .say(format!("try to create remote inbound pod for {deployment}..."))
                .await;
            let injected = match self.mode {
                Mode::Mesh => {
                    controller
                        .inject_vpn_and_envoy(&deployment, &route_config, &self.headers)
                        .await
                }
                Mode::Reverse => controller.inject_vpn(&deployment, &route_config).await,
            };
            if let Err(e) = injected {
                // The lease must not outlive the injection it was rented for.
                if let Err(release) = dhcp.release_ip(&[shadow_ip]).await {
                    tracing::error!("Failed to release {shadow_ip}: {release:#}");
                }
                return Err(e);
            }

            reversed.push(ReversedWorkload {
                deployment,
                shadow_ip,
            });
        }

        Ok(reversed)
    }

    /// Reverts the sidecars and releases the shadow IPs. Returns the
    /// released addresses.
    pub async fn do_reverse_stop(
        &self,
        dhcp: &DhcpManager,
        reversed: &[ReversedWorkload],
        progress: &mut Progress<'_>,
    ) -> Result<Vec<Ipv4Addr>> {
        let controller = ReverseController::new(self.client.clone(), &self.namespace);

        let mut requested = Vec::new();
        for workload in &self.workloads {
            requested.push(controller.normalize(workload).await?);
        }

        let mut released = Vec::new();
        for entry in reversed {
            if !requested.is_empty() && !requested.contains(&entry.deployment) {
                continue;
            }

            progress
                .say(format!("restoring workload {}...", entry.deployment))
                .await;
            controller.remove_sidecar(&entry.deployment).await?;
            released.push(entry.shadow_ip);
        }

        if !released.is_empty() {
            dhcp.release_ip(&released).await?;
        }

        Ok(released)
    }

    /// The cluster-side IP the sidecars dial to join the tunnel: the
    /// traffic-manager Service's ClusterIP.
    async fn outbound_service_ip(&self) -> Result<String> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);

        services
            .get(TRAFFIC_MANAGER)
            .await
            .context("can not found outbound service")?
            .spec
            .and_then(|spec| spec.cluster_ip)
            .context("outbound service has no ClusterIP")
    }
}
