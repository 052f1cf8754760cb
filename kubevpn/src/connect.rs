//! The connect controller: everything `ConnectStart` has to line up, in
//! order, and the teardown that unwinds it.

use std::{net::Ipv4Addr, path::Path, sync::Arc, sync::Mutex};

use anyhow::{Context as _, Result};
use cluster::{DhcpManager, TrafficManager, portforward};
use ip_network::IpNetwork;
use k8s_openapi::api::core::v1::{Namespace, Service};
use kube::{Api, config::KubeConfigOptions};
use tokio_util::sync::CancellationToken;
use tun::Tun;
use tunnel::{DeviceConfig, Route};

use crate::{config, daemon::Progress, platform::Platform};

pub struct ConnectOptions {
    pub kubeconfig_path: String,
    pub namespace: String,
    pub namespace_id: String,
    client: kube::Client,
    dhcp: DhcpManager,
    cidrs: Vec<IpNetwork>,
    local_tun_ip: Option<(Ipv4Addr, u8)>,
    platform: Arc<dyn Platform>,
    rollbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl ConnectOptions {
    /// Builds the cluster client and resolves the namespace to its UID.
    ///
    /// Configuration problems surface here, before anything in the cluster
    /// is touched.
    pub async fn init_client(
        kubeconfig_path: &str,
        namespace: &str,
        platform: Arc<dyn Platform>,
    ) -> Result<Self> {
        let kube_config = if !kubeconfig_path.is_empty() && Path::new(kubeconfig_path).exists() {
            let kubeconfig = kube::config::Kubeconfig::read_from(kubeconfig_path)
                .context("Failed to read kubeconfig")?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("Failed to load kubeconfig")?
        } else {
            kube::Config::infer()
                .await
                .context("Failed to infer cluster configuration")?
        };

        let namespace = if namespace.is_empty() {
            kube_config.default_namespace.clone()
        } else {
            namespace.to_owned()
        };

        let client = kube::Client::try_from(kube_config).context("Failed to build client")?;

        let namespace_id = Api::<Namespace>::all(client.clone())
            .get(&namespace)
            .await
            .with_context(|| format!("Failed to resolve namespace {namespace}"))?
            .metadata
            .uid
            .unwrap_or_default();

        let dhcp = DhcpManager::new(client.clone(), &namespace, config::cidr(), config::ROUTER_IP);

        Ok(Self {
            kubeconfig_path: kubeconfig_path.to_owned(),
            namespace,
            namespace_id,
            client,
            dhcp,
            cidrs: Vec::new(),
            local_tun_ip: None,
            platform,
            rollbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn client(&self) -> kube::Client {
        self.client.clone()
    }

    pub fn dhcp(&self) -> &DhcpManager {
        &self.dhcp
    }

    pub fn cidrs(&self) -> &[IpNetwork] {
        &self.cidrs
    }

    pub fn local_tun_ip(&self) -> Option<(Ipv4Addr, u8)> {
        self.local_tun_ip
    }

    /// Registers a closure run (in registration order) during cleanup.
    pub fn add_rollback(&self, f: impl FnOnce() + Send + 'static) {
        self.rollbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Box::new(f));
    }

    /// Brings the connection up. Fails fast; the caller runs [`Self::cleanup`]
    /// on any error.
    pub async fn do_connect(
        &mut self,
        connect_token: CancellationToken,
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        // 1) CIDRs the tunnel should route.
        self.cidrs = cluster::cidr::discover(&self.client, &self.namespace).await?;
        let cidr_list = self
            .cidrs
            .iter()
            .map(|cidr| cidr.to_string())
            .collect::<Vec<_>>()
            .join(",");
        progress.say(format!("CIDR are: {cidr_list}")).await;

        // 2) Lease record and our stable tunnel IP.
        self.dhcp.init_if_necessary().await?;
        let (ip, prefix) = self.dhcp.generate_tun_ip().await?;
        self.local_tun_ip = Some((ip, prefix));

        // 3) Traffic manager, counted in.
        let manager = TrafficManager::new(self.client.clone(), &self.namespace);
        manager.ensure(&config::router_net(), &self.cidrs).await?;

        // 4) Port-forward to it.
        progress
            .say(format!("wait port {} to be free...", config::PORT))
            .await;
        portforward::wait_port_free(config::PORT, portforward::PORT_FREE_TIMEOUT).await?;
        progress.say(format!("port {} are free", config::PORT)).await;

        portforward::start(
            self.client.clone(),
            &self.namespace,
            config::PORT,
            connect_token.clone(),
        )
        .await?;
        progress.say("port forward ready").await;

        // 5) The local tunnel server.
        progress.say(format!("your ip is {ip}")).await;
        self.start_tun(connect_token, ip, prefix).await?;
        progress.say("tunnel connected").await;

        if let Err(e) = self.platform.allow_firewall().await {
            tracing::debug!("Failed to open firewall: {e:#}");
        }

        // 6) DNS into the cluster.
        self.setup_dns().await?;
        progress.say("dns service ok").await;

        // 7) Nothing else may own our routes.
        self.platform
            .disable_conflicting_devices(&config::tun_name())
            .await?;

        Ok(())
    }

    async fn start_tun(
        &self,
        token: CancellationToken,
        ip: Ipv4Addr,
        prefix: u8,
    ) -> Result<()> {
        let mut route_list = vec![config::cidr().to_string()];
        route_list.extend(self.cidrs.iter().map(|cidr| cidr.to_string()));

        let serve_node = format!(
            "tun:/{}?net={ip}/{prefix}&route={}",
            config::TUN_UDP_ADDR,
            route_list.join(","),
        );
        let server = Route::single(
            serve_node,
            Some(format!("tcp://127.0.0.1:{}", config::PORT)),
            5,
        )?;

        let name = config::tun_name();
        let device = open_device(&name)?;
        self.platform
            .configure_tun(&name, ip, prefix, &server.tun_routes())
            .await?;

        let device_config = DeviceConfig {
            tun_ip4: Some(ip),
            tun_ip6: None,
            router_ip4: config::ROUTER_IP,
            router_ip6: config::ROUTER_IP6,
        };
        tokio::spawn(async move {
            if let Err(e) = server.serve(token, device, device_config).await {
                tracing::debug!("tunnel server stopped: {e:#}");
            }
        });

        Ok(())
    }

    async fn setup_dns(&self) -> Result<()> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), "kube-system");
        let nameservers: Vec<std::net::IpAddr> = services
            .get("kube-dns")
            .await
            .ok()
            .and_then(|service| service.spec)
            .and_then(|spec| spec.cluster_ip)
            .and_then(|ip| ip.parse().ok())
            .into_iter()
            .collect();

        let search = vec![
            format!("{}.svc.cluster.local", self.namespace),
            "svc.cluster.local".to_owned(),
            "cluster.local".to_owned(),
        ];

        self.platform
            .setup_dns(&config::tun_name(), &nameservers, &search)
            .await
    }

    /// Restores DNS, runs the rollback hooks in order, releases every
    /// lease we hold and tears the traffic-manager down if we were the
    /// last client.
    pub async fn cleanup(&self) {
        tracing::info!("prepare to exit, cleaning up");

        if let Err(e) = self.platform.cancel_dns().await {
            tracing::error!("Failed to restore DNS: {e:#}");
        }

        let rollbacks = std::mem::take(
            &mut *self
                .rollbacks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for rollback in rollbacks {
            rollback();
        }

        if let Err(e) = self.dhcp.release().await {
            tracing::error!("Failed to release leases: {e:#}");
        }

        TrafficManager::new(self.client.clone(), &self.namespace)
            .cleanup_if_unused()
            .await;

        tracing::info!("clean up successful");
    }
}

#[cfg(target_os = "linux")]
fn open_device(name: &str) -> Result<Arc<dyn Tun>> {
    Ok(Arc::new(tun::TunDevice::open(name)?))
}

#[cfg(not(target_os = "linux"))]
fn open_device(_name: &str) -> Result<Arc<dyn Tun>> {
    anyhow::bail!("TUN devices are only supported on Linux")
}
