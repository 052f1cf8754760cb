//! Everything that talks to the Kubernetes cluster: the lease record and
//! its allocator, CIDR discovery, the traffic-manager lifecycle, supervised
//! port-forwards and sidecar injection for reversed workloads.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod allocator;
pub mod cidr;
pub mod dhcp;
pub mod envoy;
pub mod manager;
pub mod portforward;
pub mod reverse;

mod lease;
mod retry;

pub use allocator::IpAllocator;
pub use dhcp::DhcpManager;
pub use lease::{LeaseTable, UsedIpMap, used_ip_from_string, used_ip_to_string};
pub use manager::TrafficManager;
pub use reverse::{Mode, PodRouteConfig, ReverseController};

/// Name of the ConfigMap, Deployment and Service making up the
/// traffic-manager in a namespace.
pub const TRAFFIC_MANAGER: &str = "kubevpn-traffic-manager";

/// Keys inside the lease-record ConfigMap.
pub const KEY_USED_IP: &str = "UsedIP";
pub const KEY_DHCP: &str = "DHCP";
pub const KEY_MAC2IP: &str = "MAC2IP";
pub const KEY_ENVOY: &str = "Envoy";

/// Synthetic identity under which the router's own tunnel IP is leased.
pub const ROUTER_MAC: &str = "ee:ee:ee:ee:ee:ee";

/// Client-count annotation on the traffic-manager Service.
pub const REF_COUNT_ANNOTATION: &str = "ref-count";

/// Annotation under which a reversed workload's original spec is stashed.
pub const ORIGIN_ANNOTATION: &str = "kubevpn";

/// Header that selects the mesh route to the workstation.
pub const ROUTING_HEADER: &str = "KubeVPN-Routing-Tag";

pub const SIDECAR_VPN: &str = "vpn";
pub const SIDECAR_ENVOY_PROXY: &str = "envoy-proxy";
pub const SIDECAR_CONTROL_PLANE: &str = "control-plane";
pub const VOLUME_ENVOY_CONFIG: &str = "envoy-config";

pub const IMAGE_SERVER: &str = "naison/kubevpn:latest";
pub const IMAGE_MESH: &str = "naison/kubevpn-mesh:latest";
pub const IMAGE_CONTROL_PLANE: &str = "naison/envoy-xds-server:latest";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no IP available in {0}")]
    NoIpAvailable(ip_network::Ipv4Network),

    #[error("can not find any CIDR")]
    NoCidr,

    #[error("lease record not found in namespace {0}")]
    RecordNotFound(String),
}

/// The workstation's identity in the lease record.
///
/// Falls back to a fixed locally-administered address when no interface
/// reports a MAC (containers, CI).
pub fn mac_address() -> String {
    mac_address::get_mac_address()
        .ok()
        .flatten()
        .map(|mac| mac.to_string().to_lowercase())
        .unwrap_or_else(|| "02:00:00:00:00:01".to_owned())
}

pub(crate) fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(api) if api.code == 404)
}

pub(crate) fn is_already_exists(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(api) if api.code == 409 && api.reason == "AlreadyExists")
}
