//! Discovery of the CIDRs the tunnel should route.
//!
//! Three sources are merged: node specs, observed pod IPs and the service
//! CIDR. The service CIDR is not exposed by any API, so we ask the
//! apiserver to allocate an impossible ClusterIP and read the valid range
//! out of the rejection message.

use std::{collections::BTreeSet, net::IpAddr};

use anyhow::{Context as _, Result};
use ip_network::{IpNetwork, Ipv4Network, Ipv6Network};
use k8s_openapi::api::core::v1::{Node, Pod, Service, ServicePort, ServiceSpec};
use kube::{
    Api,
    api::{DeleteParams, ListParams, ObjectMeta, PostParams},
};

const SERVICE_CIDR_MARKER: &str = "The range of valid IPs is";

pub async fn discover(client: &kube::Client, namespace: &str) -> Result<Vec<IpNetwork>> {
    let mut cidrs: Vec<IpNetwork> = Vec::new();

    // 1) Pod CIDRs straight from the node specs.
    let nodes: Api<Node> = Api::all(client.clone());
    if let Ok(list) = nodes.list(&ListParams::default()).await {
        let mut specs = BTreeSet::new();
        for node in list {
            let Some(spec) = node.spec else { continue };
            if let Some(cidr) = spec.pod_cidr {
                specs.insert(cidr);
            }
            specs.extend(spec.pod_cidrs.unwrap_or_default());
        }

        for spec in specs {
            if let Ok(cidr) = IpNetwork::from_str_truncate(&spec) {
                cidrs.push(cidr);
            }
        }
    }

    // 2) Observed pod IPs. Node specs lie on some distributions, so every
    // pod IP not already covered widens into a /24.
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    if let Ok(list) = pods.list(&ListParams::default()).await {
        for pod in list {
            let Some(ip) = pod
                .status
                .and_then(|status| status.pod_ip)
                .and_then(|ip| ip.parse::<IpAddr>().ok())
            else {
                continue;
            };

            if !covered(&cidrs, ip) {
                cidrs.push(widen_pod_ip(ip));
            }
        }
    }

    // 3) The service CIDR, via a deliberately invalid Service.
    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    let probe = Service {
        metadata: ObjectMeta {
            generate_name: Some("foo-svc-".to_owned()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                port: 80,
                ..Default::default()
            }]),
            cluster_ip: Some("0.0.0.0".to_owned()),
            ..Default::default()
        }),
        ..Default::default()
    };
    match services.create(&PostParams::default(), &probe).await {
        Err(e) => {
            if let Some(cidr) = parse_service_cidr_error(&e.to_string()) {
                cidrs.push(cidr);
            }
        }
        Ok(created) => {
            // Creation unexpectedly succeeded. Take the probe back out and
            // widen every observed ClusterIP instead.
            if let Some(name) = created.metadata.name {
                let _ = services.delete(&name, &DeleteParams::default()).await;
            }

            if let Ok(list) = services.list(&ListParams::default()).await {
                for service in list {
                    let Some(ip) = service
                        .spec
                        .and_then(|spec| spec.cluster_ip)
                        .and_then(|ip| ip.parse::<IpAddr>().ok())
                    else {
                        continue;
                    };

                    if !covered(&cidrs, ip) {
                        cidrs.push(widen_service_ip(ip));
                    }
                }
            }
        }
    }

    let cidrs = dedup(cidrs);
    if cidrs.is_empty() {
        return Err(crate::Error::NoCidr).context("CIDR discovery came up empty");
    }

    Ok(cidrs)
}

fn covered(cidrs: &[IpNetwork], ip: IpAddr) -> bool {
    cidrs.iter().any(|cidr| cidr.contains(ip))
}

fn widen_pod_ip(ip: IpAddr) -> IpNetwork {
    widen(ip, 24, 64)
}

fn widen_service_ip(ip: IpAddr) -> IpNetwork {
    widen(ip, 16, 64)
}

#[allow(clippy::unwrap_used)] // Both prefixes are statically in range.
fn widen(ip: IpAddr, v4_prefix: u8, v6_prefix: u8) -> IpNetwork {
    match ip {
        IpAddr::V4(ip) => Ipv4Network::new_truncate(ip, v4_prefix).unwrap().into(),
        IpAddr::V6(ip) => Ipv6Network::new_truncate(ip, v6_prefix).unwrap().into(),
    }
}

/// Extracts the service CIDR from the apiserver's rejection message, e.g.
/// `… The range of valid IPs is 10.96.0.0/12`.
fn parse_service_cidr_error(message: &str) -> Option<IpNetwork> {
    let index = message.rfind(SERVICE_CIDR_MARKER)?;
    let raw = message[index + SERVICE_CIDR_MARKER.len()..].trim();

    IpNetwork::from_str_truncate(raw).ok()
}

fn dedup(cidrs: Vec<IpNetwork>) -> Vec<IpNetwork> {
    let mut seen = BTreeSet::new();
    cidrs
        .into_iter()
        .filter(|cidr| seen.insert(cidr.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_cidr_is_parsed_out_of_the_rejection() {
        let message = "Service \"foo-svc-x7k2p\" is invalid: spec.clusterIPs: Invalid value: \
                       []string{\"0.0.0.0\"}: failed to allocate IP 0.0.0.0: the provided IP \
                       (0.0.0.0) is not in the valid range. The range of valid IPs is 10.96.0.0/12";

        assert_eq!(
            parse_service_cidr_error(message),
            Some("10.96.0.0/12".parse().unwrap())
        );
    }

    #[test]
    fn rejection_without_the_marker_yields_nothing() {
        assert_eq!(parse_service_cidr_error("services is forbidden"), None);
    }

    #[test]
    fn pod_ips_widen_to_a_slash_24() {
        assert_eq!(
            widen_pod_ip("172.17.0.5".parse().unwrap()),
            "172.17.0.0/24".parse::<IpNetwork>().unwrap()
        );
    }

    #[test]
    fn service_ips_widen_to_a_slash_16() {
        assert_eq!(
            widen_service_ip("10.96.128.3".parse().unwrap()),
            "10.96.0.0/16".parse::<IpNetwork>().unwrap()
        );
    }

    #[test]
    fn duplicates_collapse_in_order() {
        let cidrs = vec![
            "10.244.0.0/16".parse().unwrap(),
            "10.96.0.0/12".parse().unwrap(),
            "10.244.0.0/16".parse().unwrap(),
        ];

        let deduped = dedup(cidrs);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0], "10.244.0.0/16".parse::<IpNetwork>().unwrap());
    }

    #[test]
    fn coverage_takes_existing_cidrs_into_account() {
        let cidrs: Vec<IpNetwork> = vec!["10.244.0.0/16".parse().unwrap()];

        assert!(covered(&cidrs, "10.244.3.7".parse().unwrap()));
        assert!(!covered(&cidrs, "172.17.0.5".parse().unwrap()));
    }
}
