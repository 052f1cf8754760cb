//! Lifecycle of the in-cluster traffic-manager.
//!
//! The traffic-manager is a Deployment + Service pair shared by every
//! client of a namespace. Its Service carries a `ref-count` annotation
//! counting connected clients; the last one out tears everything down.

use anyhow::{Context as _, Result};
use ip_network::IpNetwork;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Capabilities, Container, ContainerPort, Pod, PodSpec, PodTemplateSpec,
            ResourceRequirements, SecurityContext, Service, ServicePort, ServiceSpec,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, ObjectMeta},
        util::intstr::IntOrString,
    },
};
use kube::{
    Api,
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
};

use crate::{REF_COUNT_ANNOTATION, TRAFFIC_MANAGER, is_already_exists, is_not_found, retry};

/// TCP port the traffic-manager accepts workstation tunnels on.
pub const TUNNEL_PORT: u16 = 10800;

pub struct TrafficManager {
    client: kube::Client,
    namespace: String,
}

impl TrafficManager {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_owned(),
        }
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Creates the traffic-manager Deployment and Service if absent and
    /// counts this client in.
    pub async fn ensure(&self, router_net: &str, routes: &[IpNetwork]) -> Result<()> {
        let deployments = self.deployments();

        match deployments.get(TRAFFIC_MANAGER).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {
                tracing::info!("Creating traffic manager in {}", self.namespace);

                let deployment = deployment(&self.namespace, router_net, routes);
                match deployments.create(&PostParams::default(), &deployment).await {
                    Ok(_) => {}
                    Err(e) if is_already_exists(&e) => {}
                    Err(e) => return Err(e).context("Failed to create traffic manager"),
                }

                match self
                    .services()
                    .create(&PostParams::default(), &service(&self.namespace))
                    .await
                {
                    Ok(_) => {}
                    Err(e) if is_already_exists(&e) => {}
                    Err(e) => return Err(e).context("Failed to create traffic manager service"),
                }
            }
            Err(e) => return Err(e).context("Failed to read traffic manager"),
        }

        self.bump_ref_count(1).await;

        Ok(())
    }

    /// Adds `increment` to the `ref-count` annotation via JSON-patch, under
    /// retry-on-conflict. Failing to count is logged, never fatal.
    pub async fn bump_ref_count(&self, increment: i64) {
        let services = self.services();

        let result = retry::on_conflict(|| async {
            let service = services
                .get(TRAFFIC_MANAGER)
                .await
                .context("Failed to read traffic manager service")?;

            let current = service
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(REF_COUNT_ANNOTATION))
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);

            let patch: json_patch::Patch = serde_json::from_value(serde_json::json!([{
                "op": "replace",
                "path": format!("/metadata/annotations/{REF_COUNT_ANNOTATION}"),
                "value": (current + increment).to_string(),
            }]))
            .context("Failed to build ref-count patch")?;

            services
                .patch(
                    TRAFFIC_MANAGER,
                    &PatchParams::default(),
                    &Patch::Json::<()>(patch),
                )
                .await
                .context("Failed to patch ref-count")?;

            Ok(())
        })
        .await;

        match result {
            Ok(()) => tracing::info!("update ref count successfully"),
            Err(e) => tracing::error!("update ref count error: {e:#}"),
        }
    }

    /// Counts this client out; when nobody is left, deletes the ConfigMap,
    /// Service and Deployment with no grace period.
    pub async fn cleanup_if_unused(&self) {
        self.bump_ref_count(-1).await;

        let ref_count = match self.services().get(TRAFFIC_MANAGER).await {
            Ok(service) => service
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(REF_COUNT_ANNOTATION))
                .and_then(|v| v.parse::<i64>().ok()),
            Err(e) => {
                tracing::error!("Failed to read traffic manager service: {e}");
                return;
            }
        };

        let Some(ref_count) = ref_count else {
            tracing::error!("traffic manager has no readable ref-count");
            return;
        };

        if ref_count > 0 {
            return;
        }

        tracing::info!("refCount is zero, prepare to clean up resource");
        let delete = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };

        let configmaps: Api<k8s_openapi::api::core::v1::ConfigMap> =
            Api::namespaced(self.client.clone(), &self.namespace);
        let _ = configmaps.delete(TRAFFIC_MANAGER, &delete).await;
        let _ = self.services().delete(TRAFFIC_MANAGER, &delete).await;
        let _ = self.deployments().delete(TRAFFIC_MANAGER, &delete).await;
    }

    /// The traffic-manager pods that are actually running.
    pub async fn running_pods(&self) -> Result<Vec<Pod>> {
        let list = self
            .pods()
            .list(&ListParams::default().labels(&format!("app={TRAFFIC_MANAGER}")))
            .await
            .context("Failed to list traffic manager pods")?;

        let running: Vec<Pod> = list
            .into_iter()
            .filter(|pod| {
                pod.metadata.deletion_timestamp.is_none()
                    && pod
                        .status
                        .as_ref()
                        .and_then(|status| status.phase.as_deref())
                        == Some("Running")
            })
            .collect();

        anyhow::ensure!(!running.is_empty(), "can not found any running pod");

        Ok(running)
    }
}

fn labels() -> std::collections::BTreeMap<String, String> {
    [("app".to_owned(), TRAFFIC_MANAGER.to_owned())].into()
}

pub(crate) fn resources() -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(
            [
                ("cpu".to_owned(), Quantity("128m".to_owned())),
                ("memory".to_owned(), Quantity("128Mi".to_owned())),
            ]
            .into(),
        ),
        limits: Some(
            [
                ("cpu".to_owned(), Quantity("256m".to_owned())),
                ("memory".to_owned(), Quantity("256Mi".to_owned())),
            ]
            .into(),
        ),
        ..Default::default()
    }
}

pub(crate) fn privileged_security_context() -> SecurityContext {
    SecurityContext {
        capabilities: Some(Capabilities {
            add: Some(vec!["NET_ADMIN".to_owned()]),
            ..Default::default()
        }),
        run_as_user: Some(0),
        privileged: Some(true),
        ..Default::default()
    }
}

fn deployment(namespace: &str, router_net: &str, routes: &[IpNetwork]) -> Deployment {
    let route_list = routes
        .iter()
        .map(|cidr| cidr.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let serve = format!(
        "sysctl net.ipv4.ip_forward=1;\
         iptables -F;\
         iptables -P INPUT ACCEPT;\
         iptables -P FORWARD ACCEPT;\
         iptables -t nat -A POSTROUTING -s {router_net} -o eth0 -j MASQUERADE;\
         kubevpn serve -L 'tun:/127.0.0.1:8422?net={router_net}&route={route_list}' \
         -L 'tcp://:{TUNNEL_PORT}' --debug=true"
    );

    Deployment {
        metadata: ObjectMeta {
            name: Some(TRAFFIC_MANAGER.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(labels()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: crate::SIDECAR_VPN.to_owned(),
                        image: Some(crate::IMAGE_SERVER.to_owned()),
                        command: Some(vec!["/bin/sh".to_owned(), "-c".to_owned()]),
                        args: Some(vec![serve]),
                        ports: Some(vec![ContainerPort {
                            container_port: TUNNEL_PORT.into(),
                            ..Default::default()
                        }]),
                        security_context: Some(privileged_security_context()),
                        resources: Some(resources()),
                        image_pull_policy: Some("Always".to_owned()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service(namespace: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(TRAFFIC_MANAGER.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(labels()),
            annotations: Some([(REF_COUNT_ANNOTATION.to_owned(), "0".to_owned())].into()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels()),
            ports: Some(vec![ServicePort {
                port: TUNNEL_PORT.into(),
                target_port: Some(IntOrString::Int(TUNNEL_PORT.into())),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_runs_the_tunnel_server() {
        let routes: Vec<IpNetwork> = vec![
            "223.254.254.0/24".parse().unwrap(),
            "10.244.0.0/16".parse().unwrap(),
        ];
        let deployment = deployment("default", "223.254.254.100/24", &routes);

        let container = &deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.name, crate::SIDECAR_VPN);

        let args = container.args.as_ref().unwrap().join(" ");
        assert!(args.contains("net=223.254.254.100/24"));
        assert!(args.contains("route=223.254.254.0/24,10.244.0.0/16"));
        assert!(args.contains("tcp://:10800"));
    }

    #[test]
    fn service_starts_with_a_zero_ref_count() {
        let service = service("default");

        assert_eq!(
            service.metadata.annotations.unwrap()[REF_COUNT_ANNOTATION],
            "0"
        );
        assert_eq!(
            service.spec.unwrap().ports.unwrap()[0].port,
            i32::from(TUNNEL_PORT)
        );
    }
}
