//! Sidecar injection for reversed workloads.
//!
//! Before the first mutation the workload's original spec is stashed as a
//! JSON snapshot in its own annotations; removal restores that snapshot
//! verbatim, so whatever we did in between cannot leak into the workload.

use std::collections::BTreeMap;

use anyhow::{Context as _, Result, bail};
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, ReplicaSet},
        core::v1::{
            ConfigMap, ConfigMapVolumeSource, Container, Pod, Service, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::{
    Api, ResourceExt as _,
    api::{DeleteParams, ListParams, PostParams},
};
use serde::{Deserialize, Serialize};

use crate::{
    IMAGE_MESH, IMAGE_SERVER, ORIGIN_ANNOTATION, SIDECAR_ENVOY_PROXY, SIDECAR_VPN,
    VOLUME_ENVOY_CONFIG, envoy,
    manager::{privileged_security_context, resources},
    retry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// All traffic for the workload goes to the workstation.
    Reverse,
    /// Only requests carrying the routing tag do.
    Mesh,
}

/// Addresses a sidecar needs to join the tunnel.
#[derive(Debug, Clone)]
pub struct PodRouteConfig {
    /// The workstation's tunnel IP.
    pub local_tun_ip: String,
    /// The shadow IP leased for this workload, with mask.
    pub inbound_pod_tun_ip: String,
    /// The traffic-manager's in-cluster (pod network) IP.
    pub traffic_manager_real_ip: String,
    /// CIDR the sidecar routes into the tunnel.
    pub route: String,
}

pub struct ReverseController {
    client: kube::Client,
    namespace: String,
}

impl ReverseController {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_owned(),
        }
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Normalizes a workload selector to its top-level Deployment.
    ///
    /// `pod/x` climbs the owner references, `service/x` goes through the
    /// label selector to a pod and climbs from there, `deployment/x` (or a
    /// bare name) is taken as-is.
    pub async fn normalize(&self, workload: &str) -> Result<String> {
        let (kind, name) = workload
            .split_once('/')
            .map(|(kind, name)| (kind.to_ascii_lowercase(), name))
            .unwrap_or(("deployment".to_owned(), workload));

        match kind.as_str() {
            "deployment" | "deployments" | "deploy" => Ok(name.to_owned()),
            "replicaset" | "replicasets" | "rs" => self.owner_of_replicaset(name).await,
            "pod" | "pods" | "po" => self.owner_of_pod(name).await,
            "service" | "services" | "svc" => {
                let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
                let services: Api<Service> =
                    Api::namespaced(self.client.clone(), &self.namespace);

                let service = services
                    .get(name)
                    .await
                    .with_context(|| format!("Failed to read service {name}"))?;
                let selector = service
                    .spec
                    .and_then(|spec| spec.selector)
                    .context("service has no selector")?;

                let list = pods
                    .list(&ListParams::default().labels(&selector_string(&selector)))
                    .await
                    .context("Failed to list pods behind service")?;
                let pod = list
                    .items
                    .first()
                    .with_context(|| format!("service {name} selects no pods"))?;

                self.owner_of_pod(&pod.name_any()).await
            }
            other => bail!("Not support resources: {other}/{name}"),
        }
    }

    async fn owner_of_pod(&self, name: &str) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let pod = pods
            .get(name)
            .await
            .with_context(|| format!("Failed to read pod {name}"))?;

        let Some(owner) = pod
            .metadata
            .owner_references
            .as_ref()
            .and_then(|refs| refs.first())
        else {
            bail!("pod {name} has no controller");
        };

        match owner.kind.as_str() {
            "ReplicaSet" => self.owner_of_replicaset(&owner.name).await,
            "Deployment" => Ok(owner.name.clone()),
            other => bail!("Not support resources: {other}/{}", owner.name),
        }
    }

    async fn owner_of_replicaset(&self, name: &str) -> Result<String> {
        let replicasets: Api<ReplicaSet> = Api::namespaced(self.client.clone(), &self.namespace);
        let rs = replicasets
            .get(name)
            .await
            .with_context(|| format!("Failed to read replicaset {name}"))?;

        rs.metadata
            .owner_references
            .as_ref()
            .and_then(|refs| refs.iter().find(|r| r.kind == "Deployment"))
            .map(|r| r.name.clone())
            .with_context(|| format!("replicaset {name} has no deployment owner"))
    }

    /// Injects the VPN sidecar: plain reverse mode, everything lands on
    /// the workstation.
    pub async fn inject_vpn(&self, deployment_name: &str, config: &PodRouteConfig) -> Result<()> {
        let deployments = self.deployments();

        retry::on_conflict(|| async {
            let mut deployment = deployments
                .get(deployment_name)
                .await
                .with_context(|| format!("Failed to read deployment {deployment_name}"))?;

            stash_origin(&mut deployment)?;

            let spec = pod_spec_mut(&mut deployment)?;
            spec.containers.push(vpn_sidecar(config));

            deployments
                .replace(deployment_name, &PostParams::default(), &deployment)
                .await
                .context("Failed to update deployment")?;

            Ok(())
        })
        .await
    }

    /// Injects the VPN and Envoy sidecars plus the rendered bootstrap:
    /// mesh mode, only tagged requests land on the workstation.
    pub async fn inject_vpn_and_envoy(
        &self,
        deployment_name: &str,
        config: &PodRouteConfig,
        headers: &BTreeMap<String, String>,
    ) -> Result<()> {
        let configmap_name = format!("{}-{deployment_name}", self.namespace);

        let tag = headers
            .values()
            .next()
            .cloned()
            .unwrap_or_else(|| "kubevpn".to_owned());
        let shadow_ip = config
            .inbound_pod_tun_ip
            .split('/')
            .next()
            .unwrap_or(&config.inbound_pod_tun_ip)
            .to_owned();
        let port = self.first_service_port(deployment_name).await?;

        self.ensure_envoy_configmap(&configmap_name, &tag, &shadow_ip, &port)
            .await?;

        let deployments = self.deployments();
        retry::on_conflict(|| async {
            let mut deployment = deployments
                .get(deployment_name)
                .await
                .with_context(|| format!("Failed to read deployment {deployment_name}"))?;

            stash_origin(&mut deployment)?;

            let spec = pod_spec_mut(&mut deployment)?;
            spec.volumes.get_or_insert_default().push(Volume {
                name: VOLUME_ENVOY_CONFIG.to_owned(),
                config_map: Some(ConfigMapVolumeSource {
                    name: configmap_name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            });
            spec.containers.push(vpn_sidecar(config));
            spec.containers.push(envoy_sidecar());

            deployments
                .replace(deployment_name, &PostParams::default(), &deployment)
                .await
                .context("Failed to update deployment")?;

            Ok(())
        })
        .await
    }

    /// Reverts the workload to the snapshot taken before injection and
    /// drops the mesh ConfigMap if one exists.
    pub async fn remove_sidecar(&self, deployment_name: &str) -> Result<()> {
        let deployments = self.deployments();

        let deployment = deployments
            .get(deployment_name)
            .await
            .with_context(|| format!("Failed to read deployment {deployment_name}"))?;

        let Some(mut origin) = restore_origin(&deployment)? else {
            tracing::info!(%deployment_name, "No origin snapshot, nothing to revert");
            return Ok(());
        };

        deployments
            .delete(deployment_name, &DeleteParams::default())
            .await
            .context("Failed to delete mutated deployment")?;

        origin.metadata.resource_version = None;
        origin.metadata.uid = None;
        deployments
            .create(&PostParams::default(), &origin)
            .await
            .context("Failed to restore original deployment")?;

        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let _ = configmaps
            .delete(
                &format!("{}-{deployment_name}", self.namespace),
                &DeleteParams::default(),
            )
            .await;

        Ok(())
    }

    /// The target port of the first Service selecting this workload.
    async fn first_service_port(&self, deployment_name: &str) -> Result<String> {
        let deployment = self
            .deployments()
            .get(deployment_name)
            .await
            .with_context(|| format!("Failed to read deployment {deployment_name}"))?;
        let labels = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.match_labels.as_ref())
            .context("deployment has no selector labels")?;

        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = services
            .list(&ListParams::default())
            .await
            .context("Failed to list services")?;

        let service = list
            .items
            .into_iter()
            .find(|service| {
                service
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.selector.as_ref())
                    .is_some_and(|selector| {
                        selector.iter().all(|(k, v)| labels.get(k) == Some(v))
                    })
            })
            .with_context(|| format!("no service selects deployment {deployment_name}"))?;

        let port = service
            .spec
            .and_then(|spec| spec.ports)
            .and_then(|ports| ports.into_iter().next())
            .context("service has no ports")?;

        let target = match port.target_port {
            Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(p)) => {
                p.to_string()
            }
            Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::String(p)) => p,
            None => port.port.to_string(),
        };

        Ok(target)
    }

    async fn ensure_envoy_configmap(
        &self,
        name: &str,
        tag: &str,
        shadow_ip: &str,
        port: &str,
    ) -> Result<()> {
        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);

        let configmap = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(self.namespace.clone()),
                labels: Some([("kubevpn".to_owned(), "kubevpn".to_owned())].into()),
                ..Default::default()
            },
            data: Some(
                [(
                    "envoy.yaml".to_owned(),
                    envoy::bootstrap(tag, shadow_ip, port),
                )]
                .into(),
            ),
            ..Default::default()
        };

        // Recreate rather than patch so a stale bootstrap never survives.
        let _ = configmaps.delete(name, &DeleteParams::default()).await;
        configmaps
            .create(&PostParams::default(), &configmap)
            .await
            .context("Failed to create envoy ConfigMap")?;

        Ok(())
    }
}

/// Stashes the original spec into the annotations, once. A workload that
/// already carries a snapshot keeps the first one.
pub fn stash_origin(deployment: &mut Deployment) -> Result<()> {
    if deployment
        .annotations()
        .contains_key(ORIGIN_ANNOTATION)
    {
        return Ok(());
    }

    let snapshot =
        serde_json::to_string(deployment).context("Failed to serialize origin snapshot")?;
    deployment
        .metadata
        .annotations
        .get_or_insert_default()
        .insert(ORIGIN_ANNOTATION.to_owned(), snapshot);

    Ok(())
}

/// Parses the stashed snapshot back, if any.
pub fn restore_origin(deployment: &Deployment) -> Result<Option<Deployment>> {
    let Some(snapshot) = deployment.annotations().get(ORIGIN_ANNOTATION) else {
        return Ok(None);
    };

    let origin =
        serde_json::from_str(snapshot).context("Failed to parse origin snapshot")?;

    Ok(Some(origin))
}

fn pod_spec_mut(deployment: &mut Deployment) -> Result<&mut k8s_openapi::api::core::v1::PodSpec> {
    deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
        .context("deployment has no pod template spec")
}

/// The VPN sidecar joins the tunnel under the shadow IP so traffic for the
/// workload can be steered to the workstation.
fn vpn_sidecar(config: &PodRouteConfig) -> Container {
    let args = format!(
        "sysctl net.ipv4.ip_forward=1;\
         iptables -F;\
         iptables -P INPUT ACCEPT;\
         iptables -P FORWARD ACCEPT;\
         iptables -t nat -A PREROUTING -i eth0 -p tcp --dport 80:60000 -j DNAT --to {local}:80-60000;\
         iptables -t nat -A POSTROUTING -p tcp -m tcp --dport 80:60000 -j MASQUERADE;\
         iptables -t nat -A PREROUTING -i eth0 -p udp --dport 80:60000 -j DNAT --to {local}:80-60000;\
         iptables -t nat -A POSTROUTING -p udp -m udp --dport 80:60000 -j MASQUERADE;\
         kubevpn serve -L 'tun://0.0.0.0:8421/{router}:8421?net={shadow}&route={route}' --debug=true",
        local = config.local_tun_ip,
        router = config.traffic_manager_real_ip,
        shadow = config.inbound_pod_tun_ip,
        route = config.route,
    );

    Container {
        name: SIDECAR_VPN.to_owned(),
        image: Some(IMAGE_SERVER.to_owned()),
        command: Some(vec!["/bin/sh".to_owned(), "-c".to_owned()]),
        args: Some(vec![args]),
        security_context: Some(privileged_security_context()),
        resources: Some(resources()),
        image_pull_policy: Some("Always".to_owned()),
        ..Default::default()
    }
}

fn envoy_sidecar() -> Container {
    let args = "sysctl net.ipv4.ip_forward=1;\
         iptables -F;\
         iptables -P INPUT ACCEPT;\
         iptables -P FORWARD ACCEPT;\
         iptables -t nat -A PREROUTING -i eth0 -p tcp --dport 80:60000 ! -s 127.0.0.1 -j DNAT --to 127.0.0.1:10501;\
         iptables -t nat -A POSTROUTING -p tcp -m tcp --dport 80:60000 ! -s 127.0.0.1 -j MASQUERADE;\
         iptables -t nat -A PREROUTING -i eth0 -p udp --dport 80:60000 ! -s 127.0.0.1 -j DNAT --to 127.0.0.1:10501;\
         iptables -t nat -A POSTROUTING -p udp -m udp --dport 80:60000 ! -s 127.0.0.1 -j MASQUERADE;\
         envoy -c /etc/envoy.yaml"
        .to_owned();

    Container {
        name: SIDECAR_ENVOY_PROXY.to_owned(),
        image: Some(IMAGE_MESH.to_owned()),
        command: Some(vec!["/bin/sh".to_owned(), "-c".to_owned()]),
        args: Some(vec![args]),
        security_context: Some(privileged_security_context()),
        resources: Some(resources()),
        image_pull_policy: Some("Always".to_owned()),
        volume_mounts: Some(vec![VolumeMount {
            name: VOLUME_ENVOY_CONFIG.to_owned(),
            read_only: Some(false),
            mount_path: "/etc/envoy.yaml".to_owned(),
            sub_path: Some("envoy.yaml".to_owned()),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};

    use super::*;

    fn deployment() -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("productpage".to_owned()),
                namespace: Some("default".to_owned()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "app".to_owned(),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn config() -> PodRouteConfig {
        PodRouteConfig {
            local_tun_ip: "223.254.254.5".to_owned(),
            inbound_pod_tun_ip: "223.254.254.7/24".to_owned(),
            traffic_manager_real_ip: "10.244.1.12".to_owned(),
            route: "223.254.254.0/24".to_owned(),
        }
    }

    #[test]
    fn origin_snapshot_round_trips_modulo_resource_version() {
        let mut mutated = deployment();
        stash_origin(&mut mutated).unwrap();

        let spec = pod_spec_mut(&mut mutated).unwrap();
        spec.containers.push(vpn_sidecar(&config()));
        spec.containers.push(envoy_sidecar());

        let restored = restore_origin(&mutated).unwrap().unwrap();
        assert_eq!(restored, deployment());
    }

    #[test]
    fn stash_origin_keeps_the_first_snapshot() {
        let mut first = deployment();
        stash_origin(&mut first).unwrap();
        let snapshot = first.annotations()[ORIGIN_ANNOTATION].clone();

        let spec = pod_spec_mut(&mut first).unwrap();
        spec.containers.push(vpn_sidecar(&config()));
        stash_origin(&mut first).unwrap();

        assert_eq!(first.annotations()[ORIGIN_ANNOTATION], snapshot);
    }

    #[test]
    fn vpn_sidecar_joins_the_tunnel_under_the_shadow_ip() {
        let container = vpn_sidecar(&config());

        assert_eq!(container.name, SIDECAR_VPN);
        let args = container.args.unwrap().join(" ");
        assert!(args.contains("net=223.254.254.7/24"));
        assert!(args.contains("tun://0.0.0.0:8421/10.244.1.12:8421"));
        assert!(args.contains("--to 223.254.254.5:80-60000"));
    }

    #[test]
    fn envoy_sidecar_mounts_the_rendered_bootstrap() {
        let container = envoy_sidecar();

        assert_eq!(container.name, SIDECAR_ENVOY_PROXY);
        assert_eq!(
            container.volume_mounts.unwrap()[0].mount_path,
            "/etc/envoy.yaml"
        );
    }
}
