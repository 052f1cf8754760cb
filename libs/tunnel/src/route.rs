//! Route configuration: which TUN nodes to serve and through which chain.

use std::{
    net::Ipv4Addr,
    str::FromStr as _,
    sync::Arc,
};

use anyhow::{Context as _, Result, bail};
use ip_network::IpNetwork;
use tokio_util::sync::CancellationToken;
use tun::Tun;

use crate::{
    DeviceConfig, NatTable, TunHandler,
    chain::{Chain, Node, Protocol},
};

#[derive(Debug, Clone, Default)]
pub struct Route {
    /// Serve node URLs, e.g. `tun:/127.0.0.1:8422?net=…&route=…`.
    pub serve_nodes: Vec<String>,
    /// Optional chain node URL, e.g. `tcp://127.0.0.1:10800`.
    pub chain_node: Option<String>,
    pub retries: usize,
}

impl Route {
    pub fn generate_servers(&self) -> Result<Vec<Server>> {
        let chain = match &self.chain_node {
            Some(raw) => {
                let node = Node::from_url(raw)?;
                if node.protocol != Protocol::Tcp {
                    bail!("chain node `{raw}` is not a TCP relay");
                }

                Chain::with_node(node, self.retries)
            }
            None => Chain::new(),
        };

        let servers = self
            .serve_nodes
            .iter()
            .map(|raw| {
                let node = Node::from_url(raw)?;
                if node.protocol != Protocol::Tun {
                    bail!("serve node `{raw}` is not a TUN node");
                }

                Ok(Server {
                    node: node.clone(),
                    handler: Arc::new(TunHandler::new(node, chain.clone())),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if servers.is_empty() {
            bail!("invalid route config");
        }

        Ok(servers)
    }

    /// Convenience for the common single-node shape.
    pub fn single(serve_node: String, chain_node: Option<String>, retries: usize) -> Result<Server> {
        let route = Self {
            serve_nodes: vec![serve_node],
            chain_node,
            retries,
        };

        let mut servers = route.generate_servers()?;

        servers.pop().context("no server was generated")
    }
}

/// One serve node, ready to drive a TUN device.
#[derive(Clone)]
pub struct Server {
    node: Node,
    handler: Arc<TunHandler>,
}

impl Server {
    /// The device's own address and prefix length, from the `net` parameter.
    pub fn tun_net(&self) -> Option<(Ipv4Addr, u8)> {
        let net = self.node.params.get("net")?;
        let (ip, prefix) = net.split_once('/')?;

        Some((ip.parse().ok()?, prefix.parse().ok()?))
    }

    /// The CIDRs this node routes, from the `route` parameter.
    pub fn tun_routes(&self) -> Vec<IpNetwork> {
        let Some(routes) = self.node.params.get("route") else {
            return Vec::new();
        };

        routes
            .split(',')
            .filter_map(|cidr| IpNetwork::from_str_truncate(cidr).ok())
            .collect()
    }

    pub fn routes(&self) -> &NatTable {
        self.handler.routes()
    }

    pub async fn serve(
        &self,
        token: CancellationToken,
        tun: Arc<dyn Tun>,
        config: DeviceConfig,
    ) -> Result<()> {
        self.handler.handle(token, tun, config).await
    }
}

pub fn parse_network(cidr: &str) -> Result<IpNetwork> {
    IpNetwork::from_str(cidr).with_context(|| format!("Failed to parse CIDR `{cidr}`"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_a_server_from_route_strings() {
        let route = Route {
            serve_nodes: vec![
                "tun:/127.0.0.1:8422?net=223.254.254.5/24&route=223.254.254.0/24,10.244.0.0/16"
                    .to_owned(),
            ],
            chain_node: Some("tcp://127.0.0.1:10800".to_owned()),
            retries: 5,
        };

        let servers = route.generate_servers().unwrap();
        assert_eq!(servers.len(), 1);

        let server = &servers[0];
        assert_eq!(
            server.tun_net(),
            Some((Ipv4Addr::new(223, 254, 254, 5), 24))
        );
        assert_eq!(server.tun_routes().len(), 2);
    }

    #[test]
    fn empty_route_is_invalid() {
        let route = Route::default();

        assert!(route.generate_servers().is_err());
    }

    #[test]
    fn non_tun_serve_node_is_rejected() {
        let route = Route {
            serve_nodes: vec!["tcp://127.0.0.1:8422".to_owned()],
            chain_node: None,
            retries: 1,
        };

        assert!(route.generate_servers().is_err());
    }
}
