//! Client-side dialing through a chain of relay hops.
//!
//! A chain is at most one TCP relay node in front of the target; an empty
//! chain dials directly. Route selection deliberately takes no interest in
//! the target address.

use std::{collections::HashMap, net::SocketAddr, time::Duration};

use anyhow::{Context as _, Result, anyhow, bail};
use tokio::{
    net::{TcpStream, UdpSocket, lookup_host},
    time::timeout,
};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tun,
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

/// One hop: a protocol, a local or dial address, an optional remote
/// endpoint and free-form parameters.
///
/// Serve nodes look like `tun://127.0.0.1:8422?net=223.254.254.5/24&route=…`
/// (no remote, server role) or `tun://0.0.0.0:8421/223.254.254.100:8421?…`
/// (remote present, client role). Chain nodes look like `tcp://host:port`.
#[derive(Debug, Clone)]
pub struct Node {
    pub protocol: Protocol,
    pub addr: String,
    pub remote: Option<String>,
    pub params: HashMap<String, String>,
}

impl Node {
    pub fn from_url(raw: &str) -> Result<Self> {
        let url = url::Url::parse(raw).with_context(|| format!("Failed to parse node `{raw}`"))?;

        let protocol = match url.scheme() {
            "tun" => Protocol::Tun,
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            other => bail!("unsupported node protocol `{other}`"),
        };

        let (addr, remote) = match url.host_str() {
            Some(host) => {
                let addr = match url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_owned(),
                };
                let path = url.path().trim_start_matches('/');
                let remote = (!path.is_empty()).then(|| path.to_owned());

                (addr, remote)
            }
            // `tun:/127.0.0.1:8422` has no authority, the address is the path.
            None => (url.path().trim_start_matches('/').to_owned(), None),
        };

        let params = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        Ok(Self {
            protocol,
            addr,
            remote,
            params,
        })
    }
}

/// The outcome of a dial: either a raw datagram socket or a relayed stream.
pub enum Transport {
    Stream(TcpStream),
    Datagram(UdpSocket),
}

#[derive(Debug, Clone, Default)]
pub struct Chain {
    node: Option<Node>,
    retries: usize,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(node: Node, retries: usize) -> Self {
        Self {
            node: Some(node),
            retries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.node.is_none()
    }

    pub async fn dial(&self, network: Network, addr: &str) -> Result<Transport> {
        let retries = self.retries.max(1);

        let mut last_err = None;
        for _ in 0..retries {
            match self.dial_once(network, addr).await {
                Ok(transport) => return Ok(transport),
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("no dial attempts were made")))
    }

    async fn dial_once(&self, network: Network, addr: &str) -> Result<Transport> {
        // Route selection does not consider the target address.
        let Some(node) = &self.node else {
            if network == Network::Udp && addr.is_empty() {
                let socket = UdpSocket::bind("0.0.0.0:0")
                    .await
                    .context("Failed to bind anonymous UDP socket")?;

                return Ok(Transport::Datagram(socket));
            }

            let resolved = resolve(addr).await?;

            return match network {
                Network::Tcp => {
                    let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(resolved))
                        .await
                        .with_context(|| format!("Dial to {resolved} timed out"))?
                        .with_context(|| format!("Failed to dial {resolved}"))?;

                    Ok(Transport::Stream(stream))
                }
                Network::Udp => {
                    let socket = UdpSocket::bind("0.0.0.0:0")
                        .await
                        .context("Failed to bind UDP socket")?;
                    socket
                        .connect(resolved)
                        .await
                        .with_context(|| format!("Failed to connect UDP socket to {resolved}"))?;

                    Ok(Transport::Datagram(socket))
                }
            };
        };

        let resolved = resolve(addr).await?;

        let conn = timeout(DIAL_TIMEOUT, TcpStream::connect(&node.addr))
            .await
            .with_context(|| format!("Dial to chain node {} timed out", node.addr))?
            .with_context(|| format!("Failed to dial chain node {}", node.addr))?;

        // On handshake failure the underlying connection is dropped.
        let conn = timeout(HANDSHAKE_TIMEOUT, connect_through(node, conn, network, resolved))
            .await
            .with_context(|| format!("Handshake with {} timed out", node.addr))??;

        Ok(Transport::Stream(conn))
    }
}

/// Resolves `addr` once, preferring the first A record.
async fn resolve(addr: &str) -> Result<SocketAddr> {
    let addrs: Vec<_> = lookup_host(addr)
        .await
        .with_context(|| format!("Failed to resolve {addr}"))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or(addrs.first())
        .copied()
        .with_context(|| format!("{addr} resolved to no addresses"))
}

/// Completes the handshake to `target` through `node`.
async fn connect_through(
    node: &Node,
    conn: TcpStream,
    _network: Network,
    _target: SocketAddr,
) -> Result<TcpStream> {
    match node.protocol {
        // A TCP chain node is a plain forwarder; the far end already pipes
        // into the tunnel endpoint, so there is nothing to negotiate.
        Protocol::Tcp => Ok(conn),
        Protocol::Tun | Protocol::Udp => bail!("chain nodes must be TCP relays"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve_node_without_authority() {
        let node = Node::from_url("tun:/127.0.0.1:8422?net=223.254.254.5/24&route=10.0.0.0/8")
            .unwrap();

        assert_eq!(node.protocol, Protocol::Tun);
        assert_eq!(node.addr, "127.0.0.1:8422");
        assert_eq!(node.remote, None);
        assert_eq!(node.params["net"], "223.254.254.5/24");
        assert_eq!(node.params["route"], "10.0.0.0/8");
    }

    #[test]
    fn parses_client_node_with_remote() {
        let node =
            Node::from_url("tun://0.0.0.0:8421/223.254.254.100:8421?net=223.254.254.9/24").unwrap();

        assert_eq!(node.addr, "0.0.0.0:8421");
        assert_eq!(node.remote.as_deref(), Some("223.254.254.100:8421"));
    }

    #[test]
    fn rejects_unknown_protocols() {
        assert!(Node::from_url("quic://127.0.0.1:1").is_err());
    }

    #[tokio::test]
    async fn empty_chain_with_empty_udp_addr_binds_anonymously() {
        let transport = Chain::new().dial(Network::Udp, "").await.unwrap();

        let Transport::Datagram(socket) = transport else {
            panic!("expected a datagram socket");
        };
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn empty_chain_dials_directly() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await });

        let transport = Chain::new()
            .dial(Network::Tcp, &addr.to_string())
            .await
            .unwrap();
        assert!(matches!(transport, Transport::Stream(_)));
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn chain_dials_through_the_relay_node() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await });

        let node = Node::from_url(&format!("tcp://{relay_addr}")).unwrap();
        let chain = Chain::with_node(node, 3);

        // The target is never dialed directly; only the relay sees a connection.
        let transport = chain.dial(Network::Udp, "192.0.2.1:8422").await.unwrap();
        assert!(matches!(transport, Transport::Stream(_)));
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dial_failure_surfaces_after_retries() {
        let node = Node::from_url("tcp://127.0.0.1:1").unwrap();
        let chain = Chain::with_node(node, 2);

        assert!(chain.dial(Network::Udp, "192.0.2.1:8422").await.is_err());
    }
}
