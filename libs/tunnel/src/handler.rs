use std::{sync::Arc, time::Duration};

use anyhow::{Context as _, Result, anyhow};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::UdpSocket,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tun::Tun;

use crate::{
    Device, DeviceConfig, NatTable, Packet,
    chain::{Chain, Network, Node, Transport},
    peer::Peer,
    pool,
};

/// Drives one TUN device, in either role.
///
/// A node with a remote endpoint is a client: it dials the remote through
/// the chain and bridges the device over the resulting transport. A node
/// without one is a server: it listens for UDP peers and relays between
/// them and the device.
pub struct TunHandler {
    node: Node,
    chain: Chain,
    routes: NatTable,
}

impl TunHandler {
    pub fn new(node: Node, chain: Chain) -> Self {
        Self {
            node,
            chain,
            routes: NatTable::new(),
        }
    }

    pub fn routes(&self) -> &NatTable {
        &self.routes
    }

    pub async fn handle(
        &self,
        token: CancellationToken,
        tun: Arc<dyn Tun>,
        config: DeviceConfig,
    ) -> Result<()> {
        if self.node.remote.is_some() {
            self.handle_client(token, tun, config).await
        } else {
            self.handle_server(token, tun, config).await
        }
    }

    /// The server role: bind UDP, relay, rebind on socket failure.
    ///
    /// Only a device failure or cancellation ends the loop.
    async fn handle_server(
        &self,
        token: CancellationToken,
        tun: Arc<dyn Tun>,
        config: DeviceConfig,
    ) -> Result<()> {
        let (exit_tx, mut exit_rx) = mpsc::channel::<anyhow::Error>(1);
        let device = Device::start(tun, config, exit_tx);

        tokio::spawn(print_routes(self.routes.clone(), token.child_token()));

        let result = loop {
            if token.is_cancelled() {
                break Ok(());
            }

            let conn = match UdpSocket::bind(&self.node.addr).await {
                Ok(conn) => Arc::new(conn),
                Err(e) => {
                    tracing::debug!("[udp] can not listen {}: {e}", self.node.addr);
                    tokio::select! {
                        _ = token.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };

            let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(2);
            let peer_token = token.child_token();
            let peer = Peer::start(
                conn.clone(),
                self.routes.clone(),
                &device,
                err_tx.clone(),
                &peer_token,
            );

            tokio::spawn(forward_to_peers(
                device.inbound(),
                self.routes.clone(),
                conn,
                err_tx,
                peer_token.clone(),
            ));

            tokio::select! {
                _ = token.cancelled() => {
                    peer.close();
                    peer_token.cancel();
                    break Ok(());
                }
                error = err_rx.recv() => {
                    if let Some(error) = error {
                        tracing::debug!("[tun] {}: {error:#}", device.name());
                    }
                    peer.close();
                    peer_token.cancel();
                }
                error = exit_rx.recv() => {
                    peer.close();
                    peer_token.cancel();
                    break Err(error.unwrap_or_else(|| anyhow!("device gone")));
                }
            }
        };

        device.close();

        result
    }

    /// The client role: dial the remote through the chain and bridge the
    /// device over the transport, redialing on transport failure.
    async fn handle_client(
        &self,
        token: CancellationToken,
        tun: Arc<dyn Tun>,
        config: DeviceConfig,
    ) -> Result<()> {
        let remote = self
            .node
            .remote
            .clone()
            .context("client node has no remote endpoint")?;

        let (exit_tx, mut exit_rx) = mpsc::channel::<anyhow::Error>(1);
        let device = Device::start(tun, config, exit_tx);

        let result = loop {
            if token.is_cancelled() {
                break Ok(());
            }

            let transport = tokio::select! {
                _ = token.cancelled() => break Ok(()),
                result = self.chain.dial(Network::Udp, &remote) => match result {
                    Ok(transport) => transport,
                    Err(e) => {
                        tracing::debug!("[tun] failed to dial {remote}: {e:#}");
                        tokio::select! {
                            _ = token.cancelled() => break Ok(()),
                            _ = tokio::time::sleep(Duration::from_secs(2)) => continue,
                        }
                    }
                },
            };

            let bridge_token = token.child_token();
            let mut bridge = tokio::spawn(bridge_transport(
                transport,
                device.inbound(),
                device.outbound(),
                bridge_token.clone(),
            ));

            tokio::select! {
                _ = token.cancelled() => {
                    bridge_token.cancel();
                    break Ok(());
                }
                result = &mut bridge => {
                    match result {
                        Ok(Err(e)) => tracing::debug!("[tun] transport to {remote} failed: {e:#}"),
                        Ok(Ok(())) => {}
                        Err(e) => tracing::debug!("[tun] bridge task failed: {e}"),
                    }
                    bridge_token.cancel();
                    tokio::select! {
                        _ = token.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
                error = exit_rx.recv() => {
                    bridge_token.cancel();
                    break Err(error.unwrap_or_else(|| anyhow!("device gone")));
                }
            }
        };

        device.close();

        result
    }
}

async fn forward_to_peers(
    inbound: flume::Receiver<Packet>,
    routes: NatTable,
    conn: Arc<UdpSocket>,
    errors: mpsc::Sender<anyhow::Error>,
    token: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = token.cancelled() => return,
            next = inbound.recv_async() => match next {
                Ok(packet) => packet,
                Err(_) => return,
            },
        };

        let Some(addr) = routes.route_to(packet.dst) else {
            tracing::debug!("[tun] no route for {} -> {}", packet.src, packet.dst);
            continue;
        };

        tracing::trace!("[tun] find route: {} -> {addr}", packet.dst);

        if let Err(e) = conn.send_to(packet.bytes(), addr).await {
            tracing::debug!("[tun] can not route: {} -> {addr}", packet.dst);
            let _ = errors.try_send(anyhow::Error::new(e).context("Failed to forward datagram"));
            return;
        }
    }
}

async fn print_routes(routes: NatTable, token: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let mut count = 0;
        routes.for_each(|ip, addrs| {
            count += 1;
            let list = addrs
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(" ");
            tracing::debug!("to: {ip}, route: {list}");
        });
        tracing::debug!("{count} routes");
    }
}

async fn bridge_transport(
    transport: Transport,
    inbound: flume::Receiver<Packet>,
    outbound: flume::Sender<Packet>,
    token: CancellationToken,
) -> Result<()> {
    match transport {
        Transport::Datagram(conn) => {
            let conn = Arc::new(conn);
            let mut egress = tokio::spawn(datagram_egress(conn.clone(), inbound, token.clone()));
            let mut ingress = tokio::spawn(datagram_ingress(conn, outbound, token.clone()));

            let result = tokio::select! {
                _ = token.cancelled() => Ok(()),
                r = &mut egress => r.context("egress task failed")?,
                r = &mut ingress => r.context("ingress task failed")?,
            };

            egress.abort();
            ingress.abort();

            result
        }
        Transport::Stream(stream) => {
            let (read, write) = stream.into_split();
            let mut egress = tokio::spawn(stream_egress(write, inbound, token.clone()));
            let mut ingress = tokio::spawn(stream_ingress(read, outbound, token.clone()));

            let result = tokio::select! {
                _ = token.cancelled() => Ok(()),
                r = &mut egress => r.context("egress task failed")?,
                r = &mut ingress => r.context("ingress task failed")?,
            };

            egress.abort();
            ingress.abort();

            result
        }
    }
}

async fn datagram_egress(
    conn: Arc<UdpSocket>,
    inbound: flume::Receiver<Packet>,
    token: CancellationToken,
) -> Result<()> {
    loop {
        let packet = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            next = inbound.recv_async() => next.context("device inbound closed")?,
        };

        conn.send(packet.bytes())
            .await
            .context("Failed to send packet to remote")?;
    }
}

async fn datagram_ingress(
    conn: Arc<UdpSocket>,
    outbound: flume::Sender<Packet>,
    token: CancellationToken,
) -> Result<()> {
    loop {
        let mut buf = pool().pull();

        let len = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            result = conn.recv(&mut buf) => result.context("Failed to read packet from remote")?,
        };

        let Some(packet) = Packet::new(buf, len) else {
            tracing::error!("[tun] unknown packet");
            continue;
        };

        if outbound.send_async(packet).await.is_err() {
            return Ok(());
        }
    }
}

async fn stream_egress(
    mut write: tokio::net::tcp::OwnedWriteHalf,
    inbound: flume::Receiver<Packet>,
    token: CancellationToken,
) -> Result<()> {
    loop {
        let packet = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            next = inbound.recv_async() => next.context("device inbound closed")?,
        };

        let len = u16::try_from(packet.bytes().len()).context("packet too large to frame")?;

        write
            .write_u16(len)
            .await
            .context("Failed to write frame header")?;
        write
            .write_all(packet.bytes())
            .await
            .context("Failed to write frame")?;
    }
}

async fn stream_ingress(
    mut read: tokio::net::tcp::OwnedReadHalf,
    outbound: flume::Sender<Packet>,
    token: CancellationToken,
) -> Result<()> {
    loop {
        let len = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            result = read.read_u16() => result.context("Failed to read frame header")? as usize,
        };

        let mut buf = pool().pull();
        anyhow::ensure!(len <= buf.len(), "frame of {len} bytes exceeds buffer");

        read.read_exact(&mut buf[..len])
            .await
            .context("Failed to read frame")?;

        let Some(packet) = Packet::new(buf, len) else {
            tracing::error!("[tun] unknown packet");
            continue;
        };

        if outbound.send_async(packet).await.is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::time::{Duration, timeout};
    use tun::channel::ChannelTun;

    use super::*;

    fn config(tun_ip4: Option<Ipv4Addr>) -> DeviceConfig {
        DeviceConfig {
            tun_ip4,
            tun_ip6: None,
            router_ip4: Ipv4Addr::new(223, 254, 254, 100),
            router_ip6: "fd3d:4c41:4e2f::64".parse().unwrap(),
        }
    }

    async fn reserve_udp_addr() -> std::net::SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.local_addr().unwrap()
    }

    #[tokio::test]
    async fn server_round_trip() {
        let bind_addr = reserve_udp_addr().await;
        let node = Node::from_url(&format!("tun://{bind_addr}?net=223.254.254.5/24")).unwrap();
        let handler = TunHandler::new(node, Chain::new());
        let routes = handler.routes().clone();

        let (tun, mut tun_handle) = ChannelTun::new("utun-test");
        let token = CancellationToken::new();

        let serve = {
            let token = token.clone();
            async move { handler.handle(token, Arc::new(tun), config(None)).await }
        };
        let serve = tokio::spawn(serve);

        // Ingress: a datagram from a peer lands on the TUN and its source
        // route is learned.
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let inbound_packet = ip_header::icmp_echo_v4(
            Ipv4Addr::new(223, 254, 254, 2),
            Ipv4Addr::new(223, 254, 254, 5),
        )
        .unwrap();

        let written = timeout(Duration::from_secs(10), async {
            loop {
                client.send_to(&inbound_packet, bind_addr).await.unwrap();

                match timeout(Duration::from_millis(200), tun_handle.written.recv()).await {
                    Ok(Some(packet)) => break packet,
                    Ok(None) => panic!("TUN gone"),
                    Err(_) => continue, // Server may not be bound yet, resend.
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(written, inbound_packet);
        assert!(
            routes
                .route_to(Ipv4Addr::new(223, 254, 254, 2).into())
                .is_some()
        );

        // Egress: a packet read from the TUN is forwarded to the learned peer.
        let outbound_packet = ip_header::icmp_echo_v4(
            Ipv4Addr::new(223, 254, 254, 5),
            Ipv4Addr::new(223, 254, 254, 2),
        )
        .unwrap();
        tun_handle
            .inject
            .send(outbound_packet.clone())
            .await
            .unwrap();

        let mut buf = [0u8; 2048];
        let (n, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &outbound_packet[..]);

        token.cancel();
        timeout(Duration::from_secs(5), serve)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn client_bridges_device_over_stream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = listener.local_addr().unwrap();

        // The chain terminates at our fake relay; the remote address itself
        // is never dialed directly.
        let node =
            Node::from_url("tun://127.0.0.1:8422/223.254.254.100:8422?net=223.254.254.5/24")
                .unwrap();
        let chain_node = Node::from_url(&format!("tcp://{relay_addr}")).unwrap();
        let handler = TunHandler::new(node, Chain::with_node(chain_node, 1));

        let (tun, mut tun_handle) = ChannelTun::new("utun-test");
        let token = CancellationToken::new();

        let serve = {
            let token = token.clone();
            async move { handler.handle(token, Arc::new(tun), config(None)).await }
        };
        let serve = tokio::spawn(serve);

        let (mut relay_conn, _) = listener.accept().await.unwrap();

        // Egress: packets from the device arrive length-framed at the relay.
        let packet = ip_header::icmp_echo_v4(
            Ipv4Addr::new(223, 254, 254, 5),
            Ipv4Addr::new(223, 254, 254, 2),
        )
        .unwrap();
        tun_handle.inject.send(packet.clone()).await.unwrap();

        let len = relay_conn.read_u16().await.unwrap() as usize;
        let mut framed = vec![0u8; len];
        relay_conn.read_exact(&mut framed).await.unwrap();
        assert_eq!(framed, packet);

        // Ingress: a framed packet from the relay is written to the device.
        let reply = ip_header::icmp_echo_v4(
            Ipv4Addr::new(223, 254, 254, 2),
            Ipv4Addr::new(223, 254, 254, 5),
        )
        .unwrap();
        relay_conn.write_u16(reply.len() as u16).await.unwrap();
        relay_conn.write_all(&reply).await.unwrap();

        let written = timeout(Duration::from_secs(5), tun_handle.written.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written, reply);

        token.cancel();
        timeout(Duration::from_secs(5), serve)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
