use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::{net::UdpSocket, sync::mpsc};
use tokio_util::sync::CancellationToken;

use crate::{Device, NatTable, PARSER_THREADS, Packet, QUEUE_SIZE, pool};

/// The UDP side of the engine.
///
/// Reads datagrams off one socket, learns the source route for every packet
/// (`src` tunnel IP is reachable at the datagram's sender) and either
/// relays the packet to another learned peer or delivers it to the local
/// TUN device.
pub(crate) struct Peer {
    closed: Arc<AtomicBool>,
    token: CancellationToken,
}

impl Peer {
    pub(crate) fn start(
        conn: Arc<UdpSocket>,
        routes: NatTable,
        device: &Device,
        errors: mpsc::Sender<anyhow::Error>,
        parent: &CancellationToken,
    ) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let token = parent.child_token();

        let (raw_tx, raw_rx) = flume::bounded::<(SocketAddr, crate::Buffer, usize)>(QUEUE_SIZE);
        let (parsed_tx, parsed_rx) = flume::bounded::<Packet>(QUEUE_SIZE);

        tokio::spawn(read_from_conn(
            conn.clone(),
            raw_tx,
            closed.clone(),
            token.clone(),
            errors.clone(),
        ));

        for _ in 0..PARSER_THREADS {
            tokio::spawn(parse_and_learn(
                raw_rx.clone(),
                parsed_tx.clone(),
                routes.clone(),
                closed.clone(),
                token.clone(),
            ));
        }

        tokio::spawn(route(
            conn,
            parsed_rx,
            routes,
            device.outbound(),
            device.closed_flag(),
            token.clone(),
            errors,
        ));

        Self { closed, token }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.token.cancel();
    }
}

async fn read_from_conn(
    conn: Arc<UdpSocket>,
    raw_tx: flume::Sender<(SocketAddr, crate::Buffer, usize)>,
    closed: Arc<AtomicBool>,
    token: CancellationToken,
    errors: mpsc::Sender<anyhow::Error>,
) {
    loop {
        let mut buf = pool().pull();

        let result = tokio::select! {
            _ = token.cancelled() => return,
            result = conn.recv_from(&mut buf) => result,
        };

        let (len, from) = match result {
            Ok(x) => x,
            Err(e) => {
                let _ = errors.try_send(anyhow::Error::new(e).context("Failed to read datagram"));
                return;
            }
        };

        if closed.load(Ordering::Relaxed) {
            return;
        }

        if raw_tx.send_async((from, buf, len)).await.is_err() {
            return;
        }
    }
}

async fn parse_and_learn(
    raw_rx: flume::Receiver<(SocketAddr, crate::Buffer, usize)>,
    parsed_tx: flume::Sender<Packet>,
    routes: NatTable,
    closed: Arc<AtomicBool>,
    token: CancellationToken,
) {
    loop {
        let (from, buf, len) = tokio::select! {
            _ = token.cancelled() => return,
            next = raw_rx.recv_async() => match next {
                Ok(elem) => elem,
                Err(_) => return,
            },
        };

        let Some(packet) = Packet::new(buf, len) else {
            tracing::error!("[tun] unknown packet");
            continue;
        };

        let (_, known) = routes.load_or_store(packet.src, from);
        if known {
            tracing::trace!("[tun] add route: {} -> {from}", packet.src);
        } else {
            tracing::debug!("[tun] new route: {} -> {from}", packet.src);
        }

        if closed.load(Ordering::Relaxed) {
            return;
        }

        if parsed_tx.send_async(packet).await.is_err() {
            return;
        }
    }
}

async fn route(
    conn: Arc<UdpSocket>,
    parsed_rx: flume::Receiver<Packet>,
    routes: NatTable,
    tun_outbound: flume::Sender<Packet>,
    tun_closed: Arc<AtomicBool>,
    token: CancellationToken,
    errors: mpsc::Sender<anyhow::Error>,
) {
    loop {
        let packet = tokio::select! {
            _ = token.cancelled() => return,
            next = parsed_rx.recv_async() => match next {
                Ok(packet) => packet,
                Err(_) => return,
            },
        };

        if let Some(addr) = routes.route_to(packet.dst) {
            tracing::trace!("[tun] find route: {} -> {addr}", packet.dst);

            if let Err(e) = conn.send_to(packet.bytes(), addr).await {
                let _ = errors.try_send(anyhow::Error::new(e).context("Failed to relay datagram"));
                return;
            }

            continue;
        }

        // No learned peer for this destination, it is ours.
        if !tun_closed.load(Ordering::Relaxed) && tun_outbound.send_async(packet).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::time::{Duration, timeout};
    use tun::channel::ChannelTun;

    use super::*;
    use crate::device::DeviceConfig;

    fn config() -> DeviceConfig {
        DeviceConfig {
            tun_ip4: None,
            tun_ip6: None,
            router_ip4: Ipv4Addr::new(223, 254, 254, 100),
            router_ip6: "fd3d:4c41:4e2f::64".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn learns_source_routes_and_delivers_locally() {
        let (tun, mut tun_handle) = ChannelTun::new("utun-test");
        let (exit_tx, _exit_rx) = mpsc::channel(1);
        let device = Device::start(Arc::new(tun), config(), exit_tx);

        let conn = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let server_addr = conn.local_addr().unwrap();

        let routes = NatTable::new();
        let (err_tx, _err_rx) = mpsc::channel(2);
        let token = CancellationToken::new();
        let peer = Peer::start(conn, routes.clone(), &device, err_tx, &token);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo = ip_header::icmp_echo_v4(
            Ipv4Addr::new(223, 254, 254, 2),
            Ipv4Addr::new(223, 254, 254, 5),
        )
        .unwrap();
        client.send_to(&echo, server_addr).await.unwrap();

        // No route for the destination, so the packet must fall through to the TUN.
        let written = timeout(Duration::from_secs(5), tun_handle.written.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written, echo);

        // The source route is learned.
        let learned = routes.route_to(IpAddr::from(Ipv4Addr::new(223, 254, 254, 2)));
        assert_eq!(learned, Some(client.local_addr().unwrap()));

        peer.close();
        device.close();
    }

    #[tokio::test]
    async fn relays_between_two_peers() {
        let (tun, _tun_handle) = ChannelTun::new("utun-test");
        let (exit_tx, _exit_rx) = mpsc::channel(1);
        let device = Device::start(Arc::new(tun), config(), exit_tx);

        let conn = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let server_addr = conn.local_addr().unwrap();

        let routes = NatTable::new();
        let (err_tx, _err_rx) = mpsc::channel(2);
        let token = CancellationToken::new();
        let peer = Peer::start(conn, routes.clone(), &device, err_tx, &token);

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // `a` announces itself as 223.254.254.2 by sending anything.
        let hello = ip_header::icmp_echo_v4(
            Ipv4Addr::new(223, 254, 254, 2),
            Ipv4Addr::new(223, 254, 254, 100),
        )
        .unwrap();
        a.send_to(&hello, server_addr).await.unwrap();

        // Wait until the route is learned before `b` addresses `a`.
        timeout(Duration::from_secs(5), async {
            while routes
                .route_to(IpAddr::from(Ipv4Addr::new(223, 254, 254, 2)))
                .is_none()
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let to_a = ip_header::icmp_echo_v4(
            Ipv4Addr::new(223, 254, 254, 3),
            Ipv4Addr::new(223, 254, 254, 2),
        )
        .unwrap();
        b.send_to(&to_a, server_addr).await.unwrap();

        let mut buf = [0u8; 2048];
        let (n, from) = timeout(Duration::from_secs(5), a.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &to_a[..]);
        assert_eq!(from, server_addr);

        peer.close();
        device.close();
    }
}
