use std::{
    net::{Ipv4Addr, Ipv6Addr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tun::Tun;

use crate::{PARSER_THREADS, Packet, QUEUE_SIZE, pool};

/// Addresses the device engine needs to know about.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// The device's own IPv4 tunnel address, if it has one.
    pub tun_ip4: Option<Ipv4Addr>,
    /// The device's own IPv6 tunnel address, if it has one.
    pub tun_ip6: Option<Ipv6Addr>,
    /// The cluster-side router's IPv4 tunnel address.
    pub router_ip4: Ipv4Addr,
    /// The cluster-side router's IPv6 tunnel address.
    pub router_ip6: Ipv6Addr,
}

/// The TUN side of the engine.
///
/// Owns the lanes between the device and the rest of the engine: a reader,
/// a pool of header parsers, a writer and the heartbeat. All lanes are
/// bounded queues; the reader stalls when the parsers fall behind, the
/// parsers stall when the consumer of `inbound` falls behind.
pub struct Device {
    name: String,
    closed: Arc<AtomicBool>,
    token: CancellationToken,
    inbound: flume::Receiver<Packet>,
    outbound: flume::Sender<Packet>,
}

impl Device {
    /// Spawns the device lanes.
    ///
    /// A fatal device error (read or write failure, EOF) is posted to
    /// `exit` exactly once.
    pub fn start(
        tun: Arc<dyn Tun>,
        config: DeviceConfig,
        exit: mpsc::Sender<anyhow::Error>,
    ) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::new();

        let (raw_tx, raw_rx) = flume::bounded::<(crate::Buffer, usize)>(QUEUE_SIZE);
        let (inbound_tx, inbound_rx) = flume::bounded::<Packet>(QUEUE_SIZE);
        let (outbound_tx, outbound_rx) = flume::bounded::<Packet>(QUEUE_SIZE);

        let name = tun.name().to_owned();

        tokio::spawn(read_from_tun(
            tun.clone(),
            raw_tx,
            closed.clone(),
            token.clone(),
            exit.clone(),
        ));

        for _ in 0..PARSER_THREADS {
            tokio::spawn(parse_headers(
                raw_rx.clone(),
                inbound_tx.clone(),
                closed.clone(),
                token.clone(),
            ));
        }

        tokio::spawn(write_to_tun(tun, outbound_rx, token.clone(), exit));

        tokio::spawn(heartbeats(
            config,
            inbound_tx.clone(),
            closed.clone(),
            token.clone(),
        ));

        Self {
            name,
            closed,
            token,
            inbound: inbound_rx,
            outbound: outbound_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Stops all lanes. In-flight buffers are recycled as their queues drain.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.token.cancel();
    }

    /// Parsed packets read from the device (plus injected heartbeats).
    pub(crate) fn inbound(&self) -> flume::Receiver<Packet> {
        self.inbound.clone()
    }

    /// Queue of packets to be written to the device.
    pub(crate) fn outbound(&self) -> flume::Sender<Packet> {
        self.outbound.clone()
    }

    pub(crate) fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

async fn read_from_tun(
    tun: Arc<dyn Tun>,
    raw_tx: flume::Sender<(crate::Buffer, usize)>,
    closed: Arc<AtomicBool>,
    token: CancellationToken,
    exit: mpsc::Sender<anyhow::Error>,
) {
    loop {
        let mut buf = pool().pull();

        let result = tokio::select! {
            _ = token.cancelled() => return,
            result = tun::recv(tun.as_ref(), &mut buf) => result,
        };

        let len = match result {
            Ok(0) => {
                let _ = exit.try_send(anyhow!("TUN device closed"));
                return;
            }
            Ok(len) => len,
            Err(e) => {
                let _ = exit.try_send(anyhow::Error::new(e).context("Failed to read from TUN"));
                return;
            }
        };

        if closed.load(Ordering::Relaxed) {
            return;
        }

        if raw_tx.send_async((buf, len)).await.is_err() {
            return;
        }
    }
}

async fn parse_headers(
    raw_rx: flume::Receiver<(crate::Buffer, usize)>,
    inbound_tx: flume::Sender<Packet>,
    closed: Arc<AtomicBool>,
    token: CancellationToken,
) {
    loop {
        let (buf, len) = tokio::select! {
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

        tracing::trace!("[tun] {} --> {}", packet.src, packet.dst);

        if closed.load(Ordering::Relaxed) {
            return;
        }

        if inbound_tx.send_async(packet).await.is_err() {
            return;
        }
    }
}

async fn write_to_tun(
    tun: Arc<dyn Tun>,
    outbound_rx: flume::Receiver<Packet>,
    token: CancellationToken,
    exit: mpsc::Sender<anyhow::Error>,
) {
    loop {
        let packet = tokio::select! {
            _ = token.cancelled() => return,
            next = outbound_rx.recv_async() => match next {
                Ok(packet) => packet,
                Err(_) => return,
            },
        };

        if let Err(e) = tun::send(tun.as_ref(), packet.bytes()).await {
            let _ = exit.try_send(anyhow::Error::new(e).context("Failed to write to TUN"));
            return;
        }
    }
}

/// Keeps the relay's route for us warm.
///
/// Every 5 seconds, 4 echo requests per enabled address family go down the
/// inbound lane at 1 second intervals, exactly as if the host had pinged
/// the router through the device. The relay itself (src == router) does not
/// heartbeat.
async fn heartbeats(
    config: DeviceConfig,
    inbound_tx: flume::Sender<Packet>,
    closed: Arc<AtomicBool>,
    token: CancellationToken,
) {
    let echo4 = config
        .tun_ip4
        .filter(|src| *src != config.router_ip4)
        .and_then(|src| {
            ip_header::icmp_echo_v4(src, config.router_ip4)
                .inspect_err(|e| tracing::error!("{e:#}"))
                .ok()
        });
    let echo6 = config
        .tun_ip6
        .filter(|src| *src != config.router_ip6)
        .and_then(|src| {
            ip_header::icmp_echo_v6(src, config.router_ip6)
                .inspect_err(|e| tracing::error!("{e:#}"))
                .ok()
        });

    if echo4.is_none() && echo6.is_none() {
        return;
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        for _ in 0..4 {
            for bytes in [echo4.as_deref(), echo6.as_deref()].into_iter().flatten() {
                if closed.load(Ordering::Relaxed) {
                    return;
                }

                let buf = pool().pull_initialised(bytes);
                let Some(packet) = Packet::new(buf, bytes.len()) else {
                    continue;
                };

                if inbound_tx.send_async(packet).await.is_err() {
                    return;
                }
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use tun::channel::ChannelTun;

    use super::*;

    pub(crate) fn test_config(tun_ip4: Option<Ipv4Addr>) -> DeviceConfig {
        DeviceConfig {
            tun_ip4,
            tun_ip6: None,
            router_ip4: Ipv4Addr::new(223, 254, 254, 100),
            router_ip6: "fd3d:4c41:4e2f::64".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn parses_packets_read_from_the_device() {
        let (tun, handle) = ChannelTun::new("utun-test");
        let (exit_tx, _exit_rx) = mpsc::channel(1);
        let device = Device::start(Arc::new(tun), test_config(None), exit_tx);

        let echo = ip_header::icmp_echo_v4(
            Ipv4Addr::new(223, 254, 254, 2),
            Ipv4Addr::new(223, 254, 254, 5),
        )
        .unwrap();
        handle.inject.send(echo.clone()).await.unwrap();

        let packet = device.inbound().recv_async().await.unwrap();
        assert_eq!(packet.bytes(), &echo[..]);
        assert_eq!(packet.src, "223.254.254.2".parse::<IpAddr>().unwrap());
        assert_eq!(packet.dst, "223.254.254.5".parse::<IpAddr>().unwrap());

        device.close();
    }

    #[tokio::test]
    async fn outbound_packets_reach_the_device() {
        let (tun, mut handle) = ChannelTun::new("utun-test");
        let (exit_tx, _exit_rx) = mpsc::channel(1);
        let device = Device::start(Arc::new(tun), test_config(None), exit_tx);

        let echo = ip_header::icmp_echo_v4(
            Ipv4Addr::new(223, 254, 254, 5),
            Ipv4Addr::new(223, 254, 254, 2),
        )
        .unwrap();
        let packet = Packet::new(pool().pull_initialised(&echo), echo.len()).unwrap();
        device.outbound().send_async(packet).await.unwrap();

        assert_eq!(handle.written.recv().await.unwrap(), echo);

        device.close();
    }

    #[tokio::test]
    async fn device_eof_is_fatal() {
        let (tun, handle) = ChannelTun::new("utun-test");
        let (exit_tx, mut exit_rx) = mpsc::channel(1);
        let _device = Device::start(Arc::new(tun), test_config(None), exit_tx);

        drop(handle.inject);

        exit_rx.recv().await.expect("EOF should be posted to exit");
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_goes_down_the_inbound_lane() {
        let (tun, _handle) = ChannelTun::new("utun-test");
        let (exit_tx, _exit_rx) = mpsc::channel(1);
        let device = Device::start(
            Arc::new(tun),
            test_config(Some(Ipv4Addr::new(223, 254, 254, 5))),
            exit_tx,
        );

        let packet = device.inbound().recv_async().await.unwrap();
        assert_eq!(packet.src, "223.254.254.5".parse::<IpAddr>().unwrap());
        assert_eq!(packet.dst, "223.254.254.100".parse::<IpAddr>().unwrap());

        device.close();
    }

    #[tokio::test(start_paused = true)]
    async fn router_does_not_heartbeat_itself() {
        let (tun, _handle) = ChannelTun::new("utun-test");
        let (exit_tx, _exit_rx) = mpsc::channel(1);
        let device = Device::start(
            Arc::new(tun),
            test_config(Some(Ipv4Addr::new(223, 254, 254, 100))),
            exit_tx,
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(device.inbound().is_empty());

        device.close();
    }
}
