//! Router advertisements on behalf of guest gateways.
//!
//! A guest's Router Solicitation is answered with an advertisement that
//! appears to come from the guest's configured IPv6 gateway, so the
//! gateway's MAC has to be known first. It is learned from Neighbor
//! Advertisements; until then the solicitation waits in a retry queue.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::Ipv6Addr;
use std::sync::Arc;

use ipnetwork::Ipv6Network;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::config::RaConfig;
use crate::conn::FrameConn;
use crate::error::Result;
use crate::frame::{self, Frame, IpHeader, Transport, ALL_NODES};
use crate::guest::GuestResponder;
use crate::icmp6::{
    Message, NdpOption, NeighborAdvertisement, NeighborSolicitation, PrefixInfo, RouteInfo,
    RouterAdvertisement, PREFIX_ON_LINK,
};
use crate::mac::MacAddr;
use crate::response::ResponseConfig;

/// IPv6 address to MAC, learned from Neighbor Advertisements.
#[derive(Debug, Default)]
pub struct NeighborCache {
    entries: Mutex<HashMap<Ipv6Addr, MacAddr>>,
}

impl NeighborCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, addr: Ipv6Addr) -> Option<MacAddr> {
        self.entries.lock().get(&addr).copied()
    }

    pub fn insert(&self, addr: Ipv6Addr, mac: MacAddr) -> Option<MacAddr> {
        self.entries.lock().insert(addr, mac)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Who sent a Router Solicitation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Solicitation {
    pub mac: MacAddr,
    /// Unspecified if the guest has no address yet.
    pub src: Ipv6Addr,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RaRetry {
    pub solicitation: Solicitation,
    pub tries: u32,
    pub successes: u32,
}

impl RaRetry {
    pub fn new(solicitation: Solicitation) -> Self {
        Self {
            solicitation,
            tries: 0,
            successes: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Outcome {
    Sent,
    /// The gateway's MAC is not known yet.
    Unresolved(Ipv6Addr),
    /// Not a guest we advertise for.
    NoConfig,
}

pub struct RaEngine {
    frames: Arc<dyn FrameConn>,
    responder: Arc<GuestResponder>,
    neighbors: NeighborCache,
    /// Targets of our outstanding Neighbor Solicitations.
    solicited: Mutex<HashSet<Ipv6Addr>>,
    config: RaConfig,
    retries: mpsc::UnboundedSender<RaRetry>,
    retry_rx: Mutex<Option<mpsc::UnboundedReceiver<RaRetry>>>,
    shutdown: watch::Sender<bool>,
}

impl RaEngine {
    pub fn new(frames: Arc<dyn FrameConn>, responder: Arc<GuestResponder>, config: RaConfig) -> Self {
        let (retries, retry_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            frames,
            responder,
            neighbors: NeighborCache::new(),
            solicited: Mutex::default(),
            config,
            retries,
            retry_rx: Mutex::new(Some(retry_rx)),
            shutdown,
        }
    }

    pub fn neighbors(&self) -> &NeighborCache {
        &self.neighbors
    }

    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    /// Answers solicitations until closed. The retry queue runs on its
    /// own task alongside.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let retry_rx = self.retry_rx.lock().take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AlreadyExists, "router advertisement engine already ran")
        })?;

        let retry_task = tokio::spawn(Arc::clone(&self).retry_loop(retry_rx));
        let res = self.receive_loop().await;
        self.close();
        if let Err(err) = retry_task.await {
            tracing::error!("router advertisement retry loop failed: {}", err);
        }
        res
    }

    async fn receive_loop(&self) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        tracing::info!("answering router solicitations as {}", self.frames.mac());

        loop {
            if *shutdown.borrow_and_update() {
                return Ok(());
            }

            let frame = tokio::select! {
                _ = shutdown.changed() => continue,
                res = self.frames.recv_frame() => res?,
            };

            if let Err(err) = self.handle_frame(&frame).await {
                tracing::debug!("dropping ICMPv6 frame: {}", err);
            }
        }
    }

    async fn retry_loop(self: Arc<Self>, mut retry_rx: mpsc::UnboundedReceiver<RaRetry>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut interval = tokio::time::interval(self.config.retry_interval());
        let mut pending = Vec::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!("dropping {} pending advertisements", pending.len());
                        return;
                    }
                }
                Some(retry) = retry_rx.recv() => pending.push(retry),
                _ = interval.tick() => {
                    if !pending.is_empty() {
                        pending = self.retry(std::mem::take(&mut pending)).await;
                    }
                }
            }
        }
    }

    /// Attempts every request in `batch` once and returns those that want
    /// another attempt.
    async fn retry(&self, batch: Vec<RaRetry>) -> Vec<RaRetry> {
        let max = self.config.max_attempts;
        let mut pending = Vec::with_capacity(batch.len());

        for mut retry in batch {
            retry.tries += 1;

            match self.advertise(&retry.solicitation).await {
                Ok(Outcome::Sent) => retry.successes += 1,
                Ok(Outcome::Unresolved(gateway)) => {
                    if let Err(err) = self.solicit_neighbor(gateway).await {
                        tracing::warn!("failed to solicit {}: {}", gateway, err);
                    }
                }
                Ok(Outcome::NoConfig) => continue,
                Err(err) => tracing::warn!("failed to advertise to {}: {}", retry.solicitation.mac, err),
            }

            if retry.successes >= max || retry.tries >= max.saturating_mul(2) {
                tracing::debug!(
                    "done with {} after {} attempts, {} sent",
                    retry.solicitation.mac,
                    retry.tries,
                    retry.successes
                );
            } else {
                pending.push(retry);
            }
        }

        pending
    }

    async fn handle_frame(&self, data: &[u8]) -> Result<()> {
        let frame = Frame::decode(data)?;
        let (IpHeader::V6(ip), Transport::Icmpv6(payload)) = (frame.ip, frame.transport) else {
            return Ok(());
        };

        match Message::decode(payload)? {
            msg @ Message::RouterSolicitation(_) => {
                let solicitation = Solicitation {
                    mac: msg.source_link_addr().unwrap_or(frame.eth.src),
                    src: ip.src,
                };
                self.handle_solicitation(solicitation).await
            }
            Message::NeighborAdvertisement(na) => {
                self.handle_advertisement(&na, frame.eth.src);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn handle_solicitation(&self, solicitation: Solicitation) -> Result<()> {
        tracing::debug!("router solicitation from {} ({})", solicitation.mac, solicitation.src);

        match self.advertise(&solicitation).await? {
            Outcome::Sent | Outcome::NoConfig => {}
            Outcome::Unresolved(gateway) => {
                self.solicit_neighbor(gateway).await?;
                // Only fails once the retry loop is gone.
                let _ = self.retries.send(RaRetry::new(solicitation));
            }
        }
        Ok(())
    }

    fn handle_advertisement(&self, na: &NeighborAdvertisement, eth_src: MacAddr) {
        if !na.solicited {
            return;
        }
        if !self.solicited.lock().remove(&na.target) {
            tracing::debug!("ignoring advertisement for {}, not asked for", na.target);
            return;
        }

        let mac = na
            .options
            .iter()
            .find_map(|option| match option {
                NdpOption::TargetLinkAddr(mac) => Some(*mac),
                _ => None,
            })
            .unwrap_or(eth_src);
        if self.neighbors.insert(na.target, mac) != Some(mac) {
            tracing::info!("learned {} is at {}", na.target, mac);
        }
    }

    async fn advertise(&self, solicitation: &Solicitation) -> Result<Outcome> {
        let Some(conf) = self.responder.response_config(solicitation.mac, None, None) else {
            return Ok(Outcome::NoConfig);
        };
        let (Some(addr), Some(gateway)) = (conf.client_ip6, conf.gateway6) else {
            return Ok(Outcome::NoConfig);
        };
        let Some(gateway_mac) = self.neighbors.get(gateway) else {
            return Ok(Outcome::Unresolved(gateway));
        };

        let ra = self.router_advertisement(&conf, addr, gateway, gateway_mac);
        let src = gateway_mac.link_local();
        let dst = if solicitation.src.is_unspecified() {
            ALL_NODES
        } else {
            solicitation.src
        };

        let message = Message::RouterAdvertisement(ra).to_bytes(src, dst);
        let frame = frame::icmpv6_frame(gateway_mac, solicitation.mac, src, dst, &message);
        self.frames.send_frame(&frame).await?;

        tracing::info!("advertised {} to {} ({})", gateway, solicitation.mac, dst);
        Ok(Outcome::Sent)
    }

    fn router_advertisement(
        &self,
        conf: &ResponseConfig,
        addr: Ipv6Addr,
        gateway: Ipv6Addr,
        gateway_mac: MacAddr,
    ) -> RouterAdvertisement {
        let mtu = conf.mtu.map(u32::from).unwrap_or(self.config.mtu);

        let mut options = vec![NdpOption::SourceLinkAddr(gateway_mac), NdpOption::Mtu(mtu)];
        if let Ok(network) = Ipv6Network::new(addr, conf.prefix_len6) {
            options.push(on_link(network));
        }

        for route in &conf.routes6 {
            if route.gateway.is_unspecified() {
                options.push(on_link(route.network));
            } else if route.gateway != gateway {
                options.push(NdpOption::RouteInfo(RouteInfo {
                    prefix_len: route.network.prefix(),
                    preference: self.config.preference,
                    lifetime: self.config.route_lifetime,
                    prefix: route.network.network(),
                }));
            }
        }

        RouterAdvertisement {
            hop_limit: self.config.hop_limit,
            managed: self.config.managed,
            other: self.config.other,
            home_agent: self.config.home_agent,
            preference: self.config.preference,
            router_lifetime: self.config.router_lifetime,
            reachable_time: self.config.reachable_time,
            retrans_timer: self.config.retrans_timer,
            options,
        }
    }

    async fn solicit_neighbor(&self, target: Ipv6Addr) -> Result<()> {
        let mac = self.frames.mac();
        let src = mac.link_local();
        let dst = frame::solicited_node(target);

        let ns = Message::NeighborSolicitation(NeighborSolicitation {
            target,
            options: vec![NdpOption::SourceLinkAddr(mac)],
        });
        let message = ns.to_bytes(src, dst);
        let frame = frame::icmpv6_frame(mac, MacAddr::ipv6_multicast(dst), src, dst, &message);
        self.solicited.lock().insert(target);
        self.frames.send_frame(&frame).await?;

        tracing::debug!("solicited {}", target);
        Ok(())
    }
}

fn on_link(network: Ipv6Network) -> NdpOption {
    NdpOption::PrefixInfo(PrefixInfo {
        prefix_len: network.prefix(),
        flags: PREFIX_ON_LINK,
        valid_lifetime: u32::MAX,
        preferred_lifetime: u32::MAX,
        prefix: network.network(),
    })
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::Arc;

    use super::{NeighborCache, RaEngine, RaRetry, Solicitation};
    use crate::config::RaConfig;
    use crate::conn::mock::MemoryFrames;
    use crate::frame::{self, Frame, IpHeader, Transport, ALL_NODES};
    use crate::guest::{GuestDesc, GuestResponder, NicDesc, StaticGuestTable};
    use crate::icmp6::{Message, NdpOption, NeighborAdvertisement, RouterSolicitation};
    use crate::mac::MacAddr;
    use crate::response::{ResponseConfig, Route6};

    const HOST: MacAddr = MacAddr::from_octets([0x02, 0, 0, 0, 0, 0xfe]);
    const GUEST: MacAddr = MacAddr::from_octets([0x52, 0x54, 0, 0, 0, 1]);
    const GATEWAY: MacAddr = MacAddr::from_octets([0x02, 0, 0, 0, 0, 0x01]);

    fn ip(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    fn responder() -> Arc<GuestResponder> {
        let table = StaticGuestTable::new();
        table.insert(
            GuestDesc {
                id: "g".into(),
                name: "g".into(),
                hostname: None,
                os_name: None,
                nics: vec![NicDesc {
                    mac: GUEST,
                    ip: Ipv4Addr::new(10, 0, 0, 5),
                    masklen: 24,
                    gateway: None,
                    dns: Vec::new(),
                    ntp: Vec::new(),
                    domain: None,
                    routes: Vec::new(),
                    is_virtual: true,
                    bridge: None,
                    port: None,
                    mtu: Some(9000),
                    ip6: Some(ip("2001:db8:0:1::5")),
                    masklen6: 64,
                    gateway6: Some(ip("2001:db8:0:1::1")),
                    routes6: vec![
                        Route6 {
                            network: "2001:db8:ff::/48".parse().unwrap(),
                            gateway: Ipv6Addr::UNSPECIFIED,
                        },
                        Route6 {
                            network: "2001:db8:aa::/48".parse().unwrap(),
                            gateway: ip("2001:db8:0:1::2"),
                        },
                    ],
                    dns6: Vec::new(),
                }],
            },
            false,
        );
        Arc::new(GuestResponder::new(Arc::new(table), "br0", ResponseConfig::default()))
    }

    fn config() -> RaConfig {
        RaConfig {
            enabled: true,
            max_attempts: 2,
            retry_interval: 50,
            ..Default::default()
        }
    }

    fn solicitation() -> Solicitation {
        Solicitation {
            mac: GUEST,
            src: Ipv6Addr::UNSPECIFIED,
        }
    }

    fn decode_icmp(data: &[u8]) -> (Frame<'_>, Message) {
        let frame = Frame::decode(data).unwrap();
        let Transport::Icmpv6(payload) = frame.transport else {
            panic!("not ICMPv6");
        };
        let msg = Message::decode(payload).unwrap();
        (frame, msg)
    }

    #[test]
    fn neighbor_cache() {
        let cache = NeighborCache::new();
        assert!(cache.is_empty());
        cache.insert(ip("fe80::1"), GATEWAY);
        assert_eq!(cache.get(ip("fe80::1")), Some(GATEWAY));
        assert_eq!(cache.get(ip("fe80::2")), None);
    }

    #[tokio::test]
    async fn unresolved_gateway_is_retried_at_most_twice_max() {
        let (frames, _inbound, mut outbound) = MemoryFrames::new(HOST);
        let engine = RaEngine::new(Arc::new(frames), responder(), config());

        let mut batch = vec![RaRetry::new(solicitation())];
        let mut rounds = 0;
        while !batch.is_empty() {
            batch = engine.retry(batch).await;
            rounds += 1;
            assert!(rounds <= 4, "retried past the limit");
        }
        assert_eq!(rounds, 4);

        // One neighbor solicitation per attempt.
        for _ in 0..4 {
            let data = outbound.recv().await.unwrap();
            let (frame, msg) = decode_icmp(&data);
            let Message::NeighborSolicitation(ns) = msg else {
                panic!("expected a neighbor solicitation");
            };
            assert_eq!(ns.target, ip("2001:db8:0:1::1"));
            let IpHeader::V6(header) = frame.ip else {
                panic!("not IPv6");
            };
            assert_eq!(header.dst, frame::solicited_node(ns.target));
        }
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn resolved_gateway_stops_after_max_successes() {
        let (frames, _inbound, mut outbound) = MemoryFrames::new(HOST);
        let engine = RaEngine::new(Arc::new(frames), responder(), config());
        engine.neighbors().insert(ip("2001:db8:0:1::1"), GATEWAY);

        let batch = engine.retry(vec![RaRetry::new(solicitation())]).await;
        assert_eq!(batch[0].successes, 1);
        assert!(engine.retry(batch).await.is_empty());

        for _ in 0..2 {
            let data = outbound.recv().await.unwrap();
            let (_, msg) = decode_icmp(&data);
            assert!(matches!(msg, Message::RouterAdvertisement(_)));
        }
    }

    fn advertisement(target: Ipv6Addr) -> Vec<u8> {
        let na = Message::NeighborAdvertisement(NeighborAdvertisement {
            router: true,
            solicited: true,
            override_flag: true,
            target,
            options: vec![NdpOption::TargetLinkAddr(GATEWAY)],
        });
        let src = GATEWAY.link_local();
        let dst = HOST.link_local();
        frame::icmpv6_frame(GATEWAY, HOST, src, dst, &na.to_bytes(src, dst))
    }

    #[tokio::test]
    async fn only_solicited_targets_are_learned() {
        let (frames, _inbound, _outbound) = MemoryFrames::new(HOST);
        let engine = RaEngine::new(Arc::new(frames), responder(), config());

        engine.handle_frame(&advertisement(ip("2001:db8::99"))).await.unwrap();
        assert!(engine.neighbors().is_empty());

        let gateway_ip = ip("2001:db8:0:1::1");
        engine.solicit_neighbor(gateway_ip).await.unwrap();
        engine.handle_frame(&advertisement(gateway_ip)).await.unwrap();
        assert_eq!(engine.neighbors().get(gateway_ip), Some(GATEWAY));

        // A repeat without a new solicitation is not taken.
        engine.handle_frame(&advertisement(ip("2001:db8::99"))).await.unwrap();
        assert_eq!(engine.neighbors().len(), 1);
    }

    #[tokio::test]
    async fn solicitation_is_answered_once_gateway_is_known() {
        let (frames, inbound, mut outbound) = MemoryFrames::new(HOST);
        let engine = Arc::new(RaEngine::new(Arc::new(frames), responder(), config()));
        let task = tokio::spawn(Arc::clone(&engine).run());

        let rs = Message::RouterSolicitation(RouterSolicitation {
            options: vec![NdpOption::SourceLinkAddr(GUEST)],
        });
        let rs_dst = ip("ff02::2");
        inbound
            .send(frame::icmpv6_frame(
                GUEST,
                MacAddr::ipv6_multicast(rs_dst),
                Ipv6Addr::UNSPECIFIED,
                rs_dst,
                &rs.to_bytes(Ipv6Addr::UNSPECIFIED, rs_dst),
            ))
            .unwrap();

        // The gateway is unknown, so it is solicited first.
        let gateway_ip = ip("2001:db8:0:1::1");
        let data = outbound.recv().await.unwrap();
        let (_, msg) = decode_icmp(&data);
        let Message::NeighborSolicitation(ns) = msg else {
            panic!("expected a neighbor solicitation");
        };
        assert_eq!(ns.target, gateway_ip);
        inbound.send(advertisement(gateway_ip)).unwrap();

        // The queued solicitation is answered on a later retry.
        let data = loop {
            let data = outbound.recv().await.unwrap();
            let (_, msg) = decode_icmp(&data);
            if matches!(msg, Message::RouterAdvertisement(_)) {
                break data;
            }
        };
        let data = outbound.recv().await.unwrap();
        let (frame, msg) = decode_icmp(&data);
        assert_eq!(frame.eth.src, GATEWAY);
        assert_eq!(frame.eth.dst, GUEST);
        let IpHeader::V6(header) = frame.ip else {
            panic!("not IPv6");
        };
        assert_eq!(header.src, GATEWAY.link_local());
        assert_eq!(header.dst, ALL_NODES);

        let Message::RouterAdvertisement(ra) = msg else {
            panic!("expected a router advertisement");
        };
        assert!(ra.managed && ra.other);
        assert_eq!(ra.hop_limit, 64);
        assert_eq!(ra.router_lifetime, 9000);
        assert!(ra.options.contains(&NdpOption::Mtu(9000)));
        assert!(ra.options.contains(&NdpOption::SourceLinkAddr(GATEWAY)));

        let prefixes: Vec<_> = ra
            .options
            .iter()
            .filter_map(|option| match option {
                NdpOption::PrefixInfo(info) => Some((info.prefix, info.prefix_len)),
                _ => None,
            })
            .collect();
        assert_eq!(prefixes, [(ip("2001:db8:0:1::"), 64), (ip("2001:db8:ff::"), 48)]);

        let routes: Vec<_> = ra
            .options
            .iter()
            .filter_map(|option| match option {
                NdpOption::RouteInfo(info) => Some((info.prefix, info.prefix_len, info.lifetime)),
                _ => None,
            })
            .collect();
        assert_eq!(routes, [(ip("2001:db8:aa::"), 48, 9000)]);

        engine.close();
        task.await.unwrap().unwrap();
    }
}
