//! Answers for guests this host knows about.
//!
//! Guest NIC descriptors come from a [`GuestDescGetter`]. When one is
//! found the request is answered from it directly; everything else falls
//! through to the relay, if one is configured.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use ipnetwork::{Ipv4Network, Ipv6Network};
use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::mac::MacAddr;
use crate::relay::DhcpRelay;
use crate::relay6::Dhcp6Relay;
use crate::response::{ClientOs, ResponseConfig, Route, Route6};
use crate::server::{Handler, Reply};
use crate::v4::{self, MessageType, Op, Packet};
use crate::v6;

/// The link-local metadata service every guest gets a route to.
const METADATA_SERVER: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

/// Networks routed through a second, private NIC when the main NIC faces
/// the internet.
const PRIVATE_PREFIXES: [(Ipv4Addr, u8); 3] = [
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
];

fn default_masklen6() -> u8 {
    64
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct NicDesc {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub masklen: u8,
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
    #[serde(default)]
    pub ntp: Vec<Ipv4Addr>,
    pub domain: Option<String>,
    #[serde(default)]
    pub routes: Vec<Route>,
    /// Answered locally instead of relayed.
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
    pub bridge: Option<String>,
    pub port: Option<u16>,
    pub mtu: Option<u16>,

    pub ip6: Option<Ipv6Addr>,
    #[serde(default = "default_masklen6")]
    pub masklen6: u8,
    pub gateway6: Option<Ipv6Addr>,
    #[serde(default)]
    pub routes6: Vec<Route6>,
    #[serde(default)]
    pub dns6: Vec<Ipv6Addr>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct GuestDesc {
    pub id: String,
    pub name: String,
    pub hostname: Option<String>,
    pub os_name: Option<String>,
    #[serde(default)]
    pub nics: Vec<NicDesc>,
}

impl GuestDesc {
    /// The NIC carrying the default route: the first one with a gateway,
    /// unless a later one faces the internet and it does not.
    pub fn main_nic(&self) -> Option<&NicDesc> {
        let mut main: Option<&NicDesc> = None;
        for nic in self.nics.iter().filter(|nic| nic.gateway.is_some()) {
            match main {
                None => main = Some(nic),
                Some(cur) if !is_exit_addr(cur.ip) && is_exit_addr(nic.ip) => main = Some(nic),
                Some(_) => {}
            }
        }
        main
    }
}

/// Whether `ip` is routable on the internet.
pub fn is_exit_addr(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    // 100.64.0.0/10, carrier-grade NAT
    let shared = a == 100 && (b & 0xc0) == 64;

    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || shared)
}

/// Looks up guest NICs. Implemented by whatever tracks the guests on this
/// host.
pub trait GuestDescGetter: Send + Sync {
    /// Finds the NIC with `mac` on `bridge`. `ip` and `port` narrow the
    /// match when given. `is_candidate` selects the registry of guests
    /// whose network is still being set up.
    fn get_guest_nic_desc(
        &self,
        mac: MacAddr,
        ip: Option<IpAddr>,
        port: Option<u16>,
        bridge: &str,
        is_candidate: bool,
    ) -> Option<(GuestDesc, NicDesc)>;
}

/// A [`GuestDescGetter`] over two in-memory registries.
#[derive(Debug, Default)]
pub struct StaticGuestTable {
    guests: RwLock<HashMap<MacAddr, Arc<GuestDesc>>>,
    candidates: RwLock<HashMap<MacAddr, Arc<GuestDesc>>>,
}

impl StaticGuestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every NIC of `guest`, replacing earlier entries for the
    /// same MACs.
    pub fn insert(&self, guest: GuestDesc, candidate: bool) {
        let registry = if candidate {
            &self.candidates
        } else {
            &self.guests
        };

        let guest = Arc::new(guest);
        let mut registry = registry.write();
        for nic in &guest.nics {
            registry.insert(nic.mac, Arc::clone(&guest));
        }
    }

    /// Drops every NIC of the guest with `id` from both registries.
    pub fn remove(&self, id: &str) {
        self.guests.write().retain(|_, guest| guest.id != id);
        self.candidates.write().retain(|_, guest| guest.id != id);
    }

    pub fn len(&self) -> usize {
        self.guests.read().len() + self.candidates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl GuestDescGetter for StaticGuestTable {
    fn get_guest_nic_desc(
        &self,
        mac: MacAddr,
        ip: Option<IpAddr>,
        port: Option<u16>,
        bridge: &str,
        is_candidate: bool,
    ) -> Option<(GuestDesc, NicDesc)> {
        let registry = if is_candidate {
            &self.candidates
        } else {
            &self.guests
        };

        let guest = registry.read().get(&mac).cloned()?;
        let nic = guest.nics.iter().find(|nic| nic.mac == mac)?;

        if let Some(nic_bridge) = &nic.bridge {
            if !bridge.is_empty() && nic_bridge != bridge {
                return None;
            }
        }

        match ip {
            Some(IpAddr::V4(ip)) if !ip.is_unspecified() && ip != nic.ip => return None,
            Some(IpAddr::V6(ip)) if !ip.is_unspecified() && Some(ip) != nic.ip6 => return None,
            _ => {}
        }

        if port.is_some() && nic.port.is_some() && port != nic.port {
            return None;
        }

        Some((GuestDesc::clone(&guest), nic.clone()))
    }
}

/// Builds [`ResponseConfig`]s for the guests on one bridge.
pub struct GuestResponder {
    getter: Arc<dyn GuestDescGetter>,
    bridge: String,
    /// Server addresses and defaults each answer starts from.
    base: ResponseConfig,
}

impl GuestResponder {
    pub fn new(getter: Arc<dyn GuestDescGetter>, bridge: impl Into<String>, base: ResponseConfig) -> Self {
        Self {
            getter,
            bridge: bridge.into(),
            base,
        }
    }

    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    /// Finds a NIC, asking the authoritative registry before the
    /// candidate one.
    pub fn lookup(&self, mac: MacAddr, ip: Option<IpAddr>, port: Option<u16>) -> Option<(GuestDesc, NicDesc)> {
        self.getter
            .get_guest_nic_desc(mac, ip, port, &self.bridge, false)
            .or_else(|| self.getter.get_guest_nic_desc(mac, ip, port, &self.bridge, true))
    }

    /// What to answer the NIC with `mac`, or `None` if it is not ours to
    /// answer.
    pub fn response_config(
        &self,
        mac: MacAddr,
        ip: Option<IpAddr>,
        vendor_class: Option<&str>,
    ) -> Option<ResponseConfig> {
        let (guest, nic) = self.lookup(mac, ip, None)?;
        if !nic.is_virtual {
            tracing::debug!("{} belongs to {} but is not answered locally", mac, guest.name);
            return None;
        }

        match self.build(&guest, &nic, vendor_class) {
            Ok(conf) => Some(conf),
            Err(err) => {
                tracing::warn!("bad descriptor for {} of {}: {}", mac, guest.name, err);
                None
            }
        }
    }

    fn build(&self, guest: &GuestDesc, nic: &NicDesc, vendor_class: Option<&str>) -> Result<ResponseConfig> {
        let network = Ipv4Network::new(nic.ip, nic.masklen)
            .map_err(|err| Error::InvalidFormat(format!("{}/{}: {}", nic.ip, nic.masklen, err)))?;

        let os = ClientOs::classify(guest.os_name.as_deref(), vendor_class);
        let main_nic = guest.main_nic();
        let is_main = main_nic.is_some_and(|main| main.mac == nic.mac);

        let mut conf = self.base.clone();
        conf.client_ip = nic.ip;
        conf.subnet_mask = network.mask();
        conf.broadcast_addr = Some(network.broadcast());
        conf.hostname = guest.hostname.clone().or_else(|| Some(guest.name.clone()));
        conf.os = os;
        if let Some(domain) = &nic.domain {
            conf.domain = Some(domain.clone());
        }
        if !nic.dns.is_empty() {
            conf.dns_servers = nic.dns.clone();
        }
        if !nic.ntp.is_empty() {
            conf.ntp_servers = nic.ntp.clone();
        }
        if nic.mtu.is_some() {
            conf.mtu = nic.mtu;
        }

        conf.gateway = if is_main { nic.gateway } else { None };
        conf.routes = nic_routes(guest, nic, main_nic, os);

        if let Some(ip6) = nic.ip6 {
            // Validates the prefix length.
            Ipv6Network::new(ip6, nic.masklen6)
                .map_err(|err| Error::InvalidFormat(format!("{}/{}: {}", ip6, nic.masklen6, err)))?;
            conf.client_ip6 = Some(ip6);
            conf.prefix_len6 = nic.masklen6;
            conf.gateway6 = nic.gateway6;
            conf.routes6 = nic.routes6.clone();
            if !nic.dns6.is_empty() {
                conf.dns_servers6 = nic.dns6.clone();
            }
        }

        Ok(conf)
    }
}

fn nic_routes(guest: &GuestDesc, nic: &NicDesc, main_nic: Option<&NicDesc>, os: ClientOs) -> Vec<Route> {
    let mut routes = nic.routes.clone();

    match main_nic {
        Some(main) if main.mac == nic.mac => {
            if let Some(gateway) = nic.gateway {
                if os.wants_default_route() {
                    if let Ok(default) = Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0) {
                        routes.push(Route::new(default, gateway));
                    }
                }
                routes.push(Route::new(Ipv4Network::from(METADATA_SERVER), gateway));
            }
        }
        Some(main) => {
            // A private second NIC next to a public main NIC takes over
            // the private ranges.
            if let Some(gateway) = nic.gateway {
                if nic.routes.is_empty()
                    && guest.nics.len() == 2
                    && !is_exit_addr(nic.ip)
                    && is_exit_addr(main.ip)
                {
                    for (addr, prefix) in PRIVATE_PREFIXES {
                        if let Ok(network) = Ipv4Network::new(addr, prefix) {
                            routes.push(Route::new(network, gateway));
                        }
                    }
                }
            }
        }
        None => {}
    }

    routes
}

/// DHCPv4 handler for the guest-facing server.
pub struct DhcpHandler {
    responder: Arc<GuestResponder>,
    relay: Option<Arc<DhcpRelay>>,
}

impl DhcpHandler {
    pub fn new(responder: Arc<GuestResponder>, relay: Option<Arc<DhcpRelay>>) -> Self {
        Self { responder, relay }
    }

    async fn handle(
        &self,
        packet: Packet,
        client_mac: Option<MacAddr>,
        src: SocketAddr,
    ) -> Result<Option<Reply<Packet>>> {
        if packet.op() != Some(Op::BootRequest) {
            tracing::debug!("ignoring non-request from {}", src);
            return Ok(None);
        }

        let options = packet.options();
        let Some(msg_type) = options.message_type() else {
            tracing::debug!("ignoring BOOTP request from {}", src);
            return Ok(None);
        };
        let mac = client_mac
            .ok_or_else(|| Error::InvalidFormat(format!("no client hardware address from {}", src)))?;
        tracing::debug!("{:?} from {} ({})", msg_type, mac, src);

        let Some(conf) = self.responder.response_config(mac, None, options.vendor_class()) else {
            return match &self.relay {
                Some(relay) => {
                    relay.relay(packet, mac, src).await?;
                    Ok(None)
                }
                None => {
                    tracing::debug!("no configuration for {}", mac);
                    Ok(None)
                }
            };
        };

        if let Some(server_id) = options.server_id() {
            if server_id != conf.server_ip {
                tracing::debug!("{} chose server {}", mac, server_id);
                return Ok(None);
            }
        }

        if msg_type == MessageType::Request {
            let ciaddr = packet.ciaddr();
            let requested = options
                .requested_ip()
                .or_else(|| (!ciaddr.is_unspecified()).then_some(ciaddr));
            if let Some(ip) = requested.filter(|ip| *ip != conf.client_ip) {
                tracing::info!("refusing {} to {}, assigned {}", ip, mac, conf.client_ip);
                return Ok(Some(Reply::new(v4::make_nak_packet(&packet, conf.server_ip))));
            }
        }

        let Some(reply_type) = v4::reply_message_type(msg_type) else {
            tracing::debug!("not answering {:?} from {}", msg_type, mac);
            return Ok(None);
        };

        tracing::info!("answering {:?} from {} with {}", msg_type, mac, conf.client_ip);
        Ok(Some(Reply::new(v4::make_reply_packet(&packet, reply_type, &conf))))
    }
}

impl Handler<Packet> for DhcpHandler {
    fn serve_dhcp(
        &self,
        packet: Packet,
        client_mac: Option<MacAddr>,
        src: SocketAddr,
    ) -> BoxFuture<'_, Result<Option<Reply<Packet>>>> {
        self.handle(packet, client_mac, src).boxed()
    }
}

/// DHCPv6 handler for the guest-facing server.
pub struct Dhcp6Handler {
    responder: Arc<GuestResponder>,
    relay: Option<Arc<Dhcp6Relay>>,
}

impl Dhcp6Handler {
    pub fn new(responder: Arc<GuestResponder>, relay: Option<Arc<Dhcp6Relay>>) -> Self {
        Self { responder, relay }
    }

    async fn handle(
        &self,
        msg: v6::Message,
        client_mac: Option<MacAddr>,
        src: SocketAddr,
    ) -> Result<Option<Reply<v6::Message>>> {
        if let (v6::Message::Client(request), Some(mac)) = (&msg, client_mac) {
            let conf = self
                .responder
                .response_config(mac, None, None)
                .filter(|conf| conf.client_ip6.is_some());

            if let Some(conf) = conf {
                let reply = v6::make_dhcp6_reply(request, &conf)?;
                tracing::info!("answering {:?} from {} ({})", request.msg_type, mac, src);
                return Ok(Some(Reply::new(v6::Message::Client(reply))));
            }
        }

        match &self.relay {
            Some(relay) => {
                // A relayed message's client MAC is not the sender's.
                let peer_mac = match msg {
                    v6::Message::Client(_) => client_mac,
                    v6::Message::Relay(_) => None,
                };
                relay.relay(msg, peer_mac, src).await?;
            }
            None => tracing::debug!("no configuration for {:?} ({})", client_mac, src),
        }
        Ok(None)
    }
}

impl Handler<v6::Message> for Dhcp6Handler {
    fn serve_dhcp(
        &self,
        msg: v6::Message,
        client_mac: Option<MacAddr>,
        src: SocketAddr,
    ) -> BoxFuture<'_, Result<Option<Reply<v6::Message>>>> {
        self.handle(msg, client_mac, src).boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    use super::{
        is_exit_addr, Dhcp6Handler, DhcpHandler, GuestDesc, GuestDescGetter, GuestResponder, NicDesc,
        StaticGuestTable,
    };
    use crate::conn::mock::MemoryConn;
    use crate::mac::MacAddr;
    use crate::relay::DhcpRelay;
    use crate::response::{ClientOs, ResponseConfig, Route};
    use crate::server::Handler;
    use crate::v4::{MessageType, Op, OptionCode, Packet};
    use crate::v6;

    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 254);
    const MAIN: MacAddr = MacAddr::from_octets([0x52, 0x54, 0, 0, 0, 1]);
    const SECOND: MacAddr = MacAddr::from_octets([0x52, 0x54, 0, 0, 0, 2]);
    const STRANGER: MacAddr = MacAddr::from_octets([0x52, 0x54, 0, 0, 0, 0x99]);

    fn nic(mac: MacAddr, ip: [u8; 4], gateway: Option<[u8; 4]>) -> NicDesc {
        NicDesc {
            mac,
            ip: Ipv4Addr::from(ip),
            masklen: 24,
            gateway: gateway.map(Ipv4Addr::from),
            dns: vec![Ipv4Addr::new(1, 1, 1, 1)],
            ntp: Vec::new(),
            domain: None,
            routes: Vec::new(),
            is_virtual: true,
            bridge: Some("br0".into()),
            port: None,
            mtu: None,
            ip6: None,
            masklen6: 64,
            gateway6: None,
            routes6: Vec::new(),
            dns6: Vec::new(),
        }
    }

    fn guest(os_name: Option<&str>, nics: Vec<NicDesc>) -> GuestDesc {
        GuestDesc {
            id: "g-1".into(),
            name: "web".into(),
            hostname: None,
            os_name: os_name.map(Into::into),
            nics,
        }
    }

    fn responder(table: StaticGuestTable) -> GuestResponder {
        let base = ResponseConfig {
            server_ip: SERVER,
            ..Default::default()
        };
        GuestResponder::new(Arc::new(table), "br0", base)
    }

    fn route(network: &str, gateway: [u8; 4]) -> Route {
        Route::new(network.parse().unwrap(), Ipv4Addr::from(gateway))
    }

    #[test]
    fn exit_addresses() {
        assert!(is_exit_addr(Ipv4Addr::new(8, 8, 8, 8)));
        assert!(!is_exit_addr(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!is_exit_addr(Ipv4Addr::new(100, 64, 0, 1)));
        assert!(!is_exit_addr(Ipv4Addr::new(169, 254, 1, 1)));
    }

    #[test]
    fn candidates_are_consulted_second() {
        let table = StaticGuestTable::new();
        table.insert(guest(None, vec![nic(MAIN, [10, 0, 0, 5], Some([10, 0, 0, 1]))]), true);

        assert!(table.get_guest_nic_desc(MAIN, None, None, "br0", false).is_none());
        assert!(table.get_guest_nic_desc(MAIN, None, None, "br0", true).is_some());
        assert!(table.get_guest_nic_desc(MAIN, None, None, "br1", true).is_none());
        assert!(table
            .get_guest_nic_desc(MAIN, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6))), None, "br0", true)
            .is_none());

        let responder = responder(table);
        let (_, found) = responder.lookup(MAIN, None, None).unwrap();
        assert_eq!(found.mac, MAIN);
    }

    #[test]
    fn main_nic_gets_default_and_metadata_routes() {
        let table = StaticGuestTable::new();
        table.insert(guest(None, vec![nic(MAIN, [10, 0, 0, 5], Some([10, 0, 0, 1]))]), false);

        let conf = responder(table).response_config(MAIN, None, None).unwrap();
        assert_eq!(conf.client_ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(conf.subnet_mask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(conf.broadcast_addr, Some(Ipv4Addr::new(10, 0, 0, 255)));
        assert_eq!(conf.gateway, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(conf.hostname.as_deref(), Some("web"));
        assert_eq!(
            conf.routes,
            [
                route("0.0.0.0/0", [10, 0, 0, 1]),
                route("169.254.169.254/32", [10, 0, 0, 1]),
            ]
        );
    }

    #[test]
    fn windows_guest_gets_no_default_route() {
        let table = StaticGuestTable::new();
        table.insert(guest(None, vec![nic(MAIN, [10, 0, 0, 5], Some([10, 0, 0, 1]))]), false);

        let conf = responder(table)
            .response_config(MAIN, None, Some("MSFT 5.0"))
            .unwrap();
        assert_eq!(conf.os, ClientOs::Windows);
        assert_eq!(conf.routes, [route("169.254.169.254/32", [10, 0, 0, 1])]);
    }

    #[test]
    fn private_second_nic_gets_private_ranges() {
        let table = StaticGuestTable::new();
        table.insert(
            guest(
                Some("linux"),
                vec![
                    nic(MAIN, [203, 0, 113, 5], Some([203, 0, 113, 1])),
                    nic(SECOND, [10, 1, 0, 5], Some([10, 1, 0, 1])),
                ],
            ),
            false,
        );
        let responder = responder(table);

        let conf = responder.response_config(SECOND, None, None).unwrap();
        assert_eq!(conf.gateway, None);
        assert_eq!(
            conf.routes,
            [
                route("10.0.0.0/8", [10, 1, 0, 1]),
                route("172.16.0.0/12", [10, 1, 0, 1]),
                route("192.168.0.0/16", [10, 1, 0, 1]),
            ]
        );

        let main = responder.response_config(MAIN, None, None).unwrap();
        assert_eq!(main.gateway, Some(Ipv4Addr::new(203, 0, 113, 1)));
    }

    #[test]
    fn non_virtual_nics_are_not_answered() {
        let table = StaticGuestTable::new();
        let mut desc = nic(MAIN, [10, 0, 0, 5], Some([10, 0, 0, 1]));
        desc.is_virtual = false;
        table.insert(guest(None, vec![desc]), false);

        assert!(responder(table).response_config(MAIN, None, None).is_none());
    }

    fn request(mac: MacAddr, msg_type: MessageType) -> Packet {
        let mut packet = Packet::new(Op::BootRequest);
        packet.set_xid(0x1234);
        packet.set_chaddr(&mac.octets());
        packet.add_option(OptionCode::MESSAGE_TYPE, &[msg_type.to_u8()]);
        packet
    }

    #[tokio::test]
    async fn known_guest_gets_offer() {
        let table = StaticGuestTable::new();
        table.insert(guest(None, vec![nic(MAIN, [10, 0, 0, 5], Some([10, 0, 0, 1]))]), false);
        let handler = DhcpHandler::new(Arc::new(responder(table)), None);

        let reply = handler
            .serve_dhcp(request(MAIN, MessageType::Discover), Some(MAIN), "0.0.0.0:68".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message.message_type(), Some(MessageType::Offer));
        assert_eq!(reply.message.yiaddr(), Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(reply.message.xid(), 0x1234);
    }

    #[tokio::test]
    async fn wrong_address_is_refused() {
        let table = StaticGuestTable::new();
        table.insert(guest(None, vec![nic(MAIN, [10, 0, 0, 5], Some([10, 0, 0, 1]))]), false);
        let handler = DhcpHandler::new(Arc::new(responder(table)), None);

        let mut packet = request(MAIN, MessageType::Request);
        packet.add_option(OptionCode::REQUESTED_IP, &[10, 0, 0, 9]);
        let reply = handler
            .serve_dhcp(packet, Some(MAIN), "0.0.0.0:68".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message.message_type(), Some(MessageType::Nak));
    }

    #[tokio::test]
    async fn unknown_guest_is_relayed() {
        let (guest_conn, _guest_in, _guest_out) = MemoryConn::new("0.0.0.0:67".parse().unwrap());
        let (up, _up_in, mut up_out) = MemoryConn::new("10.0.0.254:68".parse().unwrap());
        let relay = Arc::new(DhcpRelay::new(
            Arc::new(guest_conn),
            Arc::new(up),
            SERVER,
            "192.0.2.1:67".parse().unwrap(),
        ));
        let handler = DhcpHandler::new(Arc::new(responder(StaticGuestTable::new())), Some(relay));

        let src: SocketAddr = "0.0.0.0:68".parse().unwrap();
        let res = handler
            .serve_dhcp(request(STRANGER, MessageType::Discover), Some(STRANGER), src)
            .await
            .unwrap();
        assert!(res.is_none());

        let forwarded = Packet::from_bytes(up_out.recv().await.unwrap().data).unwrap();
        assert_eq!(forwarded.giaddr(), SERVER);
        assert_eq!(forwarded.client_mac(), Some(STRANGER));
    }

    #[tokio::test]
    async fn v6_guest_gets_advertise() {
        let table = StaticGuestTable::new();
        let mut desc = nic(MAIN, [10, 0, 0, 5], Some([10, 0, 0, 1]));
        desc.ip6 = Some("2001:db8::5".parse().unwrap());
        desc.gateway6 = Some("2001:db8::1".parse().unwrap());
        table.insert(guest(None, vec![desc]), false);
        let handler = Dhcp6Handler::new(Arc::new(responder(table)), None);

        let mut options = v6::Options::new();
        options.push(v6::OptionCode::CLIENT_ID, v6::packet::duid_ll(MAIN));
        options.push(v6::OptionCode::IA_NA, vec![0; 12]);
        let solicit = v6::Message::Client(v6::ClientMessage {
            msg_type: v6::MessageType::Solicit,
            transaction_id: 7,
            options,
        });

        let reply = handler
            .serve_dhcp(solicit, Some(MAIN), "[fe80::5054:ff:fe00:1]:546".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message.msg_type(), v6::MessageType::Advertise);
        assert!(reply.message.options().get(v6::OptionCode::IA_NA).is_some());
    }
}
