use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use ipnetwork::{Ipv4Network, Ipv6Network};
use serde::Deserialize;

use crate::mac::MacAddr;
use crate::v4::options::OptionCode;

pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(86_400);

/// Operating system family of a DHCP client, as far as we can tell.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ClientOs {
    #[default]
    Other,
    Windows,
}

impl ClientOs {
    /// Classifies a client from the guest's OS name and the vendor class
    /// identifier it sent. Either one naming Windows is enough.
    pub fn classify(os_name: Option<&str>, vendor_class: Option<&str>) -> Self {
        let by_vendor = vendor_class.is_some_and(|class| class.starts_with("MSFT "));
        let by_name = os_name.is_some_and(|name| name.to_ascii_lowercase().contains("windows"));

        if by_vendor || by_name {
            Self::Windows
        } else {
            Self::Other
        }
    }

    /// The option carrying classless static routes for this client.
    pub fn route_option(self) -> OptionCode {
        match self {
            Self::Windows => OptionCode::MS_CLASSLESS_ROUTE,
            Self::Other => OptionCode::CLASSLESS_ROUTE,
        }
    }

    /// Windows clients take their default route from the router option
    /// only.
    pub fn wants_default_route(self) -> bool {
        self != Self::Windows
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Route {
    pub network: Ipv4Network,
    pub gateway: Ipv4Addr,
}

impl Route {
    pub fn new(network: Ipv4Network, gateway: Ipv4Addr) -> Self {
        Self { network, gateway }
    }

    pub fn is_default(&self) -> bool {
        self.network.prefix() == 0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Route6 {
    pub network: Ipv6Network,
    pub gateway: Ipv6Addr,
}

/// Encodes routes as a classless static route option value (RFC 3442).
///
/// Each route is the prefix length, the significant octets of the
/// network and the gateway.
pub fn classless_routes(routes: &[Route]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(routes.len() * 9);
    for route in routes {
        let prefix = route.network.prefix();
        let significant = usize::from(prefix).div_ceil(8);

        buf.push(prefix);
        buf.extend_from_slice(&route.network.network().octets()[..significant]);
        buf.extend_from_slice(&route.gateway.octets());
    }
    buf
}

/// Everything needed to answer one client, built per request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseConfig {
    pub server_ip: Ipv4Addr,
    pub interface_mac: MacAddr,

    pub client_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub broadcast_addr: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub hostname: Option<String>,
    pub domain: Option<String>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub ntp_servers: Vec<Ipv4Addr>,
    pub mtu: Option<u16>,
    pub routes: Vec<Route>,
    pub os: ClientOs,

    pub lease_time: Duration,
    pub renewal_time: Option<Duration>,
    pub rebinding_time: Option<Duration>,

    pub boot_server: Option<Ipv4Addr>,
    pub boot_file: Option<String>,

    pub client_ip6: Option<Ipv6Addr>,
    pub prefix_len6: u8,
    pub gateway6: Option<Ipv6Addr>,
    pub routes6: Vec<Route6>,
    pub dns_servers6: Vec<Ipv6Addr>,
    pub ntp_servers6: Vec<Ipv6Addr>,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            server_ip: Ipv4Addr::UNSPECIFIED,
            interface_mac: MacAddr::ZERO,
            client_ip: Ipv4Addr::UNSPECIFIED,
            subnet_mask: Ipv4Addr::UNSPECIFIED,
            broadcast_addr: None,
            gateway: None,
            hostname: None,
            domain: None,
            dns_servers: Vec::new(),
            ntp_servers: Vec::new(),
            mtu: None,
            routes: Vec::new(),
            os: ClientOs::Other,
            lease_time: DEFAULT_LEASE_TIME,
            renewal_time: None,
            rebinding_time: None,
            boot_server: None,
            boot_file: None,
            client_ip6: None,
            prefix_len6: 64,
            gateway6: None,
            routes6: Vec::new(),
            dns_servers6: Vec::new(),
            ntp_servers6: Vec::new(),
        }
    }
}
