use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::guest::GuestDesc;
use crate::icmp6::Preference;

pub const DEFAULT_PATH: &str = "/etc/hostdhcp.toml";

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Interface the guests are attached to.
    pub interface: String,
    /// Bridge name used for guest lookups. Defaults to `interface`.
    pub bridge: Option<String>,
    pub dhcp: Option<DhcpConfig>,
    pub dhcp6: Option<Dhcp6Config>,
    #[serde(default)]
    pub ra: RaConfig,
    #[serde(default)]
    pub pxe: PxeConfig,
    #[serde(default)]
    pub guests: Vec<GuestEntry>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let string = std::fs::read_to_string(path)?;
        Self::from_toml(&string)
    }

    pub fn from_toml(string: &str) -> Result<Self> {
        let config: Self = toml::from_str(string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn bridge(&self) -> &str {
        self.bridge.as_deref().unwrap_or(&self.interface)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            return Err(Error::Config("interface must not be empty".into()));
        }
        if self.dhcp.is_none() && self.dhcp6.is_none() && !self.ra.enabled {
            return Err(Error::Config("nothing to serve: no [dhcp], [dhcp6] or [ra]".into()));
        }

        if let Some(dhcp) = &self.dhcp {
            dhcp.validate()?;
        }
        if let Some(dhcp6) = &self.dhcp6 {
            dhcp6.validate()?;
        }
        if self.ra.enabled {
            self.ra.validate()?;
        }
        Ok(())
    }
}

/// How a server talks to the network.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Udp,
    /// Raw IPv4 socket; needs a concrete address.
    Raw,
    /// Ethernet frames; needs a concrete address.
    Link,
}

fn default_dhcp_port() -> u16 {
    crate::v4::SERVER_PORT
}

fn default_dhcp6_port() -> u16 {
    crate::v6::SERVER_PORT
}

fn default_relay_port() -> u16 {
    crate::v4::CLIENT_PORT
}

fn default_relay6_port() -> u16 {
    crate::v6::CLIENT_PORT
}

fn default_lease_time() -> u64 {
    crate::response::DEFAULT_LEASE_TIME.as_secs()
}

fn default_relay_ttl() -> u64 {
    crate::relay::DEFAULT_TTL.as_secs()
}

#[derive(Clone, Debug, Deserialize)]
pub struct DhcpConfig {
    /// This server's address. The UDP backend binds the wildcard address
    /// on `port` and only uses this as the default `server_ip`.
    pub listen: Ipv4Addr,
    #[serde(default = "default_dhcp_port")]
    pub port: u16,
    #[serde(default)]
    pub backend: Backend,
    /// Server identifier. Defaults to `listen`.
    pub server_ip: Option<Ipv4Addr>,
    /// Seconds.
    #[serde(default = "default_lease_time")]
    pub lease_time: u64,
    pub renewal_time: Option<u64>,
    pub rebinding_time: Option<u64>,
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
    #[serde(default)]
    pub ntp: Vec<Ipv4Addr>,
    pub domain: Option<String>,
    pub mtu: Option<u16>,
    pub relay: Option<RelayConfig>,
}

impl DhcpConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((self.listen, self.port))
    }

    pub fn server_ip(&self) -> Ipv4Addr {
        self.server_ip.unwrap_or(self.listen)
    }

    fn validate(&self) -> Result<()> {
        if self.backend != Backend::Udp && self.listen.is_unspecified() {
            return Err(Error::Config(format!(
                "[dhcp] backend {:?} needs a concrete listen address",
                self.backend
            )));
        }
        if self.server_ip().is_unspecified() {
            return Err(Error::Config(
                "[dhcp] server_ip is required when listening on 0.0.0.0".into(),
            ));
        }
        if self.lease_time == 0 {
            return Err(Error::Config("[dhcp] lease_time must not be zero".into()));
        }
        if let Some(relay) = &self.relay {
            if relay.local_addr.is_unspecified() {
                return Err(Error::Config("[dhcp.relay] local_addr must be concrete".into()));
            }
            if relay.ttl == 0 {
                return Err(Error::Config("[dhcp.relay] ttl must not be zero".into()));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RelayConfig {
    /// Upstream DHCP server.
    pub server: Ipv4Addr,
    #[serde(default = "default_dhcp_port")]
    pub server_port: u16,
    /// Our address on the upstream side, written into `giaddr`.
    pub local_addr: Ipv4Addr,
    /// Port upstream replies arrive on.
    #[serde(default = "default_relay_port")]
    pub port: u16,
    #[serde(default)]
    pub backend: Backend,
    /// Seconds a forwarded request waits for its reply.
    #[serde(default = "default_relay_ttl")]
    pub ttl: u64,
}

impl RelayConfig {
    pub fn server_addr(&self) -> SocketAddr {
        SocketAddr::from((self.server, self.server_port))
    }

    pub fn local_socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.local_addr, self.port))
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Dhcp6Config {
    pub listen: Ipv6Addr,
    #[serde(default = "default_dhcp6_port")]
    pub port: u16,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub dns: Vec<Ipv6Addr>,
    #[serde(default)]
    pub ntp: Vec<Ipv6Addr>,
    pub relay: Option<Relay6Config>,
}

impl Dhcp6Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((self.listen, self.port))
    }

    fn validate(&self) -> Result<()> {
        match self.backend {
            Backend::Raw => {
                return Err(Error::Config("[dhcp6] the raw backend is IPv4 only".into()));
            }
            Backend::Link if self.listen.is_unspecified() => {
                return Err(Error::Config("[dhcp6] backend link needs a concrete listen address".into()));
            }
            _ => {}
        }
        if let Some(relay) = &self.relay {
            if relay.local_addr.is_unspecified() {
                return Err(Error::Config("[dhcp6.relay] local_addr must be concrete".into()));
            }
            if relay.ttl == 0 {
                return Err(Error::Config("[dhcp6.relay] ttl must not be zero".into()));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Relay6Config {
    pub server: Ipv6Addr,
    #[serde(default = "default_dhcp6_port")]
    pub server_port: u16,
    pub local_addr: Ipv6Addr,
    #[serde(default = "default_relay6_port")]
    pub port: u16,
    #[serde(default = "default_relay_ttl")]
    pub ttl: u64,
}

impl Relay6Config {
    pub fn server_addr(&self) -> SocketAddr {
        SocketAddr::from((self.server, self.server_port))
    }

    pub fn local_socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.local_addr, self.port))
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }
}

/// Router advertisement settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RaConfig {
    pub enabled: bool,
    pub hop_limit: u8,
    pub managed: bool,
    pub other: bool,
    pub home_agent: bool,
    pub preference: Preference,
    /// Seconds.
    pub router_lifetime: u16,
    /// Milliseconds.
    pub reachable_time: u32,
    /// Milliseconds.
    pub retrans_timer: u32,
    /// Seconds of route information options.
    pub route_lifetime: u32,
    /// Advertised when the guest's NIC has none.
    pub mtu: u32,
    /// Milliseconds between retries for unresolved gateways.
    pub retry_interval: u64,
    pub max_attempts: u32,
}

impl Default for RaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hop_limit: 64,
            managed: true,
            other: true,
            home_agent: false,
            preference: Preference::Medium,
            router_lifetime: 9000,
            reachable_time: 0,
            retrans_timer: 0,
            route_lifetime: 9000,
            mtu: 1500,
            retry_interval: 1000,
            max_attempts: 3,
        }
    }
}

impl RaConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval)
    }

    fn validate(&self) -> Result<()> {
        if self.retry_interval == 0 {
            return Err(Error::Config("[ra] retry_interval must not be zero".into()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("[ra] max_attempts must not be zero".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct PxeConfig {
    pub boot_server: Option<Ipv4Addr>,
    pub boot_file: Option<String>,
}

/// A `[[guests]]` table.
#[derive(Clone, Debug, Deserialize)]
pub struct GuestEntry {
    /// Network still being set up.
    #[serde(default)]
    pub candidate: bool,
    #[serde(flatten)]
    pub guest: GuestDesc,
}
