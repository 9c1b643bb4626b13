//! ICMPv6 Neighbor Discovery messages (RFC 4861) and the Route Information
//! option (RFC 4191).

use std::net::Ipv6Addr;

use bytes::BufMut;

use crate::codec::{take, Decode, Encode};
use crate::error::{DecodeError, Layer};
use crate::frame::{Checksum, IPPROTO_ICMPV6};
use crate::mac::MacAddr;

pub const ROUTER_SOLICITATION: u8 = 133;
pub const ROUTER_ADVERTISEMENT: u8 = 134;
pub const NEIGHBOR_SOLICITATION: u8 = 135;
pub const NEIGHBOR_ADVERTISEMENT: u8 = 136;

const OPT_SOURCE_LINK_ADDR: u8 = 1;
const OPT_TARGET_LINK_ADDR: u8 = 2;
const OPT_PREFIX_INFO: u8 = 3;
const OPT_MTU: u8 = 5;
const OPT_ROUTE_INFO: u8 = 24;

const RA_MANAGED: u8 = 0x80;
const RA_OTHER: u8 = 0x40;
const RA_HOME_AGENT: u8 = 0x20;

const NA_ROUTER: u8 = 0x80;
const NA_SOLICITED: u8 = 0x40;
const NA_OVERRIDE: u8 = 0x20;

pub const PREFIX_ON_LINK: u8 = 0x80;
pub const PREFIX_AUTONOMOUS: u8 = 0x40;

/// Default router preference (RFC 4191 §2.1).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preference {
    Low,
    #[default]
    Medium,
    High,
}

impl Preference {
    fn bits(self) -> u8 {
        match self {
            Self::High => 0b01,
            Self::Medium => 0b00,
            Self::Low => 0b11,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b01 => Self::High,
            0b11 => Self::Low,
            // 0b10 is reserved and read as medium.
            _ => Self::Medium,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PrefixInfo {
    pub prefix_len: u8,
    pub flags: u8,
    pub valid_lifetime: u32,
    pub preferred_lifetime: u32,
    pub prefix: Ipv6Addr,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RouteInfo {
    pub prefix_len: u8,
    pub preference: Preference,
    pub lifetime: u32,
    pub prefix: Ipv6Addr,
}

impl RouteInfo {
    // The prefix is cut to 0, 8 or 16 bytes depending on its length.
    fn prefix_bytes(&self) -> usize {
        match self.prefix_len {
            0 => 0,
            1..=64 => 8,
            _ => 16,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NdpOption {
    SourceLinkAddr(MacAddr),
    TargetLinkAddr(MacAddr),
    PrefixInfo(PrefixInfo),
    Mtu(u32),
    RouteInfo(RouteInfo),
    Unknown { typ: u8, data: Vec<u8> },
}

impl NdpOption {
    fn decode_all(mut buf: &[u8]) -> Result<Vec<Self>, DecodeError> {
        let eof = Layer::NdpOption.eof();
        let mut options = Vec::new();

        while !buf.is_empty() {
            let typ = u8::decode(&mut buf).map_err(&eof)?;
            let units = u8::decode(&mut buf).map_err(&eof)?;
            if units == 0 {
                return Err(DecodeError::Malformed(Layer::NdpOption, "zero length"));
            }
            let mut data = take(&mut buf, usize::from(units) * 8 - 2).map_err(&eof)?;

            let option = match typ {
                OPT_SOURCE_LINK_ADDR => Self::SourceLinkAddr(MacAddr::decode(&mut data).map_err(&eof)?),
                OPT_TARGET_LINK_ADDR => Self::TargetLinkAddr(MacAddr::decode(&mut data).map_err(&eof)?),
                OPT_MTU => {
                    let _reserved = u16::decode(&mut data).map_err(&eof)?;
                    Self::Mtu(u32::decode(&mut data).map_err(&eof)?)
                }
                OPT_PREFIX_INFO => {
                    let prefix_len = u8::decode(&mut data).map_err(&eof)?;
                    let flags = u8::decode(&mut data).map_err(&eof)?;
                    let valid_lifetime = u32::decode(&mut data).map_err(&eof)?;
                    let preferred_lifetime = u32::decode(&mut data).map_err(&eof)?;
                    let _reserved = u32::decode(&mut data).map_err(&eof)?;
                    let prefix = Ipv6Addr::decode(&mut data).map_err(&eof)?;
                    Self::PrefixInfo(PrefixInfo {
                        prefix_len,
                        flags,
                        valid_lifetime,
                        preferred_lifetime,
                        prefix,
                    })
                }
                OPT_ROUTE_INFO => {
                    let prefix_len = u8::decode(&mut data).map_err(&eof)?;
                    let flags = u8::decode(&mut data).map_err(&eof)?;
                    let lifetime = u32::decode(&mut data).map_err(&eof)?;
                    if prefix_len > 128 {
                        return Err(DecodeError::Malformed(Layer::NdpOption, "prefix length"));
                    }
                    let mut prefix = [0; 16];
                    let len = data.len().min(16);
                    prefix[..len].copy_from_slice(&data[..len]);
                    Self::RouteInfo(RouteInfo {
                        prefix_len,
                        preference: Preference::from_bits(flags >> 3),
                        lifetime,
                        prefix: Ipv6Addr::from(prefix),
                    })
                }
                typ => Self::Unknown {
                    typ,
                    data: data.to_vec(),
                },
            };

            options.push(option);
        }

        Ok(options)
    }
}

impl Encode for NdpOption {
    fn encode<B>(&self, mut buf: B)
    where
        B: BufMut,
    {
        match self {
            Self::SourceLinkAddr(mac) | Self::TargetLinkAddr(mac) => {
                let typ = if matches!(self, Self::SourceLinkAddr(_)) {
                    OPT_SOURCE_LINK_ADDR
                } else {
                    OPT_TARGET_LINK_ADDR
                };
                typ.encode(&mut buf);
                1u8.encode(&mut buf);
                mac.encode(&mut buf);
            }
            Self::Mtu(mtu) => {
                OPT_MTU.encode(&mut buf);
                1u8.encode(&mut buf);
                0u16.encode(&mut buf);
                mtu.encode(&mut buf);
            }
            Self::PrefixInfo(info) => {
                OPT_PREFIX_INFO.encode(&mut buf);
                4u8.encode(&mut buf);
                info.prefix_len.encode(&mut buf);
                info.flags.encode(&mut buf);
                info.valid_lifetime.encode(&mut buf);
                info.preferred_lifetime.encode(&mut buf);
                0u32.encode(&mut buf);
                info.prefix.encode(&mut buf);
            }
            Self::RouteInfo(info) => {
                let prefix_bytes = info.prefix_bytes();
                OPT_ROUTE_INFO.encode(&mut buf);
                ((8 + prefix_bytes) as u8 / 8).encode(&mut buf);
                info.prefix_len.encode(&mut buf);
                (info.preference.bits() << 3).encode(&mut buf);
                info.lifetime.encode(&mut buf);
                buf.put_slice(&info.prefix.octets()[..prefix_bytes]);
            }
            Self::Unknown { typ, data } => {
                let units = (data.len() + 2).div_ceil(8);
                typ.encode(&mut buf);
                (units as u8).encode(&mut buf);
                buf.put_slice(data);
                buf.put_bytes(0, units * 8 - 2 - data.len());
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouterSolicitation {
    pub options: Vec<NdpOption>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouterAdvertisement {
    pub hop_limit: u8,
    pub managed: bool,
    pub other: bool,
    pub home_agent: bool,
    pub preference: Preference,
    pub router_lifetime: u16,
    pub reachable_time: u32,
    pub retrans_timer: u32,
    pub options: Vec<NdpOption>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NeighborSolicitation {
    pub target: Ipv6Addr,
    pub options: Vec<NdpOption>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NeighborAdvertisement {
    pub router: bool,
    pub solicited: bool,
    pub override_flag: bool,
    pub target: Ipv6Addr,
    pub options: Vec<NdpOption>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    RouterSolicitation(RouterSolicitation),
    RouterAdvertisement(RouterAdvertisement),
    NeighborSolicitation(NeighborSolicitation),
    NeighborAdvertisement(NeighborAdvertisement),
}

impl Message {
    pub fn decode(mut buf: &[u8]) -> Result<Self, DecodeError> {
        let eof = Layer::Icmpv6.eof();

        let typ = u8::decode(&mut buf).map_err(&eof)?;
        let code = u8::decode(&mut buf).map_err(&eof)?;
        let _checksum = u16::decode(&mut buf).map_err(&eof)?;
        if code != 0 {
            return Err(DecodeError::Malformed(Layer::Icmpv6, "code"));
        }

        match typ {
            ROUTER_SOLICITATION => {
                let _reserved = u32::decode(&mut buf).map_err(&eof)?;
                Ok(Self::RouterSolicitation(RouterSolicitation {
                    options: NdpOption::decode_all(buf)?,
                }))
            }
            ROUTER_ADVERTISEMENT => {
                let hop_limit = u8::decode(&mut buf).map_err(&eof)?;
                let flags = u8::decode(&mut buf).map_err(&eof)?;
                let router_lifetime = u16::decode(&mut buf).map_err(&eof)?;
                let reachable_time = u32::decode(&mut buf).map_err(&eof)?;
                let retrans_timer = u32::decode(&mut buf).map_err(&eof)?;
                Ok(Self::RouterAdvertisement(RouterAdvertisement {
                    hop_limit,
                    managed: flags & RA_MANAGED != 0,
                    other: flags & RA_OTHER != 0,
                    home_agent: flags & RA_HOME_AGENT != 0,
                    preference: Preference::from_bits(flags >> 3),
                    router_lifetime,
                    reachable_time,
                    retrans_timer,
                    options: NdpOption::decode_all(buf)?,
                }))
            }
            NEIGHBOR_SOLICITATION => {
                let _reserved = u32::decode(&mut buf).map_err(&eof)?;
                let target = Ipv6Addr::decode(&mut buf).map_err(&eof)?;
                Ok(Self::NeighborSolicitation(NeighborSolicitation {
                    target,
                    options: NdpOption::decode_all(buf)?,
                }))
            }
            NEIGHBOR_ADVERTISEMENT => {
                let flags = u8::decode(&mut buf).map_err(&eof)?;
                let _reserved = <[u8; 3]>::decode(&mut buf).map_err(&eof)?;
                let target = Ipv6Addr::decode(&mut buf).map_err(&eof)?;
                Ok(Self::NeighborAdvertisement(NeighborAdvertisement {
                    router: flags & NA_ROUTER != 0,
                    solicited: flags & NA_SOLICITED != 0,
                    override_flag: flags & NA_OVERRIDE != 0,
                    target,
                    options: NdpOption::decode_all(buf)?,
                }))
            }
            typ => Err(DecodeError::Unsupported(Layer::Icmpv6, typ.into())),
        }
    }

    pub fn typ(&self) -> u8 {
        match self {
            Self::RouterSolicitation(_) => ROUTER_SOLICITATION,
            Self::RouterAdvertisement(_) => ROUTER_ADVERTISEMENT,
            Self::NeighborSolicitation(_) => NEIGHBOR_SOLICITATION,
            Self::NeighborAdvertisement(_) => NEIGHBOR_ADVERTISEMENT,
        }
    }

    pub fn options(&self) -> &[NdpOption] {
        match self {
            Self::RouterSolicitation(msg) => &msg.options,
            Self::RouterAdvertisement(msg) => &msg.options,
            Self::NeighborSolicitation(msg) => &msg.options,
            Self::NeighborAdvertisement(msg) => &msg.options,
        }
    }

    pub fn source_link_addr(&self) -> Option<MacAddr> {
        self.options().iter().find_map(|option| match option {
            NdpOption::SourceLinkAddr(mac) => Some(*mac),
            _ => None,
        })
    }

    pub fn target_link_addr(&self) -> Option<MacAddr> {
        self.options().iter().find_map(|option| match option {
            NdpOption::TargetLinkAddr(mac) => Some(*mac),
            _ => None,
        })
    }

    /// Encodes the message with its checksum over the IPv6 pseudo header
    /// for `src` and `dst`.
    pub fn to_bytes(&self, src: Ipv6Addr, dst: Ipv6Addr) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        self.typ().encode(&mut buf);
        0u8.encode(&mut buf);
        0u16.encode(&mut buf);

        match self {
            Self::RouterSolicitation(_) => {
                0u32.encode(&mut buf);
            }
            Self::RouterAdvertisement(ra) => {
                let mut flags = ra.preference.bits() << 3;
                if ra.managed {
                    flags |= RA_MANAGED;
                }
                if ra.other {
                    flags |= RA_OTHER;
                }
                if ra.home_agent {
                    flags |= RA_HOME_AGENT;
                }
                ra.hop_limit.encode(&mut buf);
                flags.encode(&mut buf);
                ra.router_lifetime.encode(&mut buf);
                ra.reachable_time.encode(&mut buf);
                ra.retrans_timer.encode(&mut buf);
            }
            Self::NeighborSolicitation(ns) => {
                0u32.encode(&mut buf);
                ns.target.encode(&mut buf);
            }
            Self::NeighborAdvertisement(na) => {
                let mut flags = 0;
                if na.router {
                    flags |= NA_ROUTER;
                }
                if na.solicited {
                    flags |= NA_SOLICITED;
                }
                if na.override_flag {
                    flags |= NA_OVERRIDE;
                }
                flags.encode(&mut buf);
                [0u8; 3].encode(&mut buf);
                na.target.encode(&mut buf);
            }
        }

        for option in self.options() {
            option.encode(&mut buf);
        }

        let mut csum = Checksum::new();
        csum.add_ipv6_pseudo(src, dst, IPPROTO_ICMPV6, buf.len() as u32);
        csum.add(&buf);
        buf[2..4].copy_from_slice(&csum.finish().to_be_bytes());
        buf
    }
}
