use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Deserializer};

use crate::codec::{Decode, Encode, Eof};

/// An Ethernet hardware address.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const BROADCAST: Self = Self([0xff; 6]);
    pub const ZERO: Self = Self([0; 6]);

    pub const fn from_octets(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Takes the first six bytes of `bytes`, if there are that many.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let octets: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(Self(octets))
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// The multicast MAC an IPv6 multicast group maps to (RFC 2464 §7).
    pub fn ipv6_multicast(group: Ipv6Addr) -> Self {
        let o = group.octets();
        Self([0x33, 0x33, o[12], o[13], o[14], o[15]])
    }

    /// The EUI-64 derived `fe80::/64` address for this MAC.
    pub fn link_local(&self) -> Ipv6Addr {
        let m = self.0;
        Ipv6Addr::from([
            0xfe,
            0x80,
            0,
            0,
            0,
            0,
            0,
            0,
            m[0] ^ 0x02,
            m[1],
            m[2],
            0xff,
            0xfe,
            m[3],
            m[4],
            m[5],
        ])
    }

    /// Recovers the MAC from an EUI-64 link-local address.
    pub fn from_link_local(addr: Ipv6Addr) -> Option<Self> {
        let o = addr.octets();
        if o[..8] != [0xfe, 0x80, 0, 0, 0, 0, 0, 0] || o[11] != 0xff || o[12] != 0xfe {
            return None;
        }

        Some(Self([o[8] ^ 0x02, o[9], o[10], o[13], o[14], o[15]]))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address: {0:?}")]
pub struct ParseMacError(String);

impl FromStr for MacAddr {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0; 6];
        let mut parts = s.split([':', '-']);

        for octet in &mut octets {
            let part = parts.next().ok_or_else(|| ParseMacError(s.to_owned()))?;
            if part.len() != 2 {
                return Err(ParseMacError(s.to_owned()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_owned()))?;
        }

        if parts.next().is_some() {
            return Err(ParseMacError(s.to_owned()));
        }

        Ok(Self(octets))
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Encode for MacAddr {
    fn encode<B>(&self, buf: B)
    where
        B: BufMut,
    {
        self.0.encode(buf);
    }
}

impl Decode for MacAddr {
    fn decode<B>(buf: B) -> Result<Self, Eof>
    where
        B: Buf,
    {
        <[u8; 6]>::decode(buf).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use super::MacAddr;

    #[test]
    fn parse_and_format() {
        let mac: MacAddr = "00:22:4d:aB:10:ff".parse().unwrap();
        assert_eq!(mac.octets(), [0x00, 0x22, 0x4d, 0xab, 0x10, 0xff]);
        assert_eq!(mac.to_string(), "00:22:4d:ab:10:ff");

        assert!("00:22:4d:ab:10".parse::<MacAddr>().is_err());
        assert!("00:22:4d:ab:10:ff:01".parse::<MacAddr>().is_err());
        assert!("zz:22:4d:ab:10:ff".parse::<MacAddr>().is_err());
    }

    #[test]
    fn link_local_round_trip() {
        let mac = MacAddr::from_octets([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
        let ll = mac.link_local();
        assert_eq!(ll, "fe80::5054:ff:fe12:3456".parse::<Ipv6Addr>().unwrap());
        assert_eq!(MacAddr::from_link_local(ll), Some(mac));
        assert_eq!(MacAddr::from_link_local("fe80::1".parse().unwrap()), None);
    }

    #[test]
    fn ipv6_multicast_mac() {
        let group: Ipv6Addr = "ff02::1:ff00:1".parse().unwrap();
        assert_eq!(
            MacAddr::ipv6_multicast(group).to_string(),
            "33:33:ff:00:00:01"
        );
    }
}
