use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

/// A DHCPv4 option code (RFC 2132).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OptionCode(pub u8);

impl OptionCode {
    pub const PAD: Self = Self(0);
    pub const SUBNET_MASK: Self = Self(1);
    pub const ROUTER: Self = Self(3);
    pub const DNS_SERVERS: Self = Self(6);
    pub const HOSTNAME: Self = Self(12);
    pub const DOMAIN_NAME: Self = Self(15);
    pub const INTERFACE_MTU: Self = Self(26);
    pub const BROADCAST_ADDR: Self = Self(28);
    pub const NTP_SERVERS: Self = Self(42);
    pub const REQUESTED_IP: Self = Self(50);
    pub const LEASE_TIME: Self = Self(51);
    pub const MESSAGE_TYPE: Self = Self(53);
    pub const SERVER_ID: Self = Self(54);
    pub const PARAMETER_REQUEST_LIST: Self = Self(55);
    pub const RENEWAL_TIME: Self = Self(58);
    pub const REBINDING_TIME: Self = Self(59);
    pub const VENDOR_CLASS_ID: Self = Self(60);
    pub const CLIENT_ID: Self = Self(61);
    pub const TFTP_SERVER_NAME: Self = Self(66);
    pub const BOOT_FILE_NAME: Self = Self(67);
    // https://datatracker.ietf.org/doc/html/rfc4578#section-2.1
    pub const CLIENT_ARCH: Self = Self(93);
    // https://datatracker.ietf.org/doc/html/rfc3442
    pub const CLASSLESS_ROUTE: Self = Self(121);
    pub const MS_CLASSLESS_ROUTE: Self = Self(249);
    pub const END: Self = Self(255);
}

impl fmt::Debug for OptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OptionCode({})", self.0)
    }
}

// https://datatracker.ietf.org/doc/html/rfc2132#section-9.6
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
}

impl MessageType {
    pub fn from_u8(typ: u8) -> Option<Self> {
        match typ {
            1 => Some(Self::Discover),
            2 => Some(Self::Offer),
            3 => Some(Self::Request),
            4 => Some(Self::Decline),
            5 => Some(Self::Ack),
            6 => Some(Self::Nak),
            7 => Some(Self::Release),
            8 => Some(Self::Inform),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Discover => 1,
            Self::Offer => 2,
            Self::Request => 3,
            Self::Decline => 4,
            Self::Ack => 5,
            Self::Nak => 6,
            Self::Release => 7,
            Self::Inform => 8,
        }
    }
}

/// Options of a parsed packet, keyed by code.
///
/// Cloning produces an independent copy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Options {
    map: HashMap<OptionCode, Vec<u8>>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, code: OptionCode) -> Option<&[u8]> {
        self.map.get(&code).map(Vec::as_slice)
    }

    pub fn contains(&self, code: OptionCode) -> bool {
        self.map.contains_key(&code)
    }

    pub fn insert(&mut self, code: OptionCode, value: Vec<u8>) -> Option<Vec<u8>> {
        self.map.insert(code, value)
    }

    pub fn remove(&mut self, code: OptionCode) -> Option<Vec<u8>> {
        self.map.remove(&code)
    }

    pub(crate) fn append(&mut self, code: OptionCode, value: &[u8]) {
        self.map.entry(code).or_default().extend_from_slice(value);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (OptionCode, &[u8])> {
        self.map.iter().map(|(code, value)| (*code, value.as_slice()))
    }

    pub fn message_type(&self) -> Option<MessageType> {
        match self.get(OptionCode::MESSAGE_TYPE)? {
            [typ] => MessageType::from_u8(*typ),
            _ => None,
        }
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.addr(OptionCode::REQUESTED_IP)
    }

    pub fn server_id(&self) -> Option<Ipv4Addr> {
        self.addr(OptionCode::SERVER_ID)
    }

    pub fn vendor_class(&self) -> Option<&str> {
        self.string(OptionCode::VENDOR_CLASS_ID)
    }

    pub fn hostname(&self) -> Option<&str> {
        self.string(OptionCode::HOSTNAME)
    }

    /// The first architecture type the client listed.
    pub fn client_arch(&self) -> Option<u16> {
        match self.get(OptionCode::CLIENT_ARCH)? {
            [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }

    pub fn parameter_request_list(&self) -> &[u8] {
        self.get(OptionCode::PARAMETER_REQUEST_LIST).unwrap_or_default()
    }

    fn addr(&self, code: OptionCode) -> Option<Ipv4Addr> {
        let octets: [u8; 4] = self.get(code)?.try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    fn string(&self, code: OptionCode) -> Option<&str> {
        std::str::from_utf8(self.get(code)?).ok()
    }
}

/// Packs addresses back to back, as list-valued options expect.
pub fn addr_list(addrs: &[Ipv4Addr]) -> Vec<u8> {
    addrs.iter().flat_map(|addr| addr.octets()).collect()
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::{addr_list, MessageType, OptionCode, Options};

    #[test]
    fn clone_is_isolated() {
        let mut options = Options::new();
        options.insert(OptionCode::HOSTNAME, b"guest".to_vec());

        let mut copy = options.clone();
        copy.insert(OptionCode::HOSTNAME, b"other".to_vec());
        copy.remove(OptionCode::HOSTNAME);
        copy.insert(OptionCode::DOMAIN_NAME, b"example.com".to_vec());

        assert_eq!(options.hostname(), Some("guest"));
        assert!(!options.contains(OptionCode::DOMAIN_NAME));
        assert_eq!(options.len(), 1);
    }

    #[test]
    fn typed_accessors() {
        let mut options = Options::new();
        options.insert(OptionCode::MESSAGE_TYPE, vec![3]);
        options.insert(OptionCode::REQUESTED_IP, vec![10, 0, 0, 5]);
        options.insert(OptionCode::VENDOR_CLASS_ID, b"MSFT 5.0".to_vec());
        options.insert(OptionCode::CLIENT_ARCH, vec![0, 7]);

        assert_eq!(options.message_type(), Some(MessageType::Request));
        assert_eq!(options.requested_ip(), Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(options.vendor_class(), Some("MSFT 5.0"));
        assert_eq!(options.client_arch(), Some(7));
        assert_eq!(options.parameter_request_list(), &[] as &[u8]);
    }

    #[test]
    fn malformed_values_read_as_absent() {
        let mut options = Options::new();
        options.insert(OptionCode::MESSAGE_TYPE, vec![1, 2]);
        options.insert(OptionCode::REQUESTED_IP, vec![10, 0]);
        assert_eq!(options.message_type(), None);
        assert_eq!(options.requested_ip(), None);
    }

    #[test]
    fn packs_addresses() {
        assert_eq!(
            addr_list(&[Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)]),
            [8, 8, 8, 8, 1, 1, 1, 1]
        );
    }
}
