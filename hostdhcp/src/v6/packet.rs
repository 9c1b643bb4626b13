//! DHCPv6 messages (RFC 8415 §8, §9).
//!
//! ```text
//! client/server:  msg-type(1) transaction-id(3) options...
//! relay:          msg-type(1) hop-count(1) link-address(16) peer-address(16) options...
//! option:         option-code(2) option-len(2) option-data...
//! ```

use std::fmt;
use std::net::Ipv6Addr;

use bytes::BufMut;

use crate::codec::{take, Decode, Encode};
use crate::error::{DecodeError, Layer};
use crate::mac::MacAddr;

pub const CLIENT_HEADER_LEN: usize = 4;
pub const RELAY_HEADER_LEN: usize = 34;

// https://datatracker.ietf.org/doc/html/rfc8415#section-7.6
pub const HOP_COUNT_LIMIT: u8 = 8;

// https://datatracker.ietf.org/doc/html/rfc8415#section-7.3
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Solicit,
    Advertise,
    Request,
    Confirm,
    Renew,
    Rebind,
    Reply,
    Release,
    Decline,
    Reconfigure,
    InformationRequest,
    RelayForw,
    RelayRepl,
}

impl MessageType {
    pub fn from_u8(typ: u8) -> Option<Self> {
        Some(match typ {
            1 => Self::Solicit,
            2 => Self::Advertise,
            3 => Self::Request,
            4 => Self::Confirm,
            5 => Self::Renew,
            6 => Self::Rebind,
            7 => Self::Reply,
            8 => Self::Release,
            9 => Self::Decline,
            10 => Self::Reconfigure,
            11 => Self::InformationRequest,
            12 => Self::RelayForw,
            13 => Self::RelayRepl,
            _ => return None,
        })
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Solicit => 1,
            Self::Advertise => 2,
            Self::Request => 3,
            Self::Confirm => 4,
            Self::Renew => 5,
            Self::Rebind => 6,
            Self::Reply => 7,
            Self::Release => 8,
            Self::Decline => 9,
            Self::Reconfigure => 10,
            Self::InformationRequest => 11,
            Self::RelayForw => 12,
            Self::RelayRepl => 13,
        }
    }

    pub fn is_relay(self) -> bool {
        matches!(self, Self::RelayForw | Self::RelayRepl)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OptionCode(pub u16);

impl OptionCode {
    pub const CLIENT_ID: Self = Self(1);
    pub const SERVER_ID: Self = Self(2);
    pub const IA_NA: Self = Self(3);
    pub const IAADDR: Self = Self(5);
    pub const ORO: Self = Self(6);
    pub const ELAPSED_TIME: Self = Self(8);
    pub const RELAY_MSG: Self = Self(9);
    pub const STATUS_CODE: Self = Self(13);
    pub const INTERFACE_ID: Self = Self(18);
    // https://datatracker.ietf.org/doc/html/rfc3646
    pub const DNS_SERVERS: Self = Self(23);
    pub const DOMAIN_LIST: Self = Self(24);
    // https://datatracker.ietf.org/doc/html/rfc4075
    pub const SNTP_SERVERS: Self = Self(31);
}

impl fmt::Debug for OptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OptionCode({})", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhcpOption {
    pub code: OptionCode,
    pub value: Vec<u8>,
}

/// Options in the order they appeared on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Options {
    options: Vec<DhcpOption>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, DecodeError> {
        let eof = Layer::Dhcpv6Option.eof();
        let mut options = Vec::new();

        while !buf.is_empty() {
            let code = u16::decode(&mut buf).map_err(&eof)?;
            let len = u16::decode(&mut buf).map_err(&eof)?;
            let value = take(&mut buf, usize::from(len)).map_err(&eof)?;

            options.push(DhcpOption {
                code: OptionCode(code),
                value: value.to_vec(),
            });
        }

        Ok(Self { options })
    }

    /// The first option with `code`.
    pub fn get(&self, code: OptionCode) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|option| option.code == code)
            .map(|option| option.value.as_slice())
    }

    pub fn push(&mut self, code: OptionCode, value: Vec<u8>) {
        self.options.push(DhcpOption { code, value });
    }

    /// Replaces the first option with `code`, or appends it.
    pub fn set(&mut self, code: OptionCode, value: Vec<u8>) {
        match self.options.iter_mut().find(|option| option.code == code) {
            Some(option) => option.value = value,
            None => self.push(code, value),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &DhcpOption> {
        self.options.iter()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

impl Encode for Options {
    fn encode<B>(&self, mut buf: B)
    where
        B: BufMut,
    {
        for option in &self.options {
            option.code.0.encode(&mut buf);
            (option.value.len() as u16).encode(&mut buf);
            buf.put_slice(&option.value);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientMessage {
    pub msg_type: MessageType,
    /// Only the low 24 bits are sent.
    pub transaction_id: u32,
    pub options: Options,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayMessage {
    pub msg_type: MessageType,
    pub hop_count: u8,
    pub link_addr: Ipv6Addr,
    pub peer_addr: Ipv6Addr,
    pub options: Options,
}

impl RelayMessage {
    /// The encapsulated message, undecoded.
    pub fn relay_message(&self) -> Option<&[u8]> {
        self.options.get(OptionCode::RELAY_MSG)
    }

    pub fn inner(&self) -> Result<Message, DecodeError> {
        let data = self
            .relay_message()
            .ok_or(DecodeError::Malformed(Layer::Dhcpv6, "missing relay message"))?;
        Message::decode(data)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Client(ClientMessage),
    Relay(RelayMessage),
}

impl Message {
    /// Decodes a message, picking the header layout from the type byte
    /// before anything else is read.
    pub fn decode(mut buf: &[u8]) -> Result<Self, DecodeError> {
        let eof = Layer::Dhcpv6.eof();

        let typ = u8::decode(&mut buf).map_err(&eof)?;
        let msg_type =
            MessageType::from_u8(typ).ok_or(DecodeError::Unsupported(Layer::Dhcpv6, typ.into()))?;

        if msg_type.is_relay() {
            let hop_count = u8::decode(&mut buf).map_err(&eof)?;
            let link_addr = Ipv6Addr::decode(&mut buf).map_err(&eof)?;
            let peer_addr = Ipv6Addr::decode(&mut buf).map_err(&eof)?;
            let options = Options::decode(buf)?;

            Ok(Self::Relay(RelayMessage {
                msg_type,
                hop_count,
                link_addr,
                peer_addr,
                options,
            }))
        } else {
            let tid = <[u8; 3]>::decode(&mut buf).map_err(&eof)?;
            let options = Options::decode(buf)?;

            Ok(Self::Client(ClientMessage {
                msg_type,
                transaction_id: u32::from_be_bytes([0, tid[0], tid[1], tid[2]]),
                options,
            }))
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    pub fn msg_type(&self) -> MessageType {
        match self {
            Self::Client(msg) => msg.msg_type,
            Self::Relay(msg) => msg.msg_type,
        }
    }

    pub fn options(&self) -> &Options {
        match self {
            Self::Client(msg) => &msg.options,
            Self::Relay(msg) => &msg.options,
        }
    }

    /// The client message at the bottom of any relay encapsulation.
    pub fn innermost(&self) -> Result<ClientMessage, DecodeError> {
        let mut current = self.clone();
        for _ in 0..=HOP_COUNT_LIMIT {
            match current {
                Self::Client(msg) => return Ok(msg),
                Self::Relay(relay) => current = relay.inner()?,
            }
        }

        Err(DecodeError::Malformed(Layer::Dhcpv6, "relay nesting"))
    }
}

impl Encode for Message {
    fn encode<B>(&self, mut buf: B)
    where
        B: BufMut,
    {
        match self {
            Self::Client(msg) => {
                msg.msg_type.to_u8().encode(&mut buf);
                let tid = msg.transaction_id.to_be_bytes();
                buf.put_slice(&tid[1..]);
                msg.options.encode(&mut buf);
            }
            Self::Relay(msg) => {
                msg.msg_type.to_u8().encode(&mut buf);
                msg.hop_count.encode(&mut buf);
                msg.link_addr.encode(&mut buf);
                msg.peer_addr.encode(&mut buf);
                msg.options.encode(&mut buf);
            }
        }
    }
}

// https://datatracker.ietf.org/doc/html/rfc8415#section-11
const DUID_LLT: u16 = 1;
const DUID_LL: u16 = 3;
const HARDWARE_TYPE_ETHERNET: u16 = 1;

/// A DUID-LL for `mac`.
pub fn duid_ll(mac: MacAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    DUID_LL.encode(&mut buf);
    HARDWARE_TYPE_ETHERNET.encode(&mut buf);
    mac.encode(&mut buf);
    buf
}

/// The Ethernet address inside a DUID-LLT or DUID-LL.
pub fn duid_mac(duid: &[u8]) -> Option<MacAddr> {
    let mut buf = duid;
    let typ = u16::decode(&mut buf).ok()?;
    let hardware = u16::decode(&mut buf).ok()?;
    if hardware != HARDWARE_TYPE_ETHERNET {
        return None;
    }

    match typ {
        DUID_LLT => MacAddr::from_slice(buf.get(4..)?),
        DUID_LL => MacAddr::from_slice(buf),
        _ => None,
    }
}

/// Best guess at the client's MAC: its DUID if link-layer based, else the
/// EUI-64 link-local address it sent from.
pub fn client_mac(msg: &ClientMessage, source: Ipv6Addr) -> Option<MacAddr> {
    msg.options
        .get(OptionCode::CLIENT_ID)
        .and_then(duid_mac)
        .or_else(|| MacAddr::from_link_local(source))
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use super::*;

    const MAC: MacAddr = MacAddr::from_octets([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);

    fn solicit() -> ClientMessage {
        let mut options = Options::new();
        options.push(OptionCode::CLIENT_ID, duid_ll(MAC));
        options.push(OptionCode::ELAPSED_TIME, vec![0, 0]);
        ClientMessage {
            msg_type: MessageType::Solicit,
            transaction_id: 0x00ab_cdef,
            options,
        }
    }

    #[test]
    fn client_header_layout() {
        let bytes = Message::Client(solicit()).to_bytes();
        assert_eq!(&bytes[..4], &[1, 0xab, 0xcd, 0xef]);
        // client id option header
        assert_eq!(&bytes[4..8], &[0, 1, 0, 10]);
        assert_eq!(Message::decode(&bytes), Ok(Message::Client(solicit())));
    }

    #[test]
    fn relay_header_is_not_read_as_options() {
        let inner = Message::Client(solicit()).to_bytes();
        let mut options = Options::new();
        options.push(OptionCode::RELAY_MSG, inner.clone());
        let relay = Message::Relay(RelayMessage {
            msg_type: MessageType::RelayForw,
            hop_count: 0,
            link_addr: "2001:db8::1".parse().unwrap(),
            peer_addr: "fe80::5054:ff:fe12:3456".parse().unwrap(),
            options,
        });

        let bytes = relay.to_bytes();
        assert_eq!(bytes.len(), RELAY_HEADER_LEN + 4 + inner.len());

        let Message::Relay(decoded) = Message::decode(&bytes).unwrap() else {
            panic!("expected relay message");
        };
        assert_eq!(decoded.link_addr, "2001:db8::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(decoded.relay_message(), Some(&inner[..]));
        assert_eq!(relay.innermost(), Ok(solicit()));
    }

    #[test]
    fn option_overrun_names_layer() {
        let mut bytes = Message::Client(solicit()).to_bytes();
        bytes.truncate(bytes.len() - 1);
        assert_eq!(
            Message::decode(&bytes),
            Err(DecodeError::Truncated(Layer::Dhcpv6Option))
        );
        assert_eq!(
            Message::decode(&[12, 0, 0]),
            Err(DecodeError::Truncated(Layer::Dhcpv6))
        );
        assert_eq!(
            Message::decode(&[200, 0, 0, 0]),
            Err(DecodeError::Unsupported(Layer::Dhcpv6, 200))
        );
    }

    #[test]
    fn mac_from_duid_or_link_local() {
        assert_eq!(duid_mac(&duid_ll(MAC)), Some(MAC));

        let mut llt = vec![0, 1, 0, 1, 0x2a, 0x2b, 0x2c, 0x2d];
        llt.extend_from_slice(&MAC.octets());
        assert_eq!(duid_mac(&llt), Some(MAC));
        // DUID-EN carries no MAC.
        assert_eq!(duid_mac(&[0, 2, 0, 0, 0, 9, 1, 2]), None);

        let mut msg = solicit();
        msg.options = Options::new();
        assert_eq!(client_mac(&msg, MAC.link_local()), Some(MAC));
        assert_eq!(client_mac(&msg, "2001:db8::5".parse().unwrap()), None);
    }

    #[test]
    fn set_replaces_first() {
        let mut options = Options::new();
        options.push(OptionCode::ORO, vec![0, 23]);
        options.set(OptionCode::ORO, vec![0, 24]);
        options.set(OptionCode::DNS_SERVERS, vec![]);
        assert_eq!(options.get(OptionCode::ORO), Some(&[0, 24][..]));
        assert_eq!(options.len(), 2);
    }
}
