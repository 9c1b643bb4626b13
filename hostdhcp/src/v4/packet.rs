//! DHCPv4 packet view.
//!
//! [`Packet`] owns its buffer and reads or writes fields at their fixed
//! BOOTP offsets. Setters write straight through to the buffer, so a reply
//! must always be built with [`Packet::new`] and never by mutating a
//! request.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{DecodeError, Layer};
use crate::mac::MacAddr;

use super::options::{MessageType, OptionCode, Options};
use super::{CLIENT_PORT, SERVER_PORT};

const OP: usize = 0;
const HTYPE: usize = 1;
const HLEN: usize = 2;
const HOPS: usize = 3;
const XID: usize = 4;
const SECS: usize = 8;
const FLAGS: usize = 10;
const CIADDR: usize = 12;
const YIADDR: usize = 16;
const SIADDR: usize = 20;
const GIADDR: usize = 24;
const CHADDR: usize = 28;
const SNAME: usize = 44;
const FILE: usize = 108;
const COOKIE: usize = 236;
const OPTIONS: usize = 240;

const CHADDR_LEN: usize = 16;
const SNAME_LEN: usize = 64;
const FILE_LEN: usize = 128;

/// Length of the fixed header including the magic cookie.
pub const HEADER_LEN: usize = OPTIONS;

/// Smallest packet some clients accept (RFC 1542 §2.1).
pub const MIN_PACKET_LEN: usize = 272;

pub const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const BROADCAST_FLAG: u16 = 0x8000;

const HTYPE_ETHERNET: u8 = 1;

// https://datatracker.ietf.org/doc/html/rfc2131#section-2
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    BootRequest,
    BootReply,
}

impl Op {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::BootRequest),
            0x02 => Some(Self::BootReply),
            _ => None,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::BootRequest => 0x01,
            Self::BootReply => 0x02,
        }
    }
}

/// How a reply has to be delivered (RFC 2131 §4.1).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxType {
    /// Limited broadcast to the client port.
    Broadcast,
    /// Unicast to the relay agent that forwarded the request.
    RelayAddr(Ipv4Addr),
    /// Unicast to the address the client already has.
    ClientAddr(Ipv4Addr),
    /// Unicast to the offered address, addressed by hardware address
    /// because the client cannot answer ARP yet.
    HardwareAddr { addr: Ipv4Addr, mac: MacAddr },
}

impl TxType {
    /// The IP destination and, for link-layer transports, the MAC to
    /// address the frame to.
    pub fn destination(&self) -> (SocketAddrV4, Option<MacAddr>) {
        match *self {
            Self::Broadcast => (
                SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT),
                Some(MacAddr::BROADCAST),
            ),
            Self::RelayAddr(addr) => (SocketAddrV4::new(addr, SERVER_PORT), None),
            Self::ClientAddr(addr) => (SocketAddrV4::new(addr, CLIENT_PORT), None),
            Self::HardwareAddr { addr, mac } => {
                (SocketAddrV4::new(addr, CLIENT_PORT), Some(mac))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    buf: Vec<u8>,
}

impl Packet {
    /// A zeroed packet with the magic cookie and an empty option area.
    pub fn new(op: Op) -> Self {
        let mut buf = vec![0; OPTIONS + 1];
        buf[OP] = op.to_u8();
        buf[HTYPE] = HTYPE_ETHERNET;
        buf[HLEN] = 6;
        buf[COOKIE..OPTIONS].copy_from_slice(&MAGIC_COOKIE);
        buf[OPTIONS] = OptionCode::END.0;
        Self { buf }
    }

    /// Wraps a received buffer.
    ///
    /// Only the fixed header is checked; the option area is parsed
    /// leniently by [`Packet::options`].
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::Truncated(Layer::Dhcpv4));
        }

        Ok(Self { buf })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn op(&self) -> Option<Op> {
        Op::from_u8(self.buf[OP])
    }

    pub fn htype(&self) -> u8 {
        self.buf[HTYPE]
    }

    pub fn set_htype(&mut self, htype: u8) {
        self.buf[HTYPE] = htype;
    }

    pub fn hlen(&self) -> u8 {
        self.buf[HLEN]
    }

    pub fn hops(&self) -> u8 {
        self.buf[HOPS]
    }

    pub fn set_hops(&mut self, hops: u8) {
        self.buf[HOPS] = hops;
    }

    pub fn xid(&self) -> u32 {
        self.read_u32(XID)
    }

    pub fn set_xid(&mut self, xid: u32) {
        self.buf[XID..XID + 4].copy_from_slice(&xid.to_be_bytes());
    }

    pub fn secs(&self) -> u16 {
        u16::from_be_bytes([self.buf[SECS], self.buf[SECS + 1]])
    }

    pub fn flags(&self) -> u16 {
        u16::from_be_bytes([self.buf[FLAGS], self.buf[FLAGS + 1]])
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.buf[FLAGS..FLAGS + 2].copy_from_slice(&flags.to_be_bytes());
    }

    pub fn broadcast(&self) -> bool {
        self.flags() & BROADCAST_FLAG != 0
    }

    pub fn set_broadcast(&mut self, broadcast: bool) {
        let flags = if broadcast {
            self.flags() | BROADCAST_FLAG
        } else {
            self.flags() & !BROADCAST_FLAG
        };
        self.set_flags(flags);
    }

    pub fn ciaddr(&self) -> Ipv4Addr {
        self.read_addr(CIADDR)
    }

    pub fn set_ciaddr(&mut self, addr: Ipv4Addr) {
        self.write_addr(CIADDR, addr);
    }

    pub fn yiaddr(&self) -> Ipv4Addr {
        self.read_addr(YIADDR)
    }

    pub fn set_yiaddr(&mut self, addr: Ipv4Addr) {
        self.write_addr(YIADDR, addr);
    }

    pub fn siaddr(&self) -> Ipv4Addr {
        self.read_addr(SIADDR)
    }

    pub fn set_siaddr(&mut self, addr: Ipv4Addr) {
        self.write_addr(SIADDR, addr);
    }

    pub fn giaddr(&self) -> Ipv4Addr {
        self.read_addr(GIADDR)
    }

    pub fn set_giaddr(&mut self, addr: Ipv4Addr) {
        self.write_addr(GIADDR, addr);
    }

    /// The client hardware address, `hlen` bytes long but never more
    /// than the 16 bytes the field holds.
    pub fn chaddr(&self) -> &[u8] {
        let len = usize::from(self.hlen()).min(CHADDR_LEN);
        &self.buf[CHADDR..CHADDR + len]
    }

    pub fn set_chaddr(&mut self, chaddr: &[u8]) {
        let len = chaddr.len().min(CHADDR_LEN);
        self.buf[CHADDR..CHADDR + CHADDR_LEN].fill(0);
        self.buf[CHADDR..CHADDR + len].copy_from_slice(&chaddr[..len]);
        self.buf[HLEN] = len as u8;
    }

    /// The client MAC, if the hardware address is Ethernet.
    pub fn client_mac(&self) -> Option<MacAddr> {
        if self.htype() != HTYPE_ETHERNET {
            return None;
        }

        MacAddr::from_slice(self.chaddr())
    }

    pub fn sname(&self) -> &[u8] {
        trim_nul(&self.buf[SNAME..SNAME + SNAME_LEN])
    }

    pub fn set_sname(&mut self, sname: &[u8]) {
        write_field(&mut self.buf[SNAME..SNAME + SNAME_LEN], sname);
    }

    pub fn file(&self) -> &[u8] {
        trim_nul(&self.buf[FILE..FILE + FILE_LEN])
    }

    pub fn set_file(&mut self, file: &[u8]) {
        write_field(&mut self.buf[FILE..FILE + FILE_LEN], file);
    }

    pub fn cookie(&self) -> [u8; 4] {
        [
            self.buf[COOKIE],
            self.buf[COOKIE + 1],
            self.buf[COOKIE + 2],
            self.buf[COOKIE + 3],
        ]
    }

    pub fn option_area(&self) -> &[u8] {
        &self.buf[OPTIONS..]
    }

    /// Parses the option area.
    ///
    /// Pad is skipped and End stops the scan. An option whose length runs
    /// past the buffer ends the scan too, keeping what was read so far.
    /// Repeated codes are concatenated (RFC 3396).
    pub fn options(&self) -> Options {
        let mut options = Options::new();
        let mut rest = self.option_area();

        loop {
            let Some((&code, tail)) = rest.split_first() else {
                break;
            };
            rest = tail;

            match OptionCode(code) {
                OptionCode::PAD => continue,
                OptionCode::END => break,
                code => {
                    let Some((&len, tail)) = rest.split_first() else {
                        break;
                    };
                    let len = usize::from(len);
                    if tail.len() < len {
                        break;
                    }

                    options.append(code, &tail[..len]);
                    rest = &tail[len..];
                }
            }
        }

        options
    }

    /// The message type option, if present and known.
    pub fn message_type(&self) -> Option<MessageType> {
        self.options().message_type()
    }

    /// Appends an option, keeping the area terminated by End.
    ///
    /// Values longer than 255 bytes are split into consecutive instances
    /// of the same code.
    pub fn add_option(&mut self, code: OptionCode, value: &[u8]) {
        self.strip_end();

        if value.is_empty() {
            self.buf.push(code.0);
            self.buf.push(0);
        }
        for chunk in value.chunks(usize::from(u8::MAX)) {
            self.buf.push(code.0);
            self.buf.push(chunk.len() as u8);
            self.buf.extend_from_slice(chunk);
        }

        self.buf.push(OptionCode::END.0);
    }

    /// Pads the packet with zeros up to [`MIN_PACKET_LEN`].
    pub fn pad_to_min_len(&mut self) {
        if self.buf.len() < MIN_PACKET_LEN {
            self.buf.resize(MIN_PACKET_LEN, OptionCode::PAD.0);
        }
    }

    /// Whether the client is a PXE firmware, which always sends its
    /// system architecture.
    pub fn is_pxe_request(&self) -> bool {
        self.options().contains(OptionCode::CLIENT_ARCH)
    }

    /// Decides how this reply reaches the client.
    pub fn tx_type(&self, msg_type: Option<MessageType>) -> TxType {
        let giaddr = self.giaddr();
        if !giaddr.is_unspecified() {
            return TxType::RelayAddr(giaddr);
        }

        if msg_type == Some(MessageType::Nak) {
            return TxType::Broadcast;
        }

        let ciaddr = self.ciaddr();
        if !ciaddr.is_unspecified() {
            return TxType::ClientAddr(ciaddr);
        }

        if self.broadcast() {
            return TxType::Broadcast;
        }

        match self.client_mac() {
            Some(mac) => TxType::HardwareAddr {
                addr: self.yiaddr(),
                mac,
            },
            None => TxType::Broadcast,
        }
    }

    // Cuts the buffer at the End marker, dropping any padding after it.
    fn strip_end(&mut self) {
        let mut offset = OPTIONS;
        while let Some(&code) = self.buf.get(offset) {
            match OptionCode(code) {
                OptionCode::END => break,
                OptionCode::PAD => offset += 1,
                _ => match self.buf.get(offset + 1) {
                    Some(&len) if offset + 2 + usize::from(len) <= self.buf.len() => {
                        offset += 2 + usize::from(len);
                    }
                    _ => {
                        offset = self.buf.len();
                        break;
                    }
                },
            }
        }

        self.buf.truncate(offset);
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_be_bytes([
            self.buf[offset],
            self.buf[offset + 1],
            self.buf[offset + 2],
            self.buf[offset + 3],
        ])
    }

    fn read_addr(&self, offset: usize) -> Ipv4Addr {
        Ipv4Addr::from(self.read_u32(offset))
    }

    fn write_addr(&mut self, offset: usize, addr: Ipv4Addr) {
        self.buf[offset..offset + 4].copy_from_slice(&addr.octets());
    }
}

fn trim_nul(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

fn write_field(field: &mut [u8], value: &[u8]) {
    field.fill(0);
    // Keep a terminating NUL.
    let len = value.len().min(field.len() - 1);
    field[..len].copy_from_slice(&value[..len]);
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::{Op, Packet, TxType, HEADER_LEN, MAGIC_COOKIE, MIN_PACKET_LEN};
    use crate::error::{DecodeError, Layer};
    use crate::mac::MacAddr;
    use crate::v4::options::{MessageType, OptionCode};

    const MAC: MacAddr = MacAddr::from_octets([0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc]);

    fn request() -> Packet {
        let mut packet = Packet::new(Op::BootRequest);
        packet.set_xid(0xdead_beef);
        packet.set_chaddr(&MAC.octets());
        packet.add_option(OptionCode::MESSAGE_TYPE, &[MessageType::Discover.to_u8()]);
        packet
    }

    #[test]
    fn short_buffer_is_truncated() {
        assert_eq!(
            Packet::from_bytes(vec![0; HEADER_LEN - 1]),
            Err(DecodeError::Truncated(Layer::Dhcpv4))
        );
        assert!(Packet::from_bytes(vec![0; HEADER_LEN]).is_ok());
    }

    #[test]
    fn fields_at_fixed_offsets() {
        let packet = request();
        let bytes = packet.as_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[4..8], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&bytes[28..34], &MAC.octets());
        assert_eq!(&bytes[236..240], &MAGIC_COOKIE);
        assert_eq!(packet.op(), Some(Op::BootRequest));
        assert_eq!(packet.client_mac(), Some(MAC));
        assert_eq!(packet.message_type(), Some(MessageType::Discover));
    }

    #[test]
    fn hlen_is_capped() {
        let mut bytes = request().into_bytes();
        bytes[2] = 200;
        let packet = Packet::from_bytes(bytes).unwrap();
        assert_eq!(packet.chaddr().len(), 16);
    }

    #[test]
    fn options_parse_is_lenient() {
        let mut packet = request();
        packet.add_option(OptionCode::HOSTNAME, b"guest");
        let mut bytes = packet.into_bytes();
        // Drop End and declare an overrunning option.
        bytes.pop();
        bytes.extend_from_slice(&[OptionCode::DOMAIN_NAME.0, 50, b'x']);

        let options = Packet::from_bytes(bytes).unwrap().options();
        assert_eq!(options.get(OptionCode::HOSTNAME), Some(&b"guest"[..]));
        assert_eq!(options.get(OptionCode::DOMAIN_NAME), None);
    }

    #[test]
    fn pad_is_skipped_and_end_stops() {
        let mut bytes = Packet::new(Op::BootRequest).into_bytes();
        bytes.pop();
        bytes.extend_from_slice(&[0, 0, 12, 2, b'v', b'm', 255, 15, 1, b'x']);

        let options = Packet::from_bytes(bytes).unwrap().options();
        assert_eq!(options.get(OptionCode::HOSTNAME), Some(&b"vm"[..]));
        assert!(!options.contains(OptionCode::DOMAIN_NAME));
    }

    #[test]
    fn add_option_after_padding() {
        let mut packet = request();
        packet.pad_to_min_len();
        assert_eq!(packet.as_bytes().len(), MIN_PACKET_LEN);

        packet.add_option(OptionCode::HOSTNAME, b"vm");
        let options = packet.options();
        assert_eq!(options.message_type(), Some(MessageType::Discover));
        assert_eq!(options.get(OptionCode::HOSTNAME), Some(&b"vm"[..]));
    }

    #[test]
    fn long_option_round_trips() {
        let mut packet = request();
        let value = vec![7u8; 300];
        packet.add_option(OptionCode::CLASSLESS_ROUTE, &value);
        assert_eq!(
            packet.options().get(OptionCode::CLASSLESS_ROUTE),
            Some(&value[..])
        );
    }

    #[test]
    fn pxe_request_needs_client_arch() {
        let mut packet = request();
        assert!(!packet.is_pxe_request());

        let mut inform = Packet::new(Op::BootRequest);
        inform.add_option(OptionCode::MESSAGE_TYPE, &[MessageType::Inform.to_u8()]);
        assert!(!inform.is_pxe_request());

        packet.add_option(OptionCode::CLIENT_ARCH, &[0, 7]);
        assert!(packet.is_pxe_request());
    }

    #[test]
    fn tx_type_table() {
        let yiaddr = Ipv4Addr::new(10, 0, 0, 5);
        let mut reply = Packet::new(Op::BootReply);
        reply.set_chaddr(&MAC.octets());
        reply.set_yiaddr(yiaddr);

        assert_eq!(
            reply.tx_type(Some(MessageType::Offer)),
            TxType::HardwareAddr { addr: yiaddr, mac: MAC }
        );

        reply.set_broadcast(true);
        assert_eq!(reply.tx_type(Some(MessageType::Offer)), TxType::Broadcast);

        reply.set_ciaddr(Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(
            reply.tx_type(Some(MessageType::Ack)),
            TxType::ClientAddr(Ipv4Addr::new(10, 0, 0, 9))
        );
        assert_eq!(reply.tx_type(Some(MessageType::Nak)), TxType::Broadcast);

        reply.set_giaddr(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(
            reply.tx_type(Some(MessageType::Nak)),
            TxType::RelayAddr(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert_eq!(
            TxType::RelayAddr(Ipv4Addr::new(10, 0, 0, 1)).destination(),
            (SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 67), None)
        );
    }

    #[test]
    fn broadcast_destination_uses_broadcast_mac() {
        assert_eq!(
            TxType::Broadcast.destination(),
            (
                SocketAddrV4::new(Ipv4Addr::BROADCAST, 68),
                Some(MacAddr::BROADCAST)
            )
        );
    }
}
