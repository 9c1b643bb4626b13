//! Ethernet, IP and UDP framing for the raw and link-layer transports.
//!
//! Decoding is layered: every header is validated before the next one is
//! looked at, and a failure reports the [`Layer`] it happened in. Encoding
//! produces complete frames with lengths and checksums filled in.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use bytes::BufMut;

use crate::codec::{take, Decode, Encode};
use crate::error::{DecodeError, Layer};
use crate::mac::MacAddr;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const UDP_HEADER_LEN: usize = 8;

const DEFAULT_TTL: u8 = 64;

/// All-nodes link-local multicast group.
pub const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// The solicited-node multicast group for `addr` (RFC 4291 §2.7.1).
pub fn solicited_node(addr: Ipv6Addr) -> Ipv6Addr {
    let o = addr.octets();
    Ipv6Addr::from([
        0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0xff, o[13], o[14], o[15],
    ])
}

/// Internet checksum accumulator (RFC 1071).
///
/// Data may be fed in arbitrarily sized pieces; an odd trailing byte is
/// carried over into the next call.
#[derive(Clone, Copy, Debug, Default)]
pub struct Checksum {
    sum: u64,
    pending: Option<u8>,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mut data: &[u8]) {
        if let Some(hi) = self.pending.take() {
            match data.split_first() {
                Some((&lo, rest)) => {
                    self.sum += u64::from(u16::from_be_bytes([hi, lo]));
                    data = rest;
                }
                None => {
                    self.pending = Some(hi);
                    return;
                }
            }
        }

        let mut words = data.chunks_exact(2);
        for word in &mut words {
            self.sum += u64::from(u16::from_be_bytes([word[0], word[1]]));
        }

        if let [last] = words.remainder() {
            self.pending = Some(*last);
        }
    }

    pub fn add_ipv4_pseudo(&mut self, src: Ipv4Addr, dst: Ipv4Addr, proto: u8, len: u16) {
        self.add(&src.octets());
        self.add(&dst.octets());
        self.add(&[0, proto]);
        self.add(&len.to_be_bytes());
    }

    pub fn add_ipv6_pseudo(&mut self, src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, len: u32) {
        self.add(&src.octets());
        self.add(&dst.octets());
        self.add(&len.to_be_bytes());
        self.add(&[0, 0, 0, next_header]);
    }

    /// Folds the sum and returns its one's complement.
    pub fn finish(self) -> u16 {
        let mut sum = self.sum;
        if let Some(hi) = self.pending {
            sum += u64::from(hi) << 8;
        }

        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }

        !(sum as u16)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

impl EthernetHeader {
    pub fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let eof = Layer::Ethernet.eof();
        let dst = MacAddr::decode(&mut *buf).map_err(&eof)?;
        let src = MacAddr::decode(&mut *buf).map_err(&eof)?;
        let ethertype = u16::decode(&mut *buf).map_err(&eof)?;
        Ok(Self {
            dst,
            src,
            ethertype,
        })
    }

    pub fn encode<B: BufMut>(&self, mut buf: B) {
        self.dst.encode(&mut buf);
        self.src.encode(&mut buf);
        self.ethertype.encode(&mut buf);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ipv4Header {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
}

impl Ipv4Header {
    /// Decodes the header and returns it with the payload it covers.
    pub fn decode<'a>(buf: &mut &'a [u8]) -> Result<(Self, &'a [u8]), DecodeError> {
        let eof = Layer::Ipv4.eof();
        let packet = *buf;

        let version_ihl = u8::decode(&mut *buf).map_err(&eof)?;
        if version_ihl >> 4 != 4 {
            return Err(DecodeError::Malformed(Layer::Ipv4, "version"));
        }

        let header_len = usize::from(version_ihl & 0x0f) * 4;
        if header_len < IPV4_HEADER_LEN {
            return Err(DecodeError::Malformed(Layer::Ipv4, "header length"));
        }

        let _tos = u8::decode(&mut *buf).map_err(&eof)?;
        let total_len = usize::from(u16::decode(&mut *buf).map_err(&eof)?);
        let _id = u16::decode(&mut *buf).map_err(&eof)?;
        let frag = u16::decode(&mut *buf).map_err(&eof)?;
        let ttl = u8::decode(&mut *buf).map_err(&eof)?;
        let protocol = u8::decode(&mut *buf).map_err(&eof)?;
        let _checksum = u16::decode(&mut *buf).map_err(&eof)?;
        let src = Ipv4Addr::decode(&mut *buf).map_err(&eof)?;
        let dst = Ipv4Addr::decode(&mut *buf).map_err(&eof)?;

        if frag & 0x3fff != 0 {
            return Err(DecodeError::Malformed(Layer::Ipv4, "fragment"));
        }

        if total_len < header_len || packet.len() < total_len {
            return Err(DecodeError::Truncated(Layer::Ipv4));
        }

        let payload = &packet[header_len..total_len];
        *buf = &packet[total_len..];

        Ok((
            Self {
                src,
                dst,
                protocol,
                ttl,
            },
            payload,
        ))
    }

    pub fn encode<B: BufMut>(&self, payload_len: usize, mut buf: B) {
        let mut header = [0u8; IPV4_HEADER_LEN];
        {
            let mut w = &mut header[..];
            0x45u8.encode(&mut w);
            0u8.encode(&mut w);
            ((IPV4_HEADER_LEN + payload_len) as u16).encode(&mut w);
            0u16.encode(&mut w);
            0u16.encode(&mut w);
            self.ttl.encode(&mut w);
            self.protocol.encode(&mut w);
            0u16.encode(&mut w);
            self.src.encode(&mut w);
            self.dst.encode(&mut w);
        }

        let mut csum = Checksum::new();
        csum.add(&header);
        header[10..12].copy_from_slice(&csum.finish().to_be_bytes());

        buf.put_slice(&header);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ipv6Header {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub next_header: u8,
    pub hop_limit: u8,
}

impl Ipv6Header {
    /// Decodes the fixed header and returns it with its payload.
    ///
    /// Extension headers are not followed; `next_header` is whatever the
    /// fixed header names.
    pub fn decode<'a>(buf: &mut &'a [u8]) -> Result<(Self, &'a [u8]), DecodeError> {
        let eof = Layer::Ipv6.eof();

        let vtf = u32::decode(&mut *buf).map_err(&eof)?;
        if vtf >> 28 != 6 {
            return Err(DecodeError::Malformed(Layer::Ipv6, "version"));
        }

        let payload_len = usize::from(u16::decode(&mut *buf).map_err(&eof)?);
        let next_header = u8::decode(&mut *buf).map_err(&eof)?;
        let hop_limit = u8::decode(&mut *buf).map_err(&eof)?;
        let src = Ipv6Addr::decode(&mut *buf).map_err(&eof)?;
        let dst = Ipv6Addr::decode(&mut *buf).map_err(&eof)?;
        let payload = take(buf, payload_len).map_err(&eof)?;

        Ok((
            Self {
                src,
                dst,
                next_header,
                hop_limit,
            },
            payload,
        ))
    }

    pub fn encode<B: BufMut>(&self, payload_len: usize, mut buf: B) {
        0x6000_0000u32.encode(&mut buf);
        (payload_len as u16).encode(&mut buf);
        self.next_header.encode(&mut buf);
        self.hop_limit.encode(&mut buf);
        self.src.encode(&mut buf);
        self.dst.encode(&mut buf);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
}

impl UdpHeader {
    pub fn decode<'a>(buf: &mut &'a [u8]) -> Result<(Self, &'a [u8]), DecodeError> {
        let eof = Layer::Udp.eof();
        let datagram = *buf;

        let src_port = u16::decode(&mut *buf).map_err(&eof)?;
        let dst_port = u16::decode(&mut *buf).map_err(&eof)?;
        let len = usize::from(u16::decode(&mut *buf).map_err(&eof)?);
        let _checksum = u16::decode(&mut *buf).map_err(&eof)?;

        if len < UDP_HEADER_LEN {
            return Err(DecodeError::Malformed(Layer::Udp, "length"));
        }
        if datagram.len() < len {
            return Err(DecodeError::Truncated(Layer::Udp));
        }

        let payload = &datagram[UDP_HEADER_LEN..len];
        *buf = &datagram[len..];

        Ok((Self { src_port, dst_port }, payload))
    }
}

/// A UDP datagram (header + payload) with its checksum over the IPv4
/// pseudo header.
pub fn udp4_datagram(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let len = (UDP_HEADER_LEN + payload.len()) as u16;

    let mut csum = Checksum::new();
    csum.add_ipv4_pseudo(*src.ip(), *dst.ip(), IPPROTO_UDP, len);
    udp_datagram(src.port(), dst.port(), payload, csum)
}

/// A UDP datagram with its checksum over the IPv6 pseudo header.
pub fn udp6_datagram(src: SocketAddrV6, dst: SocketAddrV6, payload: &[u8]) -> Vec<u8> {
    let len = (UDP_HEADER_LEN + payload.len()) as u32;

    let mut csum = Checksum::new();
    csum.add_ipv6_pseudo(*src.ip(), *dst.ip(), IPPROTO_UDP, len);
    udp_datagram(src.port(), dst.port(), payload, csum)
}

fn udp_datagram(src_port: u16, dst_port: u16, payload: &[u8], mut csum: Checksum) -> Vec<u8> {
    let len = (UDP_HEADER_LEN + payload.len()) as u16;

    let mut buf = Vec::with_capacity(usize::from(len));
    src_port.encode(&mut buf);
    dst_port.encode(&mut buf);
    len.encode(&mut buf);
    0u16.encode(&mut buf);
    buf.put_slice(payload);

    csum.add(&buf);
    let mut sum = csum.finish();
    // Zero means "no checksum" on the wire.
    if sum == 0 {
        sum = 0xffff;
    }
    buf[6..8].copy_from_slice(&sum.to_be_bytes());
    buf
}

/// A complete Ethernet + IPv4 + UDP frame.
pub fn udp4_frame(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src: SocketAddrV4,
    dst: SocketAddrV4,
    payload: &[u8],
) -> Vec<u8> {
    let datagram = udp4_datagram(src, dst, payload);

    let mut frame =
        Vec::with_capacity(ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + datagram.len());
    EthernetHeader {
        dst: dst_mac,
        src: src_mac,
        ethertype: ETHERTYPE_IPV4,
    }
    .encode(&mut frame);
    Ipv4Header {
        src: *src.ip(),
        dst: *dst.ip(),
        protocol: IPPROTO_UDP,
        ttl: DEFAULT_TTL,
    }
    .encode(datagram.len(), &mut frame);
    frame.put_slice(&datagram);
    frame
}

/// A complete Ethernet + IPv6 + UDP frame.
pub fn udp6_frame(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src: SocketAddrV6,
    dst: SocketAddrV6,
    payload: &[u8],
) -> Vec<u8> {
    let datagram = udp6_datagram(src, dst, payload);
    ipv6_frame(
        src_mac,
        dst_mac,
        Ipv6Header {
            src: *src.ip(),
            dst: *dst.ip(),
            next_header: IPPROTO_UDP,
            hop_limit: DEFAULT_TTL,
        },
        &datagram,
    )
}

/// Wraps an already checksummed ICMPv6 message in Ethernet + IPv6.
///
/// Neighbor Discovery requires a hop limit of 255 (RFC 4861 §6.1.2).
pub fn icmpv6_frame(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    message: &[u8],
) -> Vec<u8> {
    ipv6_frame(
        src_mac,
        dst_mac,
        Ipv6Header {
            src,
            dst,
            next_header: IPPROTO_ICMPV6,
            hop_limit: 255,
        },
        message,
    )
}

fn ipv6_frame(src_mac: MacAddr, dst_mac: MacAddr, header: Ipv6Header, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETHERNET_HEADER_LEN + IPV6_HEADER_LEN + payload.len());
    EthernetHeader {
        dst: dst_mac,
        src: src_mac,
        ethertype: ETHERTYPE_IPV6,
    }
    .encode(&mut frame);
    header.encode(payload.len(), &mut frame);
    frame.put_slice(payload);
    frame
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpHeader {
    V4(Ipv4Header),
    V6(Ipv6Header),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport<'a> {
    Udp { header: UdpHeader, payload: &'a [u8] },
    Icmpv6(&'a [u8]),
    Other { protocol: u8 },
}

/// A fully decoded link-layer frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub eth: EthernetHeader,
    pub ip: IpHeader,
    pub transport: Transport<'a>,
}

impl<'a> Frame<'a> {
    pub fn decode(data: &'a [u8]) -> Result<Self, DecodeError> {
        let mut buf = data;
        let eth = EthernetHeader::decode(&mut buf)?;

        match eth.ethertype {
            ETHERTYPE_IPV4 => {
                let (ip, mut payload) = Ipv4Header::decode(&mut buf)?;
                let transport = transport(ip.protocol, &mut payload)?;
                Ok(Self {
                    eth,
                    ip: IpHeader::V4(ip),
                    transport,
                })
            }
            ETHERTYPE_IPV6 => {
                let (ip, mut payload) = Ipv6Header::decode(&mut buf)?;
                let transport = transport(ip.next_header, &mut payload)?;
                Ok(Self {
                    eth,
                    ip: IpHeader::V6(ip),
                    transport,
                })
            }
            other => Err(DecodeError::Unsupported(Layer::Ethernet, other)),
        }
    }

    /// The UDP payload along with its source and destination ports.
    pub fn udp(&self) -> Option<(UdpHeader, &'a [u8])> {
        match self.transport {
            Transport::Udp { header, payload } => Some((header, payload)),
            _ => None,
        }
    }
}

fn transport<'a>(protocol: u8, payload: &mut &'a [u8]) -> Result<Transport<'a>, DecodeError> {
    match protocol {
        IPPROTO_UDP => {
            let (header, payload) = UdpHeader::decode(payload)?;
            Ok(Transport::Udp { header, payload })
        }
        IPPROTO_ICMPV6 => Ok(Transport::Icmpv6(payload)),
        protocol => Ok(Transport::Other { protocol }),
    }
}
