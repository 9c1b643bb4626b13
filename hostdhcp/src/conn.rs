//! Datagram transports.
//!
//! Three backends move DHCP payloads: [`UdpConn`] uses the kernel's UDP
//! stack, [`RawConn`] is a raw IPv4 socket that builds its own UDP header,
//! and [`LinkConn`] writes whole Ethernet frames so a reply can be
//! addressed to a MAC that has no IP address yet. [`LinkSocket`] is the
//! AF_PACKET socket underneath, also used directly for ICMPv6.

use std::future::Future;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::AsRawFd;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

use crate::bpf::Filter;
use crate::frame::{
    self, Frame, IpHeader, Ipv4Header, UdpHeader, ETHERTYPE_IPV4, ETHERTYPE_IPV6,
};
use crate::ioctl;
use crate::mac::MacAddr;

/// Large enough for any frame on a jumbo MTU link.
const RECV_BUF_LEN: usize = 9216;

/// A received datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub src: SocketAddr,
    /// Source MAC, for backends that see the link layer.
    pub mac: Option<MacAddr>,
}

pub trait Conn: Send + Sync {
    /// Waits for the next datagram addressed to this connection.
    fn recv(&self) -> BoxFuture<'_, io::Result<Datagram>>;

    /// Sends `data` to `dst`. `mac` selects the destination hardware
    /// address on link-layer backends and is ignored elsewhere.
    fn send_to<'a>(
        &'a self,
        data: &'a [u8],
        dst: SocketAddr,
        mac: Option<MacAddr>,
    ) -> BoxFuture<'a, io::Result<()>>;

    /// Bounds every following receive; `None` blocks indefinitely.
    fn set_read_deadline(&self, deadline: Option<Instant>);

    /// Bounds every following send; `None` blocks indefinitely.
    fn set_write_deadline(&self, deadline: Option<Instant>);

    fn local_addr(&self) -> SocketAddr;
}

#[derive(Copy, Clone, Debug, Default)]
struct Deadlines {
    read: Option<Instant>,
    write: Option<Instant>,
}

async fn with_deadline<T, F>(deadline: Option<Instant>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(deadline) => match timeout_at(deadline, fut).await {
            Ok(res) => res,
            Err(_) => Err(io::ErrorKind::TimedOut.into()),
        },
        None => fut.await,
    }
}

fn invalid_input(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.into())
}

/// A plain UDP socket.
#[derive(Debug)]
pub struct UdpConn {
    socket: UdpSocket,
    local_addr: SocketAddr,
    deadlines: Mutex<Deadlines>,
}

impl UdpConn {
    /// Binds `addr`, optionally pinned to `interface`. IPv6 sockets also
    /// join `group` on that interface.
    pub fn bind(
        addr: SocketAddr,
        interface: Option<&str>,
        group: Option<Ipv6Addr>,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if addr.is_ipv4() {
            socket.set_broadcast(true)?;
        } else {
            socket.set_only_v6(true)?;
        }
        if let Some(interface) = interface {
            socket.bind_device(Some(interface.as_bytes()))?;
        }
        socket.bind(&addr.into())?;

        if let Some(group) = group {
            let index = match interface {
                Some(interface) => ioctl::interface_index(interface)?,
                None => 0,
            };
            socket.join_multicast_v6(&group, index)?;
        }

        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            deadlines: Mutex::default(),
        })
    }

    /// Binds the wildcard address on `addr`'s port, so broadcasts and
    /// multicasts are received. Only `interface` pins the socket.
    pub fn listen(
        addr: SocketAddr,
        interface: Option<&str>,
        group: Option<Ipv6Addr>,
    ) -> io::Result<Self> {
        let wildcard = match addr {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, addr.port())),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, addr.port())),
        };
        Self::bind(wildcard, interface, group)
    }
}

impl Conn for UdpConn {
    fn recv(&self) -> BoxFuture<'_, io::Result<Datagram>> {
        let deadline = self.deadlines.lock().read;
        with_deadline(deadline, async move {
            let mut buf = vec![0; RECV_BUF_LEN];
            let (len, src) = self.socket.recv_from(&mut buf).await?;
            buf.truncate(len);
            Ok(Datagram {
                data: buf,
                src,
                mac: None,
            })
        })
        .boxed()
    }

    fn send_to<'a>(
        &'a self,
        data: &'a [u8],
        dst: SocketAddr,
        _mac: Option<MacAddr>,
    ) -> BoxFuture<'a, io::Result<()>> {
        let deadline = self.deadlines.lock().write;
        with_deadline(deadline, async move {
            self.socket.send_to(data, dst).await?;
            Ok(())
        })
        .boxed()
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.deadlines.lock().read = deadline;
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.deadlines.lock().write = deadline;
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn read_fd(fd: &AsyncFd<Socket>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = fd.readable().await?;
        match guard.try_io(|inner| (&*inner.get_ref()).read(buf)) {
            Ok(res) => return res,
            Err(_would_block) => continue,
        }
    }
}

async fn write_fd(fd: &AsyncFd<Socket>, data: &[u8], dst: Option<&SockAddr>) -> io::Result<()> {
    loop {
        let mut guard = fd.writable().await?;
        let res = guard.try_io(|inner| match dst {
            Some(dst) => inner.get_ref().send_to(data, dst),
            None => inner.get_ref().send(data),
        });
        match res {
            Ok(res) => return res.map(drop),
            Err(_would_block) => continue,
        }
    }
}

/// A raw IPv4 socket receiving UDP for one local address and port.
///
/// The kernel adds the IP header on send; the UDP header and its
/// checksum are built here.
#[derive(Debug)]
pub struct RawConn {
    fd: AsyncFd<Socket>,
    local_addr: SocketAddrV4,
    deadlines: Mutex<Deadlines>,
}

impl RawConn {
    pub fn bind(addr: SocketAddrV4, interface: Option<&str>) -> io::Result<Self> {
        if addr.ip().is_unspecified() {
            return Err(invalid_input("raw sockets need a concrete local address"));
        }

        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::UDP))?;
        socket.set_broadcast(true)?;
        if let Some(interface) = interface {
            socket.bind_device(Some(interface.as_bytes()))?;
        }
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(*addr.ip(), 0)).into())?;
        socket.set_nonblocking(true)?;

        Ok(Self {
            fd: AsyncFd::new(socket)?,
            local_addr: addr,
            deadlines: Mutex::default(),
        })
    }

    async fn recv_datagram(&self) -> io::Result<Datagram> {
        let mut buf = vec![0; RECV_BUF_LEN];
        loop {
            let len = read_fd(&self.fd, &mut buf).await?;
            let mut packet = &buf[..len];

            let payload = Ipv4Header::decode(&mut packet).and_then(|(ip, mut payload)| {
                let (udp, payload) = UdpHeader::decode(&mut payload)?;
                Ok((ip, udp, payload))
            });

            match payload {
                Ok((ip, udp, payload)) if udp.dst_port == self.local_addr.port() => {
                    return Ok(Datagram {
                        data: payload.to_vec(),
                        src: SocketAddr::V4(SocketAddrV4::new(ip.src, udp.src_port)),
                        mac: None,
                    });
                }
                Ok(_) => continue,
                Err(err) => {
                    tracing::debug!("dropping raw packet: {}", err);
                    continue;
                }
            }
        }
    }
}

impl Conn for RawConn {
    fn recv(&self) -> BoxFuture<'_, io::Result<Datagram>> {
        let deadline = self.deadlines.lock().read;
        with_deadline(deadline, self.recv_datagram()).boxed()
    }

    fn send_to<'a>(
        &'a self,
        data: &'a [u8],
        dst: SocketAddr,
        _mac: Option<MacAddr>,
    ) -> BoxFuture<'a, io::Result<()>> {
        let deadline = self.deadlines.lock().write;
        with_deadline(deadline, async move {
            let SocketAddr::V4(dst) = dst else {
                return Err(invalid_input("raw connection is IPv4 only"));
            };

            let datagram = frame::udp4_datagram(self.local_addr, dst, data);
            let target = SockAddr::from(SocketAddr::V4(SocketAddrV4::new(*dst.ip(), 0)));
            write_fd(&self.fd, &datagram, Some(&target)).await
        })
        .boxed()
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.deadlines.lock().read = deadline;
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.deadlines.lock().write = deadline;
    }

    fn local_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.local_addr)
    }
}

/// Whole-frame access to one interface.
pub trait FrameConn: Send + Sync {
    fn recv_frame(&self) -> BoxFuture<'_, io::Result<Vec<u8>>>;

    fn send_frame<'a>(&'a self, frame: &'a [u8]) -> BoxFuture<'a, io::Result<()>>;

    /// Hardware address of the interface.
    fn mac(&self) -> MacAddr;
}

/// An AF_PACKET socket bound to one interface and ethertype.
#[derive(Debug)]
pub struct LinkSocket {
    fd: AsyncFd<Socket>,
    mac: MacAddr,
    index: u32,
}

impl LinkSocket {
    // https://www.man7.org/linux/man-pages/man7/packet.7.html
    pub fn open(interface: &str, ethertype: u16, filter: &Filter) -> io::Result<Self> {
        let index = ioctl::interface_index(interface)?;
        let mac = ioctl::interface_mac(interface)?;

        let protocol = i32::from(ethertype.to_be());
        let socket = Socket::new(Domain::PACKET, Type::RAW, Some(Protocol::from(protocol)))?;
        filter.attach(&socket)?;

        let mut addr: libc::sockaddr_ll = unsafe { core::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = ethertype.to_be();
        addr.sll_ifindex = index as i32;

        let res = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                core::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if res == -1 {
            return Err(io::Error::last_os_error());
        }

        socket.set_nonblocking(true)?;
        tracing::debug!("opened link socket on {} ({}, index {})", interface, mac, index);

        Ok(Self {
            fd: AsyncFd::new(socket)?,
            mac,
            index,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub async fn recv(&self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0; RECV_BUF_LEN];
        loop {
            let len = read_fd(&self.fd, &mut buf).await?;
            // Outgoing frames are looped back to packet sockets.
            if is_own_frame(&buf[..len], self.mac) {
                continue;
            }

            buf.truncate(len);
            return Ok(buf);
        }
    }

    pub async fn send(&self, frame: &[u8]) -> io::Result<()> {
        write_fd(&self.fd, frame, None).await
    }
}

/// Whether `frame` was sent from `mac`.
fn is_own_frame(frame: &[u8], mac: MacAddr) -> bool {
    frame.len() >= 12 && frame[6..12] == mac.octets()
}

impl FrameConn for LinkSocket {
    fn recv_frame(&self) -> BoxFuture<'_, io::Result<Vec<u8>>> {
        self.recv().boxed()
    }

    fn send_frame<'a>(&'a self, frame: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        self.send(frame).boxed()
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }
}

/// UDP over a link-layer socket, building full Ethernet frames.
pub struct LinkConn {
    socket: Box<dyn FrameConn>,
    local_addr: SocketAddr,
    deadlines: Mutex<Deadlines>,
}

impl LinkConn {
    pub fn open(interface: &str, addr: SocketAddr) -> io::Result<Self> {
        if addr.ip().is_unspecified() {
            return Err(invalid_input("link connections need a concrete local address"));
        }

        let socket = match addr {
            SocketAddr::V4(_) => {
                LinkSocket::open(interface, ETHERTYPE_IPV4, &Filter::udp4_dst_port(addr.port()))?
            }
            SocketAddr::V6(_) => {
                LinkSocket::open(interface, ETHERTYPE_IPV6, &Filter::udp6_dst_port(addr.port()))?
            }
        };

        Ok(Self::with_socket(Box::new(socket), addr))
    }

    pub fn with_socket(socket: Box<dyn FrameConn>, local_addr: SocketAddr) -> Self {
        Self {
            socket,
            local_addr,
            deadlines: Mutex::default(),
        }
    }

    async fn recv_datagram(&self) -> io::Result<Datagram> {
        loop {
            let buf = self.socket.recv_frame().await?;
            let frame = match Frame::decode(&buf) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::debug!("dropping frame: {}", err);
                    continue;
                }
            };

            let Some((udp, payload)) = frame.udp() else {
                continue;
            };
            if udp.dst_port != self.local_addr.port() {
                continue;
            }

            let src = match frame.ip {
                IpHeader::V4(ip) => SocketAddr::V4(SocketAddrV4::new(ip.src, udp.src_port)),
                IpHeader::V6(ip) => SocketAddr::V6(SocketAddrV6::new(ip.src, udp.src_port, 0, 0)),
            };

            return Ok(Datagram {
                data: payload.to_vec(),
                src,
                mac: Some(frame.eth.src),
            });
        }
    }

    fn build_frame(&self, data: &[u8], dst: SocketAddr, mac: Option<MacAddr>) -> io::Result<Vec<u8>> {
        let src_mac = self.socket.mac();
        let dst_mac = mac.unwrap_or_else(|| resolve_mac(dst.ip()));

        match (self.local_addr, dst) {
            (SocketAddr::V4(src), SocketAddr::V4(dst)) => {
                Ok(frame::udp4_frame(src_mac, dst_mac, src, dst, data))
            }
            (SocketAddr::V6(src), SocketAddr::V6(dst)) => {
                Ok(frame::udp6_frame(src_mac, dst_mac, src, dst, data))
            }
            _ => Err(invalid_input(format!(
                "cannot send to {} from {}",
                dst, self.local_addr
            ))),
        }
    }
}

/// The MAC a destination maps to without neighbor resolution. Unicast
/// destinations we cannot map are sent to the broadcast MAC.
fn resolve_mac(addr: IpAddr) -> MacAddr {
    match addr {
        IpAddr::V6(addr) if addr.is_multicast() => MacAddr::ipv6_multicast(addr),
        IpAddr::V6(addr) => MacAddr::from_link_local(addr).unwrap_or(MacAddr::BROADCAST),
        IpAddr::V4(_) => MacAddr::BROADCAST,
    }
}

impl Conn for LinkConn {
    fn recv(&self) -> BoxFuture<'_, io::Result<Datagram>> {
        let deadline = self.deadlines.lock().read;
        with_deadline(deadline, self.recv_datagram()).boxed()
    }

    fn send_to<'a>(
        &'a self,
        data: &'a [u8],
        dst: SocketAddr,
        mac: Option<MacAddr>,
    ) -> BoxFuture<'a, io::Result<()>> {
        let deadline = self.deadlines.lock().write;
        with_deadline(deadline, async move {
            let frame = self.build_frame(data, dst, mac)?;
            self.socket.send_frame(&frame).await
        })
        .boxed()
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.deadlines.lock().read = deadline;
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.deadlines.lock().write = deadline;
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
