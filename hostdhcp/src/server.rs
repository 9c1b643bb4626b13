//! Receive loop shared by the DHCPv4 and DHCPv6 servers.
//!
//! A [`Server`] owns a connection and a [`Handler`]. Every datagram is
//! decoded and handled on its own task so a slow handler never holds up
//! the socket. There is no limit on tasks in flight.

use std::any::Any;
use std::backtrace::Backtrace;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;

use crate::conn::{Conn, Datagram};
use crate::error::Result;
use crate::mac::MacAddr;
use crate::{v4, v6};

/// A message type a [`Server`] can carry.
pub trait Wire: Sized + Send + 'static {
    fn decode(data: Vec<u8>) -> Result<Self>;

    fn encode(&self) -> Vec<u8>;

    /// The client's hardware address as far as this message tells,
    /// falling back to `link_mac` from the frame it arrived in.
    fn client_mac(&self, src: SocketAddr, link_mac: Option<MacAddr>) -> Option<MacAddr>;

    /// Where a reply goes when the request came from `src`.
    fn destination(&self, src: SocketAddr, link_mac: Option<MacAddr>) -> (SocketAddr, Option<MacAddr>);
}

impl Wire for v4::Packet {
    fn decode(data: Vec<u8>) -> Result<Self> {
        Ok(v4::Packet::from_bytes(data)?)
    }

    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn client_mac(&self, _src: SocketAddr, link_mac: Option<MacAddr>) -> Option<MacAddr> {
        v4::Packet::client_mac(self).or(link_mac)
    }

    fn destination(&self, _src: SocketAddr, link_mac: Option<MacAddr>) -> (SocketAddr, Option<MacAddr>) {
        let (addr, mac) = self.tx_type(self.message_type()).destination();
        (SocketAddr::V4(addr), mac.or(link_mac))
    }
}

impl Wire for v6::Message {
    fn decode(data: Vec<u8>) -> Result<Self> {
        Ok(v6::Message::decode(&data)?)
    }

    fn encode(&self) -> Vec<u8> {
        self.to_bytes()
    }

    fn client_mac(&self, src: SocketAddr, link_mac: Option<MacAddr>) -> Option<MacAddr> {
        match self {
            Self::Client(msg) => link_mac.or_else(|| match src.ip() {
                IpAddr::V6(ip) => v6::packet::client_mac(msg, ip),
                IpAddr::V4(_) => None,
            }),
            Self::Relay(relay) => {
                let inner = self.innermost().ok()?;
                v6::packet::client_mac(&inner, relay.peer_addr)
            }
        }
    }

    fn destination(&self, src: SocketAddr, link_mac: Option<MacAddr>) -> (SocketAddr, Option<MacAddr>) {
        (src, link_mac)
    }
}

/// A reply and any addresses beyond the default destination that should
/// get a copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply<M> {
    pub message: M,
    pub extra_destinations: Vec<SocketAddr>,
}

impl<M> Reply<M> {
    pub fn new(message: M) -> Self {
        Self {
            message,
            extra_destinations: Vec::new(),
        }
    }
}

pub trait Handler<M>: Send + Sync + 'static {
    /// Handles one message. `Ok(None)` means nothing is to be sent from
    /// this server, e.g. because the message was relayed.
    fn serve_dhcp(
        &self,
        msg: M,
        client_mac: Option<MacAddr>,
        src: SocketAddr,
    ) -> BoxFuture<'_, Result<Option<Reply<M>>>>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum State {
    Idle,
    Listening,
    Closed,
}

pub struct Server<M> {
    conn: Arc<dyn Conn>,
    handler: Arc<dyn Handler<M>>,
    state: watch::Sender<State>,
    /// Set by [`Server::close`]; a failed loop leaves it unset.
    closed: AtomicBool,
}

pub type DhcpServer = Server<v4::Packet>;
pub type Dhcp6Server = Server<v6::Message>;

impl<M> Server<M>
where
    M: Wire,
{
    pub fn new(conn: Arc<dyn Conn>, handler: Arc<dyn Handler<M>>) -> Self {
        let (state, _) = watch::channel(State::Idle);
        Self {
            conn,
            handler,
            state,
            closed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Follows state changes.
    pub fn watch_state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.conn.local_addr()
    }

    /// Stops the receive loop. Tasks already dispatched run to completion.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.send_replace(State::Closed);
    }

    /// Runs the receive loop until [`Server::close`] is called or a
    /// receive fails. A failed server can be served again, a closed one
    /// returns at once.
    pub async fn serve(&self) -> Result<()> {
        let mut state = self.state.subscribe();
        let started = self.state.send_if_modified(|state| {
            if self.closed.load(Ordering::SeqCst) {
                return false;
            }
            *state = State::Listening;
            true
        });
        if !started {
            tracing::debug!("{} is closed", self.conn.local_addr());
            return Ok(());
        }
        tracing::info!("listening on {}", self.conn.local_addr());

        loop {
            let res = tokio::select! {
                _ = state.changed() => {
                    if *state.borrow() == State::Closed {
                        tracing::info!("closed {}", self.conn.local_addr());
                        return Ok(());
                    }
                    continue;
                }
                res = self.conn.recv() => res,
            };

            match res {
                Ok(datagram) => self.dispatch(datagram),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::error!("receive on {} failed: {}", self.conn.local_addr(), err);
                    self.state.send_replace(State::Closed);
                    return Err(err.into());
                }
            }
        }
    }

    fn dispatch(&self, datagram: Datagram) {
        let conn = Arc::clone(&self.conn);
        let handler = Arc::clone(&self.handler);

        tokio::spawn(async move {
            let src = datagram.src;
            let res = AssertUnwindSafe(handle(conn, handler, datagram))
                .catch_unwind()
                .await;

            if let Err(panic) = res {
                tracing::error!(
                    "handler panicked on packet from {}: {}\n{}",
                    src,
                    panic_message(&panic),
                    Backtrace::force_capture()
                );
            }
        });
    }
}

async fn handle<M>(conn: Arc<dyn Conn>, handler: Arc<dyn Handler<M>>, datagram: Datagram)
where
    M: Wire,
{
    let Datagram { data, src, mac } = datagram;
    tracing::debug!("got {} bytes from {}", data.len(), src);

    let msg = match M::decode(data) {
        Ok(msg) => msg,
        Err(err) => {
            tracing::warn!("dropping packet from {}: {}", src, err);
            return;
        }
    };

    let client_mac = msg.client_mac(src, mac);
    let reply = match handler.serve_dhcp(msg, client_mac, src).await {
        Ok(Some(reply)) => reply,
        Ok(None) => return,
        Err(err) => {
            tracing::warn!("failed to handle packet from {}: {}", src, err);
            return;
        }
    };

    let (dst, dst_mac) = reply.message.destination(src, mac);
    let data = reply.message.encode();

    if let Err(err) = conn.send_to(&data, dst, dst_mac).await {
        tracing::warn!("failed to send reply to {}: {}", dst, err);
        return;
    }
    tracing::info!("sent reply to {}", dst);

    for dst in reply.extra_destinations {
        if let Err(err) = conn.send_to(&data, dst, None).await {
            tracing::warn!("failed to send reply to {}: {}", dst, err);
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}
