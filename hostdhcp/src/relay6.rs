//! DHCPv6 relay agent (RFC 8415 §19).
//!
//! Client messages are wrapped in a RELAY-FORW; a RELAY-FORW from a relay
//! further down has its hop count bumped and its addresses replaced by
//! ours. Sessions are keyed by transaction id and client identifier, since
//! transaction ids alone collide across clients.
//!
//! On the way back an edge relay (session hop count 1) strips the
//! RELAY-REPL and delivers the bare message, while an intermediate relay
//! restores the addresses it replaced and passes the RELAY-REPL down.

use std::collections::HashMap;
use std::fmt::Write;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::mac::MacAddr;
use crate::server::{Handler, Reply};
use crate::v6::packet::{HOP_COUNT_LIMIT, RelayMessage};
use crate::v6::{ClientMessage, Message, MessageType, OptionCode, Options};

pub use crate::relay::DEFAULT_TTL;

#[derive(Copy, Clone, Debug)]
struct Session {
    peer: SocketAddr,
    peer_mac: Option<MacAddr>,
    hop_count: u8,
    /// Addresses of the RELAY-FORW we rewrote, restored on the way back.
    link_addr: Ipv6Addr,
    peer_addr: Ipv6Addr,
    inserted: Instant,
}

pub struct Dhcp6Relay {
    guest_conn: Arc<dyn Conn>,
    upstream_conn: Arc<dyn Conn>,
    relay_addr: Ipv6Addr,
    server: SocketAddr,
    ttl: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl Dhcp6Relay {
    pub fn new(
        guest_conn: Arc<dyn Conn>,
        upstream_conn: Arc<dyn Conn>,
        relay_addr: Ipv6Addr,
        server: SocketAddr,
    ) -> Self {
        Self {
            guest_conn,
            upstream_conn,
            relay_addr,
            server,
            ttl: DEFAULT_TTL,
            sessions: Mutex::default(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn upstream_conn(&self) -> Arc<dyn Conn> {
        Arc::clone(&self.upstream_conn)
    }

    pub fn pending(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Forwards `msg`, received from `src`, upstream.
    pub async fn relay(&self, msg: Message, peer_mac: Option<MacAddr>, src: SocketAddr) -> Result<()> {
        let peer_ip = match src.ip() {
            IpAddr::V6(ip) if ip == self.relay_addr => {
                tracing::debug!("ignoring our own relayed message");
                return Ok(());
            }
            IpAddr::V6(ip) => ip,
            IpAddr::V4(ip) => {
                return Err(Error::InvalidFormat(format!("DHCPv6 message from {}", ip)));
            }
        };

        let key = session_key(&msg.innermost()?);

        let (forward, saved) = match msg {
            Message::Relay(relay) if relay.msg_type == MessageType::RelayRepl => {
                return Err(Error::InvalidFormat(format!(
                    "refusing to relay a RELAY-REPL from {}",
                    src
                )));
            }
            Message::Relay(mut relay) => {
                if relay.hop_count >= HOP_COUNT_LIMIT {
                    return Err(Error::InvalidFormat(format!(
                        "hop count {} from {} exceeds limit",
                        relay.hop_count, src
                    )));
                }

                let saved = (relay.link_addr, relay.peer_addr);
                relay.hop_count += 1;
                relay.link_addr = self.relay_addr;
                relay.peer_addr = peer_ip;
                (relay, saved)
            }
            Message::Client(client) => {
                let mut options = Options::new();
                options.push(OptionCode::RELAY_MSG, Message::Client(client).to_bytes());
                let relay = RelayMessage {
                    msg_type: MessageType::RelayForw,
                    hop_count: 1,
                    link_addr: self.relay_addr,
                    peer_addr: peer_ip,
                    options,
                };
                (relay, (Ipv6Addr::UNSPECIFIED, Ipv6Addr::UNSPECIFIED))
            }
        };

        let now = Instant::now();
        {
            let mut sessions = self.sessions.lock();
            sessions.retain(|_, session| now.duration_since(session.inserted) < self.ttl);
            sessions.insert(
                key,
                Session {
                    peer: src,
                    peer_mac,
                    hop_count: forward.hop_count,
                    link_addr: saved.0,
                    peer_addr: saved.1,
                    inserted: now,
                },
            );
        }

        let hop_count = forward.hop_count;
        self.upstream_conn
            .send_to(&Message::Relay(forward).to_bytes(), self.server, None)
            .await?;
        tracing::info!("relayed message from {} to {} (hop {})", src, self.server, hop_count);
        Ok(())
    }

    async fn deliver(&self, msg: Message, src: SocketAddr) -> Result<()> {
        let key = session_key(&msg.innermost()?);

        let mut reply = match msg {
            Message::Relay(relay) if relay.msg_type == MessageType::RelayRepl => relay,
            other => {
                return Err(Error::InvalidFormat(format!(
                    "expected RELAY-REPL from {}, got {:?}",
                    src,
                    other.msg_type()
                )));
            }
        };

        let session = self.sessions.lock().remove(&key);
        let Some(session) = session else {
            tracing::debug!("dropping reply from {}: unknown session", src);
            return Ok(());
        };

        let data = if session.hop_count > 1 {
            reply.hop_count = session.hop_count - 1;
            reply.link_addr = session.link_addr;
            reply.peer_addr = session.peer_addr;
            Message::Relay(reply).to_bytes()
        } else {
            reply
                .relay_message()
                .ok_or_else(|| Error::InvalidFormat("RELAY-REPL without relay message".into()))?
                .to_vec()
        };

        self.guest_conn
            .send_to(&data, session.peer, session.peer_mac)
            .await?;
        tracing::info!("delivered relayed reply to {}", session.peer);
        Ok(())
    }
}

impl Handler<Message> for Dhcp6Relay {
    fn serve_dhcp(
        &self,
        msg: Message,
        _client_mac: Option<MacAddr>,
        src: SocketAddr,
    ) -> BoxFuture<'_, Result<Option<Reply<Message>>>> {
        async move {
            self.deliver(msg, src).await?;
            Ok(None)
        }
        .boxed()
    }
}

fn session_key(msg: &ClientMessage) -> String {
    let client_id = msg.options.get(OptionCode::CLIENT_ID).unwrap_or_default();

    let mut key = String::with_capacity(6 + client_id.len() * 2);
    let _ = write!(key, "{:06x}", msg.transaction_id & 0x00ff_ffff);
    for byte in client_id {
        let _ = write!(key, "{:02x}", byte);
    }
    key
}
