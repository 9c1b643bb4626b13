//! DHCPv4 relay agent.
//!
//! Requests nobody local can answer are forwarded to an upstream server
//! with `giaddr` set to our address. The client's MAC and UDP port are
//! remembered by transaction id so the server's reply can be handed back
//! on the guest-facing connection.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::conn::Conn;
use crate::error::Result;
use crate::mac::MacAddr;
use crate::server::{Handler, Reply};
use crate::v4::{Op, Packet};

/// How long a forwarded request waits for its reply.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

#[derive(Copy, Clone, Debug)]
struct Session {
    mac: MacAddr,
    port: u16,
    inserted: Instant,
}

pub struct DhcpRelay {
    guest_conn: Arc<dyn Conn>,
    upstream_conn: Arc<dyn Conn>,
    relay_addr: Ipv4Addr,
    server: SocketAddr,
    ttl: Duration,
    sessions: Mutex<HashMap<u32, Session>>,
}

impl DhcpRelay {
    /// `relay_addr` goes into `giaddr`; `server` is the upstream DHCP
    /// server.
    pub fn new(
        guest_conn: Arc<dyn Conn>,
        upstream_conn: Arc<dyn Conn>,
        relay_addr: Ipv4Addr,
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

    /// The connection upstream replies arrive on.
    pub fn upstream_conn(&self) -> Arc<dyn Conn> {
        Arc::clone(&self.upstream_conn)
    }

    /// Transactions waiting for a reply.
    pub fn pending(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Forwards a client request upstream.
    pub async fn relay(&self, mut packet: Packet, mac: MacAddr, src: SocketAddr) -> Result<()> {
        let xid = packet.xid();
        let now = Instant::now();

        {
            let mut sessions = self.sessions.lock();
            // Sweeping here is enough; every new request triggers one.
            sessions.retain(|_, session| now.duration_since(session.inserted) < self.ttl);
            sessions.insert(
                xid,
                Session {
                    mac,
                    port: src.port(),
                    inserted: now,
                },
            );
        }

        packet.set_giaddr(self.relay_addr);
        packet.set_hops(packet.hops().saturating_add(1));

        self.upstream_conn
            .send_to(packet.as_bytes(), self.server, None)
            .await?;
        tracing::info!("relayed {:#010x} from {} to {}", xid, mac, self.server);
        Ok(())
    }

    /// Hands an upstream reply back to the client that asked for it.
    async fn deliver(&self, packet: Packet, src: SocketAddr) -> Result<()> {
        if packet.op() != Some(Op::BootReply) {
            tracing::debug!("ignoring non-reply from upstream {}", src);
            return Ok(());
        }

        let xid = packet.xid();
        let session = self.sessions.lock().remove(&xid);
        let Some(session) = session else {
            tracing::debug!("dropping reply {:#010x} from {}: unknown transaction", xid, src);
            return Ok(());
        };

        let dst = SocketAddr::from((Ipv4Addr::BROADCAST, session.port));
        self.guest_conn
            .send_to(packet.as_bytes(), dst, Some(session.mac))
            .await?;
        tracing::info!("delivered relayed reply {:#010x} to {}", xid, session.mac);
        Ok(())
    }
}

/// Serves the upstream connection.
impl Handler<Packet> for DhcpRelay {
    fn serve_dhcp(
        &self,
        packet: Packet,
        _client_mac: Option<MacAddr>,
        src: SocketAddr,
    ) -> BoxFuture<'_, Result<Option<Reply<Packet>>>> {
        async move {
            self.deliver(packet, src).await?;
            Ok(None)
        }
        .boxed()
    }
}
