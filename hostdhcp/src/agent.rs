//! Wires servers, relays and the RA engine together from a [`Config`].

use std::future::Future;
use std::io;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::bpf::Filter;
use crate::config::{Backend, Config};
use crate::conn::{Conn, LinkConn, LinkSocket, RawConn, UdpConn};
use crate::error::Result;
use crate::frame::ETHERTYPE_IPV6;
use crate::guest::{Dhcp6Handler, DhcpHandler, GuestDescGetter, GuestResponder};
use crate::ioctl;
use crate::mac::MacAddr;
use crate::ra::RaEngine;
use crate::relay::DhcpRelay;
use crate::relay6::Dhcp6Relay;
use crate::response::ResponseConfig;
use crate::server::{Dhcp6Server, DhcpServer, Server, Wire};
use crate::v6::ALL_DHCP_RELAY_AGENTS_AND_SERVERS;

/// Pause before serving again after a receive loop failed.
const RESTART_DELAY: Duration = Duration::from_secs(1);

pub struct DhcpAgent {
    servers: Vec<Arc<DhcpServer>>,
    servers6: Vec<Arc<Dhcp6Server>>,
    ra: Option<Arc<RaEngine>>,
    shutdown: watch::Sender<bool>,
}

impl DhcpAgent {
    /// An agent running nothing yet.
    pub fn empty() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            servers: Vec::new(),
            servers6: Vec::new(),
            ra: None,
            shutdown,
        }
    }

    /// Opens every socket `config` asks for.
    pub fn new(config: &Config, getter: Arc<dyn GuestDescGetter>) -> Result<Self> {
        let interface = config.interface.as_str();
        let interface_mac = ioctl::interface_mac(interface)?;
        let responder = Arc::new(GuestResponder::new(
            getter,
            config.bridge(),
            base_response(config, interface_mac),
        ));

        let mut agent = Self::empty();

        if let Some(dhcp) = &config.dhcp {
            let conn = open_listener(dhcp.backend, interface, dhcp.listen_addr(), None)?;

            let relay = match &dhcp.relay {
                Some(relay) => {
                    let upstream = open_conn(relay.backend, interface, relay.local_socket_addr(), None)?;
                    let relay = Arc::new(
                        DhcpRelay::new(Arc::clone(&conn), upstream, relay.local_addr, relay.server_addr())
                            .with_ttl(relay.ttl()),
                    );
                    agent.add_server(DhcpServer::new(relay.upstream_conn(), Arc::<DhcpRelay>::clone(&relay)));
                    Some(relay)
                }
                None => None,
            };

            let handler = Arc::new(DhcpHandler::new(Arc::clone(&responder), relay));
            agent.add_server(DhcpServer::new(conn, handler));
        }

        if let Some(dhcp6) = &config.dhcp6 {
            let conn = open_listener(
                dhcp6.backend,
                interface,
                dhcp6.listen_addr(),
                Some(ALL_DHCP_RELAY_AGENTS_AND_SERVERS),
            )?;

            let relay = match &dhcp6.relay {
                Some(relay) => {
                    let upstream = open_conn(Backend::Udp, interface, relay.local_socket_addr(), None)?;
                    let relay = Arc::new(
                        Dhcp6Relay::new(Arc::clone(&conn), upstream, relay.local_addr, relay.server_addr())
                            .with_ttl(relay.ttl()),
                    );
                    agent.add_server6(Dhcp6Server::new(relay.upstream_conn(), Arc::<Dhcp6Relay>::clone(&relay)));
                    Some(relay)
                }
                None => None,
            };

            let handler = Arc::new(Dhcp6Handler::new(Arc::clone(&responder), relay));
            agent.add_server6(Dhcp6Server::new(conn, handler));
        }

        if config.ra.enabled {
            let frames = LinkSocket::open(interface, ETHERTYPE_IPV6, &Filter::icmpv6())?;
            agent.set_ra(RaEngine::new(Arc::new(frames), responder, config.ra.clone()));
        }

        Ok(agent)
    }

    pub fn add_server(&mut self, server: DhcpServer) {
        self.servers.push(Arc::new(server));
    }

    pub fn add_server6(&mut self, server: Dhcp6Server) {
        self.servers6.push(Arc::new(server));
    }

    pub fn set_ra(&mut self, engine: RaEngine) {
        self.ra = Some(Arc::new(engine));
    }

    /// Stops everything started by [`DhcpAgent::run_until`].
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    /// Runs until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        let ctrl_c = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to wait for Ctrl-C: {}", err);
            }
        };
        self.run_until(ctrl_c).await
    }

    /// Runs every server and the RA engine until `signal` completes or
    /// [`DhcpAgent::close`] is called. A server whose receive loop fails
    /// is restarted.
    pub async fn run_until<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut tasks = JoinSet::new();
        for server in &self.servers {
            tasks.spawn(supervise(Arc::clone(server), self.shutdown.subscribe()));
        }
        for server in &self.servers6 {
            tasks.spawn(supervise(Arc::clone(server), self.shutdown.subscribe()));
        }
        if let Some(ra) = &self.ra {
            tasks.spawn(run_ra(Arc::clone(ra), self.shutdown.subscribe()));
        }

        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = signal => {}
            _ = shutdown.changed() => {}
        }

        tracing::info!("shutting down");
        self.close();
        while let Some(res) = tasks.join_next().await {
            if let Err(err) = res {
                tracing::error!("task failed: {}", err);
            }
        }
        Ok(())
    }
}

async fn supervise<M>(server: Arc<Server<M>>, mut shutdown: watch::Receiver<bool>)
where
    M: Wire,
{
    loop {
        if *shutdown.borrow_and_update() {
            server.close();
            return;
        }

        tokio::select! {
            res = server.serve() => match res {
                Ok(()) => return,
                Err(err) => {
                    tracing::error!(
                        "server on {} failed, restarting in {:?}: {}",
                        server.local_addr(),
                        RESTART_DELAY,
                        err
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(RESTART_DELAY) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            },
            _ = shutdown.changed() => {}
        }
    }
}

async fn run_ra(engine: Arc<RaEngine>, mut shutdown: watch::Receiver<bool>) {
    let run = Arc::clone(&engine).run();
    tokio::pin!(run);

    let res = tokio::select! {
        res = &mut run => res,
        _ = shutdown.changed() => {
            engine.close();
            run.await
        }
    };

    if let Err(err) = res {
        tracing::error!("router advertisements stopped: {}", err);
    }
}

/// Opens a guest-facing connection. UDP listeners bind the wildcard
/// address; `addr` still names the server.
fn open_listener(
    backend: Backend,
    interface: &str,
    addr: SocketAddr,
    group: Option<Ipv6Addr>,
) -> io::Result<Arc<dyn Conn>> {
    match backend {
        Backend::Udp => {
            let conn = UdpConn::listen(addr, Some(interface), group)?;
            tracing::debug!("listening on {} for {} ({})", conn.local_addr(), addr, interface);
            Ok(Arc::new(conn))
        }
        Backend::Raw | Backend::Link => open_conn(backend, interface, addr, group),
    }
}

fn open_conn(
    backend: Backend,
    interface: &str,
    addr: SocketAddr,
    group: Option<Ipv6Addr>,
) -> io::Result<Arc<dyn Conn>> {
    let conn: Arc<dyn Conn> = match (backend, addr) {
        (Backend::Udp, _) => Arc::new(UdpConn::bind(addr, Some(interface), group)?),
        (Backend::Raw, SocketAddr::V4(addr)) => Arc::new(RawConn::bind(addr, Some(interface))?),
        (Backend::Raw, SocketAddr::V6(_)) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "raw connections are IPv4 only",
            ));
        }
        (Backend::Link, _) => Arc::new(LinkConn::open(interface, addr)?),
    };

    tracing::debug!("opened {:?} connection on {} ({})", backend, addr, interface);
    Ok(conn)
}

/// Server-wide defaults every answer starts from.
pub fn base_response(config: &Config, interface_mac: MacAddr) -> ResponseConfig {
    let mut base = ResponseConfig {
        interface_mac,
        boot_server: config.pxe.boot_server,
        boot_file: config.pxe.boot_file.clone(),
        ..Default::default()
    };

    if let Some(dhcp) = &config.dhcp {
        base.server_ip = dhcp.server_ip();
        base.lease_time = Duration::from_secs(dhcp.lease_time);
        base.renewal_time = dhcp.renewal_time.map(Duration::from_secs);
        base.rebinding_time = dhcp.rebinding_time.map(Duration::from_secs);
        base.dns_servers = dhcp.dns.clone();
        base.ntp_servers = dhcp.ntp.clone();
        base.domain = dhcp.domain.clone();
        base.mtu = dhcp.mtu;
    }
    if let Some(dhcp6) = &config.dhcp6 {
        base.dns_servers6 = dhcp6.dns.clone();
        base.ntp_servers6 = dhcp6.ntp.clone();
    }

    base
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::{base_response, DhcpAgent};
    use crate::config::Config;
    use crate::conn::mock::MemoryConn;
    use crate::conn::Datagram;
    use crate::guest::{DhcpHandler, GuestResponder, StaticGuestTable};
    use crate::mac::MacAddr;
    use crate::response::ResponseConfig;
    use crate::server::{DhcpServer, State};
    use crate::v4::{MessageType, Op, OptionCode, Packet};

    const HOST: MacAddr = MacAddr::from_octets([0x02, 0, 0, 0, 0, 0xfe]);

    #[test]
    fn defaults_come_from_config() {
        let config = Config::from_toml(
            r#"
interface = "br0"
[dhcp]
listen = "10.0.0.254"
lease_time = 600
renewal_time = 300
dns = ["10.0.0.53"]
[pxe]
boot_file = "ipxe.efi"
"#,
        )
        .unwrap();

        let base = base_response(&config, HOST);
        assert_eq!(base.interface_mac, HOST);
        assert_eq!(base.server_ip, Ipv4Addr::new(10, 0, 0, 254));
        assert_eq!(base.lease_time, Duration::from_secs(600));
        assert_eq!(base.renewal_time, Some(Duration::from_secs(300)));
        assert_eq!(base.dns_servers, [Ipv4Addr::new(10, 0, 0, 53)]);
        assert_eq!(base.boot_file.as_deref(), Some("ipxe.efi"));
    }

    #[tokio::test]
    async fn serves_until_signalled() {
        let (conn, inbound, mut outbound) = MemoryConn::new("0.0.0.0:67".parse().unwrap());
        let responder = Arc::new(GuestResponder::new(
            Arc::new(StaticGuestTable::new()),
            "br0",
            ResponseConfig::default(),
        ));
        let server = DhcpServer::new(Arc::new(conn), Arc::new(DhcpHandler::new(responder, None)));
        let mut state = server.watch_state();

        let mut agent = DhcpAgent::empty();
        agent.add_server(server);
        let agent = Arc::new(agent);

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn({
            let agent = Arc::clone(&agent);
            async move {
                agent
                    .run_until(async move {
                        let _ = stopped.await;
                    })
                    .await
            }
        });

        state.wait_for(|state| *state == State::Listening).await.unwrap();

        // Unknown guests without a relay get no answer.
        let mut packet = Packet::new(Op::BootRequest);
        packet.set_chaddr(&[0x52, 0x54, 0, 0, 0, 1]);
        packet.add_option(OptionCode::MESSAGE_TYPE, &[MessageType::Discover.to_u8()]);
        inbound
            .send(Datagram {
                data: packet.into_bytes(),
                src: "0.0.0.0:68".parse().unwrap(),
                mac: None,
            })
            .unwrap();

        stop.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(*state.borrow(), State::Closed);
        assert!(outbound.try_recv().is_err());
    }
}
