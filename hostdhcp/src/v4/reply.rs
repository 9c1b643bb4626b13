use std::net::Ipv4Addr;
use std::time::Duration;

use crate::response::{classless_routes, ResponseConfig};

use super::options::{addr_list, MessageType, OptionCode};
use super::packet::{Op, Packet};

/// The message type a request is answered with, if it is answered at all.
pub fn reply_message_type(request: MessageType) -> Option<MessageType> {
    match request {
        MessageType::Discover => Some(MessageType::Offer),
        MessageType::Request | MessageType::Inform => Some(MessageType::Ack),
        _ => None,
    }
}

fn seconds(duration: Duration) -> [u8; 4] {
    u32::try_from(duration.as_secs())
        .unwrap_or(u32::MAX)
        .to_be_bytes()
}

/// Builds a fresh reply to `request` from `conf`.
pub fn make_reply_packet(request: &Packet, msg_type: MessageType, conf: &ResponseConfig) -> Packet {
    let mut reply = Packet::new(Op::BootReply);
    reply.set_htype(request.htype());
    reply.set_xid(request.xid());
    reply.set_flags(request.flags());
    reply.set_giaddr(request.giaddr());
    reply.set_chaddr(request.chaddr());

    let inform = request.message_type() == Some(MessageType::Inform);
    if msg_type == MessageType::Ack {
        reply.set_ciaddr(request.ciaddr());
    }
    // INFORM clients already have an address (RFC 2131 §4.3.5).
    if !inform {
        reply.set_yiaddr(conf.client_ip);
    }

    reply.add_option(OptionCode::MESSAGE_TYPE, &[msg_type.to_u8()]);
    reply.add_option(OptionCode::SERVER_ID, &conf.server_ip.octets());
    if !inform {
        reply.add_option(OptionCode::LEASE_TIME, &seconds(conf.lease_time));
        if let Some(t1) = conf.renewal_time {
            reply.add_option(OptionCode::RENEWAL_TIME, &seconds(t1));
        }
        if let Some(t2) = conf.rebinding_time {
            reply.add_option(OptionCode::REBINDING_TIME, &seconds(t2));
        }
    }

    reply.add_option(OptionCode::SUBNET_MASK, &conf.subnet_mask.octets());
    if let Some(gateway) = conf.gateway {
        reply.add_option(OptionCode::ROUTER, &gateway.octets());
    }
    if !conf.dns_servers.is_empty() {
        reply.add_option(OptionCode::DNS_SERVERS, &addr_list(&conf.dns_servers));
    }
    if let Some(domain) = &conf.domain {
        reply.add_option(OptionCode::DOMAIN_NAME, domain.as_bytes());
    }
    if let Some(broadcast) = conf.broadcast_addr {
        reply.add_option(OptionCode::BROADCAST_ADDR, &broadcast.octets());
    }
    if let Some(hostname) = &conf.hostname {
        reply.add_option(OptionCode::HOSTNAME, hostname.as_bytes());
    }
    if !conf.ntp_servers.is_empty() {
        reply.add_option(OptionCode::NTP_SERVERS, &addr_list(&conf.ntp_servers));
    }
    if let Some(mtu) = conf.mtu {
        reply.add_option(OptionCode::INTERFACE_MTU, &mtu.to_be_bytes());
    }
    if !conf.routes.is_empty() {
        reply.add_option(conf.os.route_option(), &classless_routes(&conf.routes));
    }

    if request.is_pxe_request() {
        add_boot_options(&mut reply, conf);
    }

    reply.pad_to_min_len();
    reply
}

fn add_boot_options(reply: &mut Packet, conf: &ResponseConfig) {
    if let Some(server) = conf.boot_server {
        reply.set_siaddr(server);
        reply.add_option(OptionCode::TFTP_SERVER_NAME, server.to_string().as_bytes());
    }

    if let Some(file) = &conf.boot_file {
        reply.set_file(file.as_bytes());
        reply.add_option(OptionCode::BOOT_FILE_NAME, file.as_bytes());
    }
}

/// Builds a NAK refusing `request`.
pub fn make_nak_packet(request: &Packet, server_ip: Ipv4Addr) -> Packet {
    let mut reply = Packet::new(Op::BootReply);
    reply.set_htype(request.htype());
    reply.set_xid(request.xid());
    reply.set_flags(request.flags());
    reply.set_giaddr(request.giaddr());
    reply.set_chaddr(request.chaddr());

    reply.add_option(OptionCode::MESSAGE_TYPE, &[MessageType::Nak.to_u8()]);
    reply.add_option(OptionCode::SERVER_ID, &server_ip.octets());
    reply.pad_to_min_len();
    reply
}
