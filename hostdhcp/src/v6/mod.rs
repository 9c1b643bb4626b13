//! DHCPv6 (RFC 8415).

use std::net::Ipv6Addr;

pub mod packet;
pub mod reply;

pub use packet::{ClientMessage, Message, MessageType, OptionCode, Options, RelayMessage};
pub use reply::{make_dhcp6_reply, reply_message_type};

pub const SERVER_PORT: u16 = 547;
pub const CLIENT_PORT: u16 = 546;

pub const ALL_DHCP_RELAY_AGENTS_AND_SERVERS: Ipv6Addr =
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);
