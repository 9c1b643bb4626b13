//! DHCPv4 (RFC 2131, RFC 2132).

pub mod options;
pub mod packet;
pub mod reply;

pub use options::{MessageType, OptionCode, Options};
pub use packet::{Op, Packet, TxType};
pub use reply::{make_nak_packet, make_reply_packet, reply_message_type};

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;
