//! DHCPv4, DHCPv6 and router advertisements for virtual machine guests.

pub mod agent;
pub mod bpf;
pub mod codec;
pub mod config;
pub mod conn;
pub mod error;
pub mod frame;
pub mod guest;
pub mod icmp6;
pub mod ioctl;
pub mod mac;
pub mod ra;
pub mod relay;
pub mod relay6;
pub mod response;
pub mod server;
pub mod v4;
pub mod v6;

pub use error::{DecodeError, Error, Layer, Result};
