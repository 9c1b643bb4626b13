use std::fmt;
use std::io;

use crate::codec::Eof;

/// The protocol layer a decode failure was detected in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Layer {
    Ethernet,
    Ipv4,
    Ipv6,
    Udp,
    Icmpv6,
    NdpOption,
    Dhcpv4,
    Dhcpv6,
    Dhcpv6Option,
}

impl Layer {
    /// Maps a short read on this layer into a [`DecodeError`].
    pub(crate) fn eof(self) -> impl Fn(Eof) -> DecodeError {
        move |_| DecodeError::Truncated(self)
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ethernet => "ethernet",
            Self::Ipv4 => "ipv4",
            Self::Ipv6 => "ipv6",
            Self::Udp => "udp",
            Self::Icmpv6 => "icmpv6",
            Self::NdpOption => "ndp option",
            Self::Dhcpv4 => "dhcpv4",
            Self::Dhcpv6 => "dhcpv6",
            Self::Dhcpv6Option => "dhcpv6 option",
        };
        f.write_str(name)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("{0}: truncated")]
    Truncated(Layer),
    #[error("{0}: malformed {1}")]
    Malformed(Layer, &'static str),
    #[error("{0}: unsupported type {1}")]
    Unsupported(Layer, u16),
}

impl DecodeError {
    pub fn layer(&self) -> Layer {
        match self {
            Self::Truncated(layer) | Self::Malformed(layer, _) | Self::Unsupported(layer, _) => {
                *layer
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
    #[error("unsupported message type {0}")]
    UnsupportedMessage(u8),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
