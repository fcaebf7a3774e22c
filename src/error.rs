//! Error types for the OSC mixer client
//!
//! Setup-path failures (bind, missing target, discovery) are surfaced to the
//! caller. Decode-path failures (`MalformedPacket`) are produced by the codec
//! but absorbed by the receive loop: the datagram is logged and dropped.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised by the codec, transport, discovery and session layers
#[derive(Error, Debug)]
pub enum OscError {
    /// Local UDP port could not be acquired
    #[error("UDP bind failed on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Operation needs a bound socket
    #[error("UDP socket is not open")]
    NotOpen,

    /// No mixer endpoint set (neither discovered nor entered manually)
    #[error("Mixer address not configured")]
    NoTargetConfigured,

    /// The OS accepted fewer bytes than the datagram length
    #[error("Incomplete OSC send to {target} ({sent}/{expected} bytes)")]
    SendIncomplete {
        target: SocketAddr,
        sent: usize,
        expected: usize,
    },

    /// Socket-level failure while sending or receiving
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Datagram could not be decoded as an OSC packet
    #[error("Malformed OSC packet: {0}")]
    MalformedPacket(String),

    /// Address pattern is empty or does not begin with '/'
    #[error("Invalid OSC address pattern: {0:?}")]
    InvalidAddress(String),

    /// String argument or address contains an interior NUL
    #[error("OSC string contains NUL: {0:?}")]
    InvalidString(String),

    /// Encoder rejected the packet
    #[error("OSC encode failed: {0}")]
    Encode(String),

    /// Scan range is not an IPv4 CIDR block
    #[error("Invalid CIDR block: {0:?}")]
    InvalidCidr(String),

    /// No mixer answered within the timeout; a manual address is required
    #[error("No mixer answered within {timeout_ms} ms")]
    DiscoveryTimeout { timeout_ms: u64 },
}

impl OscError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        OscError::MalformedPacket(msg.into())
    }
}

/// Result alias for the protocol core
pub type Result<T> = std::result::Result<T, OscError>;
