//! Error types for the IPMI listener
//!
//! This module provides error types for socket handling and packet
//! decoding. Protocol-level failures that must reach the remote caller are
//! expressed as completion codes instead (see [`crate::CompletionCode`]).

use std::net::SocketAddr;
use thiserror::Error;

/// Error type for IPMI operations
#[derive(Debug, Error)]
pub enum IpmiError {
    /// Failed to bind to socket
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Invalid RMCP/IPMI packet
    #[error("invalid IPMI packet: {0}")]
    InvalidPacket(String),

    /// Header or payload checksum does not match
    #[error("checksum mismatch in {0}")]
    ChecksumMismatch(&'static str),

    /// Authentication type not supported by this listener
    #[error("unsupported authentication type: {0:#04x}")]
    UnsupportedAuthType(u8),

    /// Invalid listener configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for IPMI operations
pub type Result<T> = std::result::Result<T, IpmiError>;
