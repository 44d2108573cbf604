//! Error types for sockchain
//!
//! This module defines all custom error types used throughout the application.

use std::io;
use thiserror::Error;

/// Main error type for sockchain operations
#[derive(Error, Debug)]
pub enum SockchainError {
    /// Configuration error (tokenization or chain construction)
    #[error("config: {0}")]
    Config(String),

    /// Protocol violation or rejection during a proxy handshake
    #[error("{0}")]
    Handshake(String),

    /// IO error
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Upstream SOCKS5 server replied with an error code
    #[error(transparent)]
    Reply(#[from] ReplyError),

    /// Hostname resolution failure
    #[error("{0}")]
    Resolve(String),

    /// Deadline exceeded
    #[error("timeout: {0}")]
    Timeout(String),

    /// Listener setup or shutdown error
    #[error("{0}")]
    Server(String),

    /// An error attributed to a specific hop of a chain
    #[error("{protocol} {address}: {source}")]
    Hop {
        /// Protocol tag of the failing hop
        protocol: String,
        /// Address of the failing hop
        address: String,
        /// Underlying cause
        #[source]
        source: Box<SockchainError>,
    },
}

impl SockchainError {
    /// Wrap this error with the protocol and address of the hop it
    /// occurred on.
    pub fn at_hop(self, protocol: &str, address: &str) -> Self {
        SockchainError::Hop {
            protocol: protocol.to_string(),
            address: address.to_string(),
            source: Box::new(self),
        }
    }

    /// The innermost error, unwrapping any hop attribution.
    pub fn root(&self) -> &SockchainError {
        match self {
            SockchainError::Hop { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, SockchainError>;

/// Errors carried by non-zero SOCKS5 reply codes
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
    /// General SOCKS server failure (0x01)
    #[error("general failure")]
    GeneralFailure,
    /// Connection not allowed by ruleset (0x02)
    #[error("connection not allowed")]
    ConnNotAllowed,
    /// Network unreachable (0x03)
    #[error("network unreachable")]
    NetworkUnreachable,
    /// Host unreachable (0x04)
    #[error("host unreachable")]
    HostUnreachable,
    /// Connection refused (0x05)
    #[error("connection refused")]
    ConnRefused,
    /// TTL expired (0x06)
    #[error("TTL expired")]
    TtlExpired,
    /// Command not supported (0x07)
    #[error("command not supported")]
    CmdNotSupported,
    /// Address type not supported (0x08)
    #[error("address type not supported")]
    AtypNotSupported,
    /// A reply code outside the RFC 1928 table
    #[error("unknown reply {0:#04x}")]
    Unknown(u8),
}

impl ReplyError {
    /// Map a reply byte to an error, `None` meaning success (0x00).
    pub fn from_code(code: u8) -> Option<ReplyError> {
        match code {
            0x00 => None,
            0x01 => Some(ReplyError::GeneralFailure),
            0x02 => Some(ReplyError::ConnNotAllowed),
            0x03 => Some(ReplyError::NetworkUnreachable),
            0x04 => Some(ReplyError::HostUnreachable),
            0x05 => Some(ReplyError::ConnRefused),
            0x06 => Some(ReplyError::TtlExpired),
            0x07 => Some(ReplyError::CmdNotSupported),
            0x08 => Some(ReplyError::AtypNotSupported),
            other => Some(ReplyError::Unknown(other)),
        }
    }

    /// The wire reply code for this error.
    pub fn code(&self) -> u8 {
        match self {
            ReplyError::GeneralFailure => 0x01,
            ReplyError::ConnNotAllowed => 0x02,
            ReplyError::NetworkUnreachable => 0x03,
            ReplyError::HostUnreachable => 0x04,
            ReplyError::ConnRefused => 0x05,
            ReplyError::TtlExpired => 0x06,
            ReplyError::CmdNotSupported => 0x07,
            ReplyError::AtypNotSupported => 0x08,
            ReplyError::Unknown(code) => *code,
        }
    }
}
