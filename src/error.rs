//! Error types for udrpc.
//!
//! These are local failures surfaced through `Result`. Protocol-visible
//! error kinds travel on the wire as [`crate::sm::SmErrType`] instead.

use thiserror::Error;

/// Error type for udrpc operations.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error from the management-plane socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The session table reached its lifetime cap.
    #[error("session table full ({0} sessions)")]
    SessionTableFull(usize),
    /// The requested fabric port is not managed by this endpoint.
    #[error("fabric port {0} is not managed by this rpc")]
    InvalidPhyPort(u8),
    /// Hostname does not fit the fixed-width metadata buffer.
    #[error("hostname too long: {got} bytes, max {max}")]
    HostnameTooLong { got: usize, max: usize },
    /// Another endpoint already registered this thread id with the Nexus.
    #[error("app tid {0} already registered with this nexus")]
    TidAlreadyRegistered(u8),
    /// Received byte buffer is not a whole session management packet.
    #[error("truncated sm packet: {got} bytes, expected {expected}")]
    TruncatedSmPacket { got: usize, expected: usize },
    /// Unknown session management packet type byte.
    #[error("invalid sm packet type: {0}")]
    InvalidSmPktType(u8),
    /// Unknown session management error kind byte.
    #[error("invalid sm error kind: {0}")]
    InvalidSmErrType(u8),
    /// Unknown transport kind byte in endpoint metadata.
    #[error("invalid transport kind: {0}")]
    InvalidTransportKind(u8),
}

/// Result type for udrpc operations.
pub type Result<T> = std::result::Result<T, Error>;
