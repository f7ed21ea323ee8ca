//! # veil-transport
//!
//! Network transport for the Veil mix network.
//!
//! This crate provides:
//!
//! - **Sphinx packets** — fixed-size onion-routed packets via [`sphinx`]
//! - **QUIC/TLS 1.3** link sessions via [`quic`]
//! - **Wire handshake** — the authenticated hello exchange and packet
//!   framing via [`wire`]
//! - **CBOR serialization** helpers via [`cbor`]
//!
//! ## Architecture
//!
//! ```text
//! SphinxPacket (sphinx.rs)  -- 8192-byte fixed-size onion-routed packet
//!     |
//!     v
//! Hello / frames (wire.rs)  -- CBOR hello, length-prefixed packet frames
//!     |
//!     v
//! LinkNode (quic.rs)        -- QUIC/TLS 1.3 bidirectional streams
//!     |
//!     v
//! UDP socket
//! ```

pub mod cbor;
pub mod quic;
pub mod sphinx;
pub mod wire;

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// CBOR serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// CBOR deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Protocol violation (version mismatch, oversized frame, etc.).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid or malformed Sphinx packet.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// No header slot authenticated under our key.
    #[error("MAC verification failed")]
    MacVerification,

    /// Cryptographic operation failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Peer handshake credentials did not verify.
    #[error("handshake authentication failed")]
    HandshakeAuth,

    /// TLS/certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// QUIC connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// I/O error (socket, stream read/write).
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal error (should not occur in normal operation).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
