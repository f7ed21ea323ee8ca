//! # veil-crypto
//!
//! Cryptographic primitives for the Veil mix network. No algorithm
//! negotiation is permitted; the suite is fixed.
//!
//! ## Modules
//!
//! - [`blake3`] — Domain-separated BLAKE3 hashing (registered contexts)
//! - [`chacha20`] — ChaCha20-Poly1305 AEAD encryption (RFC 8439)
//! - [`ed25519`] — Ed25519 identity keys (RFC 8032)
//! - [`x25519`] — X25519 link and mix keys (RFC 7748)
//! - [`keyfile`] — Long-lived key persistence under the data directory

pub mod blake3;
pub mod chacha20;
pub mod ed25519;
pub mod keyfile;
pub mod x25519;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// AEAD decryption failed (authentication tag mismatch).
    #[error("AEAD decryption failed")]
    AeadDecryption,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// A persisted key file is malformed.
    #[error("corrupt key file: {0}")]
    CorruptKeyFile(String),

    /// I/O error while reading or writing key material.
    #[error("key file I/O: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
