//! # veil-mixkey
//!
//! Per-epoch mix keys with a persistent anti-replay store.
//!
//! A mix key is a short-lived X25519 keypair bound to a single epoch and
//! used as this node's Sphinx unwrap key. Key material and the set of seen
//! replay tags live together in one SQLite database per epoch, so a key
//! that survives a restart also remembers every packet it has already
//! unwrapped.
//!
//! ## Modules
//!
//! - [`key`] — One mix key: persistence, replay test-and-set, close/unlink
//! - [`set`] — The rotating set of keys the node keeps live

pub mod key;
pub mod set;

pub use key::MixKey;
pub use set::MixKeyStore;

/// Error types for mix key persistence.
#[derive(Debug, thiserror::Error)]
pub enum MixKeyError {
    /// The database carries an unknown format version.
    #[error("incompatible mix key db version: {0}")]
    IncompatibleVersion(u8),

    /// The database is missing or corrupts a required entry.
    #[error("corrupt mix key db: {0}")]
    CorruptedDb(String),

    /// The stored epoch does not match the file name's epoch.
    #[error("mix key db epoch mismatch: expected {expected}, stored {stored}")]
    EpochMismatch { expected: u64, stored: u64 },

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite error.
    #[error("sqlite error: {0}")]
    Db(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, MixKeyError>;
