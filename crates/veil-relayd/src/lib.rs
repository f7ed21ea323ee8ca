//! # veil-relayd
//!
//! The Veil mix network relay daemon.
//!
//! A relay receives fixed-size Sphinx packets from peer relays, unwraps one
//! onion layer with its per-epoch mix key, enforces anti-replay on the
//! unwrap tag, and schedules the result for forward transmission to the
//! next hop (or hands it to the provider backend for local delivery). An
//! external PKI publishes, per epoch, a signed document naming every node,
//! its layer, and its keys; the relay derives its peer sets from that
//! document and authenticates every link session against it.
//!
//! ## Modules
//!
//! - [`config`] — TOML configuration
//! - [`server`] — Supervisor: construction, wiring, ordered shutdown
//! - [`pki`] — Epoch-indexed consensus cache and authentication policy
//! - [`packet`] — The in-flight packet handed between pipeline stages
//! - [`worker`] — Sphinx unwrap worker pool
//! - [`scheduler`] — Deadline-ordered egress
//! - [`connector`] — Outbound session supervisor
//! - [`listener`] — Inbound session acceptor
//! - [`periodic`] — 1 Hz heartbeat driving epoch-boundary work
//! - [`provider`] — Pluggable local-delivery contracts

pub mod config;
pub mod connector;
pub mod listener;
pub mod packet;
pub mod periodic;
pub mod pki;
pub mod provider;
pub mod scheduler;
pub mod server;
pub mod worker;

/// Top-level daemon errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Initialization stopped deliberately after key generation
    /// (`debug.generate_only`). Not a failure.
    #[error("generate-only mode: keys generated, not starting workers")]
    GenerateOnly,

    /// Configuration rejected at startup.
    #[error("config: {0}")]
    Config(String),

    /// The data directory is missing, mis-owned, or mis-moded.
    #[error("data dir: {0}")]
    DataDir(String),

    /// Key material could not be loaded or generated.
    #[error(transparent)]
    Crypto(#[from] veil_crypto::CryptoError),

    /// Mix key persistence failed.
    #[error(transparent)]
    MixKey(#[from] veil_mixkey::MixKeyError),

    /// Transport setup failed.
    #[error(transparent)]
    Transport(#[from] veil_transport::TransportError),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
