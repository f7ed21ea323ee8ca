//! Pluggable provider contracts.
//!
//! A provider node terminates client sessions and is the sink for locally
//! delivered packets. The concrete backend (spool, user store, SURB
//! handling) lives outside this crate; the relay core only needs these two
//! seams.

/// Downstream of the crypto worker's local-delivery branch.
pub trait ProviderBackend: Send + Sync + 'static {
    /// Accept a delivered plaintext for a local recipient. Must not block.
    fn deliver(&self, recipient: [u8; 64], plaintext: Vec<u8>);
}

/// The user database consulted for client session authentication.
pub trait UserDb: Send + Sync + 'static {
    /// Whether `user` may authenticate sessions with `link_key`.
    fn is_valid(&self, user: &[u8], link_key: &[u8; 32]) -> bool;
}
