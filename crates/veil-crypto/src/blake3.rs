//! Domain-separated BLAKE3 hashing for the Veil protocol.
//!
//! Cross-domain collisions are prevented by mandatory domain separation
//! using BLAKE3's built-in modes.
//!
//! ## Modes
//!
//! - [`hash`] — Pure hashing
//! - [`derive_key`] — Key derivation from a context string + key material
//! - [`keyed_hash`] — Keyed MAC/PRF
//!
//! ## Context strings
//!
//! All registered context strings are available as constants in
//! [`contexts`]. Using an unregistered context string is a protocol
//! violation.

/// Registered BLAKE3 context strings.
pub mod contexts {
    pub const SPHINX_HOP_KEY: &str = "Veil v1 sphinx-hop-key";
    pub const SPHINX_HOP_MAC: &str = "Veil v1 sphinx-hop-mac";
    pub const SPHINX_HOP_NONCE: &str = "Veil v1 sphinx-hop-nonce";
    pub const SPHINX_HOP_PAD: &str = "Veil v1 sphinx-hop-pad";
    pub const SPHINX_REPLAY_TAG: &str = "Veil v1 sphinx-replay-tag";
    pub const LINK_HELLO: &str = "Veil v1 link-hello";

    /// All registered context strings. Used for validation.
    pub const ALL_CONTEXTS: &[&str] = &[
        SPHINX_HOP_KEY,
        SPHINX_HOP_MAC,
        SPHINX_HOP_NONCE,
        SPHINX_HOP_PAD,
        SPHINX_REPLAY_TAG,
        LINK_HELLO,
    ];
}

/// Hash data with plain BLAKE3.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *::blake3::hash(data).as_bytes()
}

/// Derive a 32-byte key from a registered context string and key material.
pub fn derive_key(context: &str, key_material: &[u8]) -> [u8; 32] {
    debug_assert!(
        is_registered_context(context),
        "unregistered BLAKE3 context: {context}",
    );
    ::blake3::derive_key(context, key_material)
}

/// Keyed BLAKE3 hash (MAC/PRF mode).
pub fn keyed_hash(key: &[u8; 32], message: &[u8]) -> [u8; 32] {
    *::blake3::keyed_hash(key, message).as_bytes()
}

/// Whether a context string is registered.
pub fn is_registered_context(context: &str) -> bool {
    contexts::ALL_CONTEXTS.contains(&context)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(hash(b"veil"), hash(b"veil"));
        assert_ne!(hash(b"veil"), hash(b"veils"));
    }

    #[test]
    fn test_derive_key_context_separation() {
        let ikm = [7u8; 32];
        let a = derive_key(contexts::SPHINX_HOP_KEY, &ikm);
        let b = derive_key(contexts::SPHINX_HOP_MAC, &ikm);
        assert_ne!(a, b);
    }

    #[test]
    fn test_keyed_hash_key_separation() {
        let m = b"message";
        let a = keyed_hash(&[1u8; 32], m);
        let b = keyed_hash(&[2u8; 32], m);
        assert_ne!(a, b);
    }

    #[test]
    fn test_all_contexts_registered() {
        for ctx in contexts::ALL_CONTEXTS {
            assert!(is_registered_context(ctx));
        }
        assert!(!is_registered_context("Veil v1 made-up"));
    }
}
