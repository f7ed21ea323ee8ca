//! X25519 key agreement (RFC 7748).
//!
//! Used for the long-lived link key authenticating transport sessions and
//! for the per-epoch mix keys that unwrap Sphinx packets.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroize;

/// An X25519 static secret key (link keys, mix keys).
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct X25519StaticSecret {
    inner: StaticSecret,
}

/// An X25519 public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct X25519PublicKey {
    bytes: [u8; 32],
}

/// An X25519 shared secret.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct SharedSecret {
    bytes: [u8; 32],
}

impl X25519StaticSecret {
    /// Generate a new random static secret.
    pub fn random() -> Self {
        Self {
            inner: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            inner: StaticSecret::from(bytes),
        }
    }

    /// Get the raw bytes of this secret.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Compute the corresponding public key.
    pub fn public_key(&self) -> X25519PublicKey {
        let pk = PublicKey::from(&self.inner);
        X25519PublicKey {
            bytes: pk.to_bytes(),
        }
    }

    /// Perform Diffie-Hellman key agreement.
    pub fn diffie_hellman(&self, their_public: &X25519PublicKey) -> SharedSecret {
        let pk = PublicKey::from(their_public.bytes);
        let shared = self.inner.diffie_hellman(&pk);
        SharedSecret {
            bytes: *shared.as_bytes(),
        }
    }
}

impl X25519PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Get the raw bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.bytes
    }

    /// Get the raw bytes as a slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl SharedSecret {
    /// Get the raw bytes of the shared secret.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

/// Perform an ephemeral X25519 key exchange.
///
/// Returns (ephemeral_public_key, shared_secret).
pub fn ephemeral_key_exchange(their_public: &X25519PublicKey) -> (X25519PublicKey, SharedSecret) {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    let pk = PublicKey::from(their_public.bytes);
    let shared = secret.diffie_hellman(&pk);

    (
        X25519PublicKey {
            bytes: public.to_bytes(),
        },
        SharedSecret {
            bytes: *shared.as_bytes(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let secret = X25519StaticSecret::random();
        assert_ne!(secret.public_key().to_bytes(), [0u8; 32]);
    }

    #[test]
    fn test_diffie_hellman_agreement() {
        let a = X25519StaticSecret::random();
        let b = X25519StaticSecret::random();
        let ab = a.diffie_hellman(&b.public_key());
        let ba = b.diffie_hellman(&a.public_key());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_ephemeral_exchange() {
        let b = X25519StaticSecret::random();
        let (eph_pub, shared) = ephemeral_key_exchange(&b.public_key());
        let other = b.diffie_hellman(&eph_pub);
        assert_eq!(shared.as_bytes(), other.as_bytes());
    }

    #[test]
    fn test_from_bytes_round_trip() {
        let secret = X25519StaticSecret::random();
        let restored = X25519StaticSecret::from_bytes(secret.to_bytes());
        assert_eq!(
            secret.public_key().to_bytes(),
            restored.public_key().to_bytes(),
        );
    }
}
