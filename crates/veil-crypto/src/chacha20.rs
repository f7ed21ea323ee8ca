//! ChaCha20-Poly1305 AEAD encryption (RFC 8439).
//!
//! Used for the Sphinx per-hop routing and payload layers.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};

use crate::{CryptoError, Result};

/// Nonce size for ChaCha20-Poly1305 (96 bits = 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Key size for ChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Authentication tag size (128 bits = 16 bytes).
pub const TAG_SIZE: usize = 16;

/// Encrypt data with ChaCha20-Poly1305.
///
/// Returns ciphertext with the 16-byte authentication tag appended. The
/// nonce must never be reused with the same key.
pub fn encrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = Nonce::from_slice(nonce);

    cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadDecryption)
}

/// Decrypt data with ChaCha20-Poly1305.
///
/// # Errors
///
/// Returns [`CryptoError::AeadDecryption`] if the authentication tag does
/// not verify.
pub fn decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = Nonce::from_slice(nonce);

    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::AeadDecryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let key = [1u8; KEY_SIZE];
        let nonce = [2u8; NONCE_SIZE];
        let ct = encrypt(&key, &nonce, b"fixed-size packet", b"").expect("encrypt");
        assert_eq!(ct.len(), b"fixed-size packet".len() + TAG_SIZE);
        let pt = decrypt(&key, &nonce, &ct, b"").expect("decrypt");
        assert_eq!(pt, b"fixed-size packet");
    }

    #[test]
    fn test_tamper_detected() {
        let key = [1u8; KEY_SIZE];
        let nonce = [2u8; NONCE_SIZE];
        let mut ct = encrypt(&key, &nonce, b"payload", b"").expect("encrypt");
        ct[0] ^= 1;
        assert!(decrypt(&key, &nonce, &ct, b"").is_err());
    }

    #[test]
    fn test_aad_mismatch_detected() {
        let key = [1u8; KEY_SIZE];
        let nonce = [2u8; NONCE_SIZE];
        let ct = encrypt(&key, &nonce, b"payload", b"aad-one").expect("encrypt");
        assert!(decrypt(&key, &nonce, &ct, b"aad-two").is_err());
    }
}
