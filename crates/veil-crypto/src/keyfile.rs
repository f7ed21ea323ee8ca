//! Long-lived key persistence.
//!
//! The identity and link keys live as raw 32-byte secret serializations
//! under the data directory, owner-readable only. Generation writes the
//! file with mode 0600 and fsyncs before returning; loading rejects any
//! file that is not exactly the raw secret.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::ed25519::IdentityKey;
use crate::x25519::X25519StaticSecret;
use crate::{CryptoError, Result};

/// File mode for persisted key material.
pub const KEY_FILE_MODE: u32 = 0o600;

/// Raw secret length for both key types.
const SECRET_LEN: usize = 32;

fn read_secret(path: &Path) -> Result<[u8; SECRET_LEN]> {
    let mut f = File::open(path)?;
    let mut buf = Vec::with_capacity(SECRET_LEN + 1);
    f.read_to_end(&mut buf)?;
    if buf.len() != SECRET_LEN {
        return Err(CryptoError::CorruptKeyFile(format!(
            "{}: expected {SECRET_LEN} bytes, got {}",
            path.display(),
            buf.len(),
        )));
    }
    let mut secret = [0u8; SECRET_LEN];
    secret.copy_from_slice(&buf);
    Ok(secret)
}

fn write_secret(path: &Path, secret: &[u8; SECRET_LEN]) -> Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(KEY_FILE_MODE)
        .open(path)?;
    f.write_all(secret)?;
    f.sync_all()?;
    Ok(())
}

/// Load the identity key from `path`, generating and persisting a fresh one
/// if the file does not exist.
pub fn load_or_generate_identity(path: &Path) -> Result<IdentityKey> {
    if path.exists() {
        let secret = read_secret(path)?;
        return Ok(IdentityKey::from_bytes(&secret));
    }
    let key = IdentityKey::generate();
    write_secret(path, &key.signing_key.to_bytes())?;
    Ok(key)
}

/// Load the link key from `path`, generating and persisting a fresh one if
/// the file does not exist.
pub fn load_or_generate_link(path: &Path) -> Result<X25519StaticSecret> {
    if path.exists() {
        let secret = read_secret(path)?;
        return Ok(X25519StaticSecret::from_bytes(secret));
    }
    let key = X25519StaticSecret::random();
    write_secret(path, &key.to_bytes())?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_identity_generate_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("identity.key");

        let generated = load_or_generate_identity(&path).expect("generate");
        let loaded = load_or_generate_identity(&path).expect("load");
        assert_eq!(generated.node_id(), loaded.node_id());
    }

    #[test]
    fn test_link_generate_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("link.key");

        let generated = load_or_generate_link(&path).expect("generate");
        let loaded = load_or_generate_link(&path).expect("load");
        assert_eq!(
            generated.public_key().to_bytes(),
            loaded.public_key().to_bytes(),
        );
    }

    #[test]
    fn test_key_file_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("identity.key");
        load_or_generate_identity(&path).expect("generate");

        let mode = std::fs::metadata(&path)
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, KEY_FILE_MODE);
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("identity.key");
        std::fs::write(&path, [0u8; 16]).expect("write");

        assert!(matches!(
            load_or_generate_identity(&path),
            Err(CryptoError::CorruptKeyFile(_)),
        ));
    }
}
