//! One per-epoch mix key.
//!
//! The key and its replay-tag set persist in `mixkey-{epoch}.db` under the
//! data directory, mode 0600. The file holds two tables:
//!
//! - `metadata`: `version` = single byte `0x00`, `privateKey` = raw 32
//!   bytes, `epochKey` = 8-byte little-endian epoch.
//! - `replay`: `tag` (variable bytes) → 8-byte little-endian counter.
//!
//! A [`MixKey`] is shared as an `Arc`; dropping the last reference closes
//! the database, zeroizes the secret, and, when the owner has flagged it
//! and the key is expired, unlinks the file. A closed key cannot be
//! resurrected: there is no handle left to clone.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use veil_crypto::x25519::{X25519PublicKey, X25519StaticSecret};
use veil_types::epoch::EpochTime;

use crate::{MixKeyError, Result};

/// Database format version byte.
const DB_VERSION: u8 = 0x00;

const METADATA_VERSION_KEY: &str = "version";
const METADATA_PRIVATE_KEY: &str = "privateKey";
const METADATA_EPOCH_KEY: &str = "epochKey";

/// A mix key for one epoch, backed by its on-disk replay store.
pub struct MixKey {
    epoch: u64,
    keypair: X25519StaticSecret,
    public: X25519PublicKey,
    path: PathBuf,
    db: Mutex<Option<Connection>>,
    unlink_if_expired: AtomicBool,
}

impl MixKey {
    /// Open the mix key database for `epoch` under `data_dir`, creating and
    /// persisting a fresh keypair if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`MixKeyError::IncompatibleVersion`] for an unknown format
    /// byte, [`MixKeyError::CorruptedDb`] for missing or malformed entries,
    /// [`MixKeyError::EpochMismatch`] when the stored epoch disagrees with
    /// the file name, and [`MixKeyError::Io`]/[`MixKeyError::Db`] for
    /// filesystem and SQLite failures.
    pub fn load_or_create(data_dir: &Path, epoch: u64) -> Result<Self> {
        let path = data_dir.join(format!("mixkey-{epoch}.db"));
        let mut conn = Connection::open(&path)?;

        // Owner-only, matching the rest of the data directory.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS metadata (
                 key   TEXT PRIMARY KEY,
                 value BLOB NOT NULL
             );
             CREATE TABLE IF NOT EXISTS replay (
                 tag        BLOB PRIMARY KEY,
                 seen_count BLOB NOT NULL
             );",
        )?;

        let version: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                [METADATA_VERSION_KEY],
                |row| row.get(0),
            )
            .optional()?;

        let keypair = match version {
            Some(v) => {
                if v.len() != 1 || v[0] != DB_VERSION {
                    return Err(MixKeyError::IncompatibleVersion(
                        v.first().copied().unwrap_or(0xff),
                    ));
                }
                let secret = get_metadata(&conn, METADATA_PRIVATE_KEY)?;
                let secret: [u8; 32] = secret.try_into().map_err(|_| {
                    MixKeyError::CorruptedDb(format!("malformed '{METADATA_PRIVATE_KEY}' entry"))
                })?;

                let stored_epoch = get_metadata(&conn, METADATA_EPOCH_KEY)?;
                let stored_epoch: [u8; 8] = stored_epoch.try_into().map_err(|_| {
                    MixKeyError::CorruptedDb(format!("malformed '{METADATA_EPOCH_KEY}' entry"))
                })?;
                let stored_epoch = u64::from_le_bytes(stored_epoch);
                if stored_epoch != epoch {
                    return Err(MixKeyError::EpochMismatch {
                        expected: epoch,
                        stored: stored_epoch,
                    });
                }

                X25519StaticSecret::from_bytes(secret)
            }
            None => {
                let keypair = X25519StaticSecret::random();
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO metadata (key, value) VALUES (?1, ?2)",
                    rusqlite::params![METADATA_VERSION_KEY, vec![DB_VERSION]],
                )?;
                tx.execute(
                    "INSERT INTO metadata (key, value) VALUES (?1, ?2)",
                    rusqlite::params![METADATA_PRIVATE_KEY, keypair.to_bytes().to_vec()],
                )?;
                tx.execute(
                    "INSERT INTO metadata (key, value) VALUES (?1, ?2)",
                    rusqlite::params![METADATA_EPOCH_KEY, epoch.to_le_bytes().to_vec()],
                )?;
                tx.commit()?;
                debug!(epoch, path = %path.display(), "generated fresh mix key");
                keypair
            }
        };

        let public = keypair.public_key();
        Ok(Self {
            epoch,
            keypair,
            public,
            path,
            db: Mutex::new(Some(conn)),
            unlink_if_expired: AtomicBool::new(false),
        })
    }

    /// The epoch this key is bound to.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The public half of the keypair.
    pub fn public_key(&self) -> &X25519PublicKey {
        &self.public
    }

    /// The private half, for Sphinx unwrapping.
    pub fn private_key(&self) -> &X25519StaticSecret {
        &self.keypair
    }

    /// Mark whether the backing file should be unlinked when the key is
    /// closed while expired.
    pub fn set_unlink_if_expired(&self, unlink: bool) {
        self.unlink_if_expired.store(unlink, Ordering::Relaxed);
    }

    /// Test-and-set a replay tag: returns `true` iff the tag has been seen
    /// before. Empty tags always report replay.
    ///
    /// Anti-replay is a safety property: a store failure here means bit-rot
    /// or a bug, and continuing would silently disable replay protection,
    /// so failures abort the process.
    ///
    /// # Panics
    ///
    /// Panics if the key is already closed or the store fails.
    pub fn is_replay(&self, tag: &[u8]) -> bool {
        if tag.is_empty() {
            return true;
        }

        let mut guard = self
            .db
            .lock()
            .unwrap_or_else(|_| panic!("BUG: mixkey: replay store lock poisoned"));
        let conn = match guard.as_mut() {
            Some(conn) => conn,
            None => panic!("BUG: mixkey: is_replay on closed key"),
        };

        let seen = replay_test_and_set(conn, tag)
            .unwrap_or_else(|e| panic!("BUG: mixkey: failed to query/update the replay counter: {e}"));
        seen != 0
    }

    /// Flush and close the store, zeroizing the secret, and unlink the file
    /// when flagged and expired relative to `current_epoch`.
    fn force_close(&self, current_epoch: u64) {
        let mut guard = match self.db.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(conn) = guard.take() {
            let _ = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()));
            let _ = conn.close();

            let expired = self.epoch + 1 < current_epoch;
            if self.unlink_if_expired.load(Ordering::Relaxed) && expired {
                debug!(epoch = self.epoch, path = %self.path.display(), "unlinking expired mix key");
                let _ = std::fs::remove_file(&self.path);
                for suffix in ["-wal", "-shm"] {
                    let mut side = self.path.as_os_str().to_owned();
                    side.push(suffix);
                    let _ = std::fs::remove_file(PathBuf::from(side));
                }
            }
        }
        // The secret zeroizes when the struct drops.
    }
}

impl Drop for MixKey {
    fn drop(&mut self) {
        self.force_close(EpochTime::now().epoch);
    }
}

fn get_metadata(conn: &Connection, key: &str) -> Result<Vec<u8>> {
    conn.query_row(
        "SELECT value FROM metadata WHERE key = ?1",
        [key],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| MixKeyError::CorruptedDb(format!("missing '{key}' entry")))
}

/// The transactional replay counter update. Returns the prior counter.
fn replay_test_and_set(conn: &mut Connection, tag: &[u8]) -> Result<u64> {
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

    let prior: Option<Vec<u8>> = tx
        .query_row(
            "SELECT seen_count FROM replay WHERE tag = ?1",
            [tag],
            |row| row.get(0),
        )
        .optional()?;
    let prior = match prior {
        Some(b) if b.len() == 8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&b);
            u64::from_le_bytes(buf)
        }
        Some(_) | None => 0,
    };

    // The counter itself is unused downstream; only the new-vs-seen bit
    // matters. It saturates rather than wraps.
    let next = prior.saturating_add(1);
    tx.execute(
        "INSERT OR REPLACE INTO replay (tag, seen_count) VALUES (?1, ?2)",
        rusqlite::params![tag, next.to_le_bytes().to_vec()],
    )?;
    tx.commit()?;

    Ok(prior)
}
