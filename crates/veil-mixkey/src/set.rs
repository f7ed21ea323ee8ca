//! The rotating set of live mix keys.
//!
//! The store keeps keys for the previous, current, and imminent-next
//! epochs. The next epoch's key is generated once the remaining time in
//! the current epoch drops below [`NEXT_KEY_GEN_SLACK`]; keys older than
//! the previous epoch are retired, closed, and unlinked. Rotation is
//! driven by the periodic tick.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use veil_types::epoch::EpochTime;

use crate::{MixKey, Result};

/// Generate the next epoch's key once less than this remains in the
/// current epoch.
pub const NEXT_KEY_GEN_SLACK: Duration = Duration::from_secs(45 * 60);

/// The set of mix keys the node currently holds.
///
/// Shared between the rotation driver and the crypto workers' shadow
/// snapshots; a key stays open until the last holder drops it.
pub struct MixKeyStore {
    data_dir: PathBuf,
    keys: Mutex<HashMap<u64, Arc<MixKey>>>,
}

impl MixKeyStore {
    /// Bring up the key set for the given epoch state.
    ///
    /// Loads the previous epoch's key only if its file already exists (a
    /// fresh node has no traffic from before it started); always creates
    /// the current key; creates the next key when the transition is near.
    ///
    /// # Errors
    ///
    /// Propagates any persistence failure from key load/creation.
    pub fn new(data_dir: &Path, now: EpochTime) -> Result<Self> {
        let store = Self {
            data_dir: data_dir.to_path_buf(),
            keys: Mutex::new(HashMap::new()),
        };

        {
            let mut keys = store.keys.lock().expect("mix key set lock");
            if now.epoch > 0 {
                let prev = now.epoch - 1;
                if store.key_path(prev).exists() {
                    keys.insert(prev, Arc::new(MixKey::load_or_create(data_dir, prev)?));
                    debug!(epoch = prev, "loaded previous epoch mix key");
                }
            }
            keys.insert(
                now.epoch,
                Arc::new(MixKey::load_or_create(data_dir, now.epoch)?),
            );
            if now.till < NEXT_KEY_GEN_SLACK {
                keys.insert(
                    now.epoch + 1,
                    Arc::new(MixKey::load_or_create(data_dir, now.epoch + 1)?),
                );
            }
        }

        Ok(store)
    }

    fn key_path(&self, epoch: u64) -> PathBuf {
        self.data_dir.join(format!("mixkey-{epoch}.db"))
    }

    /// Advance the set for the given epoch state.
    ///
    /// Retires keys older than the previous epoch (flagging them for
    /// unlink), ensures the current key exists, and generates the next
    /// key inside the pre-transition slack. Returns `true` iff the set
    /// changed, in which case the crypto workers must re-shadow.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures from key creation.
    pub fn rotate(&self, now: EpochTime) -> Result<bool> {
        let mut keys = self.keys.lock().expect("mix key set lock");
        let mut changed = false;

        let expired: Vec<u64> = keys
            .keys()
            .copied()
            .filter(|&epoch| epoch + 1 < now.epoch)
            .collect();
        for epoch in expired {
            if let Some(key) = keys.remove(&epoch) {
                key.set_unlink_if_expired(true);
                info!(epoch, "retiring expired mix key");
                changed = true;
            }
        }

        if !keys.contains_key(&now.epoch) {
            keys.insert(
                now.epoch,
                Arc::new(MixKey::load_or_create(&self.data_dir, now.epoch)?),
            );
            info!(epoch = now.epoch, "generated current epoch mix key");
            changed = true;
        }

        if now.till < NEXT_KEY_GEN_SLACK && !keys.contains_key(&(now.epoch + 1)) {
            keys.insert(
                now.epoch + 1,
                Arc::new(MixKey::load_or_create(&self.data_dir, now.epoch + 1)?),
            );
            info!(epoch = now.epoch + 1, "generated next epoch mix key");
            changed = true;
        }

        Ok(changed)
    }

    /// Snapshot the active set for a crypto worker's shadow.
    pub fn snapshot(&self) -> HashMap<u64, Arc<MixKey>> {
        self.keys.lock().expect("mix key set lock").clone()
    }

    /// Look up the key for one epoch.
    pub fn get(&self, epoch: u64) -> Option<Arc<MixKey>> {
        self.keys.lock().expect("mix key set lock").get(&epoch).cloned()
    }

    /// Release every key. Keys not flagged for unlink stay on disk for the
    /// next start.
    pub fn halt(&self) {
        self.keys.lock().expect("mix key set lock").clear();
    }
}
