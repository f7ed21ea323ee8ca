//! Mix key rotation across epoch boundaries.

use veil_mixkey::set::NEXT_KEY_GEN_SLACK;
use veil_mixkey::MixKeyStore;
use veil_types::epoch::EpochTime;
use veil_types::EPOCH_DURATION_SECS;

fn at(epoch: u64, elapsed_secs: u64) -> EpochTime {
    EpochTime::at(epoch * EPOCH_DURATION_SECS + elapsed_secs)
}

#[test]
fn rotation_creates_next_and_unlinks_expired() {
    let dir = tempfile::tempdir().expect("tempdir");

    // Node has been running since epoch 98.
    let store = MixKeyStore::new(dir.path(), at(98, 60)).expect("store");
    assert!(dir.path().join("mixkey-98.db").exists());

    // Epoch 99 arrives; 98 is still the previous epoch and stays.
    store.rotate(at(99, 60)).expect("rotate into 99");
    assert!(store.get(99).is_some());
    assert!(store.get(98).is_some());

    // Approaching the boundary, the next epoch's key appears.
    let near_boundary = EPOCH_DURATION_SECS - NEXT_KEY_GEN_SLACK.as_secs() + 60;
    assert!(store.rotate(at(99, near_boundary)).expect("pre-generate"));
    assert!(dir.path().join("mixkey-100.db").exists());

    // Epoch 100: 98 is now older than current-1 and must be unlinked.
    store.rotate(at(100, 60)).expect("rotate into 100");
    assert!(store.get(98).is_none());
    assert!(!dir.path().join("mixkey-98.db").exists());
    assert!(store.get(99).is_some(), "previous epoch key must survive");
    assert!(store.get(100).is_some());
}

#[test]
fn rotation_is_idempotent_within_a_tick() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = MixKeyStore::new(dir.path(), at(100, 60)).expect("store");

    // Repeated ticks at the same instant must settle after the first.
    assert!(!store.rotate(at(100, 61)).expect("tick"));
    assert!(!store.rotate(at(100, 62)).expect("tick"));

    let near_boundary = EPOCH_DURATION_SECS - 60;
    assert!(store.rotate(at(100, near_boundary)).expect("tick"));
    assert!(!store.rotate(at(100, near_boundary + 1)).expect("tick"));
}

#[test]
fn reopened_store_reuses_persisted_keys() {
    let dir = tempfile::tempdir().expect("tempdir");

    let store = MixKeyStore::new(dir.path(), at(100, 60)).expect("store");
    let public = store
        .get(100)
        .expect("current key")
        .public_key()
        .to_bytes();
    store.halt();

    let store = MixKeyStore::new(dir.path(), at(100, 120)).expect("restart");
    assert_eq!(
        store
            .get(100)
            .expect("current key after restart")
            .public_key()
            .to_bytes(),
        public,
        "the persisted keypair must be reused",
    );
}
