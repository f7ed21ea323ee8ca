//! Authentication grace windows around epoch transitions.

use std::sync::Arc;

use veil_relayd::pki::{Pki, PkiCacheEntry};
use veil_transport::wire::PeerCredentials;
use veil_types::epoch::EpochTime;
use veil_types::pki::{Document, Layer, MixDescriptor};
use veil_types::EPOCH_DURATION_SECS;

fn descriptor(name: &str, id_byte: u8, layer: Layer) -> MixDescriptor {
    MixDescriptor {
        name: name.to_string(),
        identity_key: [id_byte; 32],
        link_key: [id_byte ^ 0xff; 32],
        layer,
        addresses: vec!["127.0.0.1:30001".to_string()],
    }
}

fn doc(epoch: u64) -> Document {
    Document {
        epoch,
        topology: vec![
            vec![descriptor("entry", 0x10, Layer::Mix(0))],
            vec![descriptor("middle", 0x20, Layer::Mix(1))],
        ],
        providers: vec![descriptor("provider", 0x40, Layer::Provider)],
    }
}

/// A cache for the middle node, with the given documents loaded.
fn pki_with_docs(epochs: &[u64]) -> Arc<Pki> {
    let pki = Arc::new(Pki::new(
        [0x20; 32],
        "middle".to_string(),
        false,
        false,
        None,
    ));
    for &epoch in epochs {
        let entry =
            PkiCacheEntry::new(doc(epoch), &[0x20; 32], "middle", false).expect("entry");
        pki.insert(entry);
    }
    pki
}

fn entry_creds() -> PeerCredentials {
    PeerCredentials {
        additional_data: vec![0x10; 32],
        public_key: [0x10 ^ 0xff; 32],
    }
}

fn at(epoch: u64, elapsed_secs: u64) -> EpochTime {
    EpochTime::at(epoch * EPOCH_DURATION_SECS + elapsed_secs)
}

#[test]
fn late_slack_for_previous_epoch_node() {
    // Node listed only in the document for epoch 99.
    let pki = pki_with_docs(&[99]);

    // One minute past the transition into epoch 100: still welcome.
    assert_eq!(
        pki.authenticate_incoming_at(&entry_creds(), at(100, 60)),
        (true, true),
    );

    // Four minutes past: the previous document no longer applies.
    assert_eq!(
        pki.authenticate_incoming_at(&entry_creds(), at(100, 240)),
        (false, false),
    );
}

#[test]
fn early_slack_for_next_epoch_node() {
    // Node listed only in the next epoch's document, with mix auth on.
    let pki = pki_with_docs(&[101]);

    // Start of epoch 100 (elapsed 0, a full epoch remaining): unknown.
    assert_eq!(
        pki.authenticate_incoming_at(&entry_creds(), at(100, 0)),
        (false, false),
    );

    // 20 minutes before the transition: recognized, but not yet allowed
    // to send.
    assert_eq!(
        pki.authenticate_incoming_at(&entry_creds(), at(100, EPOCH_DURATION_SECS - 20 * 60)),
        (false, true),
    );

    // Under 2 minutes before the transition: fully allowed.
    assert_eq!(
        pki.authenticate_incoming_at(&entry_creds(), at(100, EPOCH_DURATION_SECS - 90)),
        (true, true),
    );
}

#[test]
fn outgoing_send_requires_current_document() {
    let pki = pki_with_docs(&[100, 101]);
    let exit_creds = PeerCredentials {
        additional_data: vec![0x40; 32],
        public_key: [0x40 ^ 0xff; 32],
    };

    // Current document: full permission. (The middle node's outgoing
    // layer wraps to the providers.)
    let (desc, can_send, is_valid) =
        pki.authenticate_outgoing_at(&exit_creds, at(100, 600));
    assert!(desc.is_some());
    assert!(can_send && is_valid);

    // Next document only: valid, but sending must wait for the epoch.
    let pki = pki_with_docs(&[101]);
    let (desc, can_send, is_valid) = pki.authenticate_outgoing_at(
        &exit_creds,
        at(100, EPOCH_DURATION_SECS - 90),
    );
    assert!(desc.is_some());
    assert!(!can_send);
    assert!(is_valid);
}

#[test]
fn forward_destination_requires_current_consensus() {
    let pki = pki_with_docs(&[100]);
    assert!(pki.is_valid_forward_dest_at(&[0x40; 32], at(100, 600)));
    assert!(!pki.is_valid_forward_dest_at(&[0x99; 32], at(100, 600)));
    // A stale cache grants nothing.
    assert!(!pki.is_valid_forward_dest_at(&[0x40; 32], at(101, 60)));
}
