//! Sphinx 8192-byte fixed-size packet construction and processing.
//!
//! Sphinx packets provide sender anonymity through layered encryption. Each
//! packet traverses a 3-hop path; every relay unwraps one layer with its
//! per-epoch mix key, recovering a routing command (forward with a delay, or
//! deliver to a local recipient) and a replay tag unique to the packet under
//! that key.
//!
//! ## Packet layout (v1, X25519-only)
//!
//! ```text
//! [version:1][flags:1][eph_pks:96][routing_cts:351][macs:48][reserved:15] = 512 bytes header
//! [payload:7680] = 8192 - 512
//! ```
//!
//! - `eph_pks`: 3 x 32-byte X25519 ephemeral public keys (one per hop slot)
//! - `routing_cts`: 3 x 117-byte AEAD-sealed routing info blocks
//! - `macs`: 3 x 16-byte BLAKE3 keyed-hash recognition tags
//!
//! A relay does not know its hop index; it trial-matches every slot's
//! recognition tag under the shared secret for that slot's ephemeral key.
//!
//! ## Per-hop key derivation
//!
//! Given shared secret `S` from X25519 DH:
//! - `hop_key    = BLAKE3::derive_key("Veil v1 sphinx-hop-key", S)`
//! - `hop_mac    = BLAKE3::derive_key("Veil v1 sphinx-hop-mac", S)`
//! - `hop_pad    = BLAKE3::derive_key("Veil v1 sphinx-hop-pad", S)`
//! - `nonces     = BLAKE3::derive_key("Veil v1 sphinx-hop-nonce", S)`
//!   (`[..12]` routing, `[12..24]` payload)
//! - `replay_tag = BLAKE3::derive_key("Veil v1 sphinx-replay-tag", S)`
//!
//! The payload is encrypted with layered ChaCha20-Poly1305 (innermost layer
//! first); each unwrap strips one 16-byte tag, so a relay at slot `i` reads
//! a ciphertext of `PAYLOAD_SIZE - i * 16` bytes.

use veil_crypto::blake3 as vb3;
use veil_crypto::blake3::contexts;
use veil_crypto::chacha20;
use veil_crypto::x25519::{X25519PublicKey, X25519StaticSecret};
use veil_types::NodeId;

use crate::TransportError;

/// Total Sphinx packet size in bytes.
pub const PACKET_SIZE: usize = veil_types::SPHINX_PACKET_SIZE; // 8192

/// Number of hops in a Sphinx path.
pub const NUM_HOPS: usize = veil_types::SPHINX_HOPS; // 3

/// Size of a single X25519 ephemeral public key.
pub const EPH_PK_SIZE: usize = 32;

/// Size of a plaintext routing info block.
///
/// Layout: `[cmd:1][next_node_id:32][delay_ms:4][recipient:64]` = 101 bytes
pub const ROUTING_INFO_SIZE: usize = 101;

/// ChaCha20-Poly1305 authentication tag size.
const AEAD_TAG_SIZE: usize = chacha20::TAG_SIZE;

/// Size of one AEAD-sealed routing info block.
pub const ROUTING_CT_SIZE: usize = ROUTING_INFO_SIZE + AEAD_TAG_SIZE; // 117

/// Size of one recognition tag.
pub const MAC_TAG_SIZE: usize = 16;

/// Header size, padded to 512 bytes with a reserved region.
pub const HEADER_SIZE: usize = 512;

/// Payload region size.
pub const PAYLOAD_SIZE: usize = PACKET_SIZE - HEADER_SIZE; // 7680

/// Maximum plaintext a packet can carry: the innermost payload layer minus
/// the 4-byte length prefix.
pub const MAX_PLAINTEXT_SIZE: usize = PAYLOAD_SIZE - NUM_HOPS * AEAD_TAG_SIZE - 4; // 7628

/// Sphinx packet version for the X25519-only v1 format.
pub const SPHINX_VERSION: u8 = 1;

// Header field offsets
const OFF_VERSION: usize = 0;
const OFF_FLAGS: usize = 1;
const OFF_EPH_PKS: usize = 2;
const OFF_ROUTING: usize = OFF_EPH_PKS + NUM_HOPS * EPH_PK_SIZE; // 98
const OFF_MACS: usize = OFF_ROUTING + NUM_HOPS * ROUTING_CT_SIZE; // 449
const OFF_PAYLOAD: usize = HEADER_SIZE;

const CMD_FORWARD: u8 = 0x01;
const CMD_DELIVER: u8 = 0x02;

/// The routing command recovered by unwrapping one layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoutingCommand {
    /// Forward the rewrapped packet to the next hop after a mixing delay.
    Forward {
        /// Node id of the next hop.
        next_node_id: NodeId,
        /// Mixing delay before forwarding, in milliseconds.
        delay_ms: u32,
    },
    /// Final hop: deliver the plaintext to a local recipient.
    Deliver {
        /// Opaque recipient identifier.
        recipient: [u8; 64],
    },
}

impl RoutingCommand {
    fn to_bytes(&self) -> [u8; ROUTING_INFO_SIZE] {
        let mut buf = [0u8; ROUTING_INFO_SIZE];
        match self {
            RoutingCommand::Forward {
                next_node_id,
                delay_ms,
            } => {
                buf[0] = CMD_FORWARD;
                buf[1..33].copy_from_slice(next_node_id);
                buf[33..37].copy_from_slice(&delay_ms.to_le_bytes());
            }
            RoutingCommand::Deliver { recipient } => {
                buf[0] = CMD_DELIVER;
                buf[37..101].copy_from_slice(recipient);
            }
        }
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        if data.len() != ROUTING_INFO_SIZE {
            return Err(TransportError::InvalidPacket(format!(
                "routing info wrong size: {} bytes, need {ROUTING_INFO_SIZE}",
                data.len(),
            )));
        }
        match data[0] {
            CMD_FORWARD => {
                let mut next_node_id = [0u8; 32];
                next_node_id.copy_from_slice(&data[1..33]);
                let mut delay = [0u8; 4];
                delay.copy_from_slice(&data[33..37]);
                Ok(RoutingCommand::Forward {
                    next_node_id,
                    delay_ms: u32::from_le_bytes(delay),
                })
            }
            CMD_DELIVER => {
                let mut recipient = [0u8; 64];
                recipient.copy_from_slice(&data[37..101]);
                Ok(RoutingCommand::Deliver { recipient })
            }
            c => Err(TransportError::InvalidPacket(format!(
                "unknown routing command {c:#04x}",
            ))),
        }
    }
}

/// Per-hop derived keys from a shared secret.
struct HopKeys {
    hop_key: [u8; 32],
    hop_mac: [u8; 32],
    hop_pad: [u8; 32],
    routing_nonce: [u8; 12],
    payload_nonce: [u8; 12],
    replay_tag: [u8; 32],
}

impl HopKeys {
    fn derive(shared_secret: &[u8; 32]) -> Self {
        let nonces = vb3::derive_key(contexts::SPHINX_HOP_NONCE, shared_secret);
        let mut routing_nonce = [0u8; 12];
        routing_nonce.copy_from_slice(&nonces[..12]);
        let mut payload_nonce = [0u8; 12];
        payload_nonce.copy_from_slice(&nonces[12..24]);
        Self {
            hop_key: vb3::derive_key(contexts::SPHINX_HOP_KEY, shared_secret),
            hop_mac: vb3::derive_key(contexts::SPHINX_HOP_MAC, shared_secret),
            hop_pad: vb3::derive_key(contexts::SPHINX_HOP_PAD, shared_secret),
            routing_nonce,
            payload_nonce,
            replay_tag: vb3::derive_key(contexts::SPHINX_REPLAY_TAG, shared_secret),
        }
    }

    /// Recognition tag over the slot's ephemeral key and sealed routing info.
    fn recognition_tag(&self, eph_pk: &[u8], routing_ct: &[u8]) -> [u8; MAC_TAG_SIZE] {
        let mut msg = Vec::with_capacity(eph_pk.len() + routing_ct.len());
        msg.extend_from_slice(eph_pk);
        msg.extend_from_slice(routing_ct);
        let full = vb3::keyed_hash(&self.hop_mac, &msg);
        let mut tag = [0u8; MAC_TAG_SIZE];
        tag.copy_from_slice(&full[..MAC_TAG_SIZE]);
        tag
    }
}

/// One hop of a packet's path, as seen by the builder.
pub struct PathHop {
    /// The hop's mix public key for the target epoch.
    pub public_key: X25519PublicKey,
    /// The routing command this hop will recover.
    pub routing: RoutingCommand,
}

/// The result of unwrapping one layer at a relay.
pub struct Unwrapped {
    /// Replay tag, stable across duplicate processing of the same packet
    /// under the same mix key.
    pub replay_tag: [u8; 32],
    /// The recovered routing command.
    pub command: UnwrappedCommand,
}

/// The routing command plus the unwrapped packet material.
pub enum UnwrappedCommand {
    /// Forward the rewrapped packet to the next hop.
    Forward {
        /// Node id of the next hop.
        next_node_id: NodeId,
        /// Mixing delay before forwarding, in milliseconds.
        delay_ms: u32,
        /// The rewrapped fixed-size packet.
        packet: Vec<u8>,
    },
    /// Deliver the plaintext to a local recipient.
    Deliver {
        /// Opaque recipient identifier.
        recipient: [u8; 64],
        /// The decrypted plaintext.
        plaintext: Vec<u8>,
    },
}

/// Build a Sphinx packet with layered encryption for a 3-hop path.
///
/// The plaintext is wrapped in [`NUM_HOPS`] layers of ChaCha20-Poly1305;
/// the outermost layer is for the first hop, the innermost for the final
/// hop. The final hop's routing command must be
/// [`RoutingCommand::Deliver`]; earlier hops must be
/// [`RoutingCommand::Forward`].
///
/// # Errors
///
/// Returns [`TransportError::InvalidPacket`] if the plaintext exceeds
/// [`MAX_PLAINTEXT_SIZE`] bytes or the path's commands are malformed.
pub fn build_packet(path: &[PathHop; NUM_HOPS], plaintext: &[u8]) -> Result<Vec<u8>, TransportError> {
    if plaintext.len() > MAX_PLAINTEXT_SIZE {
        return Err(TransportError::InvalidPacket(format!(
            "plaintext too large: {} bytes, max {MAX_PLAINTEXT_SIZE}",
            plaintext.len(),
        )));
    }
    for (i, hop) in path.iter().enumerate() {
        let is_last = i == NUM_HOPS - 1;
        match (&hop.routing, is_last) {
            (RoutingCommand::Forward { .. }, false) | (RoutingCommand::Deliver { .. }, true) => {}
            _ => {
                return Err(TransportError::InvalidPacket(format!(
                    "hop {i} carries the wrong routing command kind",
                )));
            }
        }
    }

    // Ephemeral keys and per-hop key schedules.
    let mut eph_publics = Vec::with_capacity(NUM_HOPS);
    let mut hop_keys = Vec::with_capacity(NUM_HOPS);
    for hop in path.iter() {
        let eph_secret = X25519StaticSecret::random();
        let eph_public = eph_secret.public_key();
        let shared = eph_secret.diffie_hellman(&hop.public_key);
        hop_keys.push(HopKeys::derive(shared.as_bytes()));
        eph_publics.push(eph_public);
    }

    // Innermost payload: [len:4 LE][plaintext][deterministic pad].
    let inner_size = PAYLOAD_SIZE - NUM_HOPS * AEAD_TAG_SIZE;
    let mut inner = vec![0u8; inner_size];
    let len = u32::try_from(plaintext.len())
        .map_err(|_| TransportError::InvalidPacket("plaintext length overflow".to_string()))?;
    inner[..4].copy_from_slice(&len.to_le_bytes());
    inner[4..4 + plaintext.len()].copy_from_slice(plaintext);
    fill_pad(
        &hop_keys[NUM_HOPS - 1].hop_pad,
        &mut inner[4 + plaintext.len()..],
    );

    // Layer encryption: innermost (final hop) first, outermost (entry) last.
    let mut ciphertext = inner;
    for keys in hop_keys.iter().rev() {
        ciphertext = chacha20::encrypt(&keys.hop_key, &keys.payload_nonce, &ciphertext, &[])
            .map_err(|e| TransportError::Crypto(e.to_string()))?;
    }
    debug_assert_eq!(ciphertext.len(), PAYLOAD_SIZE);

    // Assemble the header.
    let mut packet = vec![0u8; PACKET_SIZE];
    packet[OFF_VERSION] = SPHINX_VERSION;
    packet[OFF_FLAGS] = 0;

    for (i, pk) in eph_publics.iter().enumerate() {
        let start = OFF_EPH_PKS + i * EPH_PK_SIZE;
        packet[start..start + EPH_PK_SIZE].copy_from_slice(&pk.to_bytes());
    }

    for (i, hop) in path.iter().enumerate() {
        let keys = &hop_keys[i];
        let info = hop.routing.to_bytes();
        let sealed = chacha20::encrypt(&keys.hop_key, &keys.routing_nonce, &info, &[])
            .map_err(|e| TransportError::Crypto(e.to_string()))?;
        debug_assert_eq!(sealed.len(), ROUTING_CT_SIZE);

        let rc_start = OFF_ROUTING + i * ROUTING_CT_SIZE;
        packet[rc_start..rc_start + ROUTING_CT_SIZE].copy_from_slice(&sealed);

        let eph_start = OFF_EPH_PKS + i * EPH_PK_SIZE;
        let tag = keys.recognition_tag(
            &packet[eph_start..eph_start + EPH_PK_SIZE],
            &packet[rc_start..rc_start + ROUTING_CT_SIZE],
        );
        let mac_start = OFF_MACS + i * MAC_TAG_SIZE;
        packet[mac_start..mac_start + MAC_TAG_SIZE].copy_from_slice(&tag);
    }

    packet[OFF_PAYLOAD..].copy_from_slice(&ciphertext);
    Ok(packet)
}

/// Unwrap one layer of a Sphinx packet with a mix key.
///
/// The relay trial-matches every hop slot's recognition tag under the
/// shared secret computed from that slot's ephemeral key. A matching slot
/// yields the routing command, the replay tag, and either the rewrapped
/// packet (forward) or the plaintext (deliver).
///
/// # Errors
///
/// Returns [`TransportError::InvalidPacket`] for malformed packets and
/// [`TransportError::MacVerification`] if no slot authenticates under this
/// key; the caller should try its other candidate mix keys.
pub fn process_packet(
    our_secret: &X25519StaticSecret,
    packet: &[u8],
) -> Result<Unwrapped, TransportError> {
    if packet.len() != PACKET_SIZE {
        return Err(TransportError::InvalidPacket(format!(
            "wrong packet size: {} bytes, need {PACKET_SIZE}",
            packet.len(),
        )));
    }
    if packet[OFF_VERSION] != SPHINX_VERSION {
        return Err(TransportError::InvalidPacket(format!(
            "unsupported sphinx version {}",
            packet[OFF_VERSION],
        )));
    }

    for slot in 0..NUM_HOPS {
        let eph_start = OFF_EPH_PKS + slot * EPH_PK_SIZE;
        let mut eph_pk_bytes = [0u8; EPH_PK_SIZE];
        eph_pk_bytes.copy_from_slice(&packet[eph_start..eph_start + EPH_PK_SIZE]);
        let eph_pk = X25519PublicKey::from_bytes(eph_pk_bytes);

        let shared = our_secret.diffie_hellman(&eph_pk);
        let keys = HopKeys::derive(shared.as_bytes());

        let rc_start = OFF_ROUTING + slot * ROUTING_CT_SIZE;
        let routing_ct = &packet[rc_start..rc_start + ROUTING_CT_SIZE];
        let expected = keys.recognition_tag(&eph_pk_bytes, routing_ct);
        let mac_start = OFF_MACS + slot * MAC_TAG_SIZE;
        if packet[mac_start..mac_start + MAC_TAG_SIZE] != expected {
            continue;
        }

        return unwrap_slot(packet, slot, &keys, routing_ct);
    }

    Err(TransportError::MacVerification)
}

fn unwrap_slot(
    packet: &[u8],
    slot: usize,
    keys: &HopKeys,
    routing_ct: &[u8],
) -> Result<Unwrapped, TransportError> {
    let info = chacha20::decrypt(&keys.hop_key, &keys.routing_nonce, routing_ct, &[])
        .map_err(|_| TransportError::MacVerification)?;
    let routing = RoutingCommand::from_bytes(&info)?;

    // At slot i the payload ciphertext occupies the first
    // PAYLOAD_SIZE - i * 16 bytes of the payload region.
    let ct_len = PAYLOAD_SIZE - slot * AEAD_TAG_SIZE;
    let payload_ct = &packet[OFF_PAYLOAD..OFF_PAYLOAD + ct_len];
    let payload = chacha20::decrypt(&keys.hop_key, &keys.payload_nonce, payload_ct, &[])
        .map_err(|_| TransportError::MacVerification)?;

    match routing {
        RoutingCommand::Forward {
            next_node_id,
            delay_ms,
        } => {
            let mut out = packet.to_vec();
            out[OFF_PAYLOAD..OFF_PAYLOAD + payload.len()].copy_from_slice(&payload);
            for b in &mut out[OFF_PAYLOAD + payload.len()..] {
                *b = 0;
            }
            Ok(Unwrapped {
                replay_tag: keys.replay_tag,
                command: UnwrappedCommand::Forward {
                    next_node_id,
                    delay_ms,
                    packet: out,
                },
            })
        }
        RoutingCommand::Deliver { recipient } => {
            if payload.len() < 4 {
                return Err(TransportError::InvalidPacket(
                    "delivered payload shorter than length prefix".to_string(),
                ));
            }
            let mut len_buf = [0u8; 4];
            len_buf.copy_from_slice(&payload[..4]);
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > payload.len() - 4 {
                return Err(TransportError::InvalidPacket(format!(
                    "delivered payload length {len} exceeds capacity {}",
                    payload.len() - 4,
                )));
            }
            Ok(Unwrapped {
                replay_tag: keys.replay_tag,
                command: UnwrappedCommand::Deliver {
                    recipient,
                    plaintext: payload[4..4 + len].to_vec(),
                },
            })
        }
    }
}

/// Fill a buffer with deterministic padding derived from a pad key.
fn fill_pad(pad_key: &[u8; 32], out: &mut [u8]) {
    let mut offset = 0usize;
    let mut ctr: u32 = 0;
    while offset < out.len() {
        let block = vb3::keyed_hash(pad_key, &ctr.to_le_bytes());
        let n = (out.len() - offset).min(block.len());
        out[offset..offset + n].copy_from_slice(&block[..n]);
        offset += n;
        ctr = ctr.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward_to(id_byte: u8, delay_ms: u32) -> RoutingCommand {
        RoutingCommand::Forward {
            next_node_id: [id_byte; 32],
            delay_ms,
        }
    }

    fn three_hop_path(
        keys: &[X25519StaticSecret; NUM_HOPS],
        recipient: [u8; 64],
    ) -> [PathHop; NUM_HOPS] {
        [
            PathHop {
                public_key: keys[0].public_key(),
                routing: forward_to(0xb1, 150),
            },
            PathHop {
                public_key: keys[1].public_key(),
                routing: forward_to(0xc2, 75),
            },
            PathHop {
                public_key: keys[2].public_key(),
                routing: RoutingCommand::Deliver { recipient },
            },
        ]
    }

    fn mix_keys() -> [X25519StaticSecret; NUM_HOPS] {
        [
            X25519StaticSecret::random(),
            X25519StaticSecret::random(),
            X25519StaticSecret::random(),
        ]
    }

    #[test]
    fn test_layout_constants() {
        assert_eq!(OFF_MACS + NUM_HOPS * MAC_TAG_SIZE, 497);
        assert!(OFF_MACS + NUM_HOPS * MAC_TAG_SIZE <= HEADER_SIZE);
        assert_eq!(HEADER_SIZE + PAYLOAD_SIZE, PACKET_SIZE);
    }

    #[test]
    fn test_three_hop_round_trip() {
        let keys = mix_keys();
        let recipient = [0x5a; 64];
        let path = three_hop_path(&keys, recipient);
        let packet = build_packet(&path, b"hello across the mix").expect("build");
        assert_eq!(packet.len(), PACKET_SIZE);

        let hop0 = process_packet(&keys[0], &packet).expect("hop 0");
        let (next0, delay0, packet1) = match hop0.command {
            UnwrappedCommand::Forward {
                next_node_id,
                delay_ms,
                packet,
            } => (next_node_id, delay_ms, packet),
            UnwrappedCommand::Deliver { .. } => panic!("hop 0 delivered"),
        };
        assert_eq!(next0, [0xb1; 32]);
        assert_eq!(delay0, 150);
        assert_eq!(packet1.len(), PACKET_SIZE);

        let hop1 = process_packet(&keys[1], &packet1).expect("hop 1");
        let (next1, delay1, packet2) = match hop1.command {
            UnwrappedCommand::Forward {
                next_node_id,
                delay_ms,
                packet,
            } => (next_node_id, delay_ms, packet),
            UnwrappedCommand::Deliver { .. } => panic!("hop 1 delivered"),
        };
        assert_eq!(next1, [0xc2; 32]);
        assert_eq!(delay1, 75);

        let hop2 = process_packet(&keys[2], &packet2).expect("hop 2");
        match hop2.command {
            UnwrappedCommand::Deliver {
                recipient: r,
                plaintext,
            } => {
                assert_eq!(r, recipient);
                assert_eq!(plaintext, b"hello across the mix");
            }
            UnwrappedCommand::Forward { .. } => panic!("hop 2 forwarded"),
        }
    }

    #[test]
    fn test_replay_tag_stable_across_duplicate_processing() {
        let keys = mix_keys();
        let path = three_hop_path(&keys, [0u8; 64]);
        let packet = build_packet(&path, b"dup").expect("build");

        let a = process_packet(&keys[0], &packet).expect("first");
        let b = process_packet(&keys[0], &packet).expect("second");
        assert_eq!(a.replay_tag, b.replay_tag);
    }

    #[test]
    fn test_replay_tags_differ_across_hops() {
        let keys = mix_keys();
        let path = three_hop_path(&keys, [0u8; 64]);
        let packet = build_packet(&path, b"x").expect("build");

        let hop0 = process_packet(&keys[0], &packet).expect("hop 0");
        let next = match hop0.command {
            UnwrappedCommand::Forward { packet, .. } => packet,
            UnwrappedCommand::Deliver { .. } => panic!("delivered"),
        };
        let hop1 = process_packet(&keys[1], &next).expect("hop 1");
        assert_ne!(hop0.replay_tag, hop1.replay_tag);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let keys = mix_keys();
        let path = three_hop_path(&keys, [0u8; 64]);
        let packet = build_packet(&path, b"x").expect("build");

        let stranger = X25519StaticSecret::random();
        assert!(matches!(
            process_packet(&stranger, &packet),
            Err(TransportError::MacVerification),
        ));
    }

    #[test]
    fn test_wrong_size_rejected() {
        let stranger = X25519StaticSecret::random();
        assert!(matches!(
            process_packet(&stranger, &[0u8; 100]),
            Err(TransportError::InvalidPacket(_)),
        ));
    }

    #[test]
    fn test_bad_version_rejected() {
        let keys = mix_keys();
        let path = three_hop_path(&keys, [0u8; 64]);
        let mut packet = build_packet(&path, b"x").expect("build");
        packet[0] = 9;
        assert!(matches!(
            process_packet(&keys[0], &packet),
            Err(TransportError::InvalidPacket(_)),
        ));
    }

    #[test]
    fn test_plaintext_too_large_rejected() {
        let keys = mix_keys();
        let path = three_hop_path(&keys, [0u8; 64]);
        let oversized = vec![0u8; MAX_PLAINTEXT_SIZE + 1];
        assert!(build_packet(&path, &oversized).is_err());
    }

    #[test]
    fn test_max_plaintext_round_trip() {
        let keys = mix_keys();
        let path = three_hop_path(&keys, [0x11; 64]);
        let payload = vec![0xabu8; MAX_PLAINTEXT_SIZE];
        let packet = build_packet(&path, &payload).expect("build");

        let mut current = packet;
        for key in &keys[..NUM_HOPS - 1] {
            current = match process_packet(key, &current).expect("forward").command {
                UnwrappedCommand::Forward { packet, .. } => packet,
                UnwrappedCommand::Deliver { .. } => panic!("early delivery"),
            };
        }
        match process_packet(&keys[NUM_HOPS - 1], &current)
            .expect("deliver")
            .command
        {
            UnwrappedCommand::Deliver { plaintext, .. } => assert_eq!(plaintext, payload),
            UnwrappedCommand::Forward { .. } => panic!("final hop forwarded"),
        }
    }

    #[test]
    fn test_routing_command_encode_round_trip() {
        let fwd = forward_to(0x42, 12345);
        assert_eq!(
            RoutingCommand::from_bytes(&fwd.to_bytes()).expect("forward"),
            fwd,
        );

        let del = RoutingCommand::Deliver {
            recipient: [0x99; 64],
        };
        assert_eq!(
            RoutingCommand::from_bytes(&del.to_bytes()).expect("deliver"),
            del,
        );
    }

    #[test]
    fn test_tampered_routing_rejected() {
        let keys = mix_keys();
        let path = three_hop_path(&keys, [0u8; 64]);
        let mut packet = build_packet(&path, b"x").expect("build");
        // Flip a bit inside slot 0's sealed routing info; the recognition
        // tag no longer matches, so no slot authenticates.
        packet[OFF_ROUTING] ^= 1;
        assert!(matches!(
            process_packet(&keys[0], &packet),
            Err(TransportError::MacVerification),
        ));
    }
}
