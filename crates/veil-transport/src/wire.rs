//! Wire handshake and packet framing.
//!
//! After the QUIC connection is established, each side sends a [`Hello`]
//! frame on the session's bidirectional stream: its node id, its link
//! public key, and an Ed25519 signature binding the two under a
//! domain-separation prefix. The verified hello yields the
//! [`PeerCredentials`] that the PKI authentication policy consumes.
//!
//! Subsequent frames on the stream are Sphinx packets, length-prefixed and
//! required to be exactly [`sphinx::PACKET_SIZE`](crate::sphinx::PACKET_SIZE)
//! bytes.

use quinn::{RecvStream, SendStream};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use veil_crypto::blake3::contexts;
use veil_crypto::ed25519::{Signature, SigningKey, VerifyingKey};
use veil_types::{NodeId, NODE_ID_LEN};

use crate::quic::LinkNode;
use crate::sphinx::PACKET_SIZE;
use crate::{cbor, TransportError};

/// Current wire protocol version.
pub const WIRE_VERSION: u8 = 1;

/// Upper bound on handshake frame size.
pub const MAX_HELLO_SIZE: usize = 1024;

/// Credentials presented by an authenticated peer.
///
/// `additional_data` carries the peer's claimed node id; `public_key` is the
/// link key the peer proved possession of at the transport layer. The PKI
/// decides whether this pair is allowed to participate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Claimed node id bytes (length-validated by the PKI policy).
    pub additional_data: Vec<u8>,
    /// Link public key bytes.
    pub public_key: [u8; 32],
}

impl PeerCredentials {
    /// The credentials' node id, if `additional_data` has the right length.
    pub fn node_id(&self) -> Option<NodeId> {
        if self.additional_data.len() != NODE_ID_LEN {
            return None;
        }
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&self.additional_data);
        Some(id)
    }
}

/// The handshake frame exchanged once per session direction.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hello {
    /// Wire protocol version. Must be [`WIRE_VERSION`].
    pub version: u8,
    /// Sender's node id (identity public key bytes).
    #[serde_as(as = "serde_with::Bytes")]
    pub node_id: NodeId,
    /// Sender's link public key.
    #[serde_as(as = "serde_with::Bytes")]
    pub link_public_key: [u8; 32],
    /// Unix timestamp in seconds when the hello was created.
    pub timestamp: u64,
    /// Ed25519 signature by the sender's identity key over the transcript.
    #[serde_as(as = "serde_with::Bytes")]
    pub sig: [u8; 64],
}

fn hello_transcript(node_id: &NodeId, link_public_key: &[u8; 32], timestamp: u64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(contexts::LINK_HELLO.len() + 32 + 32 + 8);
    msg.extend_from_slice(contexts::LINK_HELLO.as_bytes());
    msg.extend_from_slice(node_id);
    msg.extend_from_slice(link_public_key);
    msg.extend_from_slice(&timestamp.to_le_bytes());
    msg
}

impl Hello {
    /// Build a signed hello for this node.
    pub fn new(identity: &SigningKey, link_public_key: [u8; 32], timestamp: u64) -> Self {
        let node_id = identity.verifying_key().to_bytes();
        let sig = identity.sign(&hello_transcript(&node_id, &link_public_key, timestamp));
        Self {
            version: WIRE_VERSION,
            node_id,
            link_public_key,
            timestamp,
            sig: sig.to_bytes(),
        }
    }

    /// Verify the hello and convert it to peer credentials.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ProtocolViolation`] on a version mismatch
    /// and [`TransportError::HandshakeAuth`] if the signature does not
    /// verify under the claimed node id.
    pub fn verify(&self) -> Result<PeerCredentials, TransportError> {
        if self.version != WIRE_VERSION {
            return Err(TransportError::ProtocolViolation(format!(
                "wire version {} != {WIRE_VERSION}",
                self.version,
            )));
        }
        let key =
            VerifyingKey::from_bytes(&self.node_id).map_err(|_| TransportError::HandshakeAuth)?;
        let sig = Signature::from_bytes(&self.sig);
        key.verify(
            &hello_transcript(&self.node_id, &self.link_public_key, self.timestamp),
            &sig,
        )
        .map_err(|_| TransportError::HandshakeAuth)?;

        Ok(PeerCredentials {
            additional_data: self.node_id.to_vec(),
            public_key: self.link_public_key,
        })
    }
}

/// Send our hello frame on a stream.
///
/// # Errors
///
/// Returns [`TransportError::Io`] if the write fails.
pub async fn send_hello(stream: &mut SendStream, hello: &Hello) -> Result<(), TransportError> {
    let bytes = cbor::to_vec(hello)?;
    LinkNode::send_message(stream, &bytes).await
}

/// Receive and verify the peer's hello frame.
///
/// # Errors
///
/// Propagates frame and CBOR errors, plus the verification errors of
/// [`Hello::verify`].
pub async fn recv_hello(stream: &mut RecvStream) -> Result<PeerCredentials, TransportError> {
    let bytes = LinkNode::recv_message(stream, MAX_HELLO_SIZE).await?;
    let hello: Hello = cbor::from_slice(&bytes)?;
    hello.verify()
}

/// Send one fixed-size Sphinx packet frame.
///
/// # Errors
///
/// Returns [`TransportError::InvalidPacket`] if the packet is not exactly
/// [`PACKET_SIZE`] bytes, [`TransportError::Io`] if the write fails.
pub async fn send_packet(stream: &mut SendStream, packet: &[u8]) -> Result<(), TransportError> {
    if packet.len() != PACKET_SIZE {
        return Err(TransportError::InvalidPacket(format!(
            "wrong packet frame size: {} bytes, need {PACKET_SIZE}",
            packet.len(),
        )));
    }
    LinkNode::send_message(stream, packet).await
}

/// Receive one fixed-size Sphinx packet frame.
///
/// # Errors
///
/// Returns [`TransportError::ProtocolViolation`] if the frame is not
/// exactly [`PACKET_SIZE`] bytes.
pub async fn recv_packet(stream: &mut RecvStream) -> Result<Vec<u8>, TransportError> {
    let bytes = LinkNode::recv_message(stream, PACKET_SIZE).await?;
    if bytes.len() != PACKET_SIZE {
        return Err(TransportError::ProtocolViolation(format!(
            "wrong packet frame size: {} bytes, need {PACKET_SIZE}",
            bytes.len(),
        )));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_crypto::ed25519::IdentityKey;
    use veil_crypto::x25519::X25519StaticSecret;

    #[test]
    fn test_hello_verify_round_trip() {
        let identity = IdentityKey::generate();
        let link = X25519StaticSecret::random();
        let hello = Hello::new(&identity.signing_key, link.public_key().to_bytes(), 1_000);

        let creds = hello.verify().expect("verify");
        assert_eq!(creds.additional_data, identity.node_id().to_vec());
        assert_eq!(creds.public_key, link.public_key().to_bytes());
        assert_eq!(creds.node_id(), Some(identity.node_id()));
    }

    #[test]
    fn test_hello_bad_version_rejected() {
        let identity = IdentityKey::generate();
        let mut hello = Hello::new(&identity.signing_key, [1u8; 32], 1_000);
        hello.version = 2;
        assert!(matches!(
            hello.verify(),
            Err(TransportError::ProtocolViolation(_)),
        ));
    }

    #[test]
    fn test_hello_tampered_link_key_rejected() {
        let identity = IdentityKey::generate();
        let mut hello = Hello::new(&identity.signing_key, [1u8; 32], 1_000);
        hello.link_public_key[0] ^= 1;
        assert!(matches!(hello.verify(), Err(TransportError::HandshakeAuth)));
    }

    #[test]
    fn test_hello_stolen_node_id_rejected() {
        // A hello signed by one identity but claiming another's node id.
        let signer = IdentityKey::generate();
        let victim = IdentityKey::generate();
        let mut hello = Hello::new(&signer.signing_key, [1u8; 32], 1_000);
        hello.node_id = victim.node_id();
        assert!(matches!(hello.verify(), Err(TransportError::HandshakeAuth)));
    }

    #[test]
    fn test_credentials_node_id_length_check() {
        let creds = PeerCredentials {
            additional_data: vec![1, 2, 3],
            public_key: [0u8; 32],
        };
        assert!(creds.node_id().is_none());
    }
}
