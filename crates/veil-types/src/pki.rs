//! PKI consensus document model.
//!
//! An external PKI publishes, per epoch, a signed document naming every node
//! in the network, its layer, and its identity/link keys. The relay only
//! consumes these documents; signature verification over `epoch`, `topology`,
//! and `providers` is delegated to the PKI client that fetched them.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::NodeId;

/// A node's position in the mix topology.
///
/// Packets traverse the numbered layers in order; providers sit both before
/// layer 0 and after the last layer (ingress and egress of the mix cascade).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layer {
    /// A mix layer index into [`Document::topology`].
    Mix(u8),
    /// The provider layer sentinel.
    Provider,
}

/// A single node's entry in the consensus.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixDescriptor {
    /// Human-readable node identifier, unique within the consensus.
    pub name: String,
    /// Long-lived Ed25519 identity public key; doubles as the node id.
    #[serde_as(as = "serde_with::Bytes")]
    pub identity_key: NodeId,
    /// X25519 public key authenticating the node's transport sessions.
    #[serde_as(as = "serde_with::Bytes")]
    pub link_key: [u8; 32],
    /// The node's layer assignment.
    pub layer: Layer,
    /// Network addresses the node listens on, as `host:port` strings.
    pub addresses: Vec<String>,
}

impl MixDescriptor {
    /// The node id (identity public key bytes).
    pub fn node_id(&self) -> NodeId {
        self.identity_key
    }
}

/// A signed consensus for one epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// The epoch this document is valid for.
    pub epoch: u64,
    /// Per-layer mix descriptor lists, ordered by layer index.
    pub topology: Vec<Vec<MixDescriptor>>,
    /// The provider nodes.
    pub providers: Vec<MixDescriptor>,
}

impl Document {
    /// Look up a node by its identity key, searching the topology and the
    /// provider list.
    pub fn get_node_by_key(&self, id: &NodeId) -> Option<&MixDescriptor> {
        self.topology
            .iter()
            .flatten()
            .chain(self.providers.iter())
            .find(|d| &d.identity_key == id)
    }

    /// The descriptor list for a layer.
    pub fn layer_nodes(&self, layer: Layer) -> &[MixDescriptor] {
        match layer {
            Layer::Provider => &self.providers,
            Layer::Mix(i) => self
                .topology
                .get(usize::from(i))
                .map(Vec::as_slice)
                .unwrap_or(&[]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, id_byte: u8, layer: Layer) -> MixDescriptor {
        MixDescriptor {
            name: name.to_string(),
            identity_key: [id_byte; 32],
            link_key: [id_byte ^ 0xff; 32],
            layer,
            addresses: vec![format!("127.0.0.1:{}", 30000 + u16::from(id_byte))],
        }
    }

    fn sample_doc() -> Document {
        Document {
            epoch: 100,
            topology: vec![
                vec![descriptor("mix0", 1, Layer::Mix(0))],
                vec![descriptor("mix1", 2, Layer::Mix(1))],
            ],
            providers: vec![descriptor("provider0", 9, Layer::Provider)],
        }
    }

    #[test]
    fn test_get_node_by_key() {
        let doc = sample_doc();
        assert_eq!(
            doc.get_node_by_key(&[2u8; 32]).map(|d| d.name.as_str()),
            Some("mix1"),
        );
        assert_eq!(
            doc.get_node_by_key(&[9u8; 32]).map(|d| d.name.as_str()),
            Some("provider0"),
        );
        assert!(doc.get_node_by_key(&[7u8; 32]).is_none());
    }

    #[test]
    fn test_layer_nodes() {
        let doc = sample_doc();
        assert_eq!(doc.layer_nodes(Layer::Mix(0)).len(), 1);
        assert_eq!(doc.layer_nodes(Layer::Provider).len(), 1);
        assert!(doc.layer_nodes(Layer::Mix(5)).is_empty());
    }

    #[test]
    fn test_document_cbor_round_trip() {
        let doc = sample_doc();
        let mut buf = Vec::new();
        ciborium::into_writer(&doc, &mut buf).expect("serialize");
        let parsed: Document = ciborium::from_reader(buf.as_slice()).expect("parse");
        assert_eq!(doc, parsed);
    }
}
