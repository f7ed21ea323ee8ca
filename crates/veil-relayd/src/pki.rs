//! Epoch-indexed PKI consensus cache and authentication policy.
//!
//! The cache keeps derived views for the current and imminent-next epoch
//! documents. A single worker task fetches missing documents from the
//! external PKI client; every other component reads snapshot references
//! out of the map under a short read lock and uses them lock-free.
//!
//! Authentication around an epoch transition is deliberately slack: nodes
//! listed only in the next document may connect up to 30 minutes early
//! (and send in the last 2 minutes), nodes listed only in the previous
//! document may linger 3 minutes (and send in the first 2).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use veil_transport::wire::PeerCredentials;
use veil_types::epoch::EpochTime;
use veil_types::pki::{Document, Layer, MixDescriptor};
use veil_types::{node_id_to_print_string, NodeId};

use crate::connector::Connector;

/// Allow connections from/to nodes in the next document this long before
/// the transition.
pub const EARLY_CONNECT_SLACK: Duration = Duration::from_secs(30 * 60);

/// Allow connections from/to nodes in the previous document this long
/// after the transition.
pub const LATE_CONNECT_SLACK: Duration = Duration::from_secs(3 * 60);

/// Allow inbound packets from next-document nodes this long before the
/// transition.
pub const EARLY_SEND_SLACK: Duration = Duration::from_secs(2 * 60);

/// Allow inbound packets from previous-document nodes this long after the
/// transition.
pub const LATE_SEND_SLACK: Duration = Duration::from_secs(2 * 60);

/// Fetch the next epoch's document once less than this remains.
pub const NEXT_FETCH_SLACK: Duration = Duration::from_secs(45 * 60);

/// Delay before the worker's first fetch attempt.
const INITIAL_FETCH_DELAY: Duration = Duration::from_secs(5);

/// Interval between fetch passes.
const RECHECK_INTERVAL: Duration = Duration::from_secs(60);

/// The external PKI client contract: fetch the signed, verified document
/// for one epoch. Fetches may block on the network and must stay
/// cancellable from the caller's side.
pub trait PkiClient: Send + Sync + 'static {
    fn fetch(
        &self,
        epoch: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Document>> + Send + '_>>;
}

/// Why a fetched document could not be turned into a cache entry.
#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    /// Our identity key is not listed in the document.
    #[error("we are not in the consensus for epoch {0}")]
    NotInConsensus(u64),

    /// The document carries no topology.
    #[error("document for epoch {0} is missing topology")]
    EmptyTopology(u64),

    /// Our descriptor's name does not match the configured identifier.
    #[error("name mismatch in self descriptor: '{0}'")]
    NameMismatch(String),

    /// Our descriptor's layer is nonsensical for our role.
    #[error("self layer is invalid: {0:?}")]
    InvalidLayer(Layer),
}

/// Derived view of one epoch's document.
pub struct PkiCacheEntry {
    /// The document itself.
    pub doc: Document,
    /// Our own descriptor within it.
    pub self_desc: MixDescriptor,
    /// Peers in the layer that sends to us, by node id.
    pub incoming: HashMap<NodeId, MixDescriptor>,
    /// Peers in the layer we send to, by node id.
    pub outgoing: HashMap<NodeId, MixDescriptor>,
}

impl PkiCacheEntry {
    /// Build the derived view, validating our own descriptor on the way.
    ///
    /// # Errors
    ///
    /// Returns a [`PkiError`] naming the sanity check that failed.
    pub fn new(
        doc: Document,
        our_id: &NodeId,
        identifier: &str,
        is_provider: bool,
    ) -> Result<Self, PkiError> {
        let self_desc = doc
            .get_node_by_key(our_id)
            .cloned()
            .ok_or(PkiError::NotInConsensus(doc.epoch))?;

        if doc.topology.is_empty() {
            return Err(PkiError::EmptyTopology(doc.epoch));
        }
        if self_desc.name != identifier {
            return Err(PkiError::NameMismatch(self_desc.name.clone()));
        }
        if !layer_is_sane(self_desc.layer, is_provider, doc.topology.len()) {
            return Err(PkiError::InvalidLayer(self_desc.layer));
        }

        let incoming = build_layer_map(&doc, incoming_layer(self_desc.layer, doc.topology.len()));
        let outgoing = build_layer_map(&doc, outgoing_layer(self_desc.layer, doc.topology.len()));

        Ok(Self {
            doc,
            self_desc,
            incoming,
            outgoing,
        })
    }
}

fn layer_is_sane(layer: Layer, is_provider: bool, num_layers: usize) -> bool {
    match (layer, is_provider) {
        (Layer::Provider, true) => true,
        (Layer::Provider, false) => false,
        (Layer::Mix(_), true) => false,
        (Layer::Mix(i), false) => usize::from(i) < num_layers,
    }
}

/// The layer whose nodes connect to us, with wrap-around through the
/// provider layer.
fn incoming_layer(layer: Layer, num_layers: usize) -> Layer {
    match layer {
        Layer::Provider => Layer::Mix((num_layers - 1) as u8),
        Layer::Mix(0) => Layer::Provider,
        Layer::Mix(i) => Layer::Mix(i - 1),
    }
}

/// The layer whose nodes we connect to, with wrap-around through the
/// provider layer.
fn outgoing_layer(layer: Layer, num_layers: usize) -> Layer {
    match layer {
        Layer::Provider => Layer::Mix(0),
        Layer::Mix(i) if usize::from(i) == num_layers - 1 => Layer::Provider,
        Layer::Mix(i) => Layer::Mix(i + 1),
    }
}

fn build_layer_map(doc: &Document, layer: Layer) -> HashMap<NodeId, MixDescriptor> {
    doc.layer_nodes(layer)
        .iter()
        .map(|d| (d.node_id(), d.clone()))
        .collect()
}

/// The consensus cache.
pub struct Pki {
    docs: RwLock<HashMap<u64, Arc<PkiCacheEntry>>>,
    node_id: NodeId,
    identifier: String,
    is_provider: bool,
    mix_auth_disabled: bool,
    client: Option<Arc<dyn PkiClient>>,
}

impl Pki {
    /// Construct the cache. The worker is started separately, once the
    /// connector exists, because document updates call into the connector.
    pub fn new(
        node_id: NodeId,
        identifier: String,
        is_provider: bool,
        mix_auth_disabled: bool,
        client: Option<Arc<dyn PkiClient>>,
    ) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            node_id,
            identifier,
            is_provider,
            mix_auth_disabled,
            client,
        }
    }

    /// Spawn the fetch worker.
    pub fn start_worker(
        self: Arc<Self>,
        connector: Arc<Connector>,
        mut halt_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let pki = self;
        tokio::spawn(async move {
            let client = match &pki.client {
                Some(client) => Arc::clone(client),
                None => {
                    warn!("no PKI client is configured, disabling PKI interface");
                    let _ = halt_rx.recv().await;
                    return;
                }
            };

            tokio::select! {
                _ = halt_rx.recv() => return,
                _ = tokio::time::sleep(INITIAL_FETCH_DELAY) => {}
            }

            loop {
                let mut did_update = false;
                let now = EpochTime::now();
                for epoch in pki.documents_to_fetch(now) {
                    let doc = tokio::select! {
                        _ = halt_rx.recv() => return,
                        result = client.fetch(epoch) => match result {
                            Ok(doc) => doc,
                            Err(e) => {
                                warn!(epoch, "failed to fetch PKI document: {e}");
                                continue;
                            }
                        },
                    };
                    match PkiCacheEntry::new(
                        doc,
                        &pki.node_id,
                        &pki.identifier,
                        pki.is_provider,
                    ) {
                        Ok(entry) => {
                            info!(epoch, "caching PKI document");
                            pki.insert(entry);
                            did_update = true;
                        }
                        Err(e) => {
                            warn!(epoch, "failed to derive PKI cache entry: {e}");
                        }
                    }
                }
                if did_update {
                    pki.prune(EpochTime::now());
                    // The peer sets may have changed; kick the connector.
                    connector.force_update();
                }

                tokio::select! {
                    _ = halt_rx.recv() => {
                        debug!("PKI worker terminating gracefully");
                        return;
                    }
                    _ = tokio::time::sleep(RECHECK_INTERVAL) => {}
                }
            }
        })
    }

    /// Which documents the worker should fetch right now: the current
    /// epoch's if absent, plus the next epoch's once inside the fetch
    /// slack.
    pub fn documents_to_fetch(&self, now: EpochTime) -> Vec<u64> {
        let docs = self.docs.read().expect("pki map lock");
        let mut out = Vec::with_capacity(2);
        if !docs.contains_key(&now.epoch) {
            out.push(now.epoch);
        }
        if now.till < NEXT_FETCH_SLACK && !docs.contains_key(&(now.epoch + 1)) {
            out.push(now.epoch + 1);
        }
        out
    }

    /// Store a derived entry. Far-future documents are rejected as a clock
    /// anomaly.
    pub fn insert(&self, entry: PkiCacheEntry) {
        let now = EpochTime::now();
        if entry.doc.epoch > now.epoch + 1 {
            warn!(
                epoch = entry.doc.epoch,
                "far future PKI document, clock ran backwards?"
            );
            return;
        }
        let mut docs = self.docs.write().expect("pki map lock");
        docs.insert(entry.doc.epoch, Arc::new(entry));
    }

    /// Discard entries for epochs before the current one.
    pub fn prune(&self, now: EpochTime) {
        let mut docs = self.docs.write().expect("pki map lock");
        docs.retain(|&epoch, _| {
            if epoch < now.epoch {
                debug!(epoch, "discarding stale PKI document");
                return false;
            }
            true
        });
    }

    /// Snapshot the entries for a list of epochs, preserving order.
    pub fn docs_for_epochs(&self, epochs: &[u64]) -> Vec<Arc<PkiCacheEntry>> {
        let docs = self.docs.read().expect("pki map lock");
        epochs
            .iter()
            .filter_map(|epoch| docs.get(epoch).cloned())
            .collect()
    }

    /// The epoch search set for connection-level grace: always the current
    /// epoch, plus the next inside the early slack, else the previous
    /// inside the late slack.
    fn grace_epochs(now: EpochTime) -> Vec<u64> {
        let mut epochs = vec![now.epoch];
        if now.till < EARLY_CONNECT_SLACK {
            epochs.push(now.epoch + 1);
        } else if now.elapsed < LATE_CONNECT_SLACK && now.epoch > 0 {
            epochs.push(now.epoch - 1);
        }
        epochs
    }

    /// Authenticate an inbound peer. Returns `(can_send, is_valid)`.
    pub fn authenticate_incoming(&self, creds: &PeerCredentials) -> (bool, bool) {
        self.authenticate_incoming_at(creds, EpochTime::now())
    }

    pub fn authenticate_incoming_at(
        &self,
        creds: &PeerCredentials,
        now: EpochTime,
    ) -> (bool, bool) {
        if self.mix_auth_disabled {
            debug!("incoming: blindly authenticating peer (mix auth disabled)");
            return (true, true);
        }

        let Some(id) = creds.node_id() else {
            debug!("incoming: credentials AD is not a node id");
            return (false, false);
        };

        let mut is_valid = false;
        for entry in self.docs_for_epochs(&Self::grace_epochs(now)) {
            let Some(desc) = entry.incoming.get(&id) else {
                continue;
            };
            if desc.link_key != creds.public_key {
                // The link key used for the session must match what the
                // descriptor lists; maybe another document knows better.
                warn!(
                    peer = %node_id_to_print_string(&id),
                    "incoming: link key mismatch against descriptor"
                );
                continue;
            }

            // The node is listed in a reasonably current consensus.
            is_valid = true;

            let doc_epoch = entry.doc.epoch;
            if doc_epoch == now.epoch {
                return (true, true);
            }
            if doc_epoch == now.epoch + 1 && now.till < EARLY_SEND_SLACK {
                return (true, true);
            }
            if doc_epoch + 1 == now.epoch && now.elapsed < LATE_SEND_SLACK {
                return (true, true);
            }
            // This document does not grant send yet; the other one, if
            // any, may be more forgiving.
        }

        (false, is_valid)
    }

    /// Authenticate an outbound peer. Returns `(descriptor, can_send,
    /// is_valid)`; sending is only granted by the current epoch's
    /// document. The slack exists to absorb clock skew and that is
    /// handled on the incoming side.
    pub fn authenticate_outgoing(
        &self,
        creds: &PeerCredentials,
    ) -> (Option<MixDescriptor>, bool, bool) {
        self.authenticate_outgoing_at(creds, EpochTime::now())
    }

    pub fn authenticate_outgoing_at(
        &self,
        creds: &PeerCredentials,
        now: EpochTime,
    ) -> (Option<MixDescriptor>, bool, bool) {
        if self.mix_auth_disabled {
            debug!("outgoing: blindly authenticating peer (mix auth disabled)");
            return (None, true, true);
        }

        let Some(id) = creds.node_id() else {
            return (None, false, false);
        };

        let mut found: Option<MixDescriptor> = None;
        for entry in self.docs_for_epochs(&Self::grace_epochs(now)) {
            let Some(desc) = entry.outgoing.get(&id) else {
                continue;
            };
            if desc.link_key != creds.public_key {
                warn!(
                    peer = %node_id_to_print_string(&id),
                    "outgoing: link key mismatch against descriptor"
                );
                continue;
            }

            if entry.doc.epoch == now.epoch {
                return (Some(desc.clone()), true, true);
            }
            found = Some(desc.clone());
        }

        let is_valid = found.is_some();
        (found, false, is_valid)
    }

    /// The deduplicated union of outgoing peers across the grace-epoch
    /// set. The connector keeps one session per entry.
    pub fn outgoing_destinations(&self) -> HashMap<NodeId, MixDescriptor> {
        self.outgoing_destinations_at(EpochTime::now())
    }

    pub fn outgoing_destinations_at(
        &self,
        now: EpochTime,
    ) -> HashMap<NodeId, MixDescriptor> {
        let mut out = HashMap::new();
        for entry in self.docs_for_epochs(&Self::grace_epochs(now)) {
            for desc in entry.outgoing.values() {
                out.entry(desc.node_id()).or_insert_with(|| desc.clone());
            }
        }
        out
    }

    /// Whether a forward destination is plausible: listed in the current
    /// epoch's outgoing set. This only needs to stop packets destined for
    /// la-la land from being scheduled.
    pub fn is_valid_forward_dest(&self, id: &NodeId) -> bool {
        self.is_valid_forward_dest_at(id, EpochTime::now())
    }

    pub fn is_valid_forward_dest_at(&self, id: &NodeId, now: EpochTime) -> bool {
        if self.mix_auth_disabled {
            return true;
        }
        let docs = self.docs.read().expect("pki map lock");
        match docs.get(&now.epoch) {
            Some(entry) => entry.outgoing.contains_key(id),
            None => false,
        }
    }
}
