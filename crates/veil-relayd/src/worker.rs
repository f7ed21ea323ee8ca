//! Sphinx unwrap worker pool.
//!
//! A fixed pool of workers pops packets off the shared ingress queue. Each
//! worker holds a *shadow* snapshot of the active mix key set so the hot
//! path never touches the store's lock; the periodic tick posts a reshadow
//! command to every worker's mailbox when the set rotates.
//!
//! Per packet: trial-unwrap under each shadowed key (most recent epoch
//! first), test-and-set the replay tag, then either validate the next hop
//! against the PKI and hand the packet to the scheduler, or hand the
//! plaintext to the provider backend.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, trace, warn};

use veil_mixkey::{MixKey, MixKeyStore};
use veil_transport::sphinx::{self, UnwrappedCommand};
use veil_transport::TransportError;
use veil_types::epoch::EpochTime;
use veil_types::node_id_to_print_string;

use crate::packet::{Counters, IngressPacket};
use crate::pki::Pki;
use crate::provider::ProviderBackend;
use crate::scheduler::Scheduler;

/// Commands posted to a worker's mailbox.
#[derive(Clone, Copy, Debug)]
pub enum WorkerCmd {
    /// Refresh the shadowed mix key set from the store.
    Reshadow,
}

/// The ingress queue's consumer half, shared by the pool.
pub type SharedIngress = Arc<Mutex<mpsc::Receiver<IngressPacket>>>;

/// Handle to one crypto worker.
pub struct CryptoWorker {
    mailbox: mpsc::Sender<WorkerCmd>,
    handle: Option<JoinHandle<()>>,
    halt_tx: broadcast::Sender<()>,
}

/// Everything a worker needs to process packets.
#[derive(Clone)]
pub struct WorkerContext {
    pub mix_keys: Arc<MixKeyStore>,
    pub pki: Arc<Pki>,
    pub scheduler: Arc<Scheduler>,
    pub provider: Option<Arc<dyn ProviderBackend>>,
    pub counters: Arc<Counters>,
}

impl CryptoWorker {
    /// Spawn one worker over the shared ingress queue.
    pub fn spawn(id: usize, ingress: SharedIngress, ctx: WorkerContext) -> Self {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(4);
        let (halt_tx, halt_rx) = broadcast::channel(1);
        let handle = tokio::spawn(worker_loop(id, ingress, mailbox_rx, halt_rx, ctx));
        Self {
            mailbox: mailbox_tx,
            handle: Some(handle),
            halt_tx,
        }
    }

    /// Post a reshadow command. Lossy: a worker that already has one
    /// pending will refresh exactly once anyway.
    pub fn reshadow(&self) {
        let _ = self.mailbox.try_send(WorkerCmd::Reshadow);
    }

    /// A clone of this worker's command mailbox, for the periodic timer's
    /// fan-out.
    pub fn mailbox(&self) -> mpsc::Sender<WorkerCmd> {
        self.mailbox.clone()
    }

    /// Stop the worker.
    pub async fn halt(&mut self) {
        let _ = self.halt_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    id: usize,
    ingress: SharedIngress,
    mut mailbox_rx: mpsc::Receiver<WorkerCmd>,
    mut halt_rx: broadcast::Receiver<()>,
    ctx: WorkerContext,
) {
    let mut shadow = shadow_keys(&ctx.mix_keys);
    debug!(worker = id, keys = shadow.len(), "crypto worker online");

    loop {
        tokio::select! {
            _ = halt_rx.recv() => {
                debug!(worker = id, "crypto worker terminating");
                return;
            }
            cmd = mailbox_rx.recv() => {
                match cmd {
                    Some(WorkerCmd::Reshadow) => {
                        shadow = shadow_keys(&ctx.mix_keys);
                        debug!(worker = id, keys = shadow.len(), "re-shadowed mix keys");
                    }
                    None => return,
                }
            }
            packet = recv_ingress(&ingress) => {
                match packet {
                    Some(packet) => process_packet(&shadow, &ctx, packet),
                    None => return,
                }
            }
        }
    }
}

async fn recv_ingress(ingress: &SharedIngress) -> Option<IngressPacket> {
    ingress.lock().await.recv().await
}

/// Snapshot the store, most recent epoch first.
fn shadow_keys(store: &MixKeyStore) -> Vec<(u64, Arc<MixKey>)> {
    let mut keys: Vec<(u64, Arc<MixKey>)> = store.snapshot().into_iter().collect();
    keys.sort_by(|a, b| b.0.cmp(&a.0));
    keys
}

fn process_packet(shadow: &[(u64, Arc<MixKey>)], ctx: &WorkerContext, packet: IngressPacket) {
    let now = EpochTime::now();

    for (epoch, key) in shadow {
        // A key older than the previous epoch must never unwrap new
        // traffic, even if the shadow is briefly stale.
        if epoch + 1 < now.epoch {
            continue;
        }

        let unwrapped = match sphinx::process_packet(key.private_key(), &packet.payload) {
            Ok(unwrapped) => unwrapped,
            Err(TransportError::MacVerification) => continue,
            Err(e) => {
                Counters::incr(&ctx.counters.unwrap_failures);
                trace!("malformed packet: {e}");
                return;
            }
        };

        if key.is_replay(&unwrapped.replay_tag) {
            Counters::incr(&ctx.counters.replay_drops);
            debug!(epoch, "replayed packet dropped");
            return;
        }

        match unwrapped.command {
            UnwrappedCommand::Forward {
                next_node_id,
                delay_ms,
                packet: rewrapped,
            } => {
                if !ctx.pki.is_valid_forward_dest(&next_node_id) {
                    Counters::incr(&ctx.counters.invalid_dest_drops);
                    debug!(
                        next_hop = %node_id_to_print_string(&next_node_id),
                        "next hop not in consensus, dropping packet"
                    );
                    return;
                }
                let deadline = packet.arrival + Duration::from_millis(u64::from(delay_ms));
                ctx.scheduler.schedule(deadline, next_node_id, rewrapped);
            }
            UnwrappedCommand::Deliver {
                recipient,
                plaintext,
            } => match &ctx.provider {
                Some(provider) => provider.deliver(recipient, plaintext),
                None => {
                    warn!("local delivery on a non-provider node, dropping");
                }
            },
        }
        return;
    }

    Counters::incr(&ctx.counters.unwrap_failures);
    trace!("packet failed to unwrap under any candidate key");
}
