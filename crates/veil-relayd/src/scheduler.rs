//! Deadline-ordered egress.
//!
//! Unwrapped forward packets arrive tagged with a send deadline (arrival
//! instant plus the mixing delay recovered from the packet). The worker
//! keeps a min-heap keyed by deadline with a single timer programmed to
//! the earliest entry; on firing it dispatches every entry whose deadline
//! has elapsed. Ties break by insertion order, and entries whose deadline
//! already passed dispatch immediately.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use veil_types::NodeId;

use crate::packet::Counters;

/// The egress seam the scheduler dispatches into. The connector implements
/// this; dispatch is fire-and-forget and must not block.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, next_hop: NodeId, packet: Vec<u8>);
}

struct Entry {
    deadline: Instant,
    seq: u64,
    next_hop: NodeId,
    packet: Vec<u8>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Handle to the scheduler task.
pub struct Scheduler {
    tx: mpsc::Sender<Entry>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    halt_tx: broadcast::Sender<()>,
    counters: Arc<Counters>,
}

impl Scheduler {
    /// Spawn the scheduler worker.
    pub fn spawn(dispatch: Arc<dyn Dispatch>, depth: usize, counters: Arc<Counters>) -> Self {
        let (tx, rx) = mpsc::channel(depth);
        let (halt_tx, halt_rx) = broadcast::channel(1);
        let handle = tokio::spawn(worker(rx, halt_rx, dispatch));
        Self {
            tx,
            handle: std::sync::Mutex::new(Some(handle)),
            halt_tx,
            counters,
        }
    }

    /// Queue a packet for dispatch no earlier than `deadline`. Best-effort:
    /// sheds (with accounting) if the scheduler is saturated.
    pub fn schedule(&self, deadline: Instant, next_hop: NodeId, packet: Vec<u8>) {
        static SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let entry = Entry {
            deadline,
            seq: SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            next_hop,
            packet,
        };
        if self.tx.try_send(entry).is_err() {
            Counters::incr(&self.counters.scheduler_drops);
            debug!("scheduler saturated, dropping packet");
        }
    }

    /// Stop the worker, dropping everything still queued.
    pub async fn halt(&self) {
        let _ = self.halt_tx.send(());
        let handle = self.handle.lock().expect("scheduler handle lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn worker(
    mut rx: mpsc::Receiver<Entry>,
    mut halt_rx: broadcast::Receiver<()>,
    dispatch: Arc<dyn Dispatch>,
) {
    // A sleep target used while the heap is empty; never actually fires
    // because the guard disables the timer arm.
    const IDLE: Duration = Duration::from_secs(3600);

    let mut heap: BinaryHeap<Reverse<Entry>> = BinaryHeap::new();

    loop {
        let next_deadline = heap
            .peek()
            .map(|Reverse(e)| e.deadline)
            .unwrap_or_else(|| Instant::now() + IDLE);
        let timer_armed = !heap.is_empty();

        tokio::select! {
            _ = halt_rx.recv() => {
                if !heap.is_empty() {
                    info!(dropped = heap.len(), "scheduler draining on halt");
                }
                return;
            }
            entry = rx.recv() => {
                match entry {
                    Some(entry) => heap.push(Reverse(entry)),
                    None => return,
                }
            }
            _ = tokio::time::sleep_until(next_deadline), if timer_armed => {
                let now = Instant::now();
                while heap.peek().is_some_and(|Reverse(e)| e.deadline <= now) {
                    if let Some(Reverse(entry)) = heap.pop() {
                        dispatch.dispatch(entry.next_hop, entry.packet);
                    }
                }
            }
        }
    }
}
