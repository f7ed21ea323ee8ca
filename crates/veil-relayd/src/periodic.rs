//! 1 Hz heartbeat driving epoch-boundary work.
//!
//! Every second the timer runs the mix key rotation check; when the active
//! set changed it posts a reshadow command to every crypto worker's
//! mailbox. Observers are idempotent with respect to ticks, so a missed or
//! doubled tick is harmless.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::debug;

use veil_mixkey::MixKeyStore;
use veil_types::epoch::EpochTime;

use crate::worker::WorkerCmd;

/// Tick interval.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to the periodic timer task.
pub struct PeriodicTimer {
    handle: Option<JoinHandle<()>>,
    halt_tx: broadcast::Sender<()>,
}

impl PeriodicTimer {
    /// Start ticking. `mailboxes` are the crypto workers' command inboxes;
    /// the rotation result is published to each rather than mutating any
    /// worker-visible state directly.
    pub fn spawn(mix_keys: Arc<MixKeyStore>, mailboxes: Vec<mpsc::Sender<WorkerCmd>>) -> Self {
        let (halt_tx, mut halt_rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = halt_rx.recv() => {
                        debug!("periodic timer terminating");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                // Anti-replay is a safety property; failing to rotate the
                // keys that back it is not survivable.
                let changed = mix_keys
                    .rotate(EpochTime::now())
                    .unwrap_or_else(|e| panic!("BUG: mix key rotation failed: {e}"));
                if changed {
                    debug!("mix key set changed, re-shadowing crypto workers");
                    for mailbox in &mailboxes {
                        let _ = mailbox.try_send(WorkerCmd::Reshadow);
                    }
                }
            }
        });

        Self {
            handle: Some(handle),
            halt_tx,
        }
    }

    /// Stop the timer.
    pub async fn halt(&mut self) {
        let _ = self.halt_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
