//! The in-flight packet and drop accounting.
//!
//! A packet is exclusively owned by exactly one pipeline stage at a time:
//! created by a listener, queued on the ingress channel, unwrapped by a
//! crypto worker, held by the scheduler until its send deadline, then
//! handed to the connector which drops it after transmission or expiry.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;

/// A packet as received from a peer, before unwrapping.
pub struct IngressPacket {
    /// When the listener read the packet off the wire.
    pub arrival: Instant,
    /// The raw fixed-size packet bytes.
    pub payload: Vec<u8>,
}

/// Packet-drop counters, reported through logs. Every drop is silent on
/// the wire: peers get no feedback.
#[derive(Debug, Default)]
pub struct Counters {
    /// Packets shed at the ingress queue's high-water mark.
    pub ingress_shed: AtomicU64,
    /// Packets that failed to unwrap under every candidate mix key.
    pub unwrap_failures: AtomicU64,
    /// Packets dropped by the anti-replay check.
    pub replay_drops: AtomicU64,
    /// Packets whose next hop is not in the current consensus.
    pub invalid_dest_drops: AtomicU64,
    /// Packets shed at the scheduler input.
    pub scheduler_drops: AtomicU64,
    /// Packets dropped because the next hop had no live session.
    pub no_session_drops: AtomicU64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increments() {
        let counters = Counters::default();
        Counters::incr(&counters.replay_drops);
        Counters::incr(&counters.replay_drops);
        assert_eq!(counters.replay_drops.load(Ordering::Relaxed), 2);
        assert_eq!(counters.unwrap_failures.load(Ordering::Relaxed), 0);
    }
}
