//! Epoch arithmetic.
//!
//! Time is partitioned into fixed 1-hour windows counted from the Unix
//! epoch. Mix keys and PKI documents are scoped to one epoch; the grace
//! windows around a transition are computed from the elapsed/remaining
//! durations carried by [`EpochTime`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::EPOCH_DURATION_SECS;

/// A point in epoch time: the current epoch counter plus how far into the
/// epoch the clock is and how long remains until the next transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EpochTime {
    /// The current epoch counter.
    pub epoch: u64,
    /// Time elapsed since the epoch began.
    pub elapsed: Duration,
    /// Time remaining until the next epoch begins.
    pub till: Duration,
}

impl EpochTime {
    /// The epoch state at the current wall-clock time.
    pub fn now() -> Self {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::at(unix.as_secs())
    }

    /// The epoch state at an arbitrary Unix time, in seconds.
    pub fn at(unix_secs: u64) -> Self {
        let epoch = unix_secs / EPOCH_DURATION_SECS;
        let elapsed_secs = unix_secs % EPOCH_DURATION_SECS;
        Self {
            epoch,
            elapsed: Duration::from_secs(elapsed_secs),
            till: Duration::from_secs(EPOCH_DURATION_SECS - elapsed_secs),
        }
    }

    /// The Unix time, in seconds, at which the given epoch begins.
    pub fn epoch_start(epoch: u64) -> u64 {
        epoch * EPOCH_DURATION_SECS
    }
}
