//! Signal word shared by the two ends of a stream queue.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::FlagWaitError;

/// Bits raised on the signal word of a [`crate::StreamQueue`].
pub mod notify {
    /// The producer committed new bytes.
    pub const DATA_READY: u32 = 1 << 0;
    /// The consumer freed space.
    pub const DATA_CONSUMED: u32 = 1 << 1;
    /// Bits from here up belong to the local side and are never raised by the device.
    pub const LOCAL_BASE: u32 = 1 << 16;
}

/// Bitmask signal word with wait-for-bits semantics.
///
/// Waking sets bits and notifies every waiter; a successful wait clears the
/// bits it consumed. Waiters re-check their bits after every wake, since the
/// word is shared with unrelated producer activity.
#[derive(Debug, Default)]
pub struct EventFlag {
    word: Mutex<u32>,
    cond: Condvar,
}

impl EventFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise `bits` and wake all waiters.
    pub fn wake(&self, bits: u32) {
        let mut word = self.word.lock();
        *word |= bits;
        self.cond.notify_all();
    }

    /// Current value of the word, without consuming anything.
    pub fn peek(&self) -> u32 {
        *self.word.lock()
    }

    /// Wait until any of `bits` is raised, then clear and return the raised subset.
    ///
    /// With `retry_on_spurious` a wake that leaves `bits` clear keeps waiting
    /// for the remainder of the timeout; otherwise it returns
    /// [`FlagWaitError::Spurious`].
    pub fn wait(
        &self,
        bits: u32,
        timeout: Duration,
        retry_on_spurious: bool,
    ) -> Result<u32, FlagWaitError> {
        let deadline = Instant::now() + timeout;
        let mut word = self.word.lock();
        loop {
            let hit = *word & bits;
            if hit != 0 {
                *word &= !hit;
                return Ok(hit);
            }
            let timed_out = self.cond.wait_until(&mut word, deadline).timed_out();
            let hit = *word & bits;
            if hit != 0 {
                *word &= !hit;
                return Ok(hit);
            }
            if timed_out {
                return Err(FlagWaitError::TimedOut);
            }
            if !retry_on_spurious {
                return Err(FlagWaitError::Spurious);
            }
        }
    }
}
