//! Frontend lock and scan indication tracking.

use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Condvar, Mutex};
use tuner_hal_protocol::{FrontendEvent, ScanMessage};

use crate::events::WaitElapsed;

#[derive(Debug, Default)]
struct FrontendState {
    locked: bool,
    lost_lock: u32,
    scan_locked: bool,
    scan_ended: bool,
    scan_messages: Vec<ScanMessage>,
}

/// Tracks indications of one opened frontend.
#[derive(Debug, Default)]
pub struct FrontendMonitor {
    state: Mutex<FrontendState>,
    cond: Condvar,
}

impl FrontendMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(&self, event: FrontendEvent) {
        let mut state = self.state.lock();
        match event {
            FrontendEvent::Locked => state.locked = true,
            FrontendEvent::LostLock => {
                state.locked = false;
                state.lost_lock += 1;
            }
            FrontendEvent::NoSignal => state.locked = false,
        }
        debug!("[FrontendMonitor] {:?}", event);
        self.cond.notify_all();
    }

    pub fn on_scan(&self, message: ScanMessage) {
        let mut state = self.state.lock();
        match &message {
            ScanMessage::Locked(locked) => state.scan_locked |= *locked,
            ScanMessage::End(_) => state.scan_ended = true,
            ScanMessage::ProgressPercent(_) | ScanMessage::Frequencies(_) => {}
        }
        state.scan_messages.push(message);
        self.cond.notify_all();
    }

    fn wait_until(
        &self,
        timeout: Duration,
        done: impl Fn(&FrontendState) -> bool,
    ) -> Result<(), WaitElapsed> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !done(&*state) {
            if self.cond.wait_until(&mut state, deadline).timed_out() && !done(&*state) {
                return Err(WaitElapsed(timeout));
            }
        }
        Ok(())
    }

    /// Wait for the frontend to report lock.
    pub fn wait_locked(&self, timeout: Duration) -> Result<(), WaitElapsed> {
        self.wait_until(timeout, |s| s.locked)
    }

    /// Wait for the running scan to end.
    pub fn wait_scan_end(&self, timeout: Duration) -> Result<(), WaitElapsed> {
        self.wait_until(timeout, |s| s.scan_ended)
    }

    /// Forget lock and scan state before the next tune or scan.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.locked = false;
        state.scan_locked = false;
        state.scan_ended = false;
        state.scan_messages.clear();
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    pub fn scan_locked(&self) -> bool {
        self.state.lock().scan_locked
    }

    /// Frequencies reported by the last scan.
    pub fn scanned_frequencies(&self) -> Vec<u64> {
        self.state
            .lock()
            .scan_messages
            .iter()
            .filter_map(|m| match m {
                ScanMessage::Frequencies(f) => Some(f.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}
