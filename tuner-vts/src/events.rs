//! Aggregation of filter event batches and predicate waiters.
//!
//! The device delivers filter events in batches on its callback thread.
//! [`EventAggregator::on_event`] records them under a single mutex, bumps
//! the counters, and fulfils every registered waiter whose predicate matches
//! the batch. Waiters are single-shot: a fulfilled waiter is removed, and a
//! batch that arrived before a waiter was registered never fulfils it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tuner_hal_protocol::{EventRecord, EventTag, MediaEvent, MonitorEvent};

/// Predicate evaluated against each delivered batch.
pub type EventPredicate = Box<dyn Fn(&[EventRecord]) -> bool + Send>;

/// The awaited condition did not occur in time.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Event did not arrive within {0:?}")]
pub struct WaitElapsed(pub Duration);

struct Waiter {
    id: u64,
    predicate: EventPredicate,
}

/// Counts consumed by the counter waits.
#[derive(Debug, Default, Clone, Copy)]
struct Pending {
    output: u64,
    scrambling: u64,
    ip_cid: u64,
    start_id: u64,
}

#[derive(Default)]
struct AggregatorState {
    counters: HashMap<EventTag, u64>,
    batches: u64,
    pending: Pending,
    last_media: Option<MediaEvent>,
    last_record: Option<EventRecord>,
    last_start_id: Option<i32>,
    waiters: Vec<Waiter>,
    fulfilled: HashSet<u64>,
    next_waiter: u64,
}

struct Shared {
    state: Mutex<AggregatorState>,
    cond: Condvar,
}

/// Collects the event stream of one filter.
#[derive(Clone)]
pub struct EventAggregator {
    shared: Arc<Shared>,
}

impl Default for EventAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl EventAggregator {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(AggregatorState::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Record one batch and fulfil matching waiters.
    pub fn on_event(&self, batch: &[EventRecord]) {
        let mut state = self.shared.state.lock();
        state.batches += 1;
        if batch.iter().any(EventRecord::is_output) {
            state.pending.output += 1;
        }
        for event in batch {
            *state.counters.entry(event.tag()).or_insert(0) += 1;
            match event {
                EventRecord::Media(media) => state.last_media = Some(media.clone()),
                EventRecord::TsRecord(_) | EventRecord::MmtpRecord(_) => {
                    state.last_record = Some(event.clone())
                }
                EventRecord::Monitor(MonitorEvent::ScramblingStatus(_)) => {
                    state.pending.scrambling += 1
                }
                EventRecord::Monitor(MonitorEvent::IpCid(_)) => state.pending.ip_cid += 1,
                EventRecord::StartId(id) => {
                    state.last_start_id = Some(*id);
                    state.pending.start_id += 1;
                }
                EventRecord::Section(_) | EventRecord::Pes(_) => {}
            }
        }

        let mut matched = Vec::new();
        state.waiters.retain(|waiter| {
            if (waiter.predicate)(batch) {
                matched.push(waiter.id);
                false
            } else {
                true
            }
        });
        if !matched.is_empty() {
            debug!("[EventAggregator] batch fulfilled {} waiter(s)", matched.len());
        }
        state.fulfilled.extend(matched);
        trace!("[EventAggregator] batch of {} event(s)", batch.len());
        self.shared.cond.notify_all();
    }

    /// Register a single-shot waiter for the next batch matching `predicate`.
    pub fn wait_for<F>(&self, predicate: F) -> EventWait
    where
        F: Fn(&[EventRecord]) -> bool + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        let id = state.next_waiter;
        state.next_waiter += 1;
        state.waiters.push(Waiter { id, predicate: Box::new(predicate) });
        EventWait { id, shared: Arc::clone(&self.shared) }
    }

    fn wait_pending(
        &self,
        timeout: Duration,
        select: impl Fn(&mut Pending) -> &mut u64,
    ) -> Result<(), WaitElapsed> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while *select(&mut state.pending) == 0 {
            if self.shared.cond.wait_until(&mut state, deadline).timed_out()
                && *select(&mut state.pending) == 0
            {
                return Err(WaitElapsed(timeout));
            }
        }
        *select(&mut state.pending) = 0;
        Ok(())
    }

    /// Wait until a batch carrying data arrived since the last call.
    ///
    /// Batches holding only monitor or start id events do not count.
    pub fn wait_for_output(&self, timeout: Duration) -> Result<(), WaitElapsed> {
        self.wait_pending(timeout, |p| &mut p.output)
    }

    /// Wait for a scrambling status monitor event.
    pub fn wait_for_scrambling_status(&self, timeout: Duration) -> Result<(), WaitElapsed> {
        self.wait_pending(timeout, |p| &mut p.scrambling)
    }

    /// Wait for an IP context id change monitor event.
    pub fn wait_for_ip_cid_change(&self, timeout: Duration) -> Result<(), WaitElapsed> {
        self.wait_pending(timeout, |p| &mut p.ip_cid)
    }

    /// Wait for a start id event and return the id.
    pub fn wait_for_start_id(&self, timeout: Duration) -> Result<i32, WaitElapsed> {
        self.wait_pending(timeout, |p| &mut p.start_id)?;
        Ok(self.shared.state.lock().last_start_id.unwrap_or_default())
    }

    /// Total events of `tag` seen so far.
    pub fn count(&self, tag: EventTag) -> u64 {
        self.shared.state.lock().counters.get(&tag).copied().unwrap_or(0)
    }

    pub fn batches(&self) -> u64 {
        self.shared.state.lock().batches
    }

    pub fn last_media(&self) -> Option<MediaEvent> {
        self.shared.state.lock().last_media.clone()
    }

    pub fn last_record(&self) -> Option<EventRecord> {
        self.shared.state.lock().last_record.clone()
    }

    /// Number of registered, unfulfilled waiters.
    pub fn pending_waiters(&self) -> usize {
        self.shared.state.lock().waiters.len()
    }
}

/// Handle to a registered waiter.
///
/// Dropping the handle unregisters the waiter.
pub struct EventWait {
    id: u64,
    shared: Arc<Shared>,
}

impl EventWait {
    /// Block until the waiter is fulfilled or `timeout` elapses.
    ///
    /// On timeout the waiter is removed from the aggregator.
    pub fn wait(self, timeout: Duration) -> Result<(), WaitElapsed> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if state.fulfilled.remove(&self.id) {
                return Ok(());
            }
            if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                if state.fulfilled.remove(&self.id) {
                    return Ok(());
                }
                state.waiters.retain(|w| w.id != self.id);
                return Err(WaitElapsed(timeout));
            }
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        self.shared.state.lock().fulfilled.contains(&self.id)
    }
}

impl Drop for EventWait {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.waiters.retain(|w| w.id != self.id);
        state.fulfilled.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::thread;
    use tuner_hal_protocol::{ScramblingStatus, SectionEvent};

    fn media(stream_id: u16) -> EventRecord {
        EventRecord::Media(MediaEvent {
            stream_id,
            pts: Some(90_000),
            data_length: 188,
            offset: 0,
            mpu_sequence_number: 0,
            is_secure: false,
            data: Bytes::from_static(&[0x47]),
        })
    }

    fn section() -> EventRecord {
        EventRecord::Section(SectionEvent { table_id: 0, version: 1, section_num: 0, data_length: 188 })
    }

    fn has_media(batch: &[EventRecord]) -> bool {
        batch.iter().any(|e| e.tag() == EventTag::Media)
    }

    #[test]
    fn test_waiter_fulfilled_by_later_batch() {
        let aggregator = EventAggregator::new();
        let wait = aggregator.wait_for(has_media);
        let producer = {
            let aggregator = aggregator.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                aggregator.on_event(&[section()]);
                aggregator.on_event(&[media(0x100)]);
            })
        };
        assert_eq!(wait.wait(Duration::from_secs(2)), Ok(()));
        producer.join().unwrap();
        assert_eq!(aggregator.pending_waiters(), 0);
        assert_eq!(aggregator.count(EventTag::Media), 1);
        assert_eq!(aggregator.last_media().map(|m| m.stream_id), Some(0x100));
    }

    #[test]
    fn test_waiter_is_not_retroactive() {
        let aggregator = EventAggregator::new();
        aggregator.on_event(&[media(1)]);
        let wait = aggregator.wait_for(has_media);
        assert!(!wait.is_fulfilled());
        assert_eq!(wait.wait(Duration::from_millis(30)), Err(WaitElapsed(Duration::from_millis(30))));
        assert_eq!(aggregator.pending_waiters(), 0);
    }

    #[test]
    fn test_single_shot() {
        let aggregator = EventAggregator::new();
        let first = aggregator.wait_for(has_media);
        aggregator.on_event(&[media(1)]);
        let second = aggregator.wait_for(has_media);
        aggregator.on_event(&[section()]);
        assert!(first.is_fulfilled());
        assert!(!second.is_fulfilled());
        aggregator.on_event(&[media(2)]);
        assert!(second.is_fulfilled());
        assert_eq!(aggregator.pending_waiters(), 0);
    }

    #[test]
    fn test_dropped_waiter_is_unregistered() {
        let aggregator = EventAggregator::new();
        let wait = aggregator.wait_for(has_media);
        assert_eq!(aggregator.pending_waiters(), 1);
        drop(wait);
        assert_eq!(aggregator.pending_waiters(), 0);
    }

    #[test]
    fn test_counter_waits_consume_pending() {
        let aggregator = EventAggregator::new();
        aggregator.on_event(&[
            EventRecord::Monitor(MonitorEvent::ScramblingStatus(ScramblingStatus::NotScrambled)),
            EventRecord::StartId(3),
        ]);
        let timeout = Duration::from_millis(20);
        assert_eq!(aggregator.wait_for_scrambling_status(timeout), Ok(()));
        assert_eq!(aggregator.wait_for_ip_cid_change(timeout), Err(WaitElapsed(timeout)));
        assert_eq!(aggregator.wait_for_start_id(timeout), Ok(3));

        aggregator.on_event(&[section()]);
        assert_eq!(aggregator.wait_for_output(timeout), Ok(()));
        assert_eq!(aggregator.wait_for_output(timeout), Err(WaitElapsed(timeout)));
    }

    #[test]
    fn test_notice_batches_are_not_output() {
        let aggregator = EventAggregator::new();
        let wait = aggregator.wait_for(has_media);
        aggregator.on_event(&[
            EventRecord::Monitor(MonitorEvent::ScramblingStatus(ScramblingStatus::Scrambled)),
        ]);
        aggregator.on_event(&[EventRecord::StartId(1)]);

        let timeout = Duration::from_millis(30);
        assert!(!wait.is_fulfilled());
        assert_eq!(wait.wait(timeout), Err(WaitElapsed(timeout)));
        assert_eq!(aggregator.wait_for_output(timeout), Err(WaitElapsed(timeout)));
        assert!(aggregator.last_media().is_none());
        assert_eq!(aggregator.batches(), 2);
    }
}
