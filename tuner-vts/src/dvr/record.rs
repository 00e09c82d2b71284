//! Record driver: drains a record queue into an accumulation buffer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use tuner_hal_protocol::{notify, FlagWaitError, RecordStatus, StreamQueue};

use super::{DataflowError, DriverState, Transfer};
use crate::error::ScenarioError;

/// Local signal bit raised when the device reported an overflow.
const FLUSH_REQUEST: u32 = notify::LOCAL_BASE;

/// Asks the device to flush the record dvr. Runs on the record worker thread.
pub type FlushHook = Box<dyn Fn() -> Result<(), ScenarioError> + Send + Sync>;

/// Result of a finished record run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSummary {
    pub bytes: usize,
    pub batches: u64,
    pub flushes: u64,
}

struct RecordState {
    driver: DriverState,
    output: BytesMut,
    batches: u64,
    flushes: u64,
    last_status: Option<RecordStatus>,
}

struct RecordShared {
    queue: Arc<StreamQueue>,
    running: AtomicBool,
    overflow_pending: AtomicBool,
    state: Mutex<RecordState>,
    cond: Condvar,
}

impl RecordShared {
    fn drain(&self, chunk: &mut [u8]) {
        loop {
            let n = self.queue.read(chunk);
            if n == 0 {
                return;
            }
            let mut state = self.state.lock();
            state.output.extend_from_slice(&chunk[..n]);
            state.batches += 1;
            self.cond.notify_all();
        }
    }
}

/// Flow-control handle given to the indication dispatcher.
#[derive(Clone)]
pub struct RecordFlow {
    shared: Arc<RecordShared>,
}

impl RecordFlow {
    /// Apply a record status indication; an overflow schedules a flush.
    pub fn on_status(&self, status: RecordStatus) {
        let previous = self.shared.state.lock().last_status.replace(status);
        if previous != Some(status) {
            debug!("[Record] status {:?}", status);
        }
        if status == RecordStatus::Overflow {
            warn!("[Record] queue overflow reported, scheduling flush");
            self.shared.overflow_pending.store(true, Ordering::Release);
            self.shared.queue.flag().wake(FLUSH_REQUEST);
        }
    }

    pub fn last_status(&self) -> Option<RecordStatus> {
        self.shared.state.lock().last_status
    }
}

/// Drains a record queue on a worker thread.
pub struct RecordDriver {
    shared: Arc<RecordShared>,
    wait: Duration,
    worker: Option<JoinHandle<()>>,
}

impl RecordDriver {
    /// `wait` bounds one wait for `DATA_READY` before the worker re-checks for stop.
    pub fn new(queue: Arc<StreamQueue>, wait: Duration) -> Self {
        Self {
            shared: Arc::new(RecordShared {
                queue,
                running: AtomicBool::new(false),
                overflow_pending: AtomicBool::new(false),
                state: Mutex::new(RecordState {
                    driver: DriverState::Idle,
                    output: BytesMut::new(),
                    batches: 0,
                    flushes: 0,
                    last_status: None,
                }),
                cond: Condvar::new(),
            }),
            wait,
            worker: None,
        }
    }

    pub fn flow(&self) -> RecordFlow {
        RecordFlow { shared: Arc::clone(&self.shared) }
    }

    pub fn state(&self) -> DriverState {
        self.shared.state.lock().driver
    }

    /// Start draining. `flush` is invoked after an overflow indication.
    pub fn start(&mut self, flush: Option<FlushHook>) -> Result<(), DataflowError> {
        if self.worker.is_some() {
            return Err(DataflowError::AlreadyRunning);
        }
        {
            let mut state = self.shared.state.lock();
            state.driver = DriverState::Running;
            state.output.clear();
            state.batches = 0;
            state.flushes = 0;
        }
        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let wait = self.wait;
        let worker = thread::Builder::new()
            .name("record-output".to_string())
            .spawn(move || run(shared, wait, flush))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                self.shared.state.lock().driver = DriverState::Idle;
                DataflowError::Spawn(e)
            })?;
        info!("[Record] started draining record queue");
        self.worker = Some(worker);
        Ok(())
    }

    /// Wait until at least `min_bytes` were recorded or `timeout` elapsed.
    pub fn test_output(&self, min_bytes: usize, timeout: Duration) -> Result<Transfer, DataflowError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.output.len() < min_bytes.max(1) {
            if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        match state.output.len() {
            0 => Err(DataflowError::NoData(timeout)),
            n if n >= min_bytes => Ok(Transfer::Complete(n)),
            n => Ok(Transfer::Partial(n)),
        }
    }

    /// Snapshot of everything recorded so far.
    pub fn output(&self) -> Bytes {
        self.shared.state.lock().output.clone().freeze()
    }

    /// Stop the worker and join it.
    pub fn stop(&mut self) -> RecordSummary {
        self.shared.state.lock().driver = DriverState::Stopping;
        self.shared.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("[Record] worker thread panicked");
            }
        }
        let mut state = self.shared.state.lock();
        state.driver = DriverState::Idle;
        let summary = RecordSummary {
            bytes: state.output.len(),
            batches: state.batches,
            flushes: state.flushes,
        };
        info!(
            "[Record] stopped after {} bytes in {} batch(es), {} flush(es)",
            summary.bytes, summary.batches, summary.flushes
        );
        summary
    }
}

impl Drop for RecordDriver {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

fn run(shared: Arc<RecordShared>, wait: Duration, flush: Option<FlushHook>) {
    let mut chunk = vec![0u8; shared.queue.capacity().max(1)];
    while shared.running.load(Ordering::Acquire) {
        match shared.queue.flag().wait(notify::DATA_READY | FLUSH_REQUEST, wait, true) {
            Ok(bits) => {
                shared.drain(&mut chunk);
                if bits & FLUSH_REQUEST != 0 && shared.overflow_pending.swap(false, Ordering::AcqRel) {
                    match flush.as_ref().map(|hook| hook()) {
                        Some(Ok(())) => {
                            shared.state.lock().flushes += 1;
                            debug!("[Record] flushed after overflow");
                        }
                        Some(Err(e)) => warn!("[Record] flush after overflow failed: {}", e),
                        None => warn!("[Record] overflow reported but no flush hook installed"),
                    }
                }
            }
            Err(FlagWaitError::TimedOut) | Err(FlagWaitError::Spurious) => {
                // Data committed without a wake is still picked up.
                shared.drain(&mut chunk);
            }
        }
    }
    shared.drain(&mut chunk);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_collects_device_writes() {
        let queue = Arc::new(StreamQueue::new(4096));
        let mut driver = RecordDriver::new(Arc::clone(&queue), Duration::from_millis(20));
        driver.start(None).unwrap();

        let device = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..3u8 {
                    assert_eq!(queue.write(&[i; 188]), 188);
                    thread::sleep(Duration::from_millis(10));
                }
            })
        };
        device.join().unwrap();

        assert_eq!(
            driver.test_output(3 * 188, Duration::from_secs(2)).unwrap(),
            Transfer::Complete(3 * 188)
        );
        let summary = driver.stop();
        assert_eq!(summary.bytes, 3 * 188);
        let output = driver.output();
        assert_eq!(output[0], 0);
        assert_eq!(output[2 * 188], 2);
    }

    #[test]
    fn test_timeout_without_data() {
        let mut driver = RecordDriver::new(Arc::new(StreamQueue::new(1024)), Duration::from_millis(10));
        driver.start(None).unwrap();
        let err = driver.test_output(188, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, DataflowError::NoData(_)));
        driver.stop();
        assert_eq!(driver.state(), DriverState::Idle);
    }

    #[test]
    fn test_partial_transfer() {
        let queue = Arc::new(StreamQueue::new(1024));
        let mut driver = RecordDriver::new(Arc::clone(&queue), Duration::from_millis(10));
        driver.start(None).unwrap();
        queue.write(&[0x47; 188]);
        assert_eq!(
            driver.test_output(1000, Duration::from_millis(200)).unwrap(),
            Transfer::Partial(188)
        );
        driver.stop();
    }

    #[test]
    fn test_overflow_triggers_flush() {
        let queue = Arc::new(StreamQueue::new(1024));
        let mut driver = RecordDriver::new(Arc::clone(&queue), Duration::from_millis(10));
        let flushes = Arc::new(AtomicUsize::new(0));
        let hook: FlushHook = {
            let flushes = Arc::clone(&flushes);
            Box::new(move || {
                flushes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        driver.start(Some(hook)).unwrap();

        driver.flow().on_status(RecordStatus::Overflow);
        let deadline = Instant::now() + Duration::from_secs(2);
        while flushes.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let summary = driver.stop();
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
        assert_eq!(summary.flushes, 1);
        assert_eq!(driver.flow().last_status(), Some(RecordStatus::Overflow));
    }
}
