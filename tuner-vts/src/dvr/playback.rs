//! Playback driver: feeds an input file into a playback queue.
//!
//! The worker writes while the device permits it. Flow-control indications
//! arrive on the device callback thread through [`PlaybackFlow::on_status`];
//! the worker sleeps on a condition variable while writing is paused and on
//! the queue's `DATA_CONSUMED` bit while less than a quarter of the queue is
//! free.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use tuner_hal_protocol::{notify, PlaybackStatus, StreamQueue, WriteTransaction};

use super::{DataflowError, DriverState, Transfer};

/// Upper bound on one sleep while waiting for space.
const SPACE_WAIT: Duration = Duration::from_millis(50);
/// Upper bound on one sleep while writing is paused.
const PAUSE_WAIT: Duration = Duration::from_millis(100);

/// Why the worker stopped writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEnd {
    /// The whole input was written.
    EndOfInput,
    /// Reading the input failed.
    ReadError(String),
    /// The driver was stopped first.
    Stopped,
}

/// Result of a finished playback run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackSummary {
    pub bytes_written: usize,
    pub end: PlaybackEnd,
}

struct FlowState {
    keep_writing: bool,
    state: DriverState,
    last_status: Option<PlaybackStatus>,
    bytes_written: usize,
    end: Option<PlaybackEnd>,
}

struct PlaybackShared {
    flow: Mutex<FlowState>,
    cond: Condvar,
    running: AtomicBool,
}

impl PlaybackShared {
    /// Block while paused. Returns false once the driver is stopping.
    fn wait_for_permission(&self) -> bool {
        let mut flow = self.flow.lock();
        while self.running.load(Ordering::Acquire) && !flow.keep_writing {
            self.cond.wait_for(&mut flow, PAUSE_WAIT);
        }
        self.running.load(Ordering::Acquire)
    }

    fn add_written(&self, n: usize) {
        let mut flow = self.flow.lock();
        flow.bytes_written += n;
        self.cond.notify_all();
    }

    fn finish(&self, end: PlaybackEnd) {
        let mut flow = self.flow.lock();
        flow.end = Some(end);
        if flow.state == DriverState::Running {
            flow.state = DriverState::Idle;
        }
        self.cond.notify_all();
    }
}

/// Flow-control handle given to the indication dispatcher.
#[derive(Clone)]
pub struct PlaybackFlow {
    shared: Arc<PlaybackShared>,
}

impl PlaybackFlow {
    /// Apply a playback status indication and return the new keep-writing flag.
    pub fn on_status(&self, status: PlaybackStatus) -> bool {
        let mut flow = self.shared.flow.lock();
        flow.keep_writing = match status {
            PlaybackStatus::SpaceEmpty | PlaybackStatus::SpaceAlmostEmpty => true,
            PlaybackStatus::SpaceAlmostFull | PlaybackStatus::SpaceFull => false,
        };
        if flow.last_status != Some(status) {
            debug!("[Playback] status {:?}, keep writing = {}", status, flow.keep_writing);
        }
        flow.last_status = Some(status);
        self.shared.cond.notify_all();
        flow.keep_writing
    }

    pub fn keep_writing(&self) -> bool {
        self.shared.flow.lock().keep_writing
    }

    pub fn last_status(&self) -> Option<PlaybackStatus> {
        self.shared.flow.lock().last_status
    }
}

/// Feeds a file into a playback queue on a worker thread.
pub struct PlaybackDriver {
    queue: Arc<StreamQueue>,
    shared: Arc<PlaybackShared>,
    worker: Option<JoinHandle<()>>,
}

impl PlaybackDriver {
    pub fn new(queue: Arc<StreamQueue>) -> Self {
        Self {
            queue,
            shared: Arc::new(PlaybackShared {
                flow: Mutex::new(FlowState {
                    keep_writing: true,
                    state: DriverState::Idle,
                    last_status: None,
                    bytes_written: 0,
                    end: None,
                }),
                cond: Condvar::new(),
                running: AtomicBool::new(false),
            }),
            worker: None,
        }
    }

    /// Handle for routing playback status indications.
    pub fn flow(&self) -> PlaybackFlow {
        PlaybackFlow { shared: Arc::clone(&self.shared) }
    }

    pub fn state(&self) -> DriverState {
        self.shared.flow.lock().state
    }

    pub fn bytes_written(&self) -> usize {
        self.shared.flow.lock().bytes_written
    }

    /// Open `input` and start the worker.
    pub fn start(&mut self, input: &Path) -> Result<(), DataflowError> {
        if self.worker.is_some() {
            return Err(DataflowError::AlreadyRunning);
        }
        let file = File::open(input).map_err(|source| DataflowError::OpenInput {
            path: input.to_path_buf(),
            source,
        })?;

        {
            let mut flow = self.shared.flow.lock();
            flow.state = DriverState::Running;
            flow.bytes_written = 0;
            flow.end = None;
        }
        self.shared.running.store(true, Ordering::Release);

        let queue = Arc::clone(&self.queue);
        let shared = Arc::clone(&self.shared);
        let worker = thread::Builder::new()
            .name("playback-input".to_string())
            .spawn(move || run(queue, shared, file))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                self.shared.flow.lock().state = DriverState::Idle;
                DataflowError::Spawn(e)
            })?;
        info!("[Playback] started feeding {}", input.display());
        self.worker = Some(worker);
        Ok(())
    }

    /// Wait until `min_bytes` were committed, the input ended, or `timeout` elapsed.
    pub fn wait_written(&self, min_bytes: usize, timeout: Duration) -> Result<Transfer, DataflowError> {
        let deadline = Instant::now() + timeout;
        let mut flow = self.shared.flow.lock();
        loop {
            let written = flow.bytes_written;
            if written >= min_bytes && written > 0 {
                return Ok(Transfer::Complete(written));
            }
            match &flow.end {
                Some(PlaybackEnd::EndOfInput) if written > 0 => return Ok(Transfer::Complete(written)),
                Some(_) => break,
                None => {}
            }
            if self.shared.cond.wait_until(&mut flow, deadline).timed_out() {
                break;
            }
        }
        match flow.bytes_written {
            0 => Err(DataflowError::NoData(timeout)),
            n if n >= min_bytes => Ok(Transfer::Complete(n)),
            n => Ok(Transfer::Partial(n)),
        }
    }

    /// Stop the worker and join it.
    pub fn stop(&mut self) -> PlaybackSummary {
        {
            let mut flow = self.shared.flow.lock();
            if self.worker.is_some() {
                flow.state = DriverState::Stopping;
            }
            self.shared.running.store(false, Ordering::Release);
            self.shared.cond.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("[Playback] worker thread panicked");
            }
        }
        let mut flow = self.shared.flow.lock();
        flow.state = DriverState::Idle;
        let summary = PlaybackSummary {
            bytes_written: flow.bytes_written,
            end: flow.end.clone().unwrap_or(PlaybackEnd::Stopped),
        };
        info!("[Playback] stopped after {} bytes ({:?})", summary.bytes_written, summary.end);
        summary
    }
}

impl Drop for PlaybackDriver {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

/// Fill `buf` from `input`. Returns the bytes read and whether the input ended.
fn fill(input: &mut impl Read, buf: &mut [u8]) -> io::Result<(usize, bool)> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => return Ok((filled, true)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok((filled, false))
}

/// Reserve the free space of `queue` once at least a quarter of it is free.
///
/// Otherwise waits up to [`SPACE_WAIT`] for the consumer and returns `None`.
fn reserve(queue: &StreamQueue) -> Option<WriteTransaction<'_>> {
    let free = queue.available_to_write();
    if free * 4 >= queue.capacity() {
        if let Some(tx) = queue.begin_write(free) {
            return Some(tx);
        }
    }
    // Timeouts fall through so the caller rechecks its permission.
    queue.flag().wait(notify::DATA_CONSUMED, SPACE_WAIT, true).ok();
    None
}

fn run(queue: Arc<StreamQueue>, shared: Arc<PlaybackShared>, mut input: File) {
    let end = loop {
        if !shared.wait_for_permission() {
            break PlaybackEnd::Stopped;
        }

        let Some(mut tx) = reserve(&queue) else {
            continue;
        };

        let (first, second) = tx.regions();
        let first_len = first.len();
        let (mut total, mut eof) = match fill(&mut input, first) {
            Ok(result) => result,
            Err(e) => break PlaybackEnd::ReadError(e.to_string()),
        };
        let mut read_error = None;
        if !eof && total == first_len && !second.is_empty() {
            match fill(&mut input, second) {
                Ok((n, ended)) => {
                    total += n;
                    eof = ended;
                }
                Err(e) => read_error = Some(e.to_string()),
            }
        }

        if let Err(e) = tx.commit(total) {
            warn!("[Playback] commit failed: {}", e);
        }
        shared.add_written(total);

        if let Some(e) = read_error {
            break PlaybackEnd::ReadError(e);
        }
        if eof {
            break PlaybackEnd::EndOfInput;
        }
    };
    match &end {
        PlaybackEnd::ReadError(e) => error!("[Playback] input read failed: {}", e),
        other => debug!("[Playback] worker finished: {:?}", other),
    }
    shared.finish(end);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn input(len: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_flow_control_transitions() {
        let driver = PlaybackDriver::new(Arc::new(StreamQueue::new(4096)));
        let flow = driver.flow();
        assert!(flow.keep_writing());
        let flags: Vec<bool> = [
            PlaybackStatus::SpaceFull,
            PlaybackStatus::SpaceAlmostEmpty,
            PlaybackStatus::SpaceFull,
        ]
        .into_iter()
        .map(|s| flow.on_status(s))
        .collect();
        assert_eq!(flags, vec![false, true, false]);
    }

    #[test]
    fn test_no_writes_while_paused() {
        let file = input(64 * 1024);
        let queue = Arc::new(StreamQueue::new(16 * 1024));
        let mut driver = PlaybackDriver::new(Arc::clone(&queue));
        let flow = driver.flow();

        flow.on_status(PlaybackStatus::SpaceFull);
        driver.start(file.path()).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(queue.available_to_read(), 0);
        assert_eq!(driver.bytes_written(), 0);

        flow.on_status(PlaybackStatus::SpaceAlmostEmpty);
        let transfer = driver.wait_written(1, Duration::from_secs(2)).unwrap();
        assert!(transfer.bytes() > 0);

        let summary = driver.stop();
        assert_eq!(driver.state(), DriverState::Idle);
        assert!(summary.bytes_written > 0);
    }

    #[test]
    fn test_short_input_reaches_end() {
        let file = input(1880);
        let queue = Arc::new(StreamQueue::new(4096));
        let mut driver = PlaybackDriver::new(Arc::clone(&queue));
        driver.start(file.path()).unwrap();

        assert_eq!(driver.wait_written(1880, Duration::from_secs(2)).unwrap(), Transfer::Complete(1880));
        let summary = driver.stop();
        assert_eq!(summary, PlaybackSummary { bytes_written: 1880, end: PlaybackEnd::EndOfInput });

        let mut out = vec![0u8; 4096];
        assert_eq!(queue.read(&mut out), 1880);
        assert_eq!(out[187], (187 % 251) as u8);
    }

    #[test]
    fn test_wrapping_writes_preserve_data() {
        let len = 50_000;
        let file = input(len);
        let queue = Arc::new(StreamQueue::new(8192));
        let mut driver = PlaybackDriver::new(Arc::clone(&queue));

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut received = Vec::with_capacity(len);
                let mut chunk = vec![0u8; 3000];
                let deadline = Instant::now() + Duration::from_secs(5);
                while received.len() < len && Instant::now() < deadline {
                    let _ = queue.flag().wait(notify::DATA_READY, Duration::from_millis(20), true);
                    let n = queue.read(&mut chunk);
                    received.extend_from_slice(&chunk[..n]);
                }
                received
            })
        };

        driver.start(file.path()).unwrap();
        let received = consumer.join().unwrap();
        let summary = driver.stop();

        assert_eq!(summary.end, PlaybackEnd::EndOfInput);
        assert_eq!(received.len(), len);
        assert!(received.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
    }

    #[test]
    fn test_reserve_waits_when_writer_is_busy() {
        let queue = StreamQueue::new(4096);
        let open = queue.begin_write(188).unwrap();

        let started = Instant::now();
        assert!(reserve(&queue).is_none());
        assert!(started.elapsed() >= SPACE_WAIT / 2);

        drop(open);
        let tx = reserve(&queue).unwrap();
        assert_eq!(tx.len(), 4096);
    }

    #[test]
    fn test_missing_input() {
        let mut driver = PlaybackDriver::new(Arc::new(StreamQueue::new(1024)));
        let err = driver.start(Path::new("/nonexistent/input.ts")).unwrap_err();
        assert!(matches!(err, DataflowError::OpenInput { .. }));
        assert_eq!(driver.state(), DriverState::Idle);
    }

    #[test]
    fn test_timeout_without_data() {
        let file = input(4096);
        let mut driver = PlaybackDriver::new(Arc::new(StreamQueue::new(8192)));
        driver.flow().on_status(PlaybackStatus::SpaceFull);
        driver.start(file.path()).unwrap();
        let err = driver.wait_written(1, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, DataflowError::NoData(_)));
        driver.stop();
    }
}
