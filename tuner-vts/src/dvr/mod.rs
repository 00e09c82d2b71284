//! Dataflow drivers moving bytes through dvr stream queues.
//!
//! - [`PlaybackDriver`]: feeds a file into a playback queue under flow control
//! - [`RecordDriver`]: drains a record queue into an accumulation buffer
//!
//! Both run one worker thread, move through [`DriverState`], and join the
//! worker on stop.

pub mod playback;
pub mod record;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub use playback::{PlaybackDriver, PlaybackEnd, PlaybackFlow, PlaybackSummary};
pub use record::{FlushHook, RecordDriver, RecordFlow, RecordSummary};

/// Lifecycle of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Running,
    Stopping,
}

/// Amount of data moved before a wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// At least the requested amount moved.
    Complete(usize),
    /// Some data moved but less than requested before the timeout.
    Partial(usize),
}

impl Transfer {
    pub fn bytes(self) -> usize {
        match self {
            Transfer::Complete(n) | Transfer::Partial(n) => n,
        }
    }
}

/// Dataflow driver failures.
#[derive(Error, Debug)]
pub enum DataflowError {
    /// The playback input could not be opened.
    #[error("Failed to open playback input {}: {source}", path.display())]
    OpenInput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Nothing moved before the timeout.
    #[error("No data transferred within {0:?}")]
    NoData(Duration),

    /// The driver is already running.
    #[error("Driver is already running")]
    AlreadyRunning,

    /// The worker thread could not be spawned.
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}
