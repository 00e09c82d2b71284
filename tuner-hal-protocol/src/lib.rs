//! Protocol definitions for the tuner HAL conformance harness.
//!
//! This crate defines the traffic exchanged between the harness and a tuner
//! device implementation:
//!
//! - [`Request`]: control-plane call submitted with a [`CorrelationToken`]
//! - [`Reply`]: the answer echoing that token plus a [`ResultCode`]
//! - [`Indication`]: unsolicited status and event traffic
//!
//! Bulk data moves through a [`StreamQueue`], a bounded single-producer,
//! single-consumer byte ring paired with an [`EventFlag`] signal word.
//!
//! # Example
//!
//! ```rust
//! use tuner_hal_protocol::{notify, StreamQueue};
//!
//! let queue = StreamQueue::new(1024);
//! assert_eq!(queue.write(&[0x47; 188]), 188);
//! assert_eq!(queue.available_to_read(), 188);
//!
//! let mut out = vec![0u8; 188];
//! assert_eq!(queue.read(&mut out), 188);
//! assert_ne!(queue.flag().peek() & notify::DATA_CONSUMED, 0);
//! ```

pub mod error;
pub mod event;
pub mod event_flag;
pub mod message;
pub mod queue;
pub mod types;

pub use error::{FlagWaitError, QueueError, ResultCode, TransportError};
pub use event::{
    EventRecord, EventTag, MediaEvent, MmtpRecordEvent, MonitorEvent, PesEvent,
    ScramblingStatus, SectionEvent, TsRecordEvent,
};
pub use event_flag::{notify, EventFlag};
pub use message::{
    DeviceMessage, FrontendEvent, Indication, LnbEvent, Operation, Reply, Request, Response,
    ScanMessage,
};
pub use queue::{StreamQueue, WriteTransaction};
pub use types::*;
