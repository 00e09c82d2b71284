//! Conformance harness for tuner HAL implementations.
//!
//! The harness reads a hardware description, resolves it into per-scenario
//! device topologies and drives every named scenario against each device
//! service instance:
//!
//! - [`config`]: TOML configuration and timing thresholds
//! - [`registry`]: catalogs of the declared devices
//! - [`topology`]: resolution and validation of scenario connections
//! - [`device`]: correlated sessions and the in-process loopback device
//! - [`dvr`]: playback and record dataflow drivers
//! - [`events`]: filter event aggregation
//! - [`orchestrator`]: scenario execution and reporting

pub mod config;
pub mod device;
pub mod dvr;
pub mod error;
pub mod events;
pub mod logging;
pub mod orchestrator;
pub mod registry;
pub mod topology;

pub use config::{load_config, HarnessConfig, Timeouts};
pub use error::{ConfigError, FailureClass, ScenarioError};
pub use orchestrator::{run_services, Outcome, RunReport, ScenarioKind, ScenarioResult};
