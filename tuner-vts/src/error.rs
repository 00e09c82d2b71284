//! Error types for the conformance harness.
//!
//! Errors fall into two scopes:
//!
//! - [`ConfigError`]: global and fatal, raised before any scenario runs
//! - [`ScenarioError`]: local to one scenario run, recorded and the run continues

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tuner_hal_protocol::{Operation, ResultCode, TransportError};

use crate::dvr::DataflowError;
use crate::events::WaitElapsed;
use crate::registry::DeviceKind;
use crate::topology::ValidationError;

/// Fatal configuration problems.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Configuration file not found: {}", .0.display())]
    MissingFile(PathBuf),

    /// The configuration file could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for the expected schema.
    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Two devices of the same kind share an id.
    #[error("Duplicate {kind} id {id:?}")]
    DuplicateId { kind: DeviceKind, id: String },

    /// The resolved topology is inconsistent with the registry.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Failure class of a scenario, used in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The request never reached the device.
    Protocol,
    /// The device answered with a code outside the whitelist.
    Semantic,
    /// An awaited reply or event never arrived.
    Liveness,
    /// A dataflow driver failed to move data.
    Dataflow,
    /// The device behaved but produced the wrong result.
    Expectation,
}

/// Errors local to one scenario run.
#[derive(Error, Debug)]
pub enum ScenarioError {
    /// The transport rejected the request.
    #[error("{op} failed in transport: {source}")]
    Protocol {
        op: Operation,
        #[source]
        source: TransportError,
    },

    /// The device returned a code outside the whitelist for this operation.
    #[error("{op} returned {code:?}")]
    Semantic { op: Operation, code: ResultCode },

    /// The device returned an accepted non-success code; the scenario cannot continue.
    #[error("{op} is not available on this device ({code:?})")]
    Degraded { op: Operation, code: ResultCode },

    /// A reply or event did not arrive in time.
    #[error("{what} did not arrive within {timeout:?}")]
    Liveness { what: String, timeout: Duration },

    /// The reply payload does not match the request.
    #[error("Unexpected response to {op}")]
    UnexpectedResponse { op: Operation },

    /// A dataflow driver failed.
    #[error(transparent)]
    Dataflow(#[from] DataflowError),

    /// An observed value differs from the expected one.
    #[error("Expectation failed: {0}")]
    Expectation(String),
}

impl ScenarioError {
    /// Taxonomy class used in reports. `Degraded` has none since it is reported as a skip.
    pub fn class(&self) -> Option<FailureClass> {
        match self {
            ScenarioError::Protocol { .. } => Some(FailureClass::Protocol),
            ScenarioError::Semantic { .. } | ScenarioError::UnexpectedResponse { .. } => {
                Some(FailureClass::Semantic)
            }
            ScenarioError::Liveness { .. } => Some(FailureClass::Liveness),
            ScenarioError::Dataflow(DataflowError::NoData(_)) => Some(FailureClass::Liveness),
            ScenarioError::Dataflow(_) => Some(FailureClass::Dataflow),
            ScenarioError::Expectation(_) => Some(FailureClass::Expectation),
            ScenarioError::Degraded { .. } => None,
        }
    }

    /// Build a liveness error from an elapsed event wait.
    pub fn elapsed(what: impl Into<String>, elapsed: WaitElapsed) -> Self {
        ScenarioError::Liveness { what: what.into(), timeout: elapsed.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classes() {
        let semantic = ScenarioError::Semantic { op: Operation::Tune, code: ResultCode::InvalidState };
        assert_eq!(semantic.class(), Some(FailureClass::Semantic));

        let liveness = ScenarioError::elapsed("tune lock", WaitElapsed(Duration::from_secs(1)));
        assert_eq!(liveness.class(), Some(FailureClass::Liveness));
        assert_ne!(liveness.class(), semantic.class());

        let degraded = ScenarioError::Degraded { op: Operation::Scan, code: ResultCode::NotSupported };
        assert_eq!(degraded.class(), None);
    }
}
