//! Hardware topology resolution.
//!
//! This module provides:
//! - [`resolver`]: generic Cartesian enumeration under [`Rule`]s
//! - [`connections`]: typed per-scenario connections and their generators
//! - [`validate()`]: referential integrity of the resolved topology

pub mod connections;
pub mod resolver;
pub mod validate;

pub use connections::{
    DescramblingConnection, LiveConnection, LnbDescramblingConnection, LnbLiveConnection,
    LnbRecordConnection, PinnedConnections, PlaybackConnection, RecordConnection,
    ResolvedConnections, ScanConnection, TimeFilterConnection,
};
pub use resolver::{cartesian, resolve, resolve_or_pinned, Combination, Pool, Rule};
pub use validate::{is_valid, validate, ValidationError, ValidationIssue};
