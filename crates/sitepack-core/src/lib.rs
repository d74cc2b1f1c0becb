//! Core types and state machine for the sitepack build pipeline.
//!
//! This crate provides the shared vocabulary of the pipeline: build
//! configuration, the error taxonomy with machine-actionable remediations,
//! exclusion filters, scan results, the resumable [`BuildProgress`] state
//! machine, and the narrow persistence contract used between invocations.

mod config;
mod error;
mod filter;
mod progress;
mod report;
mod state;
mod strategy;

pub use config::{BuildConfig, BuildConfigBuilder};
pub use error::{BuildError, Remediation, RemediationAction, ToolFailure};
pub use filter::{FilterEntry, FilterRules, FilterScope, FilterSet};
pub use progress::{BuildProgress, DirFrame, ScanCursor, Status};
pub use report::{OversizedEntry, ScanReport, ScanResult, UnreadableTracker};
pub use state::{JsonStateStore, PersistedState, StateStore};
pub use strategy::{ArchiveDescriptor, ArchiveFormat, BuildStrategy};

/// Kind of entry recorded in the file index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// A directory.
    Dir,
    /// A regular file.
    File,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dir => write!(f, "dir"),
            Self::File => write!(f, "file"),
        }
    }
}
