//! Error taxonomy for the build pipeline.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::strategy::BuildStrategy;

/// Classification of an external tool failure, derived from its output.
///
/// Quota exhaustion is not a tool failure; it maps to [`BuildError::Capacity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolFailure {
    /// Files disappeared or were unreadable during archiving.
    MissingFiles,
    /// Anything else.
    Generic,
}

impl std::fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingFiles => write!(f, "missing files"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

/// A named, machine-actionable recovery action.
///
/// Fatal failures carry one of these so a calling layer can offer one-click
/// recovery without this crate knowing anything about that UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum RemediationAction {
    /// Re-run the build with a different archive engine.
    SwitchStrategy { to: BuildStrategy },
    /// Raise the per-chunk wall-clock budget.
    IncreaseTimeBudget { suggested_secs: u64 },
    /// Free disk space before retrying.
    FreeDiskSpace,
    /// Exclude paths that could not be read.
    ExcludeBrokenPaths { paths: Vec<PathBuf> },
}

/// Human-readable message paired with a [`RemediationAction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remediation {
    /// What the caller should do.
    pub action: RemediationAction,
    /// Why, in words fit for an end user.
    pub message: String,
}

impl Remediation {
    /// Recommend switching to the given strategy.
    pub fn switch_strategy(to: BuildStrategy) -> Self {
        Self {
            action: RemediationAction::SwitchStrategy { to },
            message: format!("Switch the archive engine to `{to}` and start a new build"),
        }
    }

    /// Recommend a larger chunk time budget.
    pub fn increase_time_budget(suggested_secs: u64) -> Self {
        Self {
            action: RemediationAction::IncreaseTimeBudget { suggested_secs },
            message: format!("Increase the per-chunk time budget to {suggested_secs}s"),
        }
    }

    /// Recommend freeing disk space.
    pub fn free_disk_space() -> Self {
        Self {
            action: RemediationAction::FreeDiskSpace,
            message: "Free disk space on the backup volume and start a new build".to_string(),
        }
    }

    /// Recommend excluding unreadable paths.
    pub fn exclude_broken_paths(paths: Vec<PathBuf>) -> Self {
        Self {
            action: RemediationAction::ExcludeBrokenPaths { paths },
            message: "Exclude the unreadable paths from the backup and retry".to_string(),
        }
    }
}

/// Errors raised by the build pipeline.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A path could not be read during scan or archiving.
    #[error("Filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The external compression tool failed.
    #[error("Archive tool failed ({kind}): {message}")]
    Tool {
        kind: ToolFailure,
        message: String,
        remediation: Remediation,
    },

    /// Post-build validation found a mismatch.
    #[error("Integrity check failed: {message}")]
    Integrity {
        message: String,
        remediation: Option<Remediation>,
    },

    /// Disk space ran out.
    #[error("Capacity exhausted: {message}")]
    Capacity {
        message: String,
        remediation: Remediation,
    },

    /// A phase re-entered without progress more times than allowed.
    #[error("Retry ceiling of {ceiling} exceeded during {phase}")]
    RetryExhausted {
        phase: String,
        ceiling: u32,
        remediation: Remediation,
    },

    /// The file index store failed in a way that breaks the build.
    #[error("Index store error: {message}")]
    Index { message: String },

    /// Persisted state could not be loaded or saved.
    #[error("State persistence error: {message}")]
    State { message: String },

    /// Configuration was rejected.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// A status transition outside the monotonic forward order.
    #[error("Illegal status transition from {from} to {to}")]
    Transition {
        from: crate::progress::Status,
        to: crate::progress::Status,
    },
}

impl BuildError {
    /// Create a filesystem error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Create an index store error.
    pub fn index(message: impl Into<String>) -> Self {
        Self::Index {
            message: message.into(),
        }
    }

    /// Create a state persistence error.
    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Create an integrity error with no attached remediation.
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
            remediation: None,
        }
    }

    /// Create a retry-exhausted error recommending a strategy switch.
    pub fn retry_exhausted(phase: impl Into<String>, ceiling: u32, current: BuildStrategy) -> Self {
        Self::RetryExhausted {
            phase: phase.into(),
            ceiling,
            remediation: Remediation::switch_strategy(current.recommended_fallback()),
        }
    }

    /// Classify external tool output into a [`ToolFailure`] and build the
    /// matching error with its remediation.
    pub fn from_tool_output(output: &str, current: BuildStrategy) -> Self {
        let lower = output.to_lowercase();
        if lower.contains("disk quota") || lower.contains("no space left") {
            Self::Capacity {
                message: output.trim().to_string(),
                remediation: Remediation::free_disk_space(),
            }
        } else if lower.contains("file not found") || lower.contains("no such file") {
            Self::Tool {
                kind: ToolFailure::MissingFiles,
                message: output.trim().to_string(),
                remediation: Remediation::switch_strategy(current.recommended_fallback()),
            }
        } else {
            Self::Tool {
                kind: ToolFailure::Generic,
                message: output.trim().to_string(),
                remediation: Remediation::switch_strategy(current.recommended_fallback()),
            }
        }
    }

    /// The remediation attached to this error, if any.
    pub fn remediation(&self) -> Option<&Remediation> {
        match self {
            Self::Tool { remediation, .. }
            | Self::Capacity { remediation, .. }
            | Self::RetryExhausted { remediation, .. } => Some(remediation),
            Self::Integrity { remediation, .. } => remediation.as_ref(),
            _ => None,
        }
    }

    /// Whether this error ends the build attempt.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Filesystem { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_output_classification() {
        let quota = BuildError::from_tool_output(
            "zip I/O error: Disk quota exceeded",
            BuildStrategy::ExternalTool,
        );
        assert!(matches!(quota, BuildError::Capacity { .. }));
        assert_eq!(
            quota.remediation().unwrap().action,
            RemediationAction::FreeDiskSpace
        );

        let missing = BuildError::from_tool_output(
            "zip warning: no such file or directory",
            BuildStrategy::ExternalTool,
        );
        assert!(matches!(
            missing,
            BuildError::Tool {
                kind: ToolFailure::MissingFiles,
                ..
            }
        ));

        let generic =
            BuildError::from_tool_output("zip error: unexpected", BuildStrategy::ExternalTool);
        assert!(matches!(
            generic,
            BuildError::Tool {
                kind: ToolFailure::Generic,
                ..
            }
        ));
    }

    #[test]
    fn retry_exhausted_recommends_fallback_engine() {
        let err = BuildError::retry_exhausted("archive-close", 3, BuildStrategy::NativeChunked);
        match err.remediation().unwrap().action {
            RemediationAction::SwitchStrategy { to } => {
                assert_eq!(to, BuildStrategy::StreamingContainer);
            }
            _ => panic!("expected switch-strategy remediation"),
        }
    }

    #[test]
    fn per_item_filesystem_errors_are_not_fatal() {
        let err = BuildError::io("/srv/site/a.txt", std::io::Error::other("boom"));
        assert!(!err.is_fatal());
        assert!(err.remediation().is_none());
    }
}
