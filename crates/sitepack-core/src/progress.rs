//! The resumable build state machine.
//!
//! `BuildProgress` is the cursor record that lets every phase of the
//! pipeline resume exactly where a prior invocation stopped. It is owned by
//! the orchestrating build loop, mutated only between chunk boundaries, and
//! persisted after every chunk; losing it means losing the build.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{BuildError, Remediation};
use crate::strategy::BuildStrategy;

/// Lifecycle status of a build.
///
/// The main sequence is monotonic forward; the side states are reachable
/// from any active state and (except `PendingCancel`) terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Status {
    PreProcess,
    Scanning,
    ScanValidation,
    AfterScan,
    Start,
    DbStart,
    DbDone,
    ArcStart,
    ArcValidation,
    ArcDone,
    CopiedPackage,
    StorageProcessing,
    Complete,
    RequirementsFailed,
    StorageFailed,
    StorageCancelled,
    PendingCancel,
    BuildCancelled,
    Error,
}

impl Status {
    /// Position in the forward sequence, `None` for side states.
    pub fn phase_order(self) -> Option<u8> {
        match self {
            Self::PreProcess => Some(0),
            Self::Scanning => Some(1),
            Self::ScanValidation => Some(2),
            Self::AfterScan => Some(3),
            Self::Start => Some(4),
            Self::DbStart => Some(5),
            Self::DbDone => Some(6),
            Self::ArcStart => Some(7),
            Self::ArcValidation => Some(8),
            Self::ArcDone => Some(9),
            Self::CopiedPackage => Some(10),
            Self::StorageProcessing => Some(11),
            Self::Complete => Some(12),
            _ => None,
        }
    }

    /// Whether the build is finished, successfully or not.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete
                | Self::RequirementsFailed
                | Self::StorageFailed
                | Self::StorageCancelled
                | Self::BuildCancelled
                | Self::Error
        )
    }

    /// Whether the build can still make forward progress.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// One directory frame of the scan walk: the directory and the index of
/// the next sorted child to visit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirFrame {
    /// Path relative to the current scan root; empty for the root itself.
    pub rel_path: std::path::PathBuf,
    /// Index of the next child in the directory's name-sorted entry list.
    pub next_child: usize,
}

/// Resumable position of an interrupted scan.
///
/// The pending stack of directory frames is enough to continue the walk
/// without re-visiting completed subtrees.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    /// Index of the root currently being walked.
    pub next_root: usize,
    /// Depth-first stack of open directories within that root.
    pub stack: Vec<DirFrame>,
}

/// Persisted cursor and status record for one build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildProgress {
    /// Current lifecycle status.
    pub status: Status,
    /// Archive engine selected for this build.
    pub strategy: BuildStrategy,
    /// Next directory entry the archive phase will append.
    pub next_dir_index: u64,
    /// Next file entry the archive phase will append.
    pub next_file_index: u64,
    /// Scan position when the scan phase was interrupted.
    pub scan_cursor: Option<ScanCursor>,
    /// Times a phase re-entered without forward progress.
    pub retries: u32,
    /// First moment any chunk of this build ran.
    pub thread_start: Option<DateTime<Utc>>,
    /// Moment the archive phase started.
    pub archive_start: Option<DateTime<Utc>>,
    /// Terminal failure flag; the driver must stop re-invoking once set.
    pub failed: bool,
    /// Set when the archive is fully written.
    pub archive_built: bool,
    /// Entries in the finished archive, when the engine could count them.
    pub archive_file_count: Option<u64>,
    /// Set after a container close failure; engines then stat every file
    /// before appending and skip unreadable ones explicitly.
    pub validation_mode: bool,
    /// Bytes appended to the archive so far.
    pub archive_bytes_written: u64,
    /// Progress percentage persisted at chunk boundaries, 0-100.
    pub percent: u8,
    /// Message of the fatal failure, if any.
    pub failure_message: Option<String>,
    /// Machine-actionable fix for the fatal failure, if any.
    pub remediation: Option<Remediation>,
}

impl BuildProgress {
    /// Create progress for a fresh build using the given engine.
    pub fn new(strategy: BuildStrategy) -> Self {
        Self {
            status: Status::PreProcess,
            strategy,
            next_dir_index: 0,
            next_file_index: 0,
            scan_cursor: None,
            retries: 0,
            thread_start: None,
            archive_start: None,
            failed: false,
            archive_built: false,
            archive_file_count: None,
            validation_mode: false,
            archive_bytes_written: 0,
            percent: 0,
            failure_message: None,
            remediation: None,
        }
    }

    /// Move forward to `to`.
    ///
    /// Only forward transitions along the main sequence are legal here;
    /// failure and cancellation go through [`fail`](Self::fail) and
    /// [`cancel`](Self::cancel).
    pub fn advance(&mut self, to: Status) -> Result<(), BuildError> {
        let from_order = self.status.phase_order();
        let to_order = to.phase_order();
        match (from_order, to_order) {
            (Some(from), Some(target)) if target > from => {
                tracing::debug!(from = %self.status, to = %to, "status transition");
                self.status = to;
                Ok(())
            }
            _ => Err(BuildError::Transition {
                from: self.status,
                to,
            }),
        }
    }

    /// Record a fatal failure and move to the `Error` terminal state.
    pub fn fail(&mut self, error: &BuildError) {
        tracing::warn!(status = %self.status, %error, "build failed");
        self.failed = true;
        self.failure_message = Some(error.to_string());
        self.remediation = error.remediation().cloned();
        self.status = Status::Error;
    }

    /// Record an externally requested cancellation; observed by the driver
    /// at the next chunk boundary.
    pub fn request_cancel(&mut self) {
        if self.status.is_active() {
            self.status = Status::PendingCancel;
        }
    }

    /// Complete a cancellation: `StorageCancelled` if the archive phase
    /// already finished, `BuildCancelled` otherwise.
    pub fn cancel(&mut self, past_archiving: bool) {
        self.status = if past_archiving {
            Status::StorageCancelled
        } else {
            Status::BuildCancelled
        };
    }

    /// Count a retry of the current phase against `ceiling`.
    ///
    /// Returns `RetryExhausted` once the ceiling is exceeded; the caller is
    /// expected to [`fail`](Self::fail) the build with it, never retry again.
    pub fn record_retry(&mut self, phase: &str, ceiling: u32) -> Result<(), BuildError> {
        self.retries += 1;
        tracing::debug!(phase, retries = self.retries, ceiling, "phase retry");
        if self.retries > ceiling {
            return Err(BuildError::retry_exhausted(phase, ceiling, self.strategy));
        }
        Ok(())
    }

    /// Reset the retry counter after a phase makes forward progress.
    pub fn clear_retries(&mut self) {
        self.retries = 0;
    }

    /// Record the first chunk's start time, once.
    pub fn mark_started(&mut self, now: DateTime<Utc>) {
        if self.thread_start.is_none() {
            self.thread_start = Some(now);
        }
    }

    /// Whether the whole multi-invocation build has run longer than the
    /// configured total-runtime ceiling.
    pub fn exceeded_total_runtime(&self, now: DateTime<Utc>, max_total_secs: u64) -> bool {
        self.thread_start
            .is_some_and(|start| (now - start).num_seconds() >= max_total_secs as i64)
    }

    /// Update the persisted completion percentage.
    pub fn set_percent(&mut self, done: u64, total: u64) {
        self.percent = if total == 0 {
            100
        } else {
            ((done.min(total) * 100) / total) as u8
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_monotonic_forward() {
        let mut progress = BuildProgress::new(BuildStrategy::NativeChunked);
        progress.advance(Status::Scanning).unwrap();
        progress.advance(Status::AfterScan).unwrap();
        assert!(progress.advance(Status::Scanning).is_err());
        assert!(progress.advance(Status::AfterScan).is_err());
        progress.advance(Status::Complete).unwrap();
    }

    #[test]
    fn side_states_are_not_advance_targets() {
        let mut progress = BuildProgress::new(BuildStrategy::NativeChunked);
        assert!(progress.advance(Status::Error).is_err());
        assert!(progress.advance(Status::BuildCancelled).is_err());
    }

    #[test]
    fn fail_is_reachable_from_any_state_and_terminal() {
        let mut progress = BuildProgress::new(BuildStrategy::ExternalTool);
        progress.advance(Status::ArcStart).unwrap();
        let error = BuildError::retry_exhausted("archive", 2, BuildStrategy::ExternalTool);
        progress.fail(&error);
        assert_eq!(progress.status, Status::Error);
        assert!(progress.failed);
        assert!(progress.remediation.is_some());
        assert!(progress.status.is_terminal());
    }

    #[test]
    fn cancellation_picks_state_by_phase() {
        let mut early = BuildProgress::new(BuildStrategy::NativeChunked);
        early.request_cancel();
        assert_eq!(early.status, Status::PendingCancel);
        early.cancel(false);
        assert_eq!(early.status, Status::BuildCancelled);

        let mut late = BuildProgress::new(BuildStrategy::NativeChunked);
        late.cancel(true);
        assert_eq!(late.status, Status::StorageCancelled);
    }

    #[test]
    fn retry_ceiling_is_never_exceeded_twice() {
        let mut progress = BuildProgress::new(BuildStrategy::NativeChunked);
        for _ in 0..3 {
            progress.record_retry("archive-close", 3).unwrap();
        }
        let err = progress.record_retry("archive-close", 3).unwrap_err();
        assert!(matches!(err, BuildError::RetryExhausted { .. }));
    }

    #[test]
    fn progress_serde_round_trip_is_lossless() {
        let mut progress = BuildProgress::new(BuildStrategy::StreamingContainer);
        progress.advance(Status::Scanning).unwrap();
        progress.mark_started(Utc::now());
        progress.next_file_index = 42;
        progress.scan_cursor = Some(ScanCursor {
            next_root: 1,
            stack: vec![DirFrame {
                rel_path: "wp-content/uploads".into(),
                next_child: 7,
            }],
        });
        progress.set_percent(42, 100);

        let json = serde_json::to_string(&progress).unwrap();
        let back: BuildProgress = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, progress.status);
        assert_eq!(back.next_file_index, 42);
        assert_eq!(back.scan_cursor, progress.scan_cursor);
        assert_eq!(back.percent, 42);
        assert_eq!(back.thread_start, progress.thread_start);
    }

    #[test]
    fn total_runtime_ceiling() {
        let mut progress = BuildProgress::new(BuildStrategy::NativeChunked);
        let start = Utc::now() - chrono::Duration::seconds(7_200);
        progress.mark_started(start);
        assert!(progress.exceeded_total_runtime(Utc::now(), 3_600));
        assert!(!progress.exceeded_total_runtime(Utc::now(), 14_400));
    }
}
