//! The common engine contract and strategy dispatch.

use sitepack_core::{
    BuildConfig, BuildError, BuildProgress, BuildStrategy, FilterSet, Remediation, ScanResult,
};
use sitepack_index::FileIndexStore;

/// Result of one engine step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Chunk boundary reached; call again to continue.
    Continue,
    /// The archive is fully written.
    Complete,
    /// A fatal failure was recorded in the progress record.
    Failed,
}

/// Everything an engine sees for one chunk.
///
/// The archive container handle is owned by the engine for the duration of
/// the chunk and is fully closed before `build_chunk` returns.
pub struct ArchiveContext<'a> {
    /// Build configuration.
    pub config: &'a BuildConfig,
    /// The index produced by the scan phase, opened read-only.
    pub index: &'a FileIndexStore,
    /// Effective filters, resolved at build start.
    pub filters: &'a FilterSet,
    /// Completed scan aggregate.
    pub scan_result: &'a ScanResult,
    /// The resumable cursor; mutated only between chunk boundaries.
    pub progress: &'a mut BuildProgress,
}

/// One interchangeable archive construction engine.
pub trait ArchiveEngine {
    /// Run one bounded slice of archive construction.
    ///
    /// Implementations must persist enough state into
    /// [`ArchiveContext::progress`] that a later, independent invocation
    /// resumes with no duplication and no gaps. Fatal failures are recorded
    /// via [`BuildProgress::fail`] and reported as [`StepOutcome::Failed`];
    /// `Err` is reserved for faults outside the engine's own semantics
    /// (index corruption, state loss).
    fn build_chunk(&mut self, ctx: &mut ArchiveContext<'_>) -> Result<StepOutcome, BuildError>;
}

/// Count a failed phase attempt against the strategy's retry ceiling.
///
/// Within the ceiling the build is asked to continue (the next invocation
/// retries the phase); past it the build is failed with a switch-strategy
/// remediation and never retried again.
pub(crate) fn retry_or_fail(
    ctx: &mut ArchiveContext<'_>,
    phase: &str,
    error: &BuildError,
) -> StepOutcome {
    tracing::warn!(phase, %error, retries = ctx.progress.retries, "archive phase attempt failed");
    match ctx.progress.record_retry(phase, ctx.config.retry_ceiling()) {
        Ok(()) => StepOutcome::Continue,
        Err(exhausted) => {
            ctx.progress.fail(&exhausted);
            StepOutcome::Failed
        }
    }
}

/// Count a chunk that hit its time budget without appending anything.
///
/// A zero-progress suspension would otherwise loop forever: the next
/// invocation starts from the same cursor and times out the same way. The
/// retry ceiling bounds that loop, and the resulting failure tells the
/// caller the budget is too small rather than recommending an engine switch.
pub(crate) fn retry_stalled_chunk(ctx: &mut ArchiveContext<'_>, phase: &str) -> StepOutcome {
    let budget = ctx.config.max_chunk_duration.as_secs();
    tracing::warn!(phase, budget, "chunk budget too small for forward progress");
    match ctx.progress.record_retry(phase, ctx.config.retry_ceiling()) {
        Ok(()) => StepOutcome::Continue,
        Err(_) => {
            let error = BuildError::RetryExhausted {
                phase: phase.to_string(),
                ceiling: ctx.config.retry_ceiling(),
                remediation: Remediation::increase_time_budget(budget.max(1) * 2),
            };
            ctx.progress.fail(&error);
            StepOutcome::Failed
        }
    }
}

/// Construct the engine for a strategy.
///
/// The strategy set is closed: this match is the entire dispatch surface.
pub fn engine_for(strategy: BuildStrategy) -> Box<dyn ArchiveEngine> {
    match strategy {
        BuildStrategy::ExternalTool => Box::new(crate::external::ExternalToolEngine::new()),
        BuildStrategy::NativeSingleThreaded => {
            Box::new(crate::native::NativeSingleThreadedEngine::new())
        }
        BuildStrategy::NativeChunked => Box::new(crate::native::NativeChunkedEngine::new()),
        BuildStrategy::StreamingContainer => {
            Box::new(crate::streaming::StreamingContainerEngine::new())
        }
    }
}
