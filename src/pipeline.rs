//! The build orchestrator.

use chrono::Utc;
use tracing::{debug, info, warn};

use sitepack_archive::{engine_for, ArchiveContext, ArtifactCheck, IntegrityValidator, StepOutcome};
use sitepack_core::{
    ArchiveDescriptor, ArchiveFormat, BuildConfig, BuildError, BuildProgress, FilterSet,
    PersistedState, ScanResult, StateStore, Status,
};
use sitepack_index::FileIndexStore;
use sitepack_scan::{ChunkLimits, ChunkStatus, ScanChunker};

/// Drives one build through its lifecycle, one bounded step at a time.
///
/// The pipeline holds no build state of its own: everything lives in the
/// [`StateStore`], so any invocation with the same configuration can pick
/// up where the previous one stopped.
pub struct BuildPipeline<S: StateStore> {
    config: BuildConfig,
    filters: FilterSet,
    store: S,
}

impl<S: StateStore> BuildPipeline<S> {
    /// Create a pipeline for one build.
    ///
    /// `filters` is only consulted when the build starts fresh; a resumed
    /// build keeps the filter set it was started with.
    pub fn new(config: BuildConfig, filters: FilterSet, store: S) -> Self {
        Self {
            config,
            filters,
            store,
        }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Run one chunk of work and persist the resulting state.
    ///
    /// Returns the status after the step. Terminal states are inert: a
    /// step on a finished build does nothing and reports the status.
    pub fn step(&self) -> Result<Status, BuildError> {
        let mut state = match self.store.load(&self.config.build_id)? {
            Some(state) => state,
            None => self.fresh_state(),
        };

        if state.progress.status.is_terminal() {
            return Ok(state.progress.status);
        }

        let now = Utc::now();
        state.progress.mark_started(now);

        if state
            .progress
            .exceeded_total_runtime(now, self.config.max_total_runtime_secs)
        {
            warn!(
                build_id = %self.config.build_id,
                max_secs = self.config.max_total_runtime_secs,
                "total runtime ceiling exceeded, cancelling build"
            );
            self.finish_cancel(&mut state);
            self.store.save(&self.config.build_id, &state)?;
            return Ok(state.progress.status);
        }

        if state.progress.status == Status::PendingCancel {
            self.finish_cancel(&mut state);
            self.store.save(&self.config.build_id, &state)?;
            return Ok(state.progress.status);
        }

        match state.progress.status {
            Status::PreProcess => self.step_pre_process(&mut state)?,
            Status::Scanning => self.step_scanning(&mut state)?,
            Status::ScanValidation => self.step_scan_validation(&mut state)?,
            Status::AfterScan => state.progress.advance(Status::Start)?,
            Status::Start => state.progress.advance(Status::DbStart)?,
            Status::DbStart => {
                // No database stage in this pipeline; the states remain so
                // external drivers see the same lifecycle everywhere.
                debug!(build_id = %self.config.build_id, "no database stage configured");
                state.progress.advance(Status::DbDone)?;
            }
            Status::DbDone => {
                state.progress.archive_start = Some(Utc::now());
                state.progress.advance(Status::ArcStart)?;
            }
            Status::ArcStart => self.step_archiving(&mut state)?,
            Status::ArcValidation => self.step_arc_validation(&mut state)?,
            Status::ArcDone => state.progress.advance(Status::CopiedPackage)?,
            Status::CopiedPackage => self.step_copied_package(&mut state)?,
            Status::StorageProcessing => {
                FileIndexStore::remove_files(&self.config.index_path());
                state.progress.advance(Status::Complete)?;
                info!(
                    build_id = %self.config.build_id,
                    archive = %self.config.archive_path().display(),
                    entries = ?state.progress.archive_file_count,
                    "build complete"
                );
            }
            // Terminal and PendingCancel are handled above.
            other => {
                return Err(BuildError::state(format!(
                    "step invoked in unexpected status {other}"
                )))
            }
        }

        self.store.save(&self.config.build_id, &state)?;
        Ok(state.progress.status)
    }

    /// Step repeatedly until the build reaches a terminal status.
    pub fn run_to_completion(&self) -> Result<Status, BuildError> {
        loop {
            let status = self.step()?;
            if status.is_terminal() {
                return Ok(status);
            }
        }
    }

    /// Flag the build for cancellation; the next step completes it.
    pub fn request_cancel(&self) -> Result<(), BuildError> {
        if let Some(mut state) = self.store.load(&self.config.build_id)? {
            state.progress.request_cancel();
            self.store.save(&self.config.build_id, &state)?;
        }
        Ok(())
    }

    /// Current progress of the build, `None` if it never started.
    pub fn status(&self) -> Result<Option<BuildProgress>, BuildError> {
        Ok(self
            .store
            .load(&self.config.build_id)?
            .map(|state| state.progress))
    }

    /// Structured scan report, `None` until the scan phase has finished.
    pub fn scan_report(&self) -> Result<Option<sitepack_core::ScanReport>, BuildError> {
        let Some(state) = self.store.load(&self.config.build_id)? else {
            return Ok(None);
        };
        let past_scan = state
            .progress
            .status
            .phase_order()
            .is_some_and(|order| order > Status::ScanValidation.phase_order().unwrap_or(u8::MAX));
        if !past_scan {
            return Ok(None);
        }
        Ok(Some(state.scan_result.report(&state.filter_set)))
    }

    /// Metadata of the output artifact, `None` until the archive is built.
    pub fn descriptor(&self) -> Result<Option<ArchiveDescriptor>, BuildError> {
        let Some(state) = self.store.load(&self.config.build_id)? else {
            return Ok(None);
        };
        if !state.progress.archive_built {
            return Ok(None);
        }
        let mut descriptor =
            ArchiveDescriptor::for_build(&self.config.build_id, self.config.strategy.format());
        descriptor.size = state.progress.archive_bytes_written;
        descriptor.file_count = state.progress.archive_file_count;
        descriptor.password = self.config.password.clone();
        Ok(Some(descriptor))
    }

    fn fresh_state(&self) -> PersistedState {
        PersistedState {
            progress: BuildProgress::new(self.config.strategy),
            scan_result: ScanResult::new(self.config.max_unreadable_tracked),
            filter_set: self.filters.clone(),
        }
    }

    /// Check preconditions and create the index generation.
    fn step_pre_process(&self, state: &mut PersistedState) -> Result<(), BuildError> {
        for root in &self.config.roots {
            if !root.exists() {
                warn!(root = %root.display(), "scan root missing, requirements failed");
                state.progress.status = Status::RequirementsFailed;
                state.progress.failed = true;
                state.progress.failure_message =
                    Some(format!("scan root {} does not exist", root.display()));
                return Ok(());
            }
        }
        std::fs::create_dir_all(&self.config.output_dir)
            .map_err(|e| BuildError::io(&self.config.output_dir, e))?;

        let mut index = FileIndexStore::open(self.config.index_path(), true)
            .map_err(|e| BuildError::index(e.to_string()))?;
        index
            .release()
            .map_err(|e| BuildError::index(e.to_string()))?;
        state.progress.advance(Status::Scanning)
    }

    /// Run one scan chunk, continuing from the persisted cursor.
    fn step_scanning(&self, state: &mut PersistedState) -> Result<(), BuildError> {
        let mut index = FileIndexStore::open(self.config.index_path(), false)
            .map_err(|e| BuildError::index(e.to_string()))?;
        let mut cursor = state.progress.scan_cursor.take().unwrap_or_default();

        let chunker = ScanChunker::new(&self.config, &state.filter_set);
        let outcome = chunker.run_chunk(
            &mut index,
            &mut state.scan_result,
            &mut cursor,
            ChunkLimits::from_config(&self.config),
        );
        index
            .release()
            .map_err(|e| BuildError::index(e.to_string()))?;

        match outcome? {
            ChunkStatus::Stop => {
                debug!(
                    build_id = %self.config.build_id,
                    depth = cursor.stack.len(),
                    "scan suspended at chunk boundary"
                );
                state.progress.scan_cursor = Some(cursor);
                Ok(())
            }
            ChunkStatus::Complete => {
                info!(
                    build_id = %self.config.build_id,
                    dirs = state.scan_result.dir_count,
                    files = state.scan_result.file_count,
                    size = %state.scan_result.display_size(),
                    "scan complete"
                );
                state.progress.scan_cursor = None;
                state.progress.advance(Status::ScanValidation)
            }
        }
    }

    /// Cross-check the index against the scan aggregate.
    fn step_scan_validation(&self, state: &mut PersistedState) -> Result<(), BuildError> {
        let index = FileIndexStore::open_read_only(self.config.index_path())
            .map_err(|e| BuildError::index(e.to_string()))?;
        let dirs = index.count(sitepack_core::EntryKind::Dir);
        let files = index.count(sitepack_core::EntryKind::File);
        if dirs != state.scan_result.dir_count || files != state.scan_result.file_count {
            let error = BuildError::integrity(format!(
                "index holds {dirs} dirs / {files} files but the scan recorded {} / {}",
                state.scan_result.dir_count, state.scan_result.file_count
            ));
            state.progress.fail(&error);
            return Ok(());
        }
        state.progress.advance(Status::AfterScan)
    }

    /// Run one archive engine chunk.
    fn step_archiving(&self, state: &mut PersistedState) -> Result<(), BuildError> {
        let index = FileIndexStore::open_read_only(self.config.index_path())
            .map_err(|e| BuildError::index(e.to_string()))?;
        let mut engine = engine_for(state.progress.strategy);
        let mut ctx = ArchiveContext {
            config: &self.config,
            index: &index,
            filters: &state.filter_set,
            scan_result: &state.scan_result,
            progress: &mut state.progress,
        };
        match engine.build_chunk(&mut ctx)? {
            StepOutcome::Continue => Ok(()),
            StepOutcome::Complete => state.progress.advance(Status::ArcValidation),
            // The engine already moved the progress record to Error.
            StepOutcome::Failed => Ok(()),
        }
    }

    /// Validate the finished archive before it is handed onward.
    fn step_arc_validation(&self, state: &mut PersistedState) -> Result<(), BuildError> {
        let validator = IntegrityValidator::new(&self.config);
        let counted = validator.validate_count(&state.progress, &state.scan_result);

        let structural = match counted {
            Ok(()) => {
                let archive_path = self.config.archive_path();
                let is_zip = matches!(
                    self.config.strategy.format(),
                    ArchiveFormat::Zip | ArchiveFormat::ShellZip
                );
                if is_zip && archive_path.exists() {
                    ArtifactCheck::zip(&archive_path).run()
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e),
        };

        match structural {
            Ok(()) => state.progress.advance(Status::ArcDone),
            Err(error) => {
                state.progress.fail(&error);
                Ok(())
            }
        }
    }

    /// Confirm the artifact is in place for downstream storage.
    fn step_copied_package(&self, state: &mut PersistedState) -> Result<(), BuildError> {
        let archive_path = self.config.archive_path();
        let empty_build = state.progress.archive_file_count == Some(0) && !archive_path.exists();
        if !empty_build && !archive_path.exists() {
            warn!(archive = %archive_path.display(), "archive artifact missing before storage");
            state.progress.status = Status::StorageFailed;
            state.progress.failed = true;
            state.progress.failure_message = Some(format!(
                "archive {} disappeared before storage hand-off",
                archive_path.display()
            ));
            return Ok(());
        }
        state.progress.advance(Status::StorageProcessing)
    }

    /// Complete a pending cancellation and clean up working files.
    fn finish_cancel(&self, state: &mut PersistedState) {
        let past_archiving = state.progress.archive_built;
        state.progress.cancel(past_archiving);
        if !past_archiving {
            // Partial archives are useless; drop them with the index.
            let _ = std::fs::remove_file(self.config.archive_path());
        }
        FileIndexStore::remove_files(&self.config.index_path());
        info!(
            build_id = %self.config.build_id,
            status = %state.progress.status,
            "build cancelled"
        );
    }
}
