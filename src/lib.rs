//! Resumable backup-archive build pipeline.
//!
//! Ties the scanner, the file index, and the archive engines together into
//! one cooperative state machine. Each call to [`BuildPipeline::step`] runs
//! at most one bounded chunk of work, persists the build state, and
//! returns; a scheduler (cron, CLI loop, job queue) re-invokes until the
//! build reaches a terminal status. No thread outlives a step.

pub mod pipeline;

pub use pipeline::BuildPipeline;
