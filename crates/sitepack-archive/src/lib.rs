//! Archive build engines and integrity validation.
//!
//! Three interchangeable engine families construct the backup archive from
//! the file index: an external shell tool, the native zip library in
//! single-pass or chunked mode, and a custom streaming container. All of
//! them share one step contract with consistent progress and failure
//! semantics, so the orchestrator can drive any of them identically.

mod engine;
mod external;
mod native;
mod streaming;
mod validate;

pub use engine::{engine_for, ArchiveContext, ArchiveEngine, StepOutcome};
pub use external::ExternalToolEngine;
pub use native::{NativeChunkedEngine, NativeSingleThreadedEngine};
pub use streaming::{StreamingContainerEngine, StreamingEntry, StreamingReader};
pub use validate::{ArtifactCheck, IntegrityValidator};
