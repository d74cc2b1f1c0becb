//! Narrow persistence contract between invocations.
//!
//! The core never assumes a specific storage engine: the orchestrator talks
//! to a [`StateStore`] and nothing else. The JSON file implementation here
//! makes the pipeline runnable end-to-end; a row store or key-value backend
//! can replace it behind the same trait.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::BuildError;
use crate::filter::FilterSet;
use crate::progress::BuildProgress;
use crate::report::ScanResult;

/// Everything a later invocation needs to resume a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    /// The resumable cursor and status record.
    pub progress: BuildProgress,
    /// Scan aggregate, partial until the scan phase completes.
    pub scan_result: ScanResult,
    /// Effective filters, resolved once at build start.
    pub filter_set: FilterSet,
}

/// Save/load boundary to the external persistence collaborator.
pub trait StateStore {
    /// Load the state of a build, `None` if it was never saved.
    fn load(&self, build_id: &str) -> Result<Option<PersistedState>, BuildError>;

    /// Persist the state of a build. Called after every chunk.
    fn save(&self, build_id: &str, state: &PersistedState) -> Result<(), BuildError>;

    /// Drop the persisted state once the build reaches a terminal state.
    fn clear(&self, build_id: &str) -> Result<(), BuildError>;
}

/// File-backed [`StateStore`] writing one JSON document per build.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    dir: PathBuf,
}

impl JsonStateStore {
    /// Create a store rooted at `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, BuildError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| BuildError::io(&dir, e))?;
        Ok(Self { dir })
    }

    fn path_for(&self, build_id: &str) -> PathBuf {
        self.dir.join(format!("{build_id}.state.json"))
    }
}

impl StateStore for JsonStateStore {
    fn load(&self, build_id: &str) -> Result<Option<PersistedState>, BuildError> {
        let path = self.path_for(build_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BuildError::io(&path, e)),
        };
        let state = serde_json::from_str(&raw)
            .map_err(|e| BuildError::state(format!("corrupt state for {build_id}: {e}")))?;
        Ok(Some(state))
    }

    fn save(&self, build_id: &str, state: &PersistedState) -> Result<(), BuildError> {
        let path = self.path_for(build_id);
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| BuildError::state(format!("serialize state for {build_id}: {e}")))?;
        // Write-then-rename so an interrupted save never leaves a torn file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| BuildError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| BuildError::io(&path, e))?;
        Ok(())
    }

    fn clear(&self, build_id: &str) -> Result<(), BuildError> {
        let path = self.path_for(build_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BuildError::io(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::BuildStrategy;

    fn sample_state() -> PersistedState {
        PersistedState {
            progress: BuildProgress::new(BuildStrategy::NativeChunked),
            scan_result: ScanResult::new(100),
            filter_set: FilterSet::default(),
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path()).unwrap();

        assert!(store.load("b1").unwrap().is_none());

        let mut state = sample_state();
        state.progress.next_file_index = 9;
        store.save("b1", &state).unwrap();

        let loaded = store.load("b1").unwrap().unwrap();
        assert_eq!(loaded.progress.next_file_index, 9);
        assert_eq!(loaded.progress.status, state.progress.status);
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path()).unwrap();
        store.save("b1", &sample_state()).unwrap();
        store.clear("b1").unwrap();
        store.clear("b1").unwrap();
        assert!(store.load("b1").unwrap().is_none());
    }

    #[test]
    fn corrupt_state_is_an_error_not_a_fresh_build() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path()).unwrap();
        fs::write(dir.path().join("b1.state.json"), "{not json").unwrap();
        assert!(store.load("b1").is_err());
    }
}
