//! Post-build integrity validation.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use sitepack_core::{BuildConfig, BuildError, BuildProgress, Remediation, ScanResult};

/// Validates a finished archive against what the scan said should be in it.
///
/// The check is a ratio band, not an equality: filters legitimately remove
/// entries and tools count directories differently, so the archive count
/// must land within a configured fraction of the scanned count. Small
/// builds skip the check entirely because a handful of filtered files
/// swings the ratio outside any sensible band.
pub struct IntegrityValidator<'a> {
    config: &'a BuildConfig,
}

impl<'a> IntegrityValidator<'a> {
    pub fn new(config: &'a BuildConfig) -> Self {
        Self { config }
    }

    /// Check the archive entry count against the scan totals.
    ///
    /// Returns `Ok(())` when the build passes; the `Err` carries an
    /// integrity failure with an exclude-broken-paths remediation.
    pub fn validate_count(
        &self,
        progress: &BuildProgress,
        scan_result: &ScanResult,
    ) -> Result<(), BuildError> {
        if !progress.archive_built {
            return Err(BuildError::integrity("archive was never marked built"));
        }

        let expected = scan_result.full_count();
        if expected < self.config.min_expected_for_check {
            debug!(expected, "build too small for count validation, skipping");
            return Ok(());
        }

        let actual = match progress.archive_file_count {
            Some(actual) => actual,
            // Unknown count is a sentinel: the engine had no way to count
            // (no listing tool), which is not an integrity failure.
            None => {
                info!("archive entry count unknown, count validation skipped");
                return Ok(());
            }
        };

        // Unreadable paths were scanned but could never be archived, so
        // they widen the lower bound.
        let unreadable = scan_result.unreadable.total;
        let lower = ((expected.saturating_sub(unreadable)) as f64
            * self.config.count_ratio_min) as u64;
        let upper = (expected as f64 * self.config.count_ratio_max) as u64;

        if actual < lower || actual > upper {
            warn!(expected, actual, lower, upper, "archive entry count outside band");
            let remediation = if scan_result.unreadable.paths.is_empty() {
                None
            } else {
                Some(Remediation::exclude_broken_paths(
                    scan_result.unreadable.paths.clone(),
                ))
            };
            return Err(BuildError::Integrity {
                message: format!(
                    "archive holds {actual} entries, expected between {lower} and {upper} \
                     (scanned {expected}, {unreadable} unreadable)"
                ),
                remediation,
            });
        }

        debug!(expected, actual, "archive entry count within band");
        Ok(())
    }
}

/// Structural check for a single produced artifact.
///
/// Verifies the file exists, meets a minimum size, and ends with the
/// expected trailing marker bytes. `relaxed` downgrades a marker mismatch
/// to a log line, for formats whose trailer is tool-version dependent.
#[derive(Debug, Clone)]
pub struct ArtifactCheck {
    pub path: PathBuf,
    pub end_marker: Vec<u8>,
    pub min_bytes: u64,
    pub relaxed: bool,
}

impl ArtifactCheck {
    /// A zip artifact: non-trivial size, ends with the end-of-central-directory
    /// comment-length bytes.
    pub fn zip(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            end_marker: vec![0x00, 0x00],
            min_bytes: 22,
            relaxed: true,
        }
    }

    pub fn run(&self) -> Result<(), BuildError> {
        let meta = std::fs::metadata(&self.path).map_err(|e| BuildError::io(&self.path, e))?;
        if meta.len() < self.min_bytes {
            return Err(BuildError::integrity(format!(
                "{} is {} bytes, below the {} byte minimum",
                self.path.display(),
                meta.len(),
                self.min_bytes
            )));
        }

        if !self.end_marker.is_empty() {
            let mut file = File::open(&self.path).map_err(|e| BuildError::io(&self.path, e))?;
            let mut tail = vec![0u8; self.end_marker.len()];
            file.seek(SeekFrom::End(-(self.end_marker.len() as i64)))
                .and_then(|_| file.read_exact(&mut tail))
                .map_err(|e| BuildError::io(&self.path, e))?;
            if tail != self.end_marker {
                if self.relaxed {
                    debug!(path = %self.path.display(), "trailing marker mismatch tolerated");
                } else {
                    return Err(BuildError::integrity(format!("{} has a corrupt trailer", self.path.display())));
                }
            }
        }
        Ok(())
    }
}
