//! Scan results and the scan report hand-off contract.

use std::path::PathBuf;

use humansize::{format_size, DECIMAL};
use serde::{Deserialize, Serialize};

use crate::filter::FilterSet;

/// An entry flagged as oversized during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OversizedEntry {
    /// Path relative to the scan root.
    pub path: PathBuf,
    /// Bytes for files, contained node count for directories.
    pub measure: u64,
}

/// Capped list of unreadable paths with the true count kept separately.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnreadableTracker {
    /// Up to `cap` unreadable paths, in discovery order.
    pub paths: Vec<PathBuf>,
    /// True number of unreadable items seen, including dropped ones.
    pub total: u64,
    /// Maximum number of paths retained.
    pub cap: usize,
}

impl UnreadableTracker {
    /// Create a tracker retaining at most `cap` paths.
    pub fn with_cap(cap: usize) -> Self {
        Self {
            paths: Vec::new(),
            total: 0,
            cap,
        }
    }

    /// Record an unreadable path, dropping it if the cap is reached.
    pub fn record(&mut self, path: PathBuf) {
        self.total += 1;
        if self.paths.len() < self.cap {
            self.paths.push(path);
        }
    }

    /// Whether paths were dropped because of the cap.
    pub fn truncated(&self) -> bool {
        self.total > self.paths.len() as u64
    }
}

/// Aggregate result of a scan, accumulated across resumed chunks.
///
/// Immutable once the scan completes; the archiving phase consumes it
/// read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    /// Number of directories accepted into the index.
    pub dir_count: u64,
    /// Number of files accepted into the index.
    pub file_count: u64,
    /// Total bytes across accepted files.
    pub total_bytes: u64,
    /// Directories with more nodes than the configured threshold.
    pub oversized_dirs: Vec<OversizedEntry>,
    /// Files larger than the configured threshold.
    pub oversized_files: Vec<OversizedEntry>,
    /// Unreadable paths, capped.
    pub unreadable: UnreadableTracker,
    /// Symlinked directories that loop back to an ancestor.
    pub recursive_links: Vec<PathBuf>,
    /// Foreign installations found beneath the scan roots.
    pub foreign_installs: Vec<PathBuf>,
}

impl ScanResult {
    /// Create an empty result with the given unreadable cap.
    pub fn new(unreadable_cap: usize) -> Self {
        Self {
            dir_count: 0,
            file_count: 0,
            total_bytes: 0,
            oversized_dirs: Vec::new(),
            oversized_files: Vec::new(),
            unreadable: UnreadableTracker::with_cap(unreadable_cap),
            recursive_links: Vec::new(),
            foreign_installs: Vec::new(),
        }
    }

    /// Fresh result for a re-scan, carrying forward only the prior
    /// unreadable total so repeated failures stay visible.
    pub fn reset(&self) -> Self {
        let mut fresh = Self::new(self.unreadable.cap);
        fresh.unreadable.total = self.unreadable.total;
        fresh
    }

    /// Record an accepted directory.
    pub fn record_dir(&mut self, path: &std::path::Path, nodes: u64, oversized_threshold: u64) {
        self.dir_count += 1;
        if nodes > oversized_threshold {
            self.oversized_dirs.push(OversizedEntry {
                path: path.to_path_buf(),
                measure: nodes,
            });
        }
    }

    /// Record an accepted file.
    pub fn record_file(&mut self, path: &std::path::Path, size: u64, oversized_threshold: u64) {
        self.file_count += 1;
        self.total_bytes += size;
        if size > oversized_threshold {
            self.oversized_files.push(OversizedEntry {
                path: path.to_path_buf(),
                measure: size,
            });
        }
    }

    /// Directories plus files.
    pub fn full_count(&self) -> u64 {
        self.dir_count + self.file_count
    }

    /// Total size formatted for display.
    pub fn display_size(&self) -> String {
        format_size(self.total_bytes, DECIMAL)
    }

    /// Whether any size warnings apply (oversized entries found).
    pub fn has_size_warnings(&self) -> bool {
        !self.oversized_dirs.is_empty() || !self.oversized_files.is_empty()
    }

    /// Build the structured scan report handed to the archiving phase.
    pub fn report(&self, filters: &FilterSet) -> ScanReport {
        ScanReport {
            dir_count: self.dir_count,
            file_count: self.file_count,
            full_count: self.full_count(),
            dir_count_display: self.dir_count.to_string(),
            file_count_display: self.file_count.to_string(),
            full_count_display: self.full_count().to_string(),
            total_bytes: self.total_bytes,
            total_bytes_display: self.display_size(),
            filtered_dirs: filters.dirs_delimited(),
            filtered_exts: filters.exts_delimited(),
            filtered_files: filters.files_delimited(),
            recursive_links: self.recursive_links.clone(),
            unreadable_paths: self.unreadable.paths.clone(),
            unreadable_total: self.unreadable.total,
            foreign_installs: self.foreign_installs.clone(),
            size_warning: self.has_size_warnings(),
            name_warning: self.unreadable.truncated(),
        }
    }
}

/// Persisted, structured hand-off between the scan phase and archiving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub dir_count: u64,
    pub file_count: u64,
    pub full_count: u64,
    pub dir_count_display: String,
    pub file_count_display: String,
    pub full_count_display: String,
    pub total_bytes: u64,
    pub total_bytes_display: String,
    pub filtered_dirs: String,
    pub filtered_exts: String,
    pub filtered_files: String,
    pub recursive_links: Vec<PathBuf>,
    pub unreadable_paths: Vec<PathBuf>,
    pub unreadable_total: u64,
    pub foreign_installs: Vec<PathBuf>,
    pub size_warning: bool,
    pub name_warning: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn unreadable_cap_bounds_memory_but_not_count() {
        let mut tracker = UnreadableTracker::with_cap(2);
        for i in 0..5 {
            tracker.record(PathBuf::from(format!("broken-{i}")));
        }
        assert_eq!(tracker.paths.len(), 2);
        assert_eq!(tracker.total, 5);
        assert!(tracker.truncated());
    }

    #[test]
    fn reset_carries_forward_only_unreadable_total() {
        let mut result = ScanResult::new(10);
        result.record_file(Path::new("a.txt"), 100, 1_000);
        result.unreadable.record(PathBuf::from("broken"));
        result.recursive_links.push(PathBuf::from("loop"));

        let fresh = result.reset();
        assert_eq!(fresh.file_count, 0);
        assert_eq!(fresh.total_bytes, 0);
        assert!(fresh.recursive_links.is_empty());
        assert!(fresh.unreadable.paths.is_empty());
        assert_eq!(fresh.unreadable.total, 1);
    }

    #[test]
    fn oversized_entries_are_flagged() {
        let mut result = ScanResult::new(10);
        result.record_dir(Path::new("big-dir"), 5_000, 1_000);
        result.record_file(Path::new("big.iso"), 2_000_000, 1_000_000);
        result.record_file(Path::new("small.txt"), 10, 1_000_000);

        assert_eq!(result.oversized_dirs.len(), 1);
        assert_eq!(result.oversized_files.len(), 1);
        assert!(result.has_size_warnings());
        assert_eq!(result.full_count(), 3);
    }
}
