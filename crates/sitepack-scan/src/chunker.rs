//! Chunked depth-first walk.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use sitepack_core::{
    BuildConfig, BuildError, DirFrame, EntryKind, FilterSet, ScanCursor, ScanResult,
};
use sitepack_index::FileIndexStore;

/// How one chunk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// Budget reached; call again with the saved cursor.
    Stop,
    /// The entire root set is exhausted.
    Complete,
}

/// Budgets bounding one chunk.
#[derive(Debug, Clone, Copy)]
pub struct ChunkLimits {
    /// Maximum entries visited in this chunk.
    pub max_iterations: usize,
    /// Wall-clock budget measured from chunk start.
    pub max_duration: Duration,
}

impl ChunkLimits {
    /// Budgets from the build configuration.
    pub fn from_config(config: &BuildConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            max_duration: config.max_chunk_duration,
        }
    }
}

/// Walks the scan roots under filter rules, one bounded chunk at a time.
pub struct ScanChunker<'a> {
    config: &'a BuildConfig,
    filters: &'a FilterSet,
}

impl<'a> ScanChunker<'a> {
    /// Create a chunker over the configured roots and resolved filters.
    pub fn new(config: &'a BuildConfig, filters: &'a FilterSet) -> Self {
        Self { config, filters }
    }

    /// Run one chunk of the scan.
    ///
    /// Visits entries until `limits` are hit (`Stop`) or every root is
    /// exhausted (`Complete`), appending accepted entries to `index` and
    /// aggregates to `result`. The cursor is updated in place and, together
    /// with the flushed index, is everything a later invocation needs.
    /// Errors are unrecoverable index faults; per-item failures are
    /// recorded and skipped.
    pub fn run_chunk(
        &self,
        index: &mut FileIndexStore,
        result: &mut ScanResult,
        cursor: &mut ScanCursor,
        limits: ChunkLimits,
    ) -> Result<ChunkStatus, BuildError> {
        let started = Instant::now();
        let mut visited = 0usize;

        while cursor.next_root < self.config.roots.len() {
            let root = self.config.roots[cursor.next_root].clone();

            if cursor.stack.is_empty() {
                // Root-level exclusion skips the whole root up front.
                if self.root_excluded(&root) {
                    debug!(root = %root.display(), "scan root is excluded, skipping");
                    cursor.next_root += 1;
                    continue;
                }
                match fs::symlink_metadata(&root) {
                    Ok(meta) if meta.is_dir() => {
                        cursor.stack.push(DirFrame {
                            rel_path: PathBuf::new(),
                            next_child: 0,
                        });
                    }
                    Ok(_) | Err(_) => {
                        warn!(root = %root.display(), "scan root unreadable or not a directory");
                        result.unreadable.record(root.clone());
                        cursor.next_root += 1;
                        continue;
                    }
                }
            }

            while let Some(frame) = cursor.stack.last().cloned() {
                let dir_abs = root.join(&frame.rel_path);
                let children = match sorted_children(&dir_abs) {
                    Ok(children) => children,
                    Err(e) => {
                        warn!(dir = %dir_abs.display(), error = %e, "unreadable directory");
                        result.unreadable.record(dir_abs);
                        cursor.stack.pop();
                        continue;
                    }
                };

                if frame.next_child >= children.len() {
                    cursor.stack.pop();
                    continue;
                }

                let mut descended = false;
                for child_idx in frame.next_child..children.len() {
                    if visited >= limits.max_iterations || started.elapsed() >= limits.max_duration
                    {
                        self.suspend(index, cursor)?;
                        return Ok(ChunkStatus::Stop);
                    }

                    let name = &children[child_idx];
                    let rel = frame.rel_path.join(name);
                    let abs = root.join(&rel);
                    visited += 1;
                    self.bump_frame(cursor, child_idx + 1);

                    if self.visit_entry(index, result, cursor, &root, &rel, &abs)? {
                        descended = true;
                        break;
                    }
                }
                if !descended {
                    // Frame exhausted unless a budget stop fired above.
                    if cursor
                        .stack
                        .last()
                        .is_some_and(|top| top.rel_path == frame.rel_path)
                    {
                        cursor.stack.pop();
                    }
                }
            }

            cursor.next_root += 1;
        }

        index.save().map_err(|e| BuildError::index(e.to_string()))?;
        debug!(visited, "scan complete");
        Ok(ChunkStatus::Complete)
    }

    /// Classify and record one entry. Returns `true` when the walk
    /// descended into a new directory frame.
    fn visit_entry(
        &self,
        index: &mut FileIndexStore,
        result: &mut ScanResult,
        cursor: &mut ScanCursor,
        root: &Path,
        rel: &Path,
        abs: &Path,
    ) -> Result<bool, BuildError> {
        let rel_str = rel_to_string(rel);

        let meta = match fs::symlink_metadata(abs) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %abs.display(), error = %e, "unreadable entry");
                result.unreadable.record(abs.to_path_buf());
                return Ok(false);
            }
        };

        if meta.file_type().is_symlink() {
            return Ok(self.visit_symlink(result, root, rel, abs));
        }

        if meta.is_dir() {
            if self.filters.excludes_dir(&rel_str) {
                debug!(path = %rel_str, "directory excluded by filter");
                return Ok(false);
            }
            let children = match sorted_children(abs) {
                Ok(children) => children,
                Err(e) => {
                    warn!(path = %abs.display(), error = %e, "unreadable directory");
                    result.unreadable.record(abs.to_path_buf());
                    return Ok(false);
                }
            };
            if self.is_foreign_install(&children) {
                debug!(path = %rel_str, "foreign installation detected");
                result.foreign_installs.push(rel.to_path_buf());
            }
            let nodes = children.len() as u64;
            index
                .add(EntryKind::Dir, cursor.next_root, rel, 0, nodes)
                .map_err(|e| BuildError::index(e.to_string()))?;
            result.record_dir(rel, nodes, self.config.oversized_dir_nodes);
            cursor.stack.push(DirFrame {
                rel_path: rel.to_path_buf(),
                next_child: 0,
            });
            return Ok(true);
        }

        if meta.is_file() {
            if self.filters.excludes_file(&rel_str) {
                return Ok(false);
            }
            index
                .add(EntryKind::File, cursor.next_root, rel, meta.len(), 0)
                .map_err(|e| BuildError::index(e.to_string()))?;
            result.record_file(rel, meta.len(), self.config.oversized_file_bytes);
        }
        // Sockets, fifos and similar are silently skipped.
        Ok(false)
    }

    /// A symlinked directory that resolves to an ancestor of itself is a
    /// recursive link. No symlink is followed; the link target is reached
    /// through its real path if it lives under a scan root.
    fn visit_symlink(&self, result: &mut ScanResult, root: &Path, rel: &Path, abs: &Path) -> bool {
        let Ok(target) = fs::canonicalize(abs) else {
            result.unreadable.record(abs.to_path_buf());
            return false;
        };
        if target.is_dir() {
            let parent = abs.parent().unwrap_or(root);
            if let Ok(canonical_parent) = fs::canonicalize(parent) {
                if canonical_parent.starts_with(&target) {
                    debug!(path = %rel.display(), target = %target.display(), "recursive symlink");
                    result.recursive_links.push(rel.to_path_buf());
                    return false;
                }
            }
            // Non-recursive directory symlinks are not followed.
            return false;
        }
        false
    }

    fn root_excluded(&self, root: &Path) -> bool {
        let normalized = root
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        self.filters.excludes_dir(&normalized)
    }

    fn is_foreign_install(&self, children: &[std::ffi::OsString]) -> bool {
        children.iter().any(|name| {
            self.config
                .foreign_install_markers
                .iter()
                .any(|marker| name.as_os_str() == std::ffi::OsStr::new(marker))
        })
    }

    fn bump_frame(&self, cursor: &mut ScanCursor, next_child: usize) {
        if let Some(top) = cursor.stack.last_mut() {
            top.next_child = next_child;
        }
    }

    /// Flush everything before handing control back; the index must never
    /// be left half-written across a suspension point.
    fn suspend(&self, index: &mut FileIndexStore, cursor: &ScanCursor) -> Result<(), BuildError> {
        index.save().map_err(|e| BuildError::index(e.to_string()))?;
        debug!(
            root = cursor.next_root,
            depth = cursor.stack.len(),
            "chunk budget reached, suspending"
        );
        Ok(())
    }
}

/// Directory children sorted by name for deterministic iteration order.
fn sorted_children(dir: &Path) -> std::io::Result<Vec<std::ffi::OsString>> {
    let mut names: Vec<std::ffi::OsString> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.file_name()))
        .collect();
    names.sort();
    Ok(names)
}

fn rel_to_string(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
