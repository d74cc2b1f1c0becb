//! JSON-lines index store with exclusive-writer locking.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use sitepack_core::EntryKind;
use thiserror::Error;
use tracing::debug;

use crate::entry::IndexEntry;

/// Errors from the index store.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Another build currently holds the write lock.
    #[error("Index at {path} is locked by another writer")]
    Locked { path: PathBuf },

    /// The store was opened read-only.
    #[error("Index at {path} is read-only")]
    ReadOnly { path: PathBuf },

    /// A row failed to parse.
    #[error("Corrupt index row {line} in {path}: {message}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// Underlying I/O failure.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl IndexError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Append/query index of every path discovered by a scan.
///
/// Two logical lists (directories and files) share one JSON-lines file.
/// At most one writer holds the index at a time, enforced by a lock file;
/// any number of later invocations may reopen it read-only.
#[derive(Debug)]
pub struct FileIndexStore {
    path: PathBuf,
    entries: Vec<IndexEntry>,
    by_path: IndexMap<(EntryKind, usize, PathBuf), usize>,
    writer: Option<BufWriter<File>>,
    locked: bool,
}

impl FileIndexStore {
    /// Open an index for writing.
    ///
    /// With `create` the file is truncated and a new generation starts;
    /// without it, existing rows are loaded and appends continue after
    /// them. Acquires the exclusive write lock either way.
    pub fn open(path: impl Into<PathBuf>, create: bool) -> Result<Self, IndexError> {
        let path = path.into();
        acquire_lock(&path)?;

        let mut store = Self {
            entries: Vec::new(),
            by_path: IndexMap::new(),
            writer: None,
            locked: true,
            path: path.clone(),
        };

        if create {
            let file = File::create(&path).map_err(|e| {
                release_lock(&path);
                IndexError::io(&path, e)
            })?;
            store.writer = Some(BufWriter::new(file));
        } else {
            if path.exists() {
                store.load_rows()?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| {
                    release_lock(&path);
                    IndexError::io(&path, e)
                })?;
            store.writer = Some(BufWriter::new(file));
        }

        debug!(path = %store.path.display(), rows = store.entries.len(), create, "index opened");
        Ok(store)
    }

    /// Reopen an existing index read-only, without taking the lock.
    ///
    /// This is how the archiving phase, running in a separate invocation,
    /// consumes the index a scan produced.
    pub fn open_read_only(path: impl Into<PathBuf>) -> Result<Self, IndexError> {
        let path = path.into();
        let mut store = Self {
            entries: Vec::new(),
            by_path: IndexMap::new(),
            writer: None,
            locked: false,
            path,
        };
        store.load_rows()?;
        Ok(store)
    }

    fn load_rows(&mut self) -> Result<(), IndexError> {
        let file = File::open(&self.path).map_err(|e| IndexError::io(&self.path, e))?;
        let reader = BufReader::new(file);
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| IndexError::io(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: IndexEntry =
                serde_json::from_str(&line).map_err(|e| IndexError::Corrupt {
                    path: self.path.clone(),
                    line: line_no + 1,
                    message: e.to_string(),
                })?;
            self.push_entry(entry);
        }
        Ok(())
    }

    fn push_entry(&mut self, entry: IndexEntry) {
        let key = (entry.kind, entry.root, entry.path.clone());
        let idx = self.entries.len();
        self.entries.push(entry);
        self.by_path.insert(key, idx);
    }

    /// Append one row. Duplicate paths within a kind and root are ignored
    /// so a resumed chunk replaying its boundary entry cannot double-record.
    pub fn add(
        &mut self,
        kind: EntryKind,
        root: usize,
        path: impl Into<PathBuf>,
        size: u64,
        nodes: u64,
    ) -> Result<(), IndexError> {
        let writer = self.writer.as_mut().ok_or_else(|| IndexError::ReadOnly {
            path: self.path.clone(),
        })?;

        let path = path.into();
        if self.by_path.contains_key(&(kind, root, path.clone())) {
            return Ok(());
        }

        let entry = IndexEntry {
            kind,
            root,
            path,
            size,
            nodes,
        };
        let line =
            serde_json::to_string(&entry).map_err(|e| IndexError::io(&self.path, e.into()))?;
        writeln!(writer, "{line}").map_err(|e| IndexError::io(&self.path, e))?;
        self.push_entry(entry);
        Ok(())
    }

    /// Iterate paths of one kind, in insertion order.
    ///
    /// Restartable: a fresh call always starts at the first entry; the
    /// archive phase applies its own resume cursor with `skip`.
    pub fn iter_paths(&self, kind: EntryKind) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    /// Iterate paths of one kind beneath a relative prefix, in insertion
    /// order. Prefix matching is by whole path component.
    pub fn iter_paths_under<'a>(
        &'a self,
        kind: EntryKind,
        prefix: &'a Path,
    ) -> impl Iterator<Item = &'a IndexEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.kind == kind && entry.path.starts_with(prefix))
    }

    /// Number of rows of one kind.
    pub fn count(&self, kind: EntryKind) -> u64 {
        self.entries.iter().filter(|e| e.kind == kind).count() as u64
    }

    /// Point lookup by relative path, across all roots.
    pub fn find(&self, kind: EntryKind, rel_path: &Path) -> Option<&IndexEntry> {
        self.entries
            .iter()
            .find(|entry| entry.kind == kind && entry.path == rel_path)
    }

    /// Flush buffered rows to disk. Must complete before a chunk returns.
    pub fn save(&mut self) -> Result<(), IndexError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().map_err(|e| IndexError::io(&self.path, e))?;
        }
        Ok(())
    }

    /// Flush, close the writer, and drop the exclusive lock.
    pub fn release(&mut self) -> Result<(), IndexError> {
        self.save()?;
        self.writer = None;
        if self.locked {
            release_lock(&self.path);
            self.locked = false;
        }
        Ok(())
    }

    /// Delete the index file and its lock once a build completes.
    pub fn remove_files(path: &Path) {
        let _ = fs::remove_file(path);
        let _ = fs::remove_file(lock_path(path));
    }
}

impl Drop for FileIndexStore {
    fn drop(&mut self) {
        // Backstop; release() is the deterministic path.
        let _ = self.release();
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

fn acquire_lock(path: &Path) -> Result<(), IndexError> {
    let lock = lock_path(path);
    match OpenOptions::new().write(true).create_new(true).open(&lock) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(IndexError::Locked {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(IndexError::io(&lock, e)),
    }
}

fn release_lock(path: &Path) {
    let _ = fs::remove_file(lock_path(path));
}
