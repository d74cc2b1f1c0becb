//! Index row type.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sitepack_core::EntryKind;

/// One scanned path as recorded in the index.
///
/// Written once per scan generation, read many times during archiving.
/// The root index disambiguates identical relative paths found under
/// different scan roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Directory or file.
    pub kind: EntryKind,
    /// Position of the scan root this entry was found under.
    #[serde(default)]
    pub root: usize,
    /// Path relative to that scan root.
    pub path: PathBuf,
    /// Byte size; zero for directories.
    pub size: u64,
    /// Files under a directory, for oversized-directory reporting; zero
    /// for files.
    pub nodes: u64,
}
