//! Native zip engines: single-pass and chunked multi-pass.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use sitepack_core::{BuildConfig, BuildError, EntryKind};
use sitepack_index::IndexEntry;

use crate::engine::{retry_or_fail, retry_stalled_chunk, ArchiveContext, ArchiveEngine, StepOutcome};

/// Multi-pass zip engine.
///
/// Appends directory entries in one tight pass, then appends files resuming
/// from the persisted cursor, closing and reopening the container at every
/// byte or wall-clock boundary so no file handle outlives a chunk.
pub struct NativeChunkedEngine;

impl NativeChunkedEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NativeChunkedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveEngine for NativeChunkedEngine {
    fn build_chunk(&mut self, ctx: &mut ArchiveContext<'_>) -> Result<StepOutcome, BuildError> {
        build_native(ctx, true)
    }
}

/// Single-pass zip engine.
///
/// Same per-file logic as the chunked engine but the whole remaining list
/// goes through one open/close pair per invocation. Only acceptable when
/// total work fits the invocation's time budget; its retry ceiling is
/// lower because a single-pass failure is more likely systemic.
pub struct NativeSingleThreadedEngine;

impl NativeSingleThreadedEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NativeSingleThreadedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveEngine for NativeSingleThreadedEngine {
    fn build_chunk(&mut self, ctx: &mut ArchiveContext<'_>) -> Result<StepOutcome, BuildError> {
        build_native(ctx, false)
    }
}

fn build_native(ctx: &mut ArchiveContext<'_>, chunked: bool) -> Result<StepOutcome, BuildError> {
    let archive_path = ctx.config.archive_path();
    let started = Instant::now();

    // Nothing appended yet means the container can be (re)created from
    // scratch; anything else must reopen in append mode.
    let fresh = ctx.progress.next_dir_index == 0 && ctx.progress.next_file_index == 0;
    let mut zip = match open_container(&archive_path, fresh) {
        Ok(zip) => zip,
        Err(error) => return Ok(retry_or_fail(ctx, "archive-open", &error)),
    };

    // Directory entries are cheap; they all go in one tight pass. The
    // cursor advance only sticks if the close succeeds.
    let dir_window_start = ctx.progress.next_dir_index;
    let dir_count = ctx.index.count(EntryKind::Dir);
    if ctx.progress.next_dir_index < dir_count {
        let options = SimpleFileOptions::default();
        for entry in ctx
            .index
            .iter_paths(EntryKind::Dir)
            .skip(ctx.progress.next_dir_index as usize)
        {
            let name = entry_name(ctx.config, entry);
            if let Err(e) = zip.add_directory(name, options) {
                let error = BuildError::index(format!("add directory failed: {e}"));
                return Ok(retry_or_fail(ctx, "archive-add-dir", &error));
            }
            ctx.progress.next_dir_index += 1;
        }
    }

    // Files resume from the persisted cursor. On a close failure the whole
    // window is replayed, so the cursor only moves once the close succeeds.
    let window_start = ctx.progress.next_file_index;
    let mut window_file_index = window_start;
    let mut window_bytes = 0u64;
    let file_count = ctx.index.count(EntryKind::File);

    for entry in ctx
        .index
        .iter_paths(EntryKind::File)
        .skip(window_start as usize)
    {
        if chunked
            && (window_bytes >= ctx.config.chunk_bytes
                || started.elapsed() >= ctx.config.max_chunk_duration)
        {
            // A boundary hit before anything was appended means the budget
            // cannot fit even one entry; suspending would replay the same
            // empty chunk forever.
            if window_file_index == window_start && ctx.progress.next_dir_index == dir_window_start
            {
                let _ = zip.finish();
                return Ok(retry_stalled_chunk(ctx, "archive-chunk"));
            }
            return Ok(close_window(
                ctx,
                zip,
                &archive_path,
                window_file_index,
                window_bytes,
                StepOutcome::Continue,
            ));
        }

        let Some(source) = resolve_source(ctx.config, entry) else {
            warn!(root = entry.root, path = %entry.path.display(), "entry references an unknown scan root");
            window_file_index += 1;
            continue;
        };
        let name = entry_name(ctx.config, entry);
        match append_file(&mut zip, &source, &name, ctx.progress.validation_mode) {
            Ok(appended) => window_bytes += appended,
            Err(e) => {
                // Per-item failure: logged and skipped, never aborts the phase.
                warn!(path = %entry.path.display(), error = %e, "skipping unreadable file");
            }
        }
        window_file_index += 1;
    }

    let outcome = close_window(
        ctx,
        zip,
        &archive_path,
        window_file_index,
        window_bytes,
        StepOutcome::Complete,
    );
    if outcome == StepOutcome::Complete {
        ctx.progress.archive_built = true;
        ctx.progress.archive_file_count = count_zip_entries(&archive_path);
        debug!(
            files = file_count,
            dirs = dir_count,
            entries = ?ctx.progress.archive_file_count,
            "native archive complete"
        );
    }
    Ok(outcome)
}

/// Close the container; only a successful close advances the file cursor.
fn close_window(
    ctx: &mut ArchiveContext<'_>,
    zip: ZipWriter<File>,
    archive_path: &Path,
    window_end: u64,
    window_bytes: u64,
    on_success: StepOutcome,
) -> StepOutcome {
    match zip.finish() {
        Ok(_file) => {
            ctx.progress.next_file_index = window_end;
            ctx.progress.archive_bytes_written += window_bytes;
            ctx.progress.clear_retries();
            let total = ctx.scan_result.full_count();
            ctx.progress
                .set_percent(ctx.progress.next_dir_index + window_end, total);
            on_success
        }
        Err(e) => recover_close_failure(ctx, archive_path, &e.to_string()),
    }
}

/// Recover from a failed container close.
///
/// A failed `finish` leaves the container without a central directory, so
/// it can never be reopened in append mode. The container is deleted and
/// every cursor reset; the retried build replays all entries into a fresh
/// container with per-file validation on.
pub(crate) fn recover_close_failure(
    ctx: &mut ArchiveContext<'_>,
    archive_path: &Path,
    cause: &str,
) -> StepOutcome {
    let _ = std::fs::remove_file(archive_path);
    ctx.progress.next_dir_index = 0;
    ctx.progress.next_file_index = 0;
    ctx.progress.archive_bytes_written = 0;
    ctx.progress.validation_mode = true;
    let error = BuildError::index(format!("container close failed: {cause}"));
    retry_or_fail(ctx, "archive-close", &error)
}

fn open_container(path: &Path, fresh: bool) -> Result<ZipWriter<File>, BuildError> {
    if fresh || !path.exists() {
        let file = File::create(path).map_err(|e| BuildError::io(path, e))?;
        Ok(ZipWriter::new(file))
    } else {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| BuildError::io(path, e))?;
        ZipWriter::new_append(file)
            .map_err(|e| BuildError::index(format!("reopen container failed: {e}")))
    }
}

/// Append one file, returning its byte size.
///
/// In validation mode the source is stat-checked before the entry header
/// is written, so an unreadable file cannot leave a truncated entry.
fn append_file(
    zip: &mut ZipWriter<File>,
    source: &Path,
    name: &str,
    validation_mode: bool,
) -> io::Result<u64> {
    if validation_mode {
        let meta = std::fs::metadata(source)?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file",
            ));
        }
    }
    let mut file = File::open(source)?;
    let size = file.metadata()?.len();
    let options = SimpleFileOptions::default().large_file(size >= u32::MAX as u64);
    zip.start_file(name, options).map_err(io::Error::other)?;
    io::copy(&mut file, zip)
}

fn count_zip_entries(path: &Path) -> Option<u64> {
    let file = File::open(path).ok()?;
    let archive = zip::ZipArchive::new(file).ok()?;
    Some(archive.len() as u64)
}

/// Absolute source path for an index entry, resolved against its own root.
///
/// `None` means the entry references a root index outside the configured
/// root list, which only happens when the index and configuration disagree.
pub(crate) fn resolve_source(config: &BuildConfig, entry: &IndexEntry) -> Option<PathBuf> {
    config.roots.get(entry.root).map(|root| root.join(&entry.path))
}

/// Archive entry name for an index entry.
///
/// With a single root, entry names are the index's relative paths. With
/// multiple roots each root's tree goes under a top-level directory named
/// after the root, so identical relative paths cannot collide.
pub(crate) fn entry_name(config: &BuildConfig, entry: &IndexEntry) -> String {
    let name = zip_name(&entry.path);
    if config.roots.len() <= 1 {
        return name;
    }
    let label = config
        .roots
        .get(entry.root)
        .and_then(|root| root.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| format!("root-{}", entry.root));
    format!("{label}/{name}")
}

pub(crate) fn zip_name(rel_path: &Path) -> String {
    rel_path
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
