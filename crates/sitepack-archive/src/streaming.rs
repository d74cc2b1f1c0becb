//! Custom sequential container engine.
//!
//! The streaming format is a plain forward-written file: a magic header
//! followed by length-prefixed entries, each carrying a deflate-compressed
//! payload and a CRC32 of the raw bytes. It needs no external tool and no
//! container reopen machinery, which is why it is the recommended fallback
//! when the other engines repeatedly fail.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use flate2::write::DeflateEncoder;
use flate2::Compression;
use tracing::{debug, warn};

use sitepack_core::{BuildError, EntryKind};

use crate::engine::{retry_or_fail, retry_stalled_chunk, ArchiveContext, ArchiveEngine, StepOutcome};
use crate::native::{entry_name, resolve_source};

const MAGIC: [u8; 4] = *b"SPKG";
const FORMAT_VERSION: u8 = 1;

const KIND_DIR: u8 = 0;
const KIND_FILE: u8 = 1;

/// Engine writing the custom sequential container in one forward pass,
/// chunked by the shared cursor.
pub struct StreamingContainerEngine;

impl StreamingContainerEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StreamingContainerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveEngine for StreamingContainerEngine {
    fn build_chunk(&mut self, ctx: &mut ArchiveContext<'_>) -> Result<StepOutcome, BuildError> {
        let archive_path = ctx.config.archive_path();
        let started = Instant::now();

        // The next invocation truncates back to the last checkpoint, so any
        // failure in this chunk must replay it from these positions.
        let dir_start = ctx.progress.next_dir_index;
        let file_start = ctx.progress.next_file_index;

        let mut writer = match open_for_append(ctx, &archive_path) {
            Ok(writer) => writer,
            Err(error) => return Ok(retry_or_fail(ctx, "streaming-open", &error)),
        };

        // Directories first, one cheap pass.
        let dir_count = ctx.index.count(EntryKind::Dir);
        for entry in ctx
            .index
            .iter_paths(EntryKind::Dir)
            .skip(ctx.progress.next_dir_index as usize)
        {
            let name = entry_name(ctx.config, entry);
            if let Err(e) = write_dir_entry(&mut writer, &name) {
                let error = BuildError::io(&archive_path, e);
                rollback(ctx, dir_start, file_start);
                return Ok(retry_or_fail(ctx, "streaming-write", &error));
            }
            ctx.progress.next_dir_index += 1;
        }

        let file_count = ctx.index.count(EntryKind::File);
        for entry in ctx
            .index
            .iter_paths(EntryKind::File)
            .skip(ctx.progress.next_file_index as usize)
        {
            if started.elapsed() >= ctx.config.max_chunk_duration {
                // Zero progress since the chunk started means the budget is
                // too small; suspending would loop on the same empty chunk.
                if ctx.progress.next_dir_index == dir_start
                    && ctx.progress.next_file_index == file_start
                {
                    let _ = finish(writer);
                    return Ok(retry_stalled_chunk(ctx, "streaming-chunk"));
                }
                return Ok(suspend(ctx, writer, &archive_path, dir_start, file_start));
            }
            let Some(source) = resolve_source(ctx.config, entry) else {
                warn!(root = entry.root, path = %entry.path.display(), "entry references an unknown scan root");
                ctx.progress.next_file_index += 1;
                continue;
            };
            let name = entry_name(ctx.config, entry);
            match write_file_entry(&mut writer, &source, &name) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound
                    || e.kind() == io::ErrorKind::PermissionDenied =>
                {
                    warn!(path = %entry.path.display(), error = %e, "skipping unreadable file");
                }
                Err(e) => {
                    let error = BuildError::io(&archive_path, e);
                    rollback(ctx, dir_start, file_start);
                    return Ok(retry_or_fail(ctx, "streaming-write", &error));
                }
            }
            ctx.progress.next_file_index += 1;
        }

        match finish(writer) {
            Ok(len) => {
                ctx.progress.archive_bytes_written = len;
                ctx.progress.archive_built = true;
                // Count what was actually written; skipped unreadable files
                // advance the cursor without producing an entry.
                ctx.progress.archive_file_count = count_container_entries(&archive_path);
                ctx.progress.clear_retries();
                ctx.progress.set_percent(1, 1);
                debug!(files = file_count, dirs = dir_count, bytes = len, "container complete");
                Ok(StepOutcome::Complete)
            }
            Err(e) => {
                let error = BuildError::io(&archive_path, e);
                rollback(ctx, dir_start, file_start);
                Ok(retry_or_fail(ctx, "streaming-close", &error))
            }
        }
    }
}

/// Open the container for this chunk.
///
/// A fresh build writes the header; a resumed one truncates back to the
/// last checkpointed length, discarding any bytes written after the final
/// flush of an interrupted invocation.
fn open_for_append(
    ctx: &mut ArchiveContext<'_>,
    path: &Path,
) -> Result<BufWriter<File>, BuildError> {
    let fresh = ctx.progress.next_dir_index == 0 && ctx.progress.next_file_index == 0;
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(fresh)
        .open(path)
        .map_err(|e| BuildError::io(path, e))?;

    if fresh {
        file.write_all(&MAGIC).map_err(|e| BuildError::io(path, e))?;
        file.write_all(&[FORMAT_VERSION])
            .map_err(|e| BuildError::io(path, e))?;
        // First checkpoint covers exactly the header.
        ctx.progress.archive_bytes_written = (MAGIC.len() + 1) as u64;
    } else {
        file.set_len(ctx.progress.archive_bytes_written)
            .map_err(|e| BuildError::io(path, e))?;
        file.seek(SeekFrom::End(0)).map_err(|e| BuildError::io(path, e))?;
    }
    Ok(BufWriter::new(file))
}

/// Flush and checkpoint at a chunk boundary.
fn suspend(
    ctx: &mut ArchiveContext<'_>,
    writer: BufWriter<File>,
    path: &Path,
    dir_start: u64,
    file_start: u64,
) -> StepOutcome {
    match finish(writer) {
        Ok(len) => {
            ctx.progress.archive_bytes_written = len;
            ctx.progress.clear_retries();
            let total = ctx.scan_result.full_count();
            ctx.progress
                .set_percent(ctx.progress.next_dir_index + ctx.progress.next_file_index, total);
            debug!(bytes = len, "chunk budget reached, container flushed");
            StepOutcome::Continue
        }
        Err(e) => {
            let error = BuildError::io(path, e);
            rollback(ctx, dir_start, file_start);
            retry_or_fail(ctx, "streaming-close", &error)
        }
    }
}

/// Restore the cursors to the chunk start so the replay after a truncating
/// reopen covers everything the failed chunk wrote.
fn rollback(ctx: &mut ArchiveContext<'_>, dir_start: u64, file_start: u64) {
    ctx.progress.next_dir_index = dir_start;
    ctx.progress.next_file_index = file_start;
}

fn finish(mut writer: BufWriter<File>) -> io::Result<u64> {
    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| io::Error::other(e.to_string()))?;
    file.sync_all()?;
    file.metadata().map(|m| m.len())
}

fn count_container_entries(path: &Path) -> Option<u64> {
    let entries = StreamingReader::open(path).ok()?.entries().ok()?;
    Some(entries.len() as u64)
}

fn write_dir_entry(writer: &mut BufWriter<File>, name: &str) -> io::Result<()> {
    write_entry_header(writer, KIND_DIR, name, 0, 0, 0)
}

/// Compress one file and append its entry.
///
/// The payload is buffered so the header can carry the stored length; a
/// source read failure therefore surfaces before any header byte is
/// written and can be skipped cleanly.
fn write_file_entry(writer: &mut BufWriter<File>, source: &Path, name: &str) -> io::Result<()> {
    let mut input = File::open(source)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());

    let mut raw_len = 0u64;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        raw_len += n as u64;
        hasher.update(&buf[..n]);
        encoder.write_all(&buf[..n])?;
    }
    let payload = encoder.finish()?;

    write_entry_header(
        writer,
        KIND_FILE,
        name,
        raw_len,
        payload.len() as u64,
        hasher.finalize(),
    )?;
    writer.write_all(&payload)
}

fn write_entry_header(
    writer: &mut BufWriter<File>,
    kind: u8,
    name: &str,
    raw_len: u64,
    stored_len: u64,
    crc32: u32,
) -> io::Result<()> {
    let name_bytes = name.as_bytes();
    writer.write_all(&[kind])?;
    writer.write_all(&(name_bytes.len() as u32).to_le_bytes())?;
    writer.write_all(name_bytes)?;
    writer.write_all(&raw_len.to_le_bytes())?;
    writer.write_all(&stored_len.to_le_bytes())?;
    writer.write_all(&crc32.to_le_bytes())?;
    Ok(())
}

/// One entry as enumerated from a finished container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingEntry {
    /// Directory or file.
    pub kind: EntryKind,
    /// Relative path, `/`-separated.
    pub path: PathBuf,
    /// Uncompressed payload size.
    pub raw_len: u64,
    /// Stored (compressed) payload size.
    pub stored_len: u64,
    /// CRC32 of the raw payload.
    pub crc32: u32,
}

/// Read side of the container, used by the integrity validator to
/// enumerate entries after the fact.
pub struct StreamingReader {
    reader: BufReader<File>,
}

impl StreamingReader {
    /// Open a finished container, verifying magic and version.
    pub fn open(path: &Path) -> Result<Self, BuildError> {
        let file = File::open(path).map_err(|e| BuildError::io(path, e))?;
        let mut reader = BufReader::new(file);
        let mut magic = [0u8; 4];
        let mut version = [0u8; 1];
        reader
            .read_exact(&mut magic)
            .and_then(|()| reader.read_exact(&mut version))
            .map_err(|e| BuildError::io(path, e))?;
        if magic != MAGIC {
            return Err(BuildError::integrity(format!(
                "{} is not a streaming container",
                path.display()
            )));
        }
        if version[0] != FORMAT_VERSION {
            return Err(BuildError::integrity(format!(
                "unsupported container version {}",
                version[0]
            )));
        }
        Ok(Self { reader })
    }

    /// Enumerate all entries, skipping over payloads.
    pub fn entries(mut self) -> Result<Vec<StreamingEntry>, BuildError> {
        let mut entries = Vec::new();
        loop {
            let mut kind = [0u8; 1];
            match self.reader.read_exact(&mut kind) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    return Err(BuildError::integrity(format!("truncated entry header: {e}")))
                }
            }

            let name_len = self.read_u32()? as usize;
            let mut name = vec![0u8; name_len];
            self.read_bytes(&mut name)?;
            let raw_len = self.read_u64()?;
            let stored_len = self.read_u64()?;
            let crc32 = self.read_u32()?;

            self.reader
                .seek(SeekFrom::Current(stored_len as i64))
                .map_err(|e| BuildError::integrity(format!("truncated payload: {e}")))?;

            entries.push(StreamingEntry {
                kind: if kind[0] == KIND_DIR {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                },
                path: PathBuf::from(String::from_utf8_lossy(&name).to_string()),
                raw_len,
                stored_len,
                crc32,
            });
        }
        Ok(entries)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), BuildError> {
        self.reader
            .read_exact(buf)
            .map_err(|e| BuildError::integrity(format!("truncated entry: {e}")))
    }

    fn read_u32(&mut self) -> Result<u32, BuildError> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&mut self) -> Result<u64, BuildError> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}
