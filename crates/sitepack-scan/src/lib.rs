//! Time-sliced, resumable filesystem scanner.
//!
//! The scanner walks the configured roots depth-first in bounded chunks,
//! classifying every entry and writing accepted ones into the file index.
//! A chunk halts at its iteration or wall-clock budget and leaves behind a
//! cursor from which the next invocation continues without re-visiting
//! completed subtrees.

mod chunker;

pub use chunker::{ChunkLimits, ChunkStatus, ScanChunker};
