//! On-disk file index bridging the scan and archive phases.
//!
//! A scan writes every accepted path into a [`FileIndexStore`]; one or more
//! later, independent invocations reopen the same index read-only and feed
//! it to an archive engine. Iteration order is deterministic and matches
//! insertion order, which is what makes mid-archive resumption exact.

mod entry;
mod store;

pub use entry::IndexEntry;
pub use store::{FileIndexStore, IndexError};
