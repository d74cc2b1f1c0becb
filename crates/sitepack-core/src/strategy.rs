//! Archive build strategies and output artifact metadata.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Selects which archive engine constructs the output artifact.
///
/// The set is closed: adding an engine means adding a variant here and one
/// implementation of the engine trait, nothing else.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum BuildStrategy {
    /// Shell out to a system `zip` binary.
    ExternalTool,
    /// Native zip container, whole remaining file list per invocation.
    NativeSingleThreaded,
    /// Native zip container, closed and reopened at chunk boundaries.
    NativeChunked,
    /// Custom sequential container with no external format dependency.
    StreamingContainer,
}

impl BuildStrategy {
    /// The archive format this strategy produces.
    pub fn format(self) -> ArchiveFormat {
        match self {
            Self::ExternalTool => ArchiveFormat::ShellZip,
            Self::NativeSingleThreaded | Self::NativeChunked => ArchiveFormat::Zip,
            Self::StreamingContainer => ArchiveFormat::Streaming,
        }
    }

    /// Retry ceiling for per-phase failures under this strategy.
    ///
    /// A single-pass failure is more likely systemic than a chunked one, so
    /// the single-threaded engine gives up sooner.
    pub fn retry_ceiling(self) -> u32 {
        match self {
            Self::ExternalTool => 2,
            Self::NativeSingleThreaded => 1,
            Self::NativeChunked => 3,
            Self::StreamingContainer => 2,
        }
    }

    /// The fallback engine recommended when this one repeatedly fails.
    pub fn recommended_fallback(self) -> BuildStrategy {
        match self {
            Self::StreamingContainer => Self::NativeChunked,
            _ => Self::StreamingContainer,
        }
    }
}

/// On-disk format of the produced archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ArchiveFormat {
    /// Zip written by the native library.
    Zip,
    /// Zip written by an external tool.
    ShellZip,
    /// Custom sequential container.
    Streaming,
}

impl ArchiveFormat {
    /// File extension for archives of this format.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Zip | Self::ShellZip => "zip",
            Self::Streaming => "spk",
        }
    }
}

/// Metadata describing the output artifact of a completed (or in-progress)
/// archive build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveDescriptor {
    /// Archive file name, derived from the build identity.
    pub file_name: String,
    /// Container format.
    pub format: ArchiveFormat,
    /// Size in bytes once written.
    pub size: u64,
    /// Optional archive password (external tool only).
    pub password: Option<String>,
    /// Number of entries in the archive; `None` means the count could not
    /// be determined (sentinel, not an error).
    pub file_count: Option<u64>,
}

impl ArchiveDescriptor {
    /// Create a descriptor for a build identified by `build_id`.
    pub fn for_build(build_id: &str, format: ArchiveFormat) -> Self {
        Self {
            file_name: format!("{build_id}.{}", format.extension()),
            format,
            size: 0,
            password: None,
            file_count: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_round_trips_through_strings() {
        for strategy in [
            BuildStrategy::ExternalTool,
            BuildStrategy::NativeSingleThreaded,
            BuildStrategy::NativeChunked,
            BuildStrategy::StreamingContainer,
        ] {
            let text = strategy.to_string();
            let parsed: BuildStrategy = text.parse().unwrap();
            assert_eq!(parsed, strategy);
        }
    }

    #[test]
    fn descriptor_name_follows_build_identity() {
        let descriptor = ArchiveDescriptor::for_build("backup-2024-03-01", ArchiveFormat::Zip);
        assert_eq!(descriptor.file_name, "backup-2024-03-01.zip");
        assert!(descriptor.file_count.is_none());

        let streaming =
            ArchiveDescriptor::for_build("backup-2024-03-01", ArchiveFormat::Streaming);
        assert_eq!(streaming.file_name, "backup-2024-03-01.spk");
    }

    #[test]
    fn fallback_never_recommends_itself() {
        for strategy in [
            BuildStrategy::ExternalTool,
            BuildStrategy::NativeSingleThreaded,
            BuildStrategy::NativeChunked,
            BuildStrategy::StreamingContainer,
        ] {
            assert_ne!(strategy.recommended_fallback(), strategy);
        }
    }
}
