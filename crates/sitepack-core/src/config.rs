//! Build configuration.
//!
//! One `BuildConfig` is constructed per build and passed by reference into
//! every component; nothing in the pipeline reads ambient global state.

use std::path::PathBuf;
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::strategy::BuildStrategy;

/// Configuration for one backup build.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct BuildConfig {
    /// Identity of this build; the archive name is derived from it.
    pub build_id: String,

    /// Root paths to scan.
    pub roots: Vec<PathBuf>,

    /// Directory receiving the archive and working files.
    pub output_dir: PathBuf,

    /// Archive engine for this build. Chosen up front; the pipeline never
    /// auto-switches mid-build.
    #[builder(default = "BuildStrategy::NativeChunked")]
    #[serde(default = "default_strategy")]
    pub strategy: BuildStrategy,

    /// Maximum entries visited per scan chunk.
    #[builder(default = "5000")]
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Wall-clock budget for one chunk.
    #[builder(default = "Duration::from_secs(18)")]
    #[serde(default = "default_chunk_duration")]
    pub max_chunk_duration: Duration,

    /// Maximum total runtime of the whole multi-invocation build, in
    /// seconds. Exceeding it forces cancellation.
    #[builder(default = "10_800")]
    #[serde(default = "default_total_runtime")]
    pub max_total_runtime_secs: u64,

    /// A directory holding more nodes than this is reported oversized.
    #[builder(default = "1_000")]
    #[serde(default = "default_oversized_nodes")]
    pub oversized_dir_nodes: u64,

    /// A file larger than this many bytes is reported oversized.
    #[builder(default = "1_073_741_824")]
    #[serde(default = "default_oversized_bytes")]
    pub oversized_file_bytes: u64,

    /// Cap on the number of unreadable paths kept in memory; the true
    /// count is tracked separately.
    #[builder(default = "100")]
    #[serde(default = "default_unreadable_cap")]
    pub max_unreadable_tracked: usize,

    /// Bytes appended between container close/reopen boundaries in the
    /// chunked native engine.
    #[builder(default = "67_108_864")]
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: u64,

    /// Lower bound of the integrity count-ratio tolerance band.
    #[builder(default = "0.90")]
    #[serde(default = "default_ratio_min")]
    pub count_ratio_min: f64,

    /// Upper bound of the integrity count-ratio tolerance band.
    #[builder(default = "1.01")]
    #[serde(default = "default_ratio_max")]
    pub count_ratio_max: f64,

    /// Expected-count threshold below which the ratio check is skipped.
    #[builder(default = "500")]
    #[serde(default = "default_min_expected")]
    pub min_expected_for_check: u64,

    /// Marker file names identifying a foreign installation beneath a root.
    #[builder(default = "default_markers()")]
    #[serde(default = "default_markers")]
    pub foreign_install_markers: Vec<String>,

    /// External compression binary.
    #[builder(default = "\"zip\".to_string()")]
    #[serde(default = "default_zip_binary")]
    pub zip_binary: String,

    /// Listing binary used to count entries after an external-tool build.
    #[builder(default = "\"unzip\".to_string()")]
    #[serde(default = "default_unzip_binary")]
    pub unzip_binary: String,

    /// Optional archive password (external tool only).
    #[builder(default)]
    #[serde(default)]
    pub password: Option<String>,
}

fn default_strategy() -> BuildStrategy {
    BuildStrategy::NativeChunked
}
fn default_max_iterations() -> usize {
    5000
}
fn default_chunk_duration() -> Duration {
    Duration::from_secs(18)
}
fn default_total_runtime() -> u64 {
    10_800
}
fn default_oversized_nodes() -> u64 {
    1_000
}
fn default_oversized_bytes() -> u64 {
    1_073_741_824
}
fn default_unreadable_cap() -> usize {
    100
}
fn default_chunk_bytes() -> u64 {
    67_108_864
}
fn default_ratio_min() -> f64 {
    0.90
}
fn default_ratio_max() -> f64 {
    1.01
}
fn default_min_expected() -> u64 {
    500
}
fn default_markers() -> Vec<String> {
    ["wp-config.php", "configuration.php", "config.php"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_zip_binary() -> String {
    "zip".to_string()
}
fn default_unzip_binary() -> String {
    "unzip".to_string()
}

impl BuildConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        match &self.build_id {
            Some(id) if !id.is_empty() => {}
            _ => return Err("build_id is required".to_string()),
        }
        match &self.roots {
            Some(roots) if !roots.is_empty() => {}
            _ => return Err("at least one scan root is required".to_string()),
        }
        let min = self.count_ratio_min.unwrap_or_else(default_ratio_min);
        let max = self.count_ratio_max.unwrap_or_else(default_ratio_max);
        if min >= max {
            return Err("count ratio band is empty".to_string());
        }
        Ok(())
    }
}

impl BuildConfig {
    /// Create a new config builder.
    pub fn builder() -> BuildConfigBuilder {
        BuildConfigBuilder::default()
    }

    /// Create a config with defaults for the given build and roots.
    pub fn new(
        build_id: impl Into<String>,
        roots: Vec<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            build_id: build_id.into(),
            roots,
            output_dir: output_dir.into(),
            strategy: default_strategy(),
            max_iterations: default_max_iterations(),
            max_chunk_duration: default_chunk_duration(),
            max_total_runtime_secs: default_total_runtime(),
            oversized_dir_nodes: default_oversized_nodes(),
            oversized_file_bytes: default_oversized_bytes(),
            max_unreadable_tracked: default_unreadable_cap(),
            chunk_bytes: default_chunk_bytes(),
            count_ratio_min: default_ratio_min(),
            count_ratio_max: default_ratio_max(),
            min_expected_for_check: default_min_expected(),
            foreign_install_markers: default_markers(),
            zip_binary: default_zip_binary(),
            unzip_binary: default_unzip_binary(),
            password: None,
        }
    }

    /// Retry ceiling for the configured strategy.
    pub fn retry_ceiling(&self) -> u32 {
        self.strategy.retry_ceiling()
    }

    /// Path of the archive artifact for this build.
    pub fn archive_path(&self) -> PathBuf {
        self.output_dir.join(format!(
            "{}.{}",
            self.build_id,
            self.strategy.format().extension()
        ))
    }

    /// Path of the on-disk file index for this build.
    pub fn index_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.index", self.build_id))
    }

    /// Path of the persisted pipeline state for this build.
    pub fn state_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.state.json", self.build_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_defaults() {
        let config = BuildConfig::builder()
            .build_id("b1")
            .roots(vec![PathBuf::from("/site")])
            .output_dir("/backups")
            .build()
            .unwrap();

        assert_eq!(config.strategy, BuildStrategy::NativeChunked);
        assert_eq!(config.max_iterations, 5000);
        assert_eq!(config.min_expected_for_check, 500);
        assert_eq!(config.archive_path(), PathBuf::from("/backups/b1.zip"));
    }

    #[test]
    fn builder_rejects_missing_roots() {
        let result = BuildConfig::builder()
            .build_id("b1")
            .roots(Vec::<PathBuf>::new())
            .output_dir("/backups")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_rejects_empty_ratio_band() {
        let result = BuildConfig::builder()
            .build_id("b1")
            .roots(vec![PathBuf::from("/site")])
            .output_dir("/backups")
            .count_ratio_min(1.05)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn config_serde_round_trip() {
        let config = BuildConfig::new("b2", vec![PathBuf::from("/site")], "/backups");
        let json = serde_json::to_string(&config).unwrap();
        let back: BuildConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.build_id, config.build_id);
        assert_eq!(back.max_chunk_duration, config.max_chunk_duration);
    }
}
