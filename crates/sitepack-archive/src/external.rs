//! External-tool engine: shells out to a system zip binary.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use sitepack_core::{BuildError, FilterSet};

use crate::engine::{retry_or_fail, ArchiveContext, ArchiveEngine, StepOutcome};

/// Engine that delegates archive construction to a system compression
/// binary, translating the filter set into tool exclusion arguments.
pub struct ExternalToolEngine;

impl ExternalToolEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ExternalToolEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveEngine for ExternalToolEngine {
    fn build_chunk(&mut self, ctx: &mut ArchiveContext<'_>) -> Result<StepOutcome, BuildError> {
        let archive_path = ctx.config.archive_path();
        let multi_root = ctx.config.roots.len() > 1;

        // A root-level exclusion means there is nothing to compress from
        // that root (database-only or fully-filtered build); with every
        // root excluded the tool is never invoked.
        let roots: Vec<PathBuf> = ctx
            .config
            .roots
            .iter()
            .filter(|root| {
                let excluded = root_is_excluded(root, ctx.filters);
                if excluded {
                    info!(root = %root.display(), "root excluded, skipping tool invocation");
                }
                !excluded
            })
            .cloned()
            .collect();
        if roots.is_empty() {
            ctx.progress.archive_built = true;
            ctx.progress.archive_file_count = Some(0);
            return Ok(StepOutcome::Complete);
        }

        // The working directory changes per root, so the tool needs the
        // archive path in absolute form. The tool updates same-name entries
        // in an existing archive, which keeps a retried invocation
        // idempotent.
        let archive_abs =
            std::path::absolute(&archive_path).unwrap_or_else(|_| archive_path.clone());

        for root in &roots {
            // One root compresses flat from inside the root. Several roots
            // compress each tree from the root's parent, so entries land
            // under a top-level directory named after the root and
            // identical relative paths cannot collide.
            let (cwd, target, prefix) = if multi_root {
                match (root.parent(), root.file_name()) {
                    (Some(parent), Some(name)) => {
                        let name = name.to_string_lossy().to_string();
                        (parent.to_path_buf(), name.clone(), Some(name))
                    }
                    _ => (root.clone(), ".".to_string(), None),
                }
            } else {
                (root.clone(), ".".to_string(), None)
            };

            let mut command = Command::new(&ctx.config.zip_binary);
            command.current_dir(&cwd);
            command.arg("-r").arg("-q");
            if let Some(password) = &ctx.config.password {
                command.arg("-P").arg(password);
            }
            command.arg(&archive_abs).arg(&target);
            append_exclusions(&mut command, ctx.filters, prefix.as_deref());

            debug!(
                binary = %ctx.config.zip_binary,
                root = %root.display(),
                archive = %archive_abs.display(),
                "invoking tool"
            );
            let output = match command.output() {
                Ok(output) => output,
                Err(e) => {
                    let error = BuildError::from_tool_output(
                        &format!("cannot run {}: {e}", ctx.config.zip_binary),
                        ctx.progress.strategy,
                    );
                    return Ok(retry_or_fail(ctx, "external-tool", &error));
                }
            };

            if !output.status.success() {
                let combined = format!(
                    "{}\n{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                );
                let error = BuildError::from_tool_output(&combined, ctx.progress.strategy);
                if error.remediation().is_some() && matches!(error, BuildError::Capacity { .. }) {
                    // Quota exhaustion never recovers by retrying.
                    ctx.progress.fail(&error);
                    return Ok(StepOutcome::Failed);
                }
                return Ok(retry_or_fail(ctx, "external-tool", &error));
            }
        }

        ctx.progress.archive_built = true;
        ctx.progress.archive_bytes_written = std::fs::metadata(&archive_path)
            .map(|m| m.len())
            .unwrap_or(0);
        ctx.progress.archive_file_count =
            count_with_listing_tool(&ctx.config.unzip_binary, &archive_path);
        if ctx.progress.archive_file_count.is_none() {
            // Unknown is a sentinel, not an error; the validator passes it.
            warn!("no listing tool available, archive file count unknown");
        }
        ctx.progress.set_percent(1, 1);
        Ok(StepOutcome::Complete)
    }
}

fn root_is_excluded(root: &Path, filters: &FilterSet) -> bool {
    let normalized = root
        .components()
        .filter(|c| matches!(c, std::path::Component::Normal(_)))
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    filters.excludes_dir(&normalized)
}

/// Translate the filter set into `-x` arguments: directories exclude their
/// whole subtree, extensions glob by suffix, files match exactly. Path
/// patterns are relative to the compress root; when the tool runs from the
/// root's parent they carry the root name as a prefix.
fn append_exclusions(command: &mut Command, filters: &FilterSet, prefix: Option<&str>) {
    let prefixed = |value: &str| match prefix {
        Some(prefix) => format!("{prefix}/{value}"),
        None => value.to_string(),
    };
    let mut patterns = Vec::new();
    for dir in &filters.dirs {
        patterns.push(format!("{}/*", prefixed(&dir.value)));
        patterns.push(prefixed(&dir.value));
    }
    for ext in &filters.exts {
        patterns.push(format!("*.{}", ext.value));
    }
    for file in &filters.files {
        patterns.push(prefixed(&file.value));
    }
    if !patterns.is_empty() {
        command.arg("-x");
        for pattern in patterns {
            command.arg(pattern);
        }
    }
}

/// Derive the entry count by running the listing tool over the archive.
///
/// `unzip -l` ends with a summary line of the form `  <bytes>  <count> files`.
fn count_with_listing_tool(unzip_binary: &str, archive: &Path) -> Option<u64> {
    let output = Command::new(unzip_binary)
        .arg("-l")
        .arg(archive)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_listing_summary(&String::from_utf8_lossy(&output.stdout))
}

fn parse_listing_summary(stdout: &str) -> Option<u64> {
    let summary = stdout
        .lines()
        .rev()
        .find(|line| line.trim_end().ends_with("files") || line.trim_end().ends_with("file"))?;
    let mut tokens = summary.split_whitespace();
    let _bytes = tokens.next()?;
    tokens.next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_summary_parsing() {
        let stdout = "Archive:  b1.zip\n\
                      Length      Date    Time    Name\n\
                      ---------  ---------- -----   ----\n\
                      418  2024-03-01 09:30   index.php\n\
                      ---------                     -------\n\
                      12345                     42 files\n";
        assert_eq!(parse_listing_summary(stdout), Some(42));
        assert_eq!(parse_listing_summary("garbage"), None);
    }

    #[test]
    fn exclusion_arguments_cover_all_filter_lists() {
        use sitepack_core::FilterRules;
        let instance = FilterRules::from_delimited("cache", "log", "secret.txt");
        let filters = FilterSet::resolve(
            &FilterRules::default(),
            &FilterRules::default(),
            &instance,
        );

        let mut command = Command::new("true");
        append_exclusions(&mut command, &filters, None);
        let args: Vec<String> = command
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();

        assert!(args.contains(&"-x".to_string()));
        assert!(args.contains(&"cache/*".to_string()));
        assert!(args.contains(&"*.log".to_string()));
        assert!(args.contains(&"secret.txt".to_string()));
    }

    #[test]
    fn exclusion_paths_carry_the_root_prefix() {
        use sitepack_core::FilterRules;
        let instance = FilterRules::from_delimited("cache", "log", "secret.txt");
        let filters = FilterSet::resolve(
            &FilterRules::default(),
            &FilterRules::default(),
            &instance,
        );

        let mut command = Command::new("true");
        append_exclusions(&mut command, &filters, Some("site-a"));
        let args: Vec<String> = command
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();

        assert!(args.contains(&"site-a/cache/*".to_string()));
        assert!(args.contains(&"site-a/secret.txt".to_string()));
        // Extension globs match anywhere regardless of root.
        assert!(args.contains(&"*.log".to_string()));
    }
}
