//! Exclusion filters merged from multiple configuration scopes.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Where a filter entry came from.
///
/// Lower scopes can only add exclusions on top of higher ones; `Core`
/// entries can never be removed by user configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterScope {
    /// Baked-in protected paths.
    Core,
    /// Administrator-wide defaults.
    GlobalDefault,
    /// Per-build instance rules.
    Instance,
}

/// One normalized exclusion value tagged with its origin scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterEntry {
    /// Normalized path or extension.
    pub value: String,
    /// Origin scope.
    pub scope: FilterScope,
}

/// Raw exclusion rules for a single scope, as configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterRules {
    /// Directory paths to exclude (relative to the scan root).
    #[serde(default)]
    pub dirs: Vec<String>,
    /// File extensions to exclude.
    #[serde(default)]
    pub exts: Vec<String>,
    /// Individual file paths to exclude (relative to the scan root).
    #[serde(default)]
    pub files: Vec<String>,
}

impl FilterRules {
    /// Parse semicolon-delimited `dirs`, `exts` and `files` strings.
    pub fn from_delimited(dirs: &str, exts: &str, files: &str) -> Self {
        Self {
            dirs: split_delimited(dirs),
            exts: split_delimited(exts),
            files: split_delimited(files),
        }
    }
}

fn split_delimited(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Effective exclusion set for one build: the union of all scopes, sorted
/// and de-duplicated for deterministic diffing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSet {
    /// Excluded directory paths.
    pub dirs: Vec<FilterEntry>,
    /// Excluded file extensions (no leading dot, lowercase).
    pub exts: Vec<FilterEntry>,
    /// Excluded file paths.
    pub files: Vec<FilterEntry>,
}

impl FilterSet {
    /// Merge exclusion rules from the three scopes into one effective set.
    ///
    /// Precedence is additive: no scope can un-exclude what another scope
    /// excluded. Malformed entries are dropped with a diagnostic, never an
    /// abort.
    pub fn resolve(core: &FilterRules, global: &FilterRules, instance: &FilterRules) -> Self {
        let scoped = [
            (FilterScope::Core, core),
            (FilterScope::GlobalDefault, global),
            (FilterScope::Instance, instance),
        ];

        let mut set = Self::default();
        for (scope, rules) in scoped {
            for raw in &rules.dirs {
                match normalize_path(raw) {
                    Some(value) => push_unique(&mut set.dirs, value, scope),
                    None => warn!(rule = %raw, ?scope, "dropping malformed directory filter"),
                }
            }
            for raw in &rules.exts {
                match normalize_ext(raw) {
                    Some(value) => push_unique(&mut set.exts, value, scope),
                    None => warn!(rule = %raw, ?scope, "dropping malformed extension filter"),
                }
            }
            for raw in &rules.files {
                match normalize_path(raw) {
                    Some(value) => push_unique(&mut set.files, value, scope),
                    None => warn!(rule = %raw, ?scope, "dropping malformed file filter"),
                }
            }
        }

        set.dirs.sort_by(|a, b| a.value.cmp(&b.value));
        set.exts.sort_by(|a, b| a.value.cmp(&b.value));
        set.files.sort_by(|a, b| a.value.cmp(&b.value));
        set
    }

    /// Whether a relative path falls under an excluded directory.
    ///
    /// Matching is exact-string prefix on normalized paths, not glob.
    pub fn excludes_dir(&self, rel_path: &str) -> bool {
        let rel = rel_path.trim_end_matches('/');
        self.dirs.iter().any(|entry| {
            rel == entry.value
                || rel
                    .strip_prefix(entry.value.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// Whether a relative file path is excluded, by path or by extension.
    pub fn excludes_file(&self, rel_path: &str) -> bool {
        if self.files.iter().any(|entry| entry.value == rel_path) {
            return true;
        }
        if self.excludes_dir(rel_path) {
            return true;
        }
        match rel_path.rsplit_once('.') {
            Some((_, ext)) if !ext.contains('/') => {
                let ext = ext.to_lowercase();
                self.exts.iter().any(|entry| entry.value == ext)
            }
            _ => false,
        }
    }

    /// Serialize the directory list back to semicolon-delimited form.
    pub fn dirs_delimited(&self) -> String {
        join_values(&self.dirs)
    }

    /// Serialize the extension list back to semicolon-delimited form.
    pub fn exts_delimited(&self) -> String {
        join_values(&self.exts)
    }

    /// Serialize the file list back to semicolon-delimited form.
    pub fn files_delimited(&self) -> String {
        join_values(&self.files)
    }
}

fn join_values(entries: &[FilterEntry]) -> String {
    entries
        .iter()
        .map(|entry| entry.value.as_str())
        .collect::<Vec<_>>()
        .join(";")
}

fn push_unique(entries: &mut Vec<FilterEntry>, value: String, scope: FilterScope) {
    // First scope to claim a value wins; Core is processed first.
    if !entries.iter().any(|entry| entry.value == value) {
        entries.push(FilterEntry { value, scope });
    }
}

/// Normalize a path rule: separators to `/`, trailing slash stripped,
/// leading `./` stripped. Returns `None` for unusable input.
fn normalize_path(raw: &str) -> Option<String> {
    let mut value = raw.trim().replace('\\', "/");
    if value.contains('\0') {
        return None;
    }
    while value.ends_with('/') && value.len() > 1 {
        value.pop();
    }
    if let Some(stripped) = value.strip_prefix("./") {
        value = stripped.to_string();
    }
    let value = value.trim_start_matches('/').to_string();
    if value.is_empty() || value == "." {
        return None;
    }
    Some(value)
}

/// Normalize an extension rule: leading dot stripped, lowercased.
fn normalize_ext(raw: &str) -> Option<String> {
    let value = raw.trim().trim_start_matches('.').to_lowercase();
    if value.is_empty() || value.contains('/') || value.contains('\0') {
        return None;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(dirs: &[&str], exts: &[&str], files: &[&str]) -> FilterRules {
        FilterRules {
            dirs: dirs.iter().map(|s| s.to_string()).collect(),
            exts: exts.iter().map(|s| s.to_string()).collect(),
            files: files.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn resolve_is_additive_union() {
        let core = rules(&["wp-admin/"], &[], &[]);
        let global = rules(&["cache"], &["LOG"], &[]);
        let instance = rules(&["cache", "tmp"], &[".log"], &["backup.sql"]);

        let set = FilterSet::resolve(&core, &global, &instance);

        let dirs: Vec<_> = set.dirs.iter().map(|e| e.value.as_str()).collect();
        assert_eq!(dirs, ["cache", "tmp", "wp-admin"]);
        let exts: Vec<_> = set.exts.iter().map(|e| e.value.as_str()).collect();
        assert_eq!(exts, ["log"]);
        let files: Vec<_> = set.files.iter().map(|e| e.value.as_str()).collect();
        assert_eq!(files, ["backup.sql"]);
    }

    #[test]
    fn union_is_monotonic_over_every_scope() {
        let core = rules(&["a"], &["x"], &[]);
        let global = rules(&["b"], &[], &["f.txt"]);
        let instance = rules(&["c"], &["y"], &[]);
        let empty = FilterRules::default();

        let merged = FilterSet::resolve(&core, &global, &instance);
        for solo in [
            FilterSet::resolve(&core, &empty, &empty),
            FilterSet::resolve(&empty, &global, &empty),
            FilterSet::resolve(&empty, &empty, &instance),
        ] {
            for entry in solo.dirs.iter().chain(&solo.exts).chain(&solo.files) {
                let found = merged
                    .dirs
                    .iter()
                    .chain(&merged.exts)
                    .chain(&merged.files)
                    .any(|m| m.value == entry.value);
                assert!(found, "merged set lost entry {:?}", entry.value);
            }
        }
    }

    #[test]
    fn core_scope_claims_duplicates_first() {
        let core = rules(&["wp-includes"], &[], &[]);
        let instance = rules(&["wp-includes"], &[], &[]);
        let set = FilterSet::resolve(&core, &FilterRules::default(), &instance);
        assert_eq!(set.dirs.len(), 1);
        assert_eq!(set.dirs[0].scope, FilterScope::Core);
    }

    #[test]
    fn malformed_rules_are_dropped_not_fatal() {
        let instance = rules(&["", "/", "  ", "ok"], &["", "."], &[]);
        let set = FilterSet::resolve(&FilterRules::default(), &FilterRules::default(), &instance);
        assert_eq!(set.dirs.len(), 1);
        assert_eq!(set.dirs[0].value, "ok");
        assert!(set.exts.is_empty());
    }

    #[test]
    fn path_matching_is_prefix_by_component() {
        let instance = rules(&["cache"], &[], &[]);
        let set = FilterSet::resolve(&FilterRules::default(), &FilterRules::default(), &instance);
        assert!(set.excludes_dir("cache"));
        assert!(set.excludes_dir("cache/pages"));
        assert!(!set.excludes_dir("cache2"));
        assert!(!set.excludes_dir("my/cache2"));
    }

    #[test]
    fn extension_matching_is_case_insensitive() {
        let instance = rules(&[], &[".LOG"], &[]);
        let set = FilterSet::resolve(&FilterRules::default(), &FilterRules::default(), &instance);
        assert!(set.excludes_file("error.log"));
        assert!(set.excludes_file("debug.LOG"));
        assert!(!set.excludes_file("log"));
    }

    #[test]
    fn delimited_round_trip_is_idempotent() {
        let instance = FilterRules::from_delimited("tmp/;cache\\pages;;tmp", "LOG;.Log", "a.txt");
        let once = FilterSet::resolve(&FilterRules::default(), &FilterRules::default(), &instance);

        let reparsed = FilterRules::from_delimited(
            &once.dirs_delimited(),
            &once.exts_delimited(),
            &once.files_delimited(),
        );
        let twice =
            FilterSet::resolve(&FilterRules::default(), &FilterRules::default(), &reparsed);

        assert_eq!(once.dirs_delimited(), twice.dirs_delimited());
        assert_eq!(once.exts_delimited(), twice.exts_delimited());
        assert_eq!(once.files_delimited(), twice.files_delimited());
    }
}
