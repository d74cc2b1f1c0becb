//! End-to-end pipeline tests driving real builds over temp trees.

use std::fs;
use std::path::Path;

use sitepack::BuildPipeline;
use sitepack_core::{
    BuildConfig, BuildStrategy, FilterRules, FilterSet, JsonStateStore, Status,
};
use tempfile::TempDir;

fn make_site(root: &Path) {
    fs::create_dir_all(root.join("wp-content/uploads")).unwrap();
    fs::create_dir_all(root.join("cache")).unwrap();
    fs::write(root.join("index.php"), b"<?php echo 'hi';").unwrap();
    fs::write(root.join("wp-content/a.txt"), b"alpha").unwrap();
    fs::write(root.join("wp-content/uploads/b.txt"), b"bravo").unwrap();
    fs::write(root.join("cache/page.html"), b"<cached>").unwrap();
    fs::write(root.join("debug.log"), b"noise").unwrap();
}

fn no_filters() -> FilterSet {
    FilterSet::resolve(
        &FilterRules::default(),
        &FilterRules::default(),
        &FilterRules::default(),
    )
}

fn config_for(dir: &TempDir, strategy: BuildStrategy) -> BuildConfig {
    let mut config = BuildConfig::new(
        "b1",
        vec![dir.path().join("site")],
        dir.path().join("out"),
    );
    config.strategy = strategy;
    config
}

#[test]
fn single_pass_build_runs_to_complete() {
    let dir = tempfile::tempdir().unwrap();
    make_site(&dir.path().join("site"));
    let config = config_for(&dir, BuildStrategy::NativeSingleThreaded);
    let archive_path = config.archive_path();
    let index_path = config.index_path();
    let store = JsonStateStore::new(dir.path().join("out")).unwrap();
    let pipeline = BuildPipeline::new(config, no_filters(), store);

    let status = pipeline.run_to_completion().unwrap();
    assert_eq!(status, Status::Complete);

    let progress = pipeline.status().unwrap().unwrap();
    assert!(progress.archive_built);
    assert_eq!(progress.percent, 100);
    // 3 dirs + 5 files.
    assert_eq!(progress.archive_file_count, Some(8));

    assert!(archive_path.exists());
    // Working files are cleaned up once the build completes.
    assert!(!index_path.exists());

    let descriptor = pipeline.descriptor().unwrap().unwrap();
    assert_eq!(descriptor.file_name, "b1.zip");
    assert!(descriptor.size > 0);
    assert_eq!(descriptor.file_count, Some(8));

    let report = pipeline.scan_report().unwrap().unwrap();
    assert_eq!(report.full_count, 8);
    assert_eq!(report.dir_count, 3);
    assert!(!report.size_warning);
}

#[test]
fn build_resumes_across_pipeline_instances() {
    let dir = tempfile::tempdir().unwrap();
    make_site(&dir.path().join("site"));
    let mut config = config_for(&dir, BuildStrategy::NativeChunked);
    // One scan entry and one archived file per chunk.
    config.max_iterations = 1;
    config.chunk_bytes = 1;
    let archive_path = config.archive_path();

    let mut steps = 0;
    let mut saw_scan_cursor = false;
    loop {
        steps += 1;
        assert!(steps < 100, "pipeline never finished");
        // A fresh pipeline per step: state must fully live in the store.
        let store = JsonStateStore::new(dir.path().join("out")).unwrap();
        let pipeline = BuildPipeline::new(config.clone(), no_filters(), store);
        let status = pipeline.step().unwrap();
        if let Some(progress) = pipeline.status().unwrap() {
            saw_scan_cursor |= progress.scan_cursor.is_some();
        }
        if status.is_terminal() {
            assert_eq!(status, Status::Complete);
            break;
        }
    }

    assert!(steps > 8, "expected many small chunks, got {steps}");
    assert!(saw_scan_cursor, "scan never suspended mid-walk");

    let file = fs::File::open(&archive_path).unwrap();
    let archive = zip::ZipArchive::new(file).unwrap();
    assert_eq!(archive.len(), 8);
}

#[test]
fn two_root_build_archives_both_trees() {
    let dir = tempfile::tempdir().unwrap();
    let site_a = dir.path().join("site-a");
    let site_b = dir.path().join("site-b");
    fs::create_dir_all(&site_a).unwrap();
    fs::create_dir_all(&site_b).unwrap();
    fs::write(site_a.join("alpha.txt"), b"alpha").unwrap();
    fs::write(site_b.join("beta.txt"), b"beta").unwrap();
    fs::write(site_a.join("index.php"), b"<?php // a").unwrap();
    fs::write(site_b.join("index.php"), b"<?php // b").unwrap();

    let mut config = BuildConfig::new(
        "b1",
        vec![site_a, site_b],
        dir.path().join("out"),
    );
    config.strategy = BuildStrategy::NativeSingleThreaded;
    let archive_path = config.archive_path();
    let store = JsonStateStore::new(dir.path().join("out")).unwrap();
    let pipeline = BuildPipeline::new(config, no_filters(), store);

    assert_eq!(pipeline.run_to_completion().unwrap(), Status::Complete);

    let file = fs::File::open(&archive_path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    assert!(names.contains(&"site-a/alpha.txt".to_string()), "{names:?}");
    assert!(names.contains(&"site-b/beta.txt".to_string()), "{names:?}");
    assert!(names.contains(&"site-a/index.php".to_string()), "{names:?}");
    assert!(names.contains(&"site-b/index.php".to_string()), "{names:?}");
}

#[test]
fn filters_keep_excluded_paths_out_of_the_archive() {
    let dir = tempfile::tempdir().unwrap();
    make_site(&dir.path().join("site"));
    let config = config_for(&dir, BuildStrategy::NativeSingleThreaded);
    let archive_path = config.archive_path();
    let filters = FilterSet::resolve(
        &FilterRules::default(),
        &FilterRules::default(),
        &FilterRules::from_delimited("cache", "log", ""),
    );
    let store = JsonStateStore::new(dir.path().join("out")).unwrap();
    let pipeline = BuildPipeline::new(config, filters, store);

    assert_eq!(pipeline.run_to_completion().unwrap(), Status::Complete);

    let file = fs::File::open(&archive_path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    assert!(names.iter().any(|n| n.contains("a.txt")));
    assert!(!names.iter().any(|n| n.contains("cache")));
    assert!(!names.iter().any(|n| n.ends_with(".log")));
}

#[test]
fn cancellation_is_observed_at_the_next_boundary() {
    let dir = tempfile::tempdir().unwrap();
    make_site(&dir.path().join("site"));
    let mut config = config_for(&dir, BuildStrategy::NativeChunked);
    config.max_iterations = 1;
    let archive_path = config.archive_path();
    let index_path = config.index_path();
    let store = JsonStateStore::new(dir.path().join("out")).unwrap();
    let pipeline = BuildPipeline::new(config, no_filters(), store);

    // Get partway into the scan, then flag cancellation.
    pipeline.step().unwrap();
    pipeline.step().unwrap();
    pipeline.request_cancel().unwrap();

    let status = pipeline.step().unwrap();
    assert_eq!(status, Status::BuildCancelled);
    assert!(status.is_terminal());

    // Working files and any partial archive are gone.
    assert!(!index_path.exists());
    assert!(!archive_path.exists());

    // Terminal builds are inert.
    assert_eq!(pipeline.step().unwrap(), Status::BuildCancelled);
}

#[test]
fn total_runtime_ceiling_forces_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    make_site(&dir.path().join("site"));
    let mut config = config_for(&dir, BuildStrategy::NativeChunked);
    config.max_iterations = 1;
    config.max_total_runtime_secs = 0;
    let store = JsonStateStore::new(dir.path().join("out")).unwrap();
    let pipeline = BuildPipeline::new(config, no_filters(), store);

    // The first step records the start time and immediately trips the
    // whole-build ceiling.
    assert_eq!(pipeline.step().unwrap(), Status::BuildCancelled);
}

#[test]
fn missing_root_fails_requirements() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&dir, BuildStrategy::NativeSingleThreaded);
    let store = JsonStateStore::new(dir.path().join("out")).unwrap();
    let pipeline = BuildPipeline::new(config, no_filters(), store);

    let status = pipeline.run_to_completion().unwrap();
    assert_eq!(status, Status::RequirementsFailed);

    let progress = pipeline.status().unwrap().unwrap();
    assert!(progress.failed);
    assert!(progress.failure_message.unwrap().contains("does not exist"));
}

#[test]
fn streaming_strategy_builds_through_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    make_site(&dir.path().join("site"));
    let config = config_for(&dir, BuildStrategy::StreamingContainer);
    let archive_path = config.archive_path();
    let store = JsonStateStore::new(dir.path().join("out")).unwrap();
    let pipeline = BuildPipeline::new(config, no_filters(), store);

    assert_eq!(pipeline.run_to_completion().unwrap(), Status::Complete);
    assert_eq!(archive_path.extension().unwrap(), "spk");

    let entries = sitepack_archive::StreamingReader::open(&archive_path)
        .unwrap()
        .entries()
        .unwrap();
    assert_eq!(entries.len(), 8);
}
