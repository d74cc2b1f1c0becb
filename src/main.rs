//! sitepack - resumable backup-archive builder.
//!
//! Usage:
//!   sitepack build --id <ID> --root <PATH>     Run a build to completion
//!   sitepack build --id <ID> --root <PATH> --step
//!                                              Run exactly one chunk
//!   sitepack status --id <ID>                  Show persisted progress
//!   sitepack cancel --id <ID>                  Flag a build for cancellation
//!   sitepack report --id <ID>                  Export the scan report as JSON
//!   sitepack filters                           Show the resolved filter set
//!   sitepack --help                            Show help

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{eyre, Context, Result};
use tracing_subscriber::EnvFilter;

use sitepack::BuildPipeline;
use sitepack_core::{
    BuildConfig, BuildStrategy, FilterRules, FilterSet, JsonStateStore, Status,
};

#[derive(Parser)]
#[command(
    name = "sitepack",
    version,
    about = "Resumable backup-archive build pipeline",
    long_about = "sitepack scans a site directory into a persisted file index and \
                  builds a backup archive from it in bounded, resumable chunks.\n\n\
                  Every invocation runs at most one chunk with `--step`, so the \
                  build can be driven by cron or any external scheduler; without \
                  `--step` the process loops until the build finishes."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run (or resume) a backup build
    Build {
        #[command(flatten)]
        target: Target,

        /// Archive engine
        #[arg(short, long, default_value = "native-chunked")]
        strategy: BuildStrategy,

        /// Run exactly one chunk and exit
        #[arg(long)]
        step: bool,

        #[command(flatten)]
        excludes: Excludes,

        /// Wall-clock budget per chunk, in seconds
        #[arg(long)]
        max_chunk_seconds: Option<u64>,

        /// Maximum entries visited per scan chunk
        #[arg(long)]
        max_iterations: Option<usize>,

        /// Archive password (external tool engine only)
        #[arg(long)]
        password: Option<String>,
    },

    /// Show the persisted progress of a build
    Status {
        #[command(flatten)]
        target: Target,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Flag a running build for cancellation at its next chunk boundary
    Cancel {
        #[command(flatten)]
        target: Target,
    },

    /// Export the structured scan report of a build as JSON
    Report {
        #[command(flatten)]
        target: Target,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output_file: Option<PathBuf>,
    },

    /// Show the effective exclusion filters for the given rules
    Filters {
        #[command(flatten)]
        excludes: Excludes,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

/// Which build, where.
#[derive(clap::Args)]
struct Target {
    /// Build identity; working files and the archive name derive from it
    #[arg(long)]
    id: String,

    /// Root directory to back up
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Directory for the archive, index and state files
    #[arg(long, default_value = ".sitepack")]
    output: PathBuf,
}

/// Instance-scope exclusion rules, semicolon-delimited.
#[derive(clap::Args)]
struct Excludes {
    /// Directories to exclude, relative to the root (e.g. "cache;tmp")
    #[arg(long, default_value = "")]
    exclude_dirs: String,

    /// File extensions to exclude (e.g. "log;bak")
    #[arg(long, default_value = "")]
    exclude_exts: String,

    /// File paths to exclude, relative to the root
    #[arg(long, default_value = "")]
    exclude_files: String,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Build {
            target,
            strategy,
            step,
            excludes,
            max_chunk_seconds,
            max_iterations,
            password,
        } => run_build(
            target,
            strategy,
            step,
            &excludes,
            max_chunk_seconds,
            max_iterations,
            password,
        ),
        Command::Status { target, format } => run_status(target, format),
        Command::Cancel { target } => run_cancel(target),
        Command::Report {
            target,
            output_file,
        } => run_report(target, output_file),
        Command::Filters { excludes, format } => run_filters(&excludes, format),
    }
}

/// Built-in protected exclusions; user configuration can only add to these.
fn core_rules() -> FilterRules {
    // The default working directory must never end up inside its own archive.
    FilterRules::from_delimited(".sitepack", "", "")
}

fn resolve_filters(excludes: &Excludes) -> FilterSet {
    let instance = FilterRules::from_delimited(
        &excludes.exclude_dirs,
        &excludes.exclude_exts,
        &excludes.exclude_files,
    );
    FilterSet::resolve(&core_rules(), &FilterRules::default(), &instance)
}

fn pipeline_for(
    target: &Target,
    strategy: BuildStrategy,
    excludes: &Excludes,
    max_chunk_seconds: Option<u64>,
    max_iterations: Option<usize>,
    password: Option<String>,
) -> Result<BuildPipeline<JsonStateStore>> {
    let root = target.root.canonicalize().context("Invalid root path")?;
    let mut builder = BuildConfig::builder();
    builder
        .build_id(target.id.clone())
        .roots(vec![root])
        .output_dir(target.output.clone())
        .strategy(strategy)
        .password(password);
    if let Some(secs) = max_chunk_seconds {
        builder.max_chunk_duration(std::time::Duration::from_secs(secs));
    }
    if let Some(iterations) = max_iterations {
        builder.max_iterations(iterations);
    }
    let config = builder.build().map_err(|e| eyre!("{e}"))?;

    let filters = resolve_filters(excludes);
    let store = JsonStateStore::new(&target.output)?;
    Ok(BuildPipeline::new(config, filters, store))
}

fn run_build(
    target: Target,
    strategy: BuildStrategy,
    step: bool,
    excludes: &Excludes,
    max_chunk_seconds: Option<u64>,
    max_iterations: Option<usize>,
    password: Option<String>,
) -> Result<()> {
    let pipeline = pipeline_for(
        &target,
        strategy,
        excludes,
        max_chunk_seconds,
        max_iterations,
        password,
    )?;

    let status = if step {
        pipeline.step().context("Build step failed")?
    } else {
        pipeline.run_to_completion().context("Build failed")?
    };

    if let Some(progress) = pipeline.status()? {
        print_progress_summary(&progress, &target.output, &target.id);
    }

    match status {
        Status::Complete => {
            if let Some(descriptor) = pipeline.descriptor()? {
                println!(
                    "Wrote {} ({})",
                    descriptor.file_name,
                    humansize::format_size(descriptor.size, humansize::DECIMAL)
                );
            }
            Ok(())
        }
        other if other.is_terminal() => Err(eyre!("build ended in status `{other}`")),
        other => {
            println!("Build suspended in status `{other}`; invoke again to continue.");
            Ok(())
        }
    }
}

fn run_status(target: Target, format: OutputFormat) -> Result<()> {
    let store = JsonStateStore::new(&target.output)?;
    let pipeline = status_pipeline(&target, store)?;
    match pipeline.status()? {
        None => {
            println!("No build named `{}` has started.", target.id);
        }
        Some(progress) => match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&progress)?),
            OutputFormat::Text => print_progress_summary(&progress, &target.output, &target.id),
        },
    }
    Ok(())
}

fn run_cancel(target: Target) -> Result<()> {
    let store = JsonStateStore::new(&target.output)?;
    let pipeline = status_pipeline(&target, store)?;
    pipeline.request_cancel()?;
    println!(
        "Build `{}` flagged for cancellation; it stops at the next chunk boundary.",
        target.id
    );
    Ok(())
}

fn run_report(target: Target, output_file: Option<PathBuf>) -> Result<()> {
    let store = JsonStateStore::new(&target.output)?;
    let pipeline = status_pipeline(&target, store)?;
    let Some(report) = pipeline.scan_report()? else {
        return Err(eyre!(
            "build `{}` has no completed scan to report on",
            target.id
        ));
    };
    let json = serde_json::to_string_pretty(&report)?;
    match output_file {
        Some(path) => {
            std::fs::write(&path, json)?;
            eprintln!("Exported to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn run_filters(excludes: &Excludes, format: OutputFormat) -> Result<()> {
    let filters = resolve_filters(excludes);
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&filters)?),
        OutputFormat::Text => {
            println!("Excluded directories: {}", display_or_none(&filters.dirs_delimited()));
            println!("Excluded extensions:  {}", display_or_none(&filters.exts_delimited()));
            println!("Excluded files:       {}", display_or_none(&filters.files_delimited()));
        }
    }
    Ok(())
}

/// A pipeline that only loads state; strategy and filters are irrelevant
/// because resumed builds keep what they were started with.
fn status_pipeline(
    target: &Target,
    store: JsonStateStore,
) -> Result<BuildPipeline<JsonStateStore>> {
    let config = BuildConfig::new(
        target.id.clone(),
        vec![target.root.clone()],
        target.output.clone(),
    );
    Ok(BuildPipeline::new(config, FilterSet::default(), store))
}

/// The archive path is derived from the persisted strategy, not the CLI
/// flags, so a resumed build reports the container it actually wrote.
fn print_progress_summary(progress: &sitepack_core::BuildProgress, output_dir: &Path, id: &str) {
    let extension = progress.strategy.format().extension();
    let archive = output_dir.join(format!("{id}.{extension}"));
    println!();
    println!("{}", "─".repeat(60));
    println!(" Status:   {} ({}%)", progress.status, progress.percent);
    println!(" Strategy: {}", progress.strategy);
    if progress.archive_built {
        println!(
            " Archive:  {} ({})",
            archive.display(),
            humansize::format_size(progress.archive_bytes_written, humansize::DECIMAL)
        );
        if let Some(count) = progress.archive_file_count {
            println!(" Entries:  {count}");
        }
    }
    if let Some(message) = &progress.failure_message {
        println!(" Failure:  {message}");
    }
    if let Some(remediation) = &progress.remediation {
        println!(" Fix:      {}", remediation.message);
    }
    println!("{}", "─".repeat(60));
}

fn display_or_none(value: &str) -> &str {
    if value.is_empty() {
        "(none)"
    } else {
        value
    }
}
