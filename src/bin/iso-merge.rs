//! iso-merge CLI entry point.
//!
//! Exit status: 0 on success, 1 when the rebuild fails, 2 when the job or
//! host configuration is rejected before anything is acquired.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use iso_merge::{preflight, Error, HostTools, JobSpec, Pipeline, PipelineError, ToolPaths};
use tracing_subscriber::EnvFilter;

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;

/// Rebuild an illumos ISO with extra files merged into its filesystems.
#[derive(Parser, Debug)]
#[command(name = "iso-merge")]
#[command(version)]
struct Cli {
    /// Job file (`.toml` or JSON). Reads JSON from stdin when omitted.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// TOML file overriding host tool locations.
    #[arg(long, value_name = "PATH")]
    tools: Option<PathBuf>,

    /// Skip host tool, privilege and input checks.
    #[arg(long)]
    skip_preflight: bool,

    /// Write `<output>.sha256` next to the rebuilt image.
    #[arg(long)]
    checksum: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let (job, paths) = match load(&cli) {
        Ok(loaded) => loaded,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "rejected");
            eprintln!("Error: {e:#}");
            return ExitCode::from(exit_status_for(&e));
        }
    };

    let tools = HostTools::new(paths);
    let result = Pipeline::new(&tools, &job)
        .write_checksum(cli.checksum)
        .run();

    match result {
        Ok(report) => {
            println!("{}", report.output.display());
            if let Some(checksum) = report.checksum {
                println!("{}", checksum.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            report_failure(&e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// Parse the job and tool paths, then run preflight.
fn load(cli: &Cli) -> Result<(JobSpec, ToolPaths)> {
    let job = match &cli.config {
        Some(path) => JobSpec::load(path)?,
        None => JobSpec::from_json_reader(io::stdin().lock())?,
    };

    let paths = match &cli.tools {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading tool paths '{}'", path.display()))?;
            ToolPaths::from_toml(&text)?
        }
        None => ToolPaths::default(),
    };

    if cli.skip_preflight {
        tracing::warn!("skipping preflight checks");
    } else {
        preflight::check_all(&paths, &job)?;
    }
    Ok((job, paths))
}

/// Exit status for an error raised before the pipeline starts.
fn exit_status_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<Error>() {
        Some(Error::Config(_)) => EXIT_CONFIG,
        // Unreadable --tools file.
        None if err.downcast_ref::<io::Error>().is_some() => EXIT_CONFIG,
        _ => EXIT_FAILURE,
    }
}

fn report_failure(err: &PipelineError) {
    eprintln!("Error: stage {} failed: {}", err.stage, err.source);
    let mut cause = std::error::Error::source(&err.source);
    while let Some(inner) = cause {
        eprintln!("  caused by: {inner}");
        cause = std::error::Error::source(inner);
    }
    for unwind in &err.unwind {
        eprintln!("  unwind: {unwind}");
    }
    if !err.unwind.is_empty() {
        eprintln!("Some resources may still be held; inspect the work directory and lofiadm.");
    }
}

/// Initialize the tracing subscriber on stderr.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}
