use anyhow::{Context, Result, bail};
use clap::{Args, Parser};
use serde::Serialize;
use sgbench::config::{AppConfig, CheckerType};
use sgbench::context::AppContext;
use sgbench::core::{Orchestrator, RunRequest};
use sgbench::logging::{self, LogConfig};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sgbench")]
#[command(
    about = "Measure upload latency and throughput into an eventually-consistent object store",
    long_about = None
)]
struct Cli {
    /// Directory tree to upload
    #[arg(required_unless_present = "print_config")]
    source: Option<PathBuf>,

    /// Staging directory, e.g. a storage gateway file share
    #[arg(required_unless_present = "print_config")]
    destination: Option<PathBuf>,

    /// Bucket the staging directory is backed by
    #[arg(required_unless_present = "print_config")]
    bucket: Option<String>,

    /// TOML config file (defaults to ./sgbench.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    #[command(flatten)]
    overrides: ConfigArgs,
}

/// Flags that override config file and environment values.
#[derive(Args, Serialize)]
struct ConfigArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_concurrent_copies: Option<usize>,

    /// Do not wait for files to become visible remotely
    #[serde(rename = "verify", skip_serializing_if = "is_false", serialize_with = "negate")]
    #[arg(long)]
    skip_verify: bool,

    /// Report file path
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    output: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    check_timeout_ms: Option<u64>,

    /// Give up on a file that is not visible after this many seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verify_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, value_enum)]
    checker: Option<CheckerType>,

    /// S3-compatible endpoint for the s3 checker
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    endpoint: Option<String>,

    /// AWS region for the s3 checker
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    region: Option<String>,

    /// Local mount of the bucket for the local checker
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    mirror_root: Option<PathBuf>,

    #[serde(skip_serializing_if = "is_false")]
    #[arg(long)]
    sync_files: bool,

    #[serde(skip_serializing_if = "is_false")]
    #[arg(long)]
    preserve_timestamps: bool,

    #[serde(skip_serializing_if = "is_false")]
    #[arg(long)]
    json_logs: bool,

    #[serde(skip_serializing_if = "is_false")]
    #[arg(long)]
    verbose: bool,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

fn negate<S: serde::Serializer>(flag: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_bool(!*flag)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(cli.config.as_deref(), Some(&cli.overrides))
        .context("Failed to load configuration")?;

    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    logging::init(LogConfig::from(&config));

    let (Some(source), Some(destination), Some(bucket)) = (cli.source, cli.destination, cli.bucket)
    else {
        bail!("SOURCE, DESTINATION and BUCKET are required");
    };

    let output = config.output.clone();
    let ctx = AppContext::new(config);
    let outcome = Orchestrator::new(ctx)
        .await?
        .run(RunRequest {
            source,
            destination,
            bucket,
        })
        .await
        .context("Run failed")?;

    print!("{}", outcome.summary);

    if !outcome.summary.is_clean() {
        bail!(
            "{} copy failure(s) and {} unverified file(s); see {}",
            outcome.summary.failed_copies,
            outcome.summary.unverified_files,
            output.display()
        );
    }

    Ok(())
}
