//! Configuration settings for xcp
//!
//! Defines the CLI arguments, their defaults, and the runtime configuration
//! derived from them. Object-store credentials are not handled here; they
//! come from the environment of each backend.

use crate::core::{CopyOptions, FailurePolicy};
use crate::error::{Result, XcpError};
use crate::fs::ListDirTask;
use crate::storage::StorageUrl;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// xcp - copy directory trees between local filesystems and object stores
#[derive(Parser, Debug, Clone)]
#[command(name = "xcp")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Copy files between local filesystems and object stores")]
#[command(long_about = r#"
xcp copies directory trees between storage backends addressed by URL,
optionally preserving modification time and permission bits.

Addresses:
  /data/in, ./rel, file:///data/in   local filesystem
  s3://bucket/prefix                 S3 (when built with native_s3)
  mem://bucket/prefix                in-process memory store

Examples:
  xcp copy /data/in s3://bucket/backup --filter '*.csv' --with-meta
  xcp copy s3://bucket/backup /data/restore -w 16
  xcp list /data/in --filter '*.*' --since 1day
"#)]
pub struct CliArgs {
    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Output format for reports
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub output_format: OutputFormat,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Copy matching files from SOURCE to DESTINATION
    Copy(CopyArgs),

    /// List matching files under SOURCE with totals
    #[command(alias = "ls")]
    List(ListArgs),
}

/// Which files to select
#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    /// Source address (local path, file://, s3:// or mem://)
    #[arg(value_name = "SOURCE")]
    pub source: String,

    /// Glob matched against file base names
    #[arg(short = 'f', long, default_value = "*", value_name = "PATTERN")]
    pub filter: String,

    /// Read and preserve modification time and mode
    #[arg(short = 'm', long)]
    pub with_meta: bool,

    /// Only list the top level of SOURCE
    #[arg(long)]
    pub no_recursive: bool,

    /// Skip dot-files and dot-directories
    #[arg(long)]
    pub skip_hidden: bool,

    /// Minimum file size (e.g., 1K)
    #[arg(long, value_name = "SIZE", value_parser = parse_size)]
    pub min_size: Option<u64>,

    /// Maximum file size (e.g., 1G)
    #[arg(long, value_name = "SIZE", value_parser = parse_size)]
    pub max_size: Option<u64>,

    /// Only files modified since an age (e.g., 2h, 7days) or a timestamp
    #[arg(long, value_name = "WHEN", value_parser = parse_since)]
    pub since: Option<SystemTime>,
}

/// Copy-specific arguments
#[derive(Args, Debug, Clone)]
pub struct CopyArgs {
    /// Files to copy
    #[command(flatten)]
    pub listing: ListArgs,

    /// Destination address
    #[arg(value_name = "DESTINATION")]
    pub destination: String,

    /// Number of parallel transfers (0 = auto-detect)
    #[arg(short = 'w', long, default_value = "0", value_name = "NUM", env = "XCP_WORKERS")]
    pub workers: usize,

    /// Buffer size per transfer (e.g., 256K, 1M)
    #[arg(short = 'b', long, default_value = "256K", value_name = "SIZE", value_parser = parse_size)]
    pub buffer_size: u64,

    /// Stop dispatching after the first failed file
    #[arg(long)]
    pub fail_fast: bool,

    /// Retry transient failures N times
    #[arg(long, default_value = "2", value_name = "NUM")]
    pub retries: u32,

    /// Delay before the first retry (e.g., 100ms, 1s)
    #[arg(long, default_value = "100ms", value_name = "DURATION", value_parser = humantime::parse_duration)]
    pub retry_delay: Duration,

    /// Show progress bars
    #[arg(short = 'p', long)]
    pub progress: bool,
}

/// Output format for reports
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// JSON format
    Json,
}

/// Listing configuration derived from CLI args
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingConfig {
    /// Source address
    pub source: StorageUrl,
    /// Base-name glob
    pub filter: String,
    /// Read and preserve metadata
    pub with_meta: bool,
    /// Descend into subdirectories
    pub recursive: bool,
    /// Skip hidden entries
    pub skip_hidden: bool,
    /// Min file size
    pub min_size: Option<u64>,
    /// Max file size
    pub max_size: Option<u64>,
    /// Lower bound on modification time
    pub modified_since: Option<SystemTime>,
}

impl ListingConfig {
    /// Create config from CLI arguments
    pub fn from_cli(args: &ListArgs) -> Result<Self> {
        if let (Some(min), Some(max)) = (args.min_size, args.max_size) {
            if min > max {
                return Err(XcpError::config(format!(
                    "--min-size ({}) is larger than --max-size ({})",
                    min, max
                )));
            }
        }

        Ok(Self {
            source: StorageUrl::parse(&args.source)?,
            filter: args.filter.clone(),
            with_meta: args.with_meta,
            recursive: !args.no_recursive,
            skip_hidden: args.skip_hidden,
            min_size: args.min_size,
            max_size: args.max_size,
            modified_since: args.since,
        })
    }

    /// Build the listing task, compiling the filter
    pub fn to_task(&self) -> Result<ListDirTask> {
        let mut task = ListDirTask::new(self.source.clone(), &self.filter)?
            .with_meta(self.with_meta)
            .recursive(self.recursive)
            .skip_hidden(self.skip_hidden);
        task.min_size = self.min_size;
        task.max_size = self.max_size;
        task.modified_since = self.modified_since;
        Ok(task)
    }
}

/// Runtime configuration for a copy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyConfig {
    /// What to copy
    pub listing: ListingConfig,
    /// Destination address
    pub destination: StorageUrl,
    /// Engine settings
    pub options: CopyOptions,
    /// Show progress bars
    pub progress: bool,
}

impl CopyConfig {
    /// Create config from CLI arguments
    pub fn from_cli(args: &CopyArgs) -> Result<Self> {
        let buffer_size = usize::try_from(args.buffer_size)
            .ok()
            .filter(|&b| b > 0)
            .ok_or_else(|| XcpError::config(format!("Invalid buffer size: {}", args.buffer_size)))?;

        Ok(Self {
            listing: ListingConfig::from_cli(&args.listing)?,
            destination: StorageUrl::parse(&args.destination)?,
            options: CopyOptions {
                concurrency: args.workers,
                failure_policy: if args.fail_fast {
                    FailurePolicy::FailFast
                } else {
                    FailurePolicy::ContinueOnError
                },
                buffer_size,
                retries: args.retries,
                retry_delay: args.retry_delay,
            },
            progress: args.progress,
        })
    }
}

/// Parse human-readable size string to bytes
pub fn parse_size(size: &str) -> std::result::Result<u64, String> {
    let size = size.trim().to_uppercase();

    if size.is_empty() {
        return Err("Empty size string".to_string());
    }

    let (num_str, multiplier) = if size.ends_with("TB") || size.ends_with('T') {
        (size.trim_end_matches(|c| c == 'T' || c == 'B'), 1024u64 * 1024 * 1024 * 1024)
    } else if size.ends_with("GB") || size.ends_with('G') {
        (size.trim_end_matches(|c| c == 'G' || c == 'B'), 1024u64 * 1024 * 1024)
    } else if size.ends_with("MB") || size.ends_with('M') {
        (size.trim_end_matches(|c| c == 'M' || c == 'B'), 1024u64 * 1024)
    } else if size.ends_with("KB") || size.ends_with('K') {
        (size.trim_end_matches(|c| c == 'K' || c == 'B'), 1024u64)
    } else if size.ends_with('B') {
        (size.trim_end_matches('B'), 1u64)
    } else {
        // Assume bytes if no suffix
        (size.as_str(), 1u64)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Invalid size: {}", size));
    }

    Ok((num * multiplier as f64) as u64)
}

/// Parse a `--since` bound: an age relative to now (`90s`, `2h`, `7days`),
/// an RFC 3339 timestamp, or a calendar date (`2024-01-31`, midnight UTC)
pub fn parse_since(value: &str) -> std::result::Result<SystemTime, String> {
    let value = value.trim();

    if let Ok(age) = humantime::parse_duration(value) {
        return SystemTime::now()
            .checked_sub(age)
            .ok_or_else(|| format!("Age out of range: {}", value));
    }

    if let Ok(stamp) = humantime::parse_rfc3339_weak(value) {
        return Ok(stamp);
    }

    if let Ok(date) = chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| format!("Invalid date: {}", value))?
            .and_utc();
        return Ok(midnight.into());
    }

    Err(format!(
        "Expected an age (e.g. 2h, 7days), an RFC 3339 timestamp or a date: {}",
        value
    ))
}
