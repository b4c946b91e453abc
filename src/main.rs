//! xcp CLI - copy directory trees between storage backends

use chrono::{DateTime, Local};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use xcp::config::{CliArgs, Commands, CopyArgs, CopyConfig, ListArgs, ListingConfig, OutputFormat};
use xcp::core::CopyEngine;
use xcp::error::Result;
use xcp::fs::{list_dir, DirEntry};
use xcp::progress::ProgressReporter;

fn main() {
    // Parse CLI arguments
    let args = CliArgs::parse();

    init_logging(&args);

    // Handle result
    match run(&args) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// RUST_LOG wins over the verbosity flags
fn init_logging(args: &CliArgs) {
    let level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Returns whether the command succeeded
fn run(args: &CliArgs) -> Result<bool> {
    match &args.command {
        Commands::Copy(copy) => cmd_copy(copy, args),
        Commands::List(list) => cmd_list(list, args),
    }
}

fn cmd_copy(copy: &CopyArgs, args: &CliArgs) -> Result<bool> {
    let config = CopyConfig::from_cli(copy)?;

    if args.verbose > 0 && !args.quiet {
        print_config(&config);
    }

    let listing = config.listing.to_task()?;
    let progress = if config.progress && !args.quiet && args.output_format == OutputFormat::Text {
        ProgressReporter::new()
    } else {
        ProgressReporter::disabled()
    };
    let engine = CopyEngine::new(config.options.clone()).with_progress(progress);

    let mut result = engine.execute(listing, &config.destination)?;

    match args.output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result.to_json())?),
        OutputFormat::Text if !args.quiet => {
            result.print_summary();
            if let Some(progress) = engine.progress().filter(|_| args.verbose > 0) {
                let summary = progress.summary();
                println!(
                    "Dispatched:      {} files, {} ({:.1}% transferred, {}/s live)",
                    summary.discovered_files,
                    humansize::format_size(summary.discovered_bytes, humansize::BINARY),
                    summary.percentage(),
                    humansize::format_size(summary.throughput as u64, humansize::BINARY)
                );
            }
        }
        OutputFormat::Text => {}
    }

    match result.take_error() {
        Some(err) => {
            tracing::error!("Copy failed: {}", err);
            Ok(false)
        }
        None => Ok(true),
    }
}

fn cmd_list(list: &ListArgs, args: &CliArgs) -> Result<bool> {
    let config = ListingConfig::from_cli(list)?;
    let mut entries = list_dir(config.to_task()?)?;

    let mut collected = Vec::new();
    while entries.advance() {
        let Some(entry) = entries.current() else {
            continue;
        };
        match args.output_format {
            OutputFormat::Json => collected.push(entry.clone()),
            OutputFormat::Text => println!("{}", format_entry(entry)),
        }
    }

    let summary = entries.summary();
    let error = entries.error().cloned();

    match args.output_format {
        OutputFormat::Json => {
            let report = serde_json::json!({
                "source": config.source.to_string(),
                "entries": collected,
                "summary": summary,
                "error": error.as_ref().map(|e| e.to_string()),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text if !args.quiet => {
            println!(
                "\n{} files, {}",
                summary.total_files,
                humansize::format_size(summary.total_bytes, humansize::BINARY)
            );
        }
        OutputFormat::Text => {}
    }

    match error {
        Some(err) => Err(err.with_context(format!("listing {}", config.source))),
        None => Ok(true),
    }
}

fn format_entry(entry: &DirEntry) -> String {
    match &entry.meta {
        Some(meta) => {
            let mtime: DateTime<Local> = meta.mtime.into();
            format!(
                "{} {:04o} {:>12} {}",
                mtime.format("%Y-%m-%d %H:%M:%S"),
                meta.mode,
                entry.size,
                entry.name
            )
        }
        None => format!("{:>12} {}", entry.size, entry.name),
    }
}

fn print_config(config: &CopyConfig) {
    println!("=== xcp Configuration ===");
    println!("Source:       {}", config.listing.source);
    println!("Destination:  {}", config.destination);
    println!("Filter:       {}", config.listing.filter);
    println!("Recursive:    {}", config.listing.recursive);
    println!("With meta:    {}", config.listing.with_meta);
    println!("Workers:      {}", config.options.effective_concurrency());
    println!("Policy:       {:?}", config.options.failure_policy);
    println!("Buffer size:  {}", humansize::format_size(config.options.buffer_size as u64, humansize::BINARY));
    println!("Retries:      {} (delay {})", config.options.retries, humantime::format_duration(config.options.retry_delay));
    println!();
}
