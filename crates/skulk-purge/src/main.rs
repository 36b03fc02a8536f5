//! Skulk Purge CLI
//!
//! Deletes every block of the listed series from the segment files of a
//! stopped Skulk instance.

use alopex_skulk_purge::purge::DEFAULT_DATA_DIR;
use alopex_skulk_purge::{ErrorPolicy, PurgeConfig, Purger, RewriteOptions, TextReporter};
use clap::Parser;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Deletes series from segment files. The database must not be running.
#[derive(Parser)]
#[command(name = "skulk-purge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Root data directory
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Only process this database
    #[arg(long)]
    database: Option<String>,

    /// Only process this retention policy
    #[arg(long)]
    retention: Option<String>,

    /// File with one series key per line to delete
    #[arg(long, required = true)]
    series_file: Option<PathBuf>,

    /// Ignore series keys containing non-printable characters
    #[arg(long)]
    sanitize: bool,

    /// Print every dropped block and enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Skip a failing database/retention policy and keep going
    #[arg(long)]
    continue_on_error: bool,

    /// Rewrite segments even when nothing is dropped from them
    #[arg(long)]
    rewrite_unchanged: bool,

    /// Do not re-read replacements before swapping them in
    #[arg(long)]
    no_verify: bool,
}

impl Cli {
    fn into_config(self) -> PurgeConfig {
        PurgeConfig {
            data_dir: self.data_dir,
            database: self.database,
            retention_policy: self.retention,
            series_file: self.series_file,
            sanitize: self.sanitize,
            error_policy: if self.continue_on_error {
                ErrorPolicy::SkipUnit
            } else {
                ErrorPolicy::Abort
            },
            rewrite: RewriteOptions {
                skip_unchanged: !self.rewrite_unchanged,
                verify_output: !self.no_verify,
            },
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let mut reporter = TextReporter::new(io::stdout().lock(), cli.verbose);
    let purger = Purger::new(cli.into_config());

    match purger.run(&mut reporter) {
        Ok(summary) if summary.is_success() => ExitCode::SUCCESS,
        Ok(summary) => {
            for failure in &summary.failures {
                eprintln!(
                    "Error: '{}' failed at '{}': {}",
                    failure.unit,
                    failure.path.display(),
                    failure.error
                );
            }
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("Error: {}", err);
            ExitCode::FAILURE
        }
    }
}
