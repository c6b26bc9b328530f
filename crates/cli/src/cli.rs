use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sluice_core::Priority;

/// Drive an in-process sluice queue from the command line.
///
/// Registers a handful of demo handlers, pushes work through the queue
/// and prints status, metrics and snapshots as JSON.
#[derive(Parser, Debug)]
#[command(name = "sluice", about = "In-process request queue with adaptive worker pools")]
pub struct CliArgs {
    /// Path to config file (default: ~/.config/sluice/config.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a synthetic mixed workload and print the final queue state.
    Run {
        /// Number of requests to submit
        #[arg(long, default_value = "200")]
        requests: usize,

        /// Fraction of "flaky" requests that fail their first attempt
        #[arg(long, default_value = "0.1")]
        failure_rate: f64,

        /// Restore cache and metrics from a snapshot before starting
        #[arg(long)]
        import: Option<PathBuf>,

        /// Write a snapshot after the workload drains
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Submit a single request to a demo handler and print its result.
    Submit {
        /// Request type: sum, sort, sleep or flaky
        request_type: String,

        /// JSON payload
        payload: String,

        #[arg(long, default_value = "normal")]
        priority: Priority,

        /// Allow the result to be cached and deduplicated
        #[arg(long)]
        cacheable: bool,

        /// Per-attempt timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Print the effective configuration (file + environment) as TOML.
    Config,
}
