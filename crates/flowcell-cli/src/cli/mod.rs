//! CLI command definitions for the `flowcell` binary.

pub mod inspect;
pub mod run;
pub mod worker;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use flowcell_infra::config::DEFAULT_CONFIG_FILE;
use flowcell_types::config::BackendKind;
use flowcell_types::step::TrustTier;

/// Execute workflow steps in capability-restricted sandboxes.
#[derive(Parser)]
#[command(name = "flowcell", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans with the OpenTelemetry stdout exporter.
    #[arg(long, global = true)]
    pub otel: bool,

    /// Executor configuration file.
    #[arg(long, global = true, env = "FLOWCELL_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute one step request read from a JSON file ("-" for stdin).
    Run {
        /// Path to a StepExecutionRequest JSON document.
        request: PathBuf,

        /// Isolation backend, overriding the config file.
        #[arg(long)]
        backend: Option<BackendKind>,

        /// Retry retryable failures per the request's retry policy.
        #[arg(long)]
        retry: bool,
    },

    /// Show the capability set a trust tier and policy resolve to.
    Capabilities {
        /// Trust tier: built-in, plugin or user-code.
        #[arg(long)]
        tier: TrustTier,

        /// Request network access.
        #[arg(long)]
        network: bool,

        /// Requested memory ceiling in MB.
        #[arg(long = "memory-mb")]
        memory_mb: Option<u64>,

        /// Requested CPU quota in percent.
        #[arg(long)]
        cpu: Option<u32>,
    },

    /// List registered built-in node types.
    Handlers,

    /// Run the worker protocol over stdin/stdout.
    #[command(hide = true)]
    Worker,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
