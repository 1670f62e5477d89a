//! flowcell CLI entry point.
//!
//! Binary name: `flowcell`
//!
//! Parses CLI arguments, sets up tracing and dispatches to a command. The
//! hidden `worker` command runs synchronously; every other command runs on a
//! multi-threaded tokio runtime.

mod cli;
mod state;

use std::process::ExitCode;

use clap::Parser;
use clap_complete::generate;
use flowcell_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut options = TracingOptions::from_verbosity(cli.verbose, cli.quiet);
    // Worker stdout carries the protocol, so it never exports spans there.
    options.otel = cli.otel && !matches!(cli.command, Commands::Worker);
    if let Err(err) = init_tracing(&options) {
        eprintln!("Warning: failed to initialize tracing: {err}");
    }

    let outcome = match cli.command {
        Commands::Worker => cli::worker::worker().map(|()| true),
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(shell, &mut cmd, "flowcell", &mut std::io::stdout());
            Ok(true)
        }
        command => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(anyhow::Error::from)
            .and_then(|runtime| runtime.block_on(dispatch(command, &cli.config, cli.json))),
    };

    shutdown_tracing();
    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("{} {err:#}", console::style("error:").red().bold());
            ExitCode::from(2)
        }
    }
}

async fn dispatch(command: Commands, config: &std::path::Path, json: bool) -> anyhow::Result<bool> {
    let state = AppState::init(config).await?;
    match command {
        Commands::Run {
            request,
            backend,
            retry,
        } => cli::run::run_request(&state, &request, backend, retry, json).await,
        Commands::Capabilities {
            tier,
            network,
            memory_mb,
            cpu,
        } => cli::inspect::capabilities(&state, tier, network, memory_mb, cpu, json).map(|()| true),
        Commands::Handlers => cli::inspect::handlers(&state, json).map(|()| true),
        Commands::Worker | Commands::Completions { .. } => Ok(true),
    }
}
