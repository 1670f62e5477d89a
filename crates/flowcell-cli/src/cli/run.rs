//! `flowcell run`: execute one step request.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use flowcell_core::retry::RetryHandler;
use flowcell_types::config::BackendKind;
use flowcell_types::result::{ExecutionResult, Outcome};
use flowcell_types::step::StepExecutionRequest;
use tokio::io::AsyncReadExt;

use crate::state::AppState;

/// Read a request document from `path`, or stdin for `-`.
pub async fn read_request(path: &Path) -> Result<StepExecutionRequest> {
    let raw = if path == Path::new("-") {
        let mut buf = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buf)
            .await
            .context("failed to read request from stdin")?;
        buf
    } else {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read request file {}", path.display()))?
    };
    serde_json::from_str(&raw).context("request is not a valid StepExecutionRequest")
}

/// Execute the request and print its result. Returns whether it succeeded.
pub async fn run_request(
    state: &AppState,
    path: &Path,
    backend: Option<BackendKind>,
    retry: bool,
    json: bool,
) -> Result<bool> {
    let request = read_request(path).await?;
    let executor = state.executor(backend).await?;

    let (result, attempts) = if retry {
        RetryHandler::execute_with_retry(&executor, request).await
    } else {
        (executor.execute(request).await, 1)
    };
    executor.shutdown();

    if json {
        println!("{}", serde_json::to_string(&result)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&result)?);
        print_summary(&result, attempts);
    }
    Ok(result.is_success())
}

fn print_summary(result: &ExecutionResult, attempts: u32) {
    let attempts = if attempts > 1 {
        format!(" after {attempts} attempts")
    } else {
        String::new()
    };
    match &result.outcome {
        Outcome::Success { items } => eprintln!(
            "  {} {} item(s) in {} ms{attempts}",
            style("✓").green(),
            items.len(),
            result.duration_ms
        ),
        Outcome::Failure {
            kind,
            message,
            retryable,
        } => eprintln!(
            "  {} {} {}{}{attempts}",
            style("✗").red(),
            style(kind).red().bold(),
            message,
            if *retryable {
                style(" (retryable)").dim().to_string()
            } else {
                String::new()
            }
        ),
    }
}
