//! Retry helper for step execution.
//!
//! The executor makes at most one attempt per call; retrying is the caller's
//! decision. [`RetryHandler`] applies a resolved policy's `retryCount` and
//! `retryDelayMs` to a result's `retryable` flag.

use std::time::Duration;

use flowcell_types::policy::EffectivePolicy;
use flowcell_types::result::ExecutionResult;
use flowcell_types::step::StepExecutionRequest;

use crate::sandbox::StepExecutor;

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry decisions. All logic lives in associated functions that
/// take the policy as a parameter.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt should follow `result`.
    ///
    /// `attempt` is 1-based (first execution is attempt 1). A policy with
    /// `retry_count = n` allows up to `n + 1` attempts in total.
    pub fn should_retry(policy: &EffectivePolicy, attempt: u32, result: &ExecutionResult) -> bool {
        result.is_retryable() && attempt <= policy.retry_count
    }

    /// Delay before the attempt following `attempt`. Constant per policy.
    pub fn delay(policy: &EffectivePolicy, _attempt: u32) -> Duration {
        policy.retry_delay()
    }

    /// Execute `request`, retrying retryable failures per its policy.
    ///
    /// Returns the last result and the number of attempts made.
    pub async fn execute_with_retry(
        executor: &StepExecutor,
        request: StepExecutionRequest,
    ) -> (ExecutionResult, u32) {
        let policy = executor.gate().resolve(&request.policy);
        let mut attempt = 1;
        loop {
            let result = executor.execute(request.clone()).await;
            if !Self::should_retry(&policy, attempt, &result) {
                return (result, attempt);
            }
            let delay = Self::delay(&policy, attempt);
            tracing::info!(
                correlation_id = %request.correlation_id,
                attempt,
                max_attempts = policy.retry_count + 1,
                delay_ms = whole_millis(delay),
                "retrying step"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Milliseconds in `delay`, saturating at `u64::MAX`.
fn whole_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}
