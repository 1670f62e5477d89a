//! End-to-end scenarios: real wasm steps through the thread backend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use flowcell_core::handler::registry::HandlerRegistry;
use flowcell_core::sandbox::{BoxIsolationBackend, StepExecutor};
use flowcell_infra::builtin::register_builtins;
use flowcell_infra::sandbox::ThreadBackend;
use flowcell_types::config::ExecutorConfig;
use flowcell_types::policy::NodePolicy;
use flowcell_types::result::ErrorKind;
use flowcell_types::step::{StepExecutionRequest, TrustTier};
use serde_json::json;

const INFINITE_LOOP: &str = r#"(module (func (export "run") (loop br 0)))"#;

const GREETING: &str = r#"(module
    (import "step" "output" (func $output (param i32 i32)))
    (memory (export "memory") 1)
    (data (i32.const 16) "{\"greeting\":\"hi\"}")
    (func (export "run") (call $output (i32.const 16) (i32.const 17))))"#;

fn executor() -> StepExecutor {
    executor_with(ExecutorConfig::default())
}

fn executor_with(config: ExecutorConfig) -> StepExecutor {
    let mut registry = HandlerRegistry::new();
    register_builtins(&mut registry).unwrap();
    let backend = BoxIsolationBackend::new(ThreadBackend::new(config.sandbox.clone()));
    StepExecutor::new(backend, Arc::new(registry), config)
}

#[tokio::test(flavor = "multi_thread")]
async fn set_node_merges_values() {
    let executor = executor();
    let request = StepExecutionRequest::built_in("set")
        .with_parameters(json!({"values": {"greeting": "hi"}}))
        .with_input_items(vec![json!({})]);

    let result = executor.execute(request).await;
    assert!(result.is_success(), "{result:?}");
    assert_eq!(result.items(), Some(&[json!({"greeting": "hi"})][..]));
    assert!(result.session_id.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn unregistered_built_in_node_type_is_rejected() {
    let executor = executor();
    let result = executor
        .execute(StepExecutionRequest::built_in("httpRequest"))
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::UnknownNodeType));
    assert!(!result.is_retryable());
}

#[tokio::test(flavor = "multi_thread")]
async fn identical_built_in_requests_give_identical_outcomes() {
    let executor = executor();
    let request = || {
        StepExecutionRequest::built_in("set")
            .with_parameters(json!({"values": {"n": 7}}))
            .with_input_items(vec![json!({"a": 1}), json!({"b": 2})])
    };
    let first = executor.execute(request()).await;
    let second = executor.execute(request()).await;
    assert_eq!(first.outcome, second.outcome);
}

#[tokio::test(flavor = "multi_thread")]
async fn guest_output_becomes_items() {
    let executor = executor();
    let result = executor
        .execute(StepExecutionRequest::sandboxed(TrustTier::UserCode, GREETING))
        .await;
    assert!(result.is_success(), "{result:?}");
    assert_eq!(result.items(), Some(&[json!({"greeting": "hi"})][..]));
    assert!(result.session_id.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn infinite_loop_times_out_within_a_second_or_so() {
    let executor = executor();
    let request = StepExecutionRequest::sandboxed(TrustTier::UserCode, INFINITE_LOOP)
        .with_policy(NodePolicy::with_timeout(1));

    let started = Instant::now();
    let result = executor.execute(request).await;
    let elapsed = started.elapsed();

    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout), "{result:?}");
    assert!(result.is_retryable());
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn timed_out_session_is_never_reused() {
    let executor = executor();
    let timed_out = executor
        .execute(
            StepExecutionRequest::sandboxed(TrustTier::UserCode, INFINITE_LOOP)
                .with_policy(NodePolicy::with_timeout(1)),
        )
        .await;
    assert_eq!(timed_out.error_kind(), Some(ErrorKind::Timeout));
    let dead = timed_out.session_id.expect("sandboxed result names its session");

    assert!(
        executor
            .pool_snapshot()
            .iter()
            .all(|session| session.session_id != dead)
    );

    let next = executor
        .execute(StepExecutionRequest::sandboxed(TrustTier::UserCode, GREETING))
        .await;
    assert!(next.is_success(), "{next:?}");
    assert_ne!(next.session_id, Some(dead));
}

#[tokio::test(flavor = "multi_thread")]
async fn successful_session_is_pooled_and_reused() {
    let executor = executor();
    let first = executor
        .execute(StepExecutionRequest::sandboxed(TrustTier::Plugin, GREETING))
        .await;
    assert!(first.is_success());
    assert_eq!(executor.pool_snapshot().len(), 1);

    let second = executor
        .execute(StepExecutionRequest::sandboxed(TrustTier::Plugin, GREETING))
        .await;
    assert_eq!(first.session_id, second.session_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn fs_import_is_access_denied() {
    let executor = executor();
    let code = r#"(module
        (import "fs" "readFileSync" (func (param i32 i32) (result i32)))
        (func (export "run")))"#;
    let result = executor
        .execute(StepExecutionRequest::sandboxed(TrustTier::UserCode, code))
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::ModuleAccessDenied));
    assert!(!result.is_retryable());
}

#[tokio::test(flavor = "multi_thread")]
async fn non_function_imports_outside_allowlist_are_denied() {
    let executor = executor();
    let phrasings = [
        r#"(module (import "fs" "mem" (memory 1)) (func (export "run")))"#,
        r#"(module (import "process" "env" (global i32)) (func (export "run")))"#,
        r#"(module (import "child_process" "t" (table 1 funcref)) (func (export "run")))"#,
        r#"(module (import "step" "require" (func)) (func (export "run")))"#,
    ];
    for code in phrasings {
        let result = executor
            .execute(StepExecutionRequest::sandboxed(TrustTier::Plugin, code))
            .await;
        assert_eq!(
            result.error_kind(),
            Some(ErrorKind::ModuleAccessDenied),
            "{code}: {result:?}"
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn network_requires_policy_opt_in() {
    let executor = executor();
    let code = r#"(module
        (import "http" "fetch" (func (param i32 i32) (result i32)))
        (func (export "run")))"#;
    let result = executor
        .execute(StepExecutionRequest::sandboxed(TrustTier::Plugin, code))
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::ModuleAccessDenied));
}

#[tokio::test(flavor = "multi_thread")]
async fn faulting_step_does_not_affect_concurrent_step() {
    let executor = Arc::new(executor());
    let faulting = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move {
            executor
                .execute(StepExecutionRequest::sandboxed(
                    TrustTier::UserCode,
                    r#"(module (func (export "run") unreachable))"#,
                ))
                .await
        })
    };
    let healthy = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move {
            executor
                .execute(
                    StepExecutionRequest::sandboxed(TrustTier::UserCode, GREETING)
                        .with_input_items(vec![json!({"ignored": true})]),
                )
                .await
        })
    };

    let faulting = faulting.await.unwrap();
    let healthy = healthy.await.unwrap();
    assert_eq!(faulting.error_kind(), Some(ErrorKind::ExecutionError));
    assert!(healthy.is_success(), "{healthy:?}");
    assert_eq!(healthy.items(), Some(&[json!({"greeting": "hi"})][..]));
    assert_ne!(faulting.session_id, healthy.session_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_stops_a_running_guest() {
    let executor = Arc::new(executor());
    let request = StepExecutionRequest::sandboxed(TrustTier::UserCode, INFINITE_LOOP)
        .with_policy(NodePolicy::with_timeout(60))
        .with_correlation_id("cancel-me");
    let running = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.execute(request).await })
    };

    // Wait until the request is in flight.
    let mut cancelled = false;
    for _ in 0..100 {
        if executor.cancel("cancel-me") {
            cancelled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(cancelled);

    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("cancelled request returns promptly")
        .unwrap();
    assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
    assert!(executor.active_sessions().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn warm_up_prefills_the_pool() {
    let executor = executor();
    assert_eq!(executor.warm_up(TrustTier::Plugin, 2).await, 2);
    assert_eq!(executor.pool_snapshot().len(), 2);
    executor.shutdown();
    assert!(executor.pool_snapshot().is_empty());
}
