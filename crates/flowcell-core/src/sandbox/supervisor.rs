//! Step executor: the supervisor side of sandboxed execution.
//!
//! [`StepExecutor::execute`] is the single inbound entry point. It validates
//! the request, routes built-in steps to the [`HandlerRegistry`] and every
//! other tier to a sandbox session, races the work against the step timeout
//! and the caller's cancellation, and always produces exactly one
//! [`ExecutionResult`].
//!
//! Sessions come from the [`SessionPool`] or are spawned through the
//! [`BoxIsolationBackend`]. A session is returned to the pool only after a
//! successful reply; timeouts, crashes, cancellations and failed replies
//! destroy it.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use flowcell_types::config::{ExecutorConfig, SandboxSettings};
use flowcell_types::policy::EffectivePolicy;
use flowcell_types::protocol::{ExecutePayload, ResultMessage, SupervisorMessage, WorkerMessage};
use flowcell_types::result::{ErrorKind, ExecutionResult, LogLine, Outcome};
use flowcell_types::session::{SessionInfo, SessionState};
use flowcell_types::step::{StepExecutionRequest, TrustTier};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::backend::{BoxIsolationBackend, SandboxError, WorkerEvent, WorkerLink};
use super::pool::{Session, SessionPool};
use crate::capability::{CapabilityGate, derive_capabilities};
use crate::handler::HandlerContext;
use crate::handler::registry::{DispatchError, HandlerRegistry};
use crate::logs::{self, LogBuffer};

const TIMEOUT_MESSAGE: &str = "step exceeded timeout";
const CANCELLED_MESSAGE: &str = "step cancelled by caller";

/// What one execution path produced, before timing is attached.
struct Verdict {
    outcome: Outcome,
    logs: Vec<LogLine>,
    session_id: Option<Uuid>,
}

impl Verdict {
    fn rejected(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::failure(kind, message),
            logs: Vec::new(),
            session_id: None,
        }
    }
}

/// How the reply race on a session ended.
enum Termination {
    Replied(ResultMessage),
    Crashed(String),
    TimedOut,
    Cancelled,
}

/// Removes a correlation id from the in-flight table when dropped.
struct InflightGuard<'a> {
    inflight: &'a DashMap<String, CancellationToken>,
    correlation_id: String,
    token: CancellationToken,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inflight.remove(&self.correlation_id);
    }
}

/// Lists a session as active while it spawns. Dropping the guard, including
/// when the spawn future is abandoned, unlists it.
struct SpawningGuard<'a> {
    active: &'a DashMap<Uuid, SessionInfo>,
    session_id: Uuid,
}

impl<'a> SpawningGuard<'a> {
    fn insert(active: &'a DashMap<Uuid, SessionInfo>, info: &SessionInfo) -> Self {
        active.insert(info.session_id, info.clone());
        Self {
            active,
            session_id: info.session_id,
        }
    }
}

impl Drop for SpawningGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.session_id);
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Executes step requests against built-in handlers or sandbox sessions.
pub struct StepExecutor {
    backend: BoxIsolationBackend,
    registry: Arc<HandlerRegistry>,
    gate: CapabilityGate,
    pool: SessionPool,
    settings: SandboxSettings,
    /// Sessions currently bound to a request.
    active: DashMap<Uuid, SessionInfo>,
    /// Cancellation tokens of in-flight requests by correlation id.
    inflight: DashMap<String, CancellationToken>,
}

impl StepExecutor {
    pub fn new(
        backend: BoxIsolationBackend,
        registry: Arc<HandlerRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        tracing::info!(
            backend = backend.name(),
            handlers = registry.len(),
            pool_enabled = config.pool.enabled,
            "step executor initialized"
        );
        Self {
            backend,
            registry,
            gate: CapabilityGate::new(config.limits),
            pool: SessionPool::new(config.pool),
            settings: config.sandbox,
            active: DashMap::new(),
            inflight: DashMap::new(),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn gate(&self) -> &CapabilityGate {
        &self.gate
    }

    /// Execute one step request.
    ///
    /// Never panics and never returns an error: every path ends in a
    /// `Success` or `Failure` outcome.
    pub async fn execute(&self, request: StepExecutionRequest) -> ExecutionResult {
        let span = tracing::info_span!(
            "step.execute",
            step_id = %request.step_id,
            correlation_id = %request.correlation_id,
            trust_tier = %request.trust_tier,
        );
        self.execute_inner(request).instrument(span).await
    }

    async fn execute_inner(&self, request: StepExecutionRequest) -> ExecutionResult {
        let started = Instant::now();

        let verdict = match validate(&request) {
            Err(message) => Verdict::rejected(ErrorKind::ValidationError, message),
            Ok(()) => match self.begin(&request.correlation_id) {
                None => Verdict::rejected(
                    ErrorKind::ValidationError,
                    format!(
                        "a request with correlation id '{}' is already in flight",
                        request.correlation_id
                    ),
                ),
                Some(guard) => {
                    let policy = self.gate.resolve(&request.policy);
                    if request.trust_tier.is_sandboxed() {
                        self.run_sandboxed(&request, &policy, &guard.token).await
                    } else {
                        self.run_builtin(&request, &policy, &guard.token).await
                    }
                }
            },
        };

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &verdict.outcome {
            Outcome::Success { items } => {
                tracing::info!(items = items.len(), duration_ms, "step succeeded");
            }
            Outcome::Failure {
                kind,
                message,
                retryable,
            } => {
                tracing::warn!(kind = %kind, retryable, duration_ms, "step failed: {message}");
            }
        }

        ExecutionResult {
            correlation_id: request.correlation_id,
            outcome: verdict.outcome,
            duration_ms,
            logs: verdict.logs,
            session_id: verdict.session_id,
        }
    }

    fn begin(&self, correlation_id: &str) -> Option<InflightGuard<'_>> {
        match self.inflight.entry(correlation_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let token = CancellationToken::new();
                vacant.insert(token.clone());
                Some(InflightGuard {
                    inflight: &self.inflight,
                    correlation_id: correlation_id.to_string(),
                    token,
                })
            }
        }
    }

    /// Cancel an in-flight request. Returns `false` if no request with that
    /// correlation id is running.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        match self.inflight.get(correlation_id) {
            Some(token) => {
                tracing::info!(correlation_id, "cancelling in-flight step");
                token.cancel();
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Trusted path
    // -----------------------------------------------------------------------

    async fn run_builtin(
        &self,
        request: &StepExecutionRequest,
        policy: &EffectivePolicy,
        token: &CancellationToken,
    ) -> Verdict {
        let ctx = Arc::new(HandlerContext::new(
            request.step_id.clone(),
            request.correlation_id.clone(),
            request.input_items.clone(),
            self.settings.max_log_lines,
        ));
        let registry = Arc::clone(&self.registry);
        let task_ctx = Arc::clone(&ctx);
        let node_type = request.node_type.clone();
        let parameters = request.parameters.clone();

        let mut task = tokio::spawn(
            async move { registry.dispatch(&node_type, &task_ctx, &parameters).await }
                .in_current_span(),
        );

        let outcome = tokio::select! {
            joined = &mut task => match joined {
                Ok(Ok(items)) => Outcome::Success { items },
                Ok(Err(DispatchError::UnknownNodeType(node_type))) => Outcome::failure(
                    ErrorKind::UnknownNodeType,
                    format!("no built-in handler registered for node type '{node_type}'"),
                ),
                Ok(Err(DispatchError::Handler(err))) => Outcome::Failure {
                    kind: ErrorKind::ExecutionError,
                    retryable: err.is_retryable(),
                    message: err.to_string(),
                },
                Err(join_err) => Outcome::failure(
                    ErrorKind::ExecutionError,
                    format!("built-in handler aborted: {join_err}"),
                ),
            },
            _ = tokio::time::sleep(policy.timeout()) => {
                task.abort();
                Outcome::failure(ErrorKind::Timeout, TIMEOUT_MESSAGE)
            }
            _ = token.cancelled() => {
                task.abort();
                Outcome::failure(ErrorKind::Cancelled, CANCELLED_MESSAGE)
            }
        };

        Verdict {
            outcome,
            logs: ctx.take_logs(),
            session_id: None,
        }
    }

    // -----------------------------------------------------------------------
    // Sandboxed path
    // -----------------------------------------------------------------------

    async fn run_sandboxed(
        &self,
        request: &StepExecutionRequest,
        policy: &EffectivePolicy,
        token: &CancellationToken,
    ) -> Verdict {
        let capabilities = derive_capabilities(request.trust_tier, policy);

        // The step timeout covers acquisition as well as the reply.
        let deadline = tokio::time::sleep(policy.timeout());
        tokio::pin!(deadline);

        let acquired = tokio::select! {
            acquired = self.acquire(request.trust_tier) => acquired,
            _ = &mut deadline => {
                return Verdict::rejected(ErrorKind::Timeout, TIMEOUT_MESSAGE);
            }
            _ = token.cancelled() => {
                return Verdict::rejected(ErrorKind::Cancelled, CANCELLED_MESSAGE);
            }
        };
        let mut session = match acquired {
            Ok(session) => session,
            Err(err) => {
                return Verdict::rejected(
                    ErrorKind::SandboxCrashed,
                    format!("failed to start sandbox session: {err}"),
                );
            }
        };
        let session_id = session.info.session_id;
        session.info.state = SessionState::Executing;
        session.info.assigned_request_id = Some(request.correlation_id.clone());
        session.info.last_activity_at = Utc::now();
        self.active.insert(session_id, session.info.clone());
        tracing::debug!(session_id = %session_id, reuse_count = session.info.reuse_count, "dispatching to session");

        let mut logs = LogBuffer::new(self.settings.max_log_lines);
        let payload = ExecutePayload::from_request(
            request,
            capabilities,
            policy.timeout_secs.saturating_mul(1_000),
        );

        let termination = match session.link.send(SupervisorMessage::Execute { payload }) {
            Err(err) => Termination::Crashed(err.to_string()),
            Ok(()) => {
                loop {
                    tokio::select! {
                        event = session.link.recv() => match event {
                            Some(WorkerEvent::Message(WorkerMessage::Log { level, text })) => {
                                logs::emit(level, &request.step_id, &text);
                                logs.push(level, text);
                            }
                            Some(WorkerEvent::Message(WorkerMessage::Ready)) => {}
                            Some(WorkerEvent::Message(WorkerMessage::Result(reply))) => {
                                if reply.correlation_id == request.correlation_id {
                                    break Termination::Replied(reply);
                                }
                                break Termination::Crashed(format!(
                                    "worker replied for '{}' while running '{}'",
                                    reply.correlation_id, request.correlation_id
                                ));
                            }
                            Some(WorkerEvent::Exited { reason }) => {
                                break Termination::Crashed(format!("sandbox exited: {reason}"));
                            }
                            None => {
                                break Termination::Crashed("sandbox channel closed".to_string());
                            }
                        },
                        _ = &mut deadline => break Termination::TimedOut,
                        _ = token.cancelled() => break Termination::Cancelled,
                    }
                }
            }
        };

        let outcome = match termination {
            Termination::Replied(reply) => {
                let outcome = reply_outcome(reply, &request.input_items);
                if matches!(outcome, Outcome::Success { .. }) {
                    self.release(session);
                } else {
                    self.destroy(session, "request failed");
                }
                outcome
            }
            Termination::Crashed(reason) => {
                tracing::error!(session_id = %session_id, "sandbox session crashed: {reason}");
                self.destroy(session, "crashed");
                Outcome::failure(ErrorKind::SandboxCrashed, reason)
            }
            Termination::TimedOut => {
                self.destroy(session, "timed out");
                Outcome::failure(ErrorKind::Timeout, TIMEOUT_MESSAGE)
            }
            Termination::Cancelled => {
                self.destroy(session, "cancelled");
                Outcome::failure(ErrorKind::Cancelled, CANCELLED_MESSAGE)
            }
        };

        Verdict {
            outcome,
            logs: logs.finish(),
            session_id: Some(session_id),
        }
    }

    /// Take a pooled session for `tier` or spawn a new one.
    async fn acquire(&self, tier: TrustTier) -> Result<Session, SandboxError> {
        if let Some(session) = self.pool.checkout(tier) {
            tracing::debug!(session_id = %session.info.session_id, "reusing pooled session");
            return Ok(session);
        }
        self.spawn_session(tier).await
    }

    async fn spawn_session(&self, tier: TrustTier) -> Result<Session, SandboxError> {
        let mut info = SessionInfo::spawning(tier);
        let spawning = SpawningGuard::insert(&self.active, &info);
        let spawned = self.spawn_and_wait(&info).await;
        drop(spawning);

        let link = spawned?;
        info.state = SessionState::Ready;
        info.last_activity_at = Utc::now();
        tracing::debug!(
            session_id = %info.session_id,
            backend = self.backend.name(),
            "sandbox session ready"
        );
        Ok(Session::new(info, link))
    }

    async fn spawn_and_wait(
        &self,
        info: &SessionInfo,
    ) -> Result<WorkerLink, SandboxError> {
        let mut link = self.backend.spawn(info).await?;
        let ready = async {
            loop {
                match link.recv().await {
                    Some(WorkerEvent::Message(WorkerMessage::Ready)) => return Ok(()),
                    Some(WorkerEvent::Message(other)) => {
                        tracing::debug!(?other, "ignoring worker message before ready");
                    }
                    Some(WorkerEvent::Exited { reason }) => return Err(SandboxError::Exited(reason)),
                    None => return Err(SandboxError::ChannelClosed),
                }
            }
        };

        let waited = tokio::time::timeout(self.settings.spawn_timeout(), ready).await;
        match waited {
            Ok(Ok(())) => Ok(link),
            Ok(Err(err)) => {
                link.terminate();
                Err(err)
            }
            Err(_) => {
                link.terminate();
                Err(SandboxError::SpawnTimeout(self.settings.spawn_timeout_ms))
            }
        }
    }

    /// Return a session that completed cleanly, or destroy it if the pool
    /// will not take it.
    fn release(&self, mut session: Session) {
        self.active.remove(&session.info.session_id);
        session.info.reuse_count = session.info.reuse_count.saturating_add(1);
        session.info.last_activity_at = Utc::now();
        if let Err(session) = self.pool.checkin(session) {
            self.destroy(session, "not pooled");
        }
    }

    fn destroy(&self, mut session: Session, reason: &str) {
        self.active.remove(&session.info.session_id);
        session.info.state = SessionState::Terminating;
        session.link.terminate();
        session.info.state = SessionState::Dead;
        tracing::debug!(session_id = %session.info.session_id, reason, "sandbox session destroyed");
    }

    // -----------------------------------------------------------------------
    // Pool lifecycle
    // -----------------------------------------------------------------------

    /// Pre-spawn up to `count` idle sessions for `tier`. Returns how many
    /// were added to the pool.
    pub async fn warm_up(&self, tier: TrustTier, count: usize) -> usize {
        if !tier.is_sandboxed() {
            return 0;
        }
        let mut warmed = 0;
        for _ in 0..count {
            match self.spawn_session(tier).await {
                Ok(session) => match self.pool.checkin(session) {
                    Ok(()) => warmed += 1,
                    Err(session) => {
                        self.destroy(session, "pool full");
                        break;
                    }
                },
                Err(err) => {
                    tracing::warn!(trust_tier = %tier, "failed to warm sandbox session: {err}");
                    break;
                }
            }
        }
        tracing::info!(trust_tier = %tier, warmed, "warmed sandbox sessions");
        warmed
    }

    /// Destroy idle sessions past the idle timeout or reuse limit.
    pub fn evict_idle(&self) -> usize {
        let evicted = self.pool.evict_idle();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted idle sandbox sessions");
        }
        evicted
    }

    /// Snapshots of idle pooled sessions.
    pub fn pool_snapshot(&self) -> Vec<SessionInfo> {
        self.pool.snapshot()
    }

    /// Snapshots of sessions currently spawning or bound to a request.
    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        self.active.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Cancel every in-flight request and destroy all idle sessions.
    pub fn shutdown(&self) {
        for entry in self.inflight.iter() {
            entry.value().cancel();
        }
        let idle = self.pool.drain();
        let count = idle.len();
        for session in idle {
            let _ = session.link.send(SupervisorMessage::Shutdown);
            self.destroy(session, "shutdown");
        }
        tracing::info!(destroyed = count, "step executor shut down");
    }
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("backend", &self.backend.name())
            .field("handlers", &self.registry.len())
            .field("active", &self.active.len())
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate(request: &StepExecutionRequest) -> Result<(), String> {
    if request.correlation_id.trim().is_empty() {
        return Err("correlationId must not be empty".to_string());
    }
    if request.node_type.trim().is_empty() {
        return Err("nodeType must not be empty".to_string());
    }
    if request.trust_tier.is_sandboxed()
        && request.code.as_deref().is_none_or(|code| code.trim().is_empty())
    {
        return Err(format!(
            "code is required for trust tier '{}'",
            request.trust_tier
        ));
    }
    Ok(())
}

/// Map a worker's terminal reply to an outcome.
fn reply_outcome(reply: ResultMessage, input_items: &[serde_json::Value]) -> Outcome {
    if reply.success {
        return Outcome::Success {
            items: reply.output.unwrap_or_else(|| input_items.to_vec()),
        };
    }
    if let Some(stack) = &reply.stack {
        tracing::debug!(stack = %stack, "worker failure stack");
    }
    match reply.error {
        Some(failure) => Outcome::failure(failure.kind, failure.message),
        None => Outcome::failure(
            ErrorKind::ExecutionError,
            "worker reported failure without detail",
        ),
    }
}
