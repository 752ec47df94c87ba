use super::output::OutputGuard;
use super::privilege::needs_escalation;
use super::transport::{RemoteOutput, RemoteTransport, TransportError};
use crate::audit::{system_time_ms, AuditRecord, AuditSink};
use crate::config::BrokerConfig;
use crate::layers::approvals::ApprovalQueue;
use crate::layers::policy::{
    is_valid_host, AuthDecision, Authorization, CommandAuthorizer, RegistryStore, SharedRegistry,
};
use crate::layers::resilience::{
    Admission, CachedOutput, CircuitBreaker, ConcurrencyLimiter, LimiterError, ResultCache,
};
use protocol::{ErrorKind, ExecutionResult, PrivilegeMode};
use serde::Serialize;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Extra time a transport gets past the command timeout to tear its process down.
const TRANSPORT_GRACE: Duration = Duration::from_secs(3);

/// Caller-side bounds for one request.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    pub request_id: Option<String>,
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub host_unavailable: usize,
    pub pending_approval: usize,
}

impl BatchSummary {
    pub fn from_results(results: &[ExecutionResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Self::default()
        };
        for result in results {
            if result.ok {
                summary.succeeded += 1;
                continue;
            }
            summary.failed += 1;
            match result.error_kind {
                Some(ErrorKind::HostUnavailable) => summary.host_unavailable += 1,
                Some(ErrorKind::PendingApproval) => summary.pending_approval += 1,
                _ => {}
            }
        }
        summary
    }
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub results: Vec<ExecutionResult>,
    pub summary: BatchSummary,
}

struct CompletedRun {
    output: RemoteOutput,
    command: String,
    privilege: PrivilegeMode,
}

enum RunError {
    Cancelled(&'static str),
    Transport(TransportError),
    EscalationRefused(String),
}

/// Runs one request through policy, resilience, transport and guard, in that
/// order, and always answers with an [`ExecutionResult`].
pub struct ExecutionCoordinator {
    authorizer: CommandAuthorizer,
    approvals: ApprovalQueue,
    breaker: CircuitBreaker,
    limiter: ConcurrencyLimiter,
    cache: ResultCache,
    guard: OutputGuard,
    transport: Arc<dyn RemoteTransport>,
    audit: Arc<dyn AuditSink>,
    command_timeout: Duration,
    cache_ttl: Duration,
}

impl ExecutionCoordinator {
    pub fn new(
        config: &BrokerConfig,
        registry: Arc<SharedRegistry>,
        store: Arc<dyn RegistryStore>,
        transport: Arc<dyn RemoteTransport>,
        audit: Arc<dyn AuditSink>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            authorizer: CommandAuthorizer::new(Arc::clone(&registry), config.policy.escalation_prefix.clone()),
            approvals: ApprovalQueue::new(registry, store),
            breaker: CircuitBreaker::new(&config.breaker),
            limiter: ConcurrencyLimiter::new(
                config.concurrency.capacity,
                config.concurrency.acquire_timeout(),
            ),
            cache: ResultCache::new(config.cache.max_entries),
            guard: OutputGuard::new(&config.guard)?,
            transport,
            audit,
            command_timeout: config.limits.timeout(),
            cache_ttl: config.cache.ttl(),
        })
    }

    pub fn approvals(&self) -> &ApprovalQueue {
        &self.approvals
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub async fn execute(
        &self,
        session_id: &str,
        host: &str,
        requested_text: &str,
        ctx: &ExecContext,
    ) -> ExecutionResult {
        let started = Instant::now();
        let id = ctx
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let host = host.trim();
        let auth = self.authorizer.authorize(requested_text, host);
        tracing::info!(
            event = "execution.authorized",
            id = %id,
            session_id = %session_id,
            host = %host,
            command = %auth.final_command,
            decision = auth.decision.as_str(),
            reason = %auth.reason,
            registry_version = auth.registry_version,
        );

        let result = if host.is_empty() {
            self.failure(&id, host, &auth, ErrorKind::PolicyRejected, "target host is empty")
        } else if !is_valid_host(host) {
            self.failure(&id, host, &auth, ErrorKind::PolicyRejected, "invalid target host")
        } else {
            match auth.decision {
                AuthDecision::Rejected => {
                    let reason = auth.reason.clone();
                    self.failure(&id, host, &auth, ErrorKind::PolicyRejected, reason)
                }
                AuthDecision::NeedsApproval => {
                    let pending = self.approvals.submit(&auth.requested, host, session_id);
                    let message = format!(
                        "command is awaiting operator approval (request {}, seen {} times)",
                        pending.id, pending.occurrence_count
                    );
                    self.failure(&id, host, &auth, ErrorKind::PendingApproval, message)
                }
                AuthDecision::Allowed => self.run_allowed(&id, host, &auth, ctx).await,
            }
        };

        self.finish(session_id, requested_text, auth.decision.as_str(), &result, started);
        result
    }

    /// Same request against every host concurrently; the limiter still bounds
    /// how many reach their transport at once.
    pub async fn execute_many(
        &self,
        session_id: &str,
        hosts: &[String],
        requested_text: &str,
        ctx: &ExecContext,
    ) -> BatchOutcome {
        let runs = hosts.iter().map(|host| {
            let ctx = ExecContext {
                request_id: None,
                ..ctx.clone()
            };
            async move { self.execute(session_id, host, requested_text, &ctx).await }
        });
        let results = futures_util::future::join_all(runs).await;
        let summary = BatchSummary::from_results(&results);
        tracing::info!(
            event = "execution.batch",
            session_id = %session_id,
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            host_unavailable = summary.host_unavailable,
        );
        BatchOutcome { results, summary }
    }

    /// Checks a proposed summary against the output of an earlier result.
    pub fn check_summary(
        &self,
        session_id: &str,
        evidence: &ExecutionResult,
        candidate: &str,
    ) -> ExecutionResult {
        let started = Instant::now();
        let id = Uuid::new_v4().to_string();
        let mut result = if !evidence.ok {
            ExecutionResult::failure(
                &id,
                &evidence.host,
                &evidence.command,
                ErrorKind::OutputRejected,
                "evidence is not a successful execution",
            )
        } else if self.guard.validate_summary(&evidence.output, candidate) {
            ExecutionResult::success(&id, &evidence.host, &evidence.command, candidate.trim())
        } else {
            ExecutionResult::failure(
                &id,
                &evidence.host,
                &evidence.command,
                ErrorKind::OutputRejected,
                "summary is not grounded in the command output",
            )
        };
        result.command_name = evidence.command_name.clone();
        result.privilege = evidence.privilege;
        self.finish(session_id, &evidence.command, "summary_check", &result, started);
        result
    }

    async fn run_allowed(
        &self,
        id: &str,
        host: &str,
        auth: &Authorization,
        ctx: &ExecContext,
    ) -> ExecutionResult {
        let command = auth.final_command.as_str();
        if let Some(hit) = self.cache.get(host, command) {
            return self.cached_result(id, host, auth, hit);
        }

        let _probe = match self.breaker.admit(host) {
            Admission::Closed => None,
            Admission::Probe(ticket) => Some(ticket),
            Admission::Rejected { retry_in } => {
                let message = format!(
                    "circuit open for {host}; retry in {}s",
                    retry_in.as_secs()
                );
                return self.failure(id, host, auth, ErrorKind::HostUnavailable, message);
            }
        };

        let permit = match self.limiter.acquire(ctx.deadline, &ctx.cancel).await {
            Ok(permit) => permit,
            Err(LimiterError::Cancelled) => {
                return self.failure(id, host, auth, ErrorKind::Cancelled, LimiterError::Cancelled.to_string());
            }
            Err(err @ LimiterError::Timeout(_)) => {
                return self.failure(id, host, auth, ErrorKind::ConcurrencyTimeout, err.to_string());
            }
            Err(err @ LimiterError::Closed) => {
                return self.failure(id, host, auth, ErrorKind::ExecutionFailed, err.to_string());
            }
        };
        let outcome = self.run_with_escalation(host, auth, ctx).await;
        self.limiter.release(permit);

        match outcome {
            Ok(run) => {
                self.breaker.record_success(host);
                let guarded = self
                    .guard
                    .guard_captured(&run.output.combined(), run.output.truncated);
                self.cache.put(
                    host,
                    command,
                    CachedOutput {
                        output: guarded.text.clone(),
                        truncated: guarded.truncated,
                        exit_code: run.output.exit_code,
                        privilege: run.privilege,
                        executed_command: run.command.clone(),
                    },
                    self.cache_ttl,
                );
                let mut result = ExecutionResult::success(id, host, &run.command, guarded.text);
                result.command_name = auth.command_name.clone();
                result.summary_default = auth.summary_default;
                result.privilege = run.privilege;
                result.exit_code = run.output.exit_code;
                result.truncated = guarded.truncated;
                if let Some(code) = run.output.exit_code.filter(|code| *code != 0) {
                    result.message = Some(format!("command exited with status {code}"));
                }
                result
            }
            Err(RunError::Cancelled(reason)) => {
                self.failure(id, host, auth, ErrorKind::Cancelled, reason)
            }
            Err(RunError::EscalationRefused(message)) => {
                self.breaker.record_success(host);
                self.failure(id, host, auth, ErrorKind::PolicyRejected, message)
            }
            Err(RunError::Transport(err)) => {
                if err.is_connection_level() {
                    self.breaker.record_failure(host);
                }
                tracing::warn!(
                    event = "execution.transport_error",
                    id = %id,
                    host = %host,
                    error = %err,
                    counted = err.is_connection_level(),
                );
                self.failure(id, host, auth, err.error_kind(), err.to_string())
            }
        }
    }

    async fn run_with_escalation(
        &self,
        host: &str,
        auth: &Authorization,
        ctx: &ExecContext,
    ) -> Result<CompletedRun, RunError> {
        let output = self.call_transport(host, &auth.final_command, ctx).await?;
        if auth.requires_privilege
            && auth.privilege == PrivilegeMode::Unprivileged
            && needs_escalation(&output)
        {
            let escalated = self
                .authorizer
                .escalate(auth)
                .map_err(RunError::EscalationRefused)?;
            tracing::info!(event = "execution.escalated", host = %host, command = %escalated);
            let output = self.call_transport(host, &escalated, ctx).await?;
            return Ok(CompletedRun {
                output,
                command: escalated,
                privilege: PrivilegeMode::Escalated,
            });
        }
        Ok(CompletedRun {
            output,
            command: auth.final_command.clone(),
            privilege: auth.privilege,
        })
    }

    async fn call_transport(
        &self,
        host: &str,
        command: &str,
        ctx: &ExecContext,
    ) -> Result<RemoteOutput, RunError> {
        let mut limit = self.command_timeout;
        let mut deadline_bound = false;
        if let Some(deadline) = ctx.deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RunError::Cancelled("caller deadline elapsed"));
            }
            if remaining < limit {
                limit = remaining;
                deadline_bound = true;
            }
        }

        let run = tokio::time::timeout(
            limit + TRANSPORT_GRACE,
            self.transport.run_remote(host, command, limit),
        );
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(RunError::Cancelled("request cancelled")),
            outcome = run => outcome.unwrap_or(Err(TransportError::CommandTimeout(limit))),
        };
        match outcome {
            Err(TransportError::CommandTimeout(_)) if deadline_bound => {
                Err(RunError::Cancelled("caller deadline elapsed"))
            }
            other => other.map_err(RunError::Transport),
        }
    }

    fn cached_result(&self, id: &str, host: &str, auth: &Authorization, hit: CachedOutput) -> ExecutionResult {
        let mut result = ExecutionResult::success(id, host, hit.executed_command, hit.output);
        result.from_cache = true;
        result.command_name = auth.command_name.clone();
        result.summary_default = auth.summary_default;
        result.privilege = hit.privilege;
        result.exit_code = hit.exit_code;
        result.truncated = hit.truncated;
        result
    }

    fn failure(
        &self,
        id: &str,
        host: &str,
        auth: &Authorization,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> ExecutionResult {
        let mut result = ExecutionResult::failure(id, host, &auth.final_command, kind, message);
        result.command_name = auth.command_name.clone();
        result.summary_default = auth.summary_default;
        result
    }

    fn finish(
        &self,
        session_id: &str,
        requested_text: &str,
        decision: &str,
        result: &ExecutionResult,
        started: Instant,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            event = "execution.completed",
            id = %result.id,
            host = %result.host,
            command = %result.command,
            ok = result.ok,
            from_cache = result.from_cache,
            error_kind = result.error_kind.map(ErrorKind::as_str),
            duration_ms,
        );
        self.audit.record(AuditRecord {
            id: result.id.clone(),
            session_id: session_id.to_string(),
            host: result.host.clone(),
            requested_text: requested_text.to_string(),
            command: result.command.clone(),
            command_name: result.command_name.clone(),
            decision: decision.to_string(),
            ok: result.ok,
            error_kind: result.error_kind,
            message: result.message.clone(),
            from_cache: result.from_cache,
            privilege: result.privilege,
            exit_code: result.exit_code,
            truncated: result.truncated,
            duration_ms,
            finished_at_ms: system_time_ms(SystemTime::now()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::policy::{EphemeralStore, Registry, RegistryFile};
    use crate::test_utils::{paused_runtime, CollectingAudit, ScriptedTransport};
    use protocol::control::BreakerState;

    const REGISTRY: &str = r#"{
        "commands": [
            {"name": "nvme_list", "command": "nvme list", "aliases": ["nvme"], "summary_default": true},
            {"name": "smart", "command": "nvme smart-log {device}", "requires_privilege": true},
            {"name": "dmesg", "command": "dmesg -T", "requires_privilege": true},
            {"name": "uptime", "command": "uptime"}
        ],
        "allowlist": ["sudo -n nvme smart-log /dev/nvme0"]
    }"#;

    struct Harness {
        coordinator: ExecutionCoordinator,
        transport: Arc<ScriptedTransport>,
        audit: Arc<CollectingAudit>,
    }

    fn harness_with(config: BrokerConfig) -> Harness {
        let file: RegistryFile = serde_json::from_str(REGISTRY).expect("registry json");
        let registry = Arc::new(SharedRegistry::new(Registry::build(file, &[]).expect("registry")));
        let transport = Arc::new(ScriptedTransport::default());
        let audit = Arc::new(CollectingAudit::default());
        let coordinator = ExecutionCoordinator::new(
            &config,
            registry,
            Arc::new(EphemeralStore),
            transport.clone(),
            audit.clone(),
        )
        .expect("coordinator");
        Harness {
            coordinator,
            transport,
            audit,
        }
    }

    fn harness() -> Harness {
        harness_with(BrokerConfig::default())
    }

    fn refused(host: &str) -> Result<RemoteOutput, TransportError> {
        Err(TransportError::ConnectionRefused(format!("{host}:22")))
    }

    #[test]
    fn repeated_registered_command_is_served_from_cache() {
        paused_runtime().block_on(async {
            let h = harness();
            h.transport.script("hostA", "nvme list", Ok(RemoteOutput::stdout("/dev/nvme0n1 Samsung\n")));
            let ctx = ExecContext::new();

            let first = h.coordinator.execute("s1", "hostA", "nvme list", &ctx).await;
            assert!(first.ok);
            assert!(!first.from_cache);
            assert_eq!(first.output, "/dev/nvme0n1 Samsung");
            assert_eq!(first.command_name.as_deref(), Some("nvme_list"));
            assert!(first.summary_default);

            tokio::time::advance(Duration::from_secs(5)).await;
            let second = h.coordinator.execute("s1", "hostA", "nvme", &ctx).await;
            assert!(second.ok);
            assert!(second.from_cache);
            assert_eq!(second.output, first.output);
            assert_eq!(h.transport.call_count(), 1);
        });
    }

    #[test]
    fn denylisted_command_is_rejected_without_queueing() {
        paused_runtime().block_on(async {
            let h = harness();
            let result = h.coordinator.execute("s1", "hostB", "rm -rf /", &ExecContext::new()).await;
            assert!(!result.ok);
            assert_eq!(result.error_kind, Some(ErrorKind::PolicyRejected));
            assert!(h.coordinator.approvals().pending().is_empty());
            assert_eq!(h.transport.call_count(), 0);
        });
    }

    #[test]
    fn option_or_shell_shaped_host_is_rejected_before_transport() {
        paused_runtime().block_on(async {
            let h = harness();
            h.transport.script("hostA", "uptime", Ok(RemoteOutput::stdout("up")));
            let ctx = ExecContext::new();
            for host in ["-oProxyCommand=touch /tmp/fleetgate-pwned", "a;reboot", "hostA && id"] {
                let result = h.coordinator.execute("s1", host, "uptime", &ctx).await;
                assert_eq!(result.error_kind, Some(ErrorKind::PolicyRejected), "{host}");
                assert_eq!(result.message.as_deref(), Some("invalid target host"));
            }
            let unknown = h.coordinator.execute("s1", "a;reboot", "iostat -x", &ctx).await;
            assert_eq!(unknown.error_kind, Some(ErrorKind::PolicyRejected));
            assert!(h.coordinator.approvals().pending().is_empty());
            assert_eq!(h.transport.call_count(), 0);
            assert!(h.coordinator.breaker().snapshot().is_empty());
        });
    }

    #[test]
    fn unregistered_command_waits_for_approval() {
        paused_runtime().block_on(async {
            let h = harness();
            let result = h.coordinator.execute("s1", "hostC", "iostat -x", &ExecContext::new()).await;
            assert!(result.is_pending_approval());
            let pending = h.coordinator.approvals().pending();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].requested_text, "iostat -x");
            assert_eq!(pending[0].occurrence_count, 1);
            assert_eq!(h.transport.call_count(), 0);
        });
    }

    #[test]
    fn approved_command_runs_on_next_request() {
        paused_runtime().block_on(async {
            let h = harness();
            h.transport.script("hostC", "iostat -x", Ok(RemoteOutput::stdout("avg-cpu: %user 1.0")));
            let ctx = ExecContext::new();
            h.coordinator.execute("s1", "hostC", "iostat -x", &ctx).await;
            h.coordinator.approvals().approve("iostat", "iostat -x").expect("approve");
            let result = h.coordinator.execute("s1", "hostC", "iostat -x", &ctx).await;
            assert!(result.ok);
            assert_eq!(result.command_name.as_deref(), Some("iostat"));
        });
    }

    #[test]
    fn open_breaker_short_circuits_host() {
        paused_runtime().block_on(async {
            let h = harness();
            h.transport.script("hostD", "uptime", refused("hostD"));
            let ctx = ExecContext::new();
            for _ in 0..5 {
                let result = h.coordinator.execute("s1", "hostD", "uptime", &ctx).await;
                assert_eq!(result.error_kind, Some(ErrorKind::HostUnavailable));
            }
            assert_eq!(h.transport.call_count(), 5);

            let result = h.coordinator.execute("s1", "hostD", "uptime", &ctx).await;
            assert_eq!(result.error_kind, Some(ErrorKind::HostUnavailable));
            assert!(result.message.as_deref().unwrap_or_default().contains("circuit open"));
            assert_eq!(h.transport.call_count(), 5);
            assert!(h.coordinator.breaker().is_open("hostD"));
        });
    }

    #[test]
    fn open_breaker_still_serves_fresh_cache() {
        paused_runtime().block_on(async {
            let h = harness();
            h.transport.script("hostA", "nvme list", Ok(RemoteOutput::stdout("nvme0n1")));
            h.transport.script("hostA", "uptime", refused("hostA"));
            let ctx = ExecContext::new();
            assert!(h.coordinator.execute("s1", "hostA", "nvme list", &ctx).await.ok);
            for _ in 0..5 {
                h.coordinator.execute("s1", "hostA", "uptime", &ctx).await;
            }
            assert!(h.coordinator.breaker().is_open("hostA"));

            let cached = h.coordinator.execute("s1", "hostA", "nvme list", &ctx).await;
            assert!(cached.ok && cached.from_cache);

            tokio::time::advance(Duration::from_secs(31)).await;
            let expired = h.coordinator.execute("s1", "hostA", "nvme list", &ctx).await;
            assert_eq!(expired.error_kind, Some(ErrorKind::HostUnavailable));
        });
    }

    #[test]
    fn half_open_probe_success_closes_breaker() {
        paused_runtime().block_on(async {
            let h = harness();
            h.transport.script("hostD", "uptime", refused("hostD"));
            h.transport.script("hostD", "uptime", refused("hostD"));
            h.transport.script("hostD", "uptime", refused("hostD"));
            h.transport.script("hostD", "uptime", refused("hostD"));
            h.transport.script("hostD", "uptime", refused("hostD"));
            h.transport.script("hostD", "uptime", Ok(RemoteOutput::stdout("up 3 days")));
            let ctx = ExecContext::new();
            for _ in 0..5 {
                h.coordinator.execute("s1", "hostD", "uptime", &ctx).await;
            }
            tokio::time::advance(Duration::from_secs(601)).await;
            let probe = h.coordinator.execute("s1", "hostD", "uptime", &ctx).await;
            assert!(probe.ok);
            assert!(h.coordinator.breaker().snapshot().is_empty());
        });
    }

    #[test]
    fn concurrent_requests_after_cooldown_send_a_single_probe() {
        paused_runtime().block_on(async {
            let h = harness();
            for _ in 0..5 {
                h.transport.script("hostD", "uptime", refused("hostD"));
            }
            h.transport.script_delayed(
                "hostD",
                "uptime",
                Duration::from_secs(2),
                Ok(RemoteOutput::stdout("up 3 days")),
            );
            let ctx = ExecContext::new();
            for _ in 0..5 {
                h.coordinator.execute("s1", "hostD", "uptime", &ctx).await;
            }
            assert_eq!(h.transport.call_count(), 5);
            tokio::time::advance(Duration::from_secs(601)).await;

            let (first, second, third) = tokio::join!(
                h.coordinator.execute("s1", "hostD", "uptime", &ctx),
                h.coordinator.execute("s1", "hostD", "uptime", &ctx),
                h.coordinator.execute("s1", "hostD", "uptime", &ctx),
            );
            let results = [first, second, third];
            assert_eq!(results.iter().filter(|result| result.ok).count(), 1);
            assert_eq!(
                results
                    .iter()
                    .filter(|result| result.error_kind == Some(ErrorKind::HostUnavailable))
                    .count(),
                2
            );
            assert_eq!(h.transport.call_count(), 6);
            assert!(h.coordinator.breaker().snapshot().is_empty());
        });
    }

    #[test]
    fn slow_command_times_out_without_penalizing_host() {
        paused_runtime().block_on(async {
            let mut config = BrokerConfig::default();
            config.limits.timeout_secs = 2;
            let h = harness_with(config);
            h.transport.script_delayed(
                "hostA",
                "uptime",
                Duration::from_secs(10),
                Ok(RemoteOutput::stdout("late")),
            );
            let result = h.coordinator.execute("s1", "hostA", "uptime", &ExecContext::new()).await;
            assert_eq!(result.error_kind, Some(ErrorKind::ExecutionTimeout));
            assert!(h.coordinator.breaker().health("hostA").is_none());
        });
    }

    #[test]
    fn saturated_limiter_reports_concurrency_timeout() {
        paused_runtime().block_on(async {
            let mut config = BrokerConfig::default();
            config.concurrency.capacity = 1;
            config.concurrency.acquire_timeout_ms = 1_000;
            let h = harness_with(config);
            h.transport.script_delayed(
                "hostA",
                "uptime",
                Duration::from_secs(5),
                Ok(RemoteOutput::stdout("up")),
            );
            h.transport.script_delayed(
                "hostB",
                "uptime",
                Duration::from_secs(5),
                Ok(RemoteOutput::stdout("up")),
            );
            let ctx = ExecContext::new();
            let (first, second) = tokio::join!(
                h.coordinator.execute("s1", "hostA", "uptime", &ctx),
                h.coordinator.execute("s1", "hostB", "uptime", &ctx),
            );
            assert!(first.ok);
            assert_eq!(second.error_kind, Some(ErrorKind::ConcurrencyTimeout));
            assert!(h.coordinator.breaker().health("hostB").is_none());
            assert_eq!(h.coordinator.limiter().available(), 1);
        });
    }

    #[test]
    fn cancellation_leaves_breaker_and_cache_untouched() {
        paused_runtime().block_on(async {
            let h = harness();
            h.transport.script_delayed(
                "hostA",
                "uptime",
                Duration::from_secs(10),
                Ok(RemoteOutput::stdout("up")),
            );
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                trigger.cancel();
            });
            let ctx = ExecContext::new().with_cancel(cancel);
            let result = h.coordinator.execute("s1", "hostA", "uptime", &ctx).await;
            assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
            assert!(h.coordinator.breaker().health("hostA").is_none());

            h.transport.script("hostA", "uptime", Ok(RemoteOutput::stdout("up")));
            let fresh = h.coordinator.execute("s1", "hostA", "uptime", &ExecContext::new()).await;
            assert!(!fresh.from_cache);
        });
    }

    #[test]
    fn caller_deadline_maps_to_cancelled() {
        paused_runtime().block_on(async {
            let h = harness();
            h.transport.script_delayed(
                "hostA",
                "uptime",
                Duration::from_secs(10),
                Ok(RemoteOutput::stdout("up")),
            );
            let ctx = ExecContext::new().with_timeout(Duration::from_secs(1));
            let result = h.coordinator.execute("s1", "hostA", "uptime", &ctx).await;
            assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
            assert!(h.coordinator.breaker().health("hostA").is_none());
        });
    }

    #[test]
    fn non_zero_exit_is_still_evidence() {
        paused_runtime().block_on(async {
            let h = harness();
            h.transport.script(
                "hostA",
                "nvme list",
                Ok(RemoteOutput {
                    stderr: "No NVMe devices found".to_string(),
                    exit_code: Some(1),
                    ..RemoteOutput::default()
                }),
            );
            let result = h.coordinator.execute("s1", "hostA", "nvme list", &ExecContext::new()).await;
            assert!(result.ok);
            assert_eq!(result.exit_code, Some(1));
            assert_eq!(result.output, "No NVMe devices found");
            assert!(result.message.is_some());
        });
    }

    #[test]
    fn permission_failure_retries_with_allowlisted_escalation() {
        paused_runtime().block_on(async {
            let h = harness();
            h.transport.script(
                "hostA",
                "nvme smart-log /dev/nvme0",
                Ok(RemoteOutput {
                    stderr: "open /dev/nvme0: Permission denied".to_string(),
                    exit_code: Some(1),
                    ..RemoteOutput::default()
                }),
            );
            h.transport.script(
                "hostA",
                "sudo -n nvme smart-log /dev/nvme0",
                Ok(RemoteOutput::stdout("critical_warning : 0")),
            );
            let result = h
                .coordinator
                .execute("s1", "hostA", "nvme smart-log /dev/nvme0", &ExecContext::new())
                .await;
            assert!(result.ok);
            assert_eq!(result.privilege, PrivilegeMode::Escalated);
            assert_eq!(result.command, "sudo -n nvme smart-log /dev/nvme0");
            assert_eq!(h.transport.call_count(), 2);
        });
    }

    #[test]
    fn escalation_without_allowlisted_literal_is_rejected() {
        paused_runtime().block_on(async {
            let h = harness();
            h.transport.script(
                "hostA",
                "dmesg -T",
                Ok(RemoteOutput {
                    stderr: "dmesg: read kernel buffer failed: Operation not permitted".to_string(),
                    exit_code: Some(1),
                    ..RemoteOutput::default()
                }),
            );
            let result = h.coordinator.execute("s1", "hostA", "dmesg -T", &ExecContext::new()).await;
            assert_eq!(result.error_kind, Some(ErrorKind::PolicyRejected));
            assert!(result.message.as_deref().unwrap_or_default().contains("sudo -n dmesg -T"));
            assert_eq!(h.transport.calls(), vec![("hostA".to_string(), "dmesg -T".to_string())]);
        });
    }

    #[test]
    fn guard_caps_output_before_caching() {
        paused_runtime().block_on(async {
            let mut config = BrokerConfig::default();
            config.guard.max_output_bytes = 32;
            let h = harness_with(config);
            h.transport.script("hostA", "uptime", Ok(RemoteOutput::stdout("y".repeat(500))));
            let ctx = ExecContext::new();
            let result = h.coordinator.execute("s1", "hostA", "uptime", &ctx).await;
            assert!(result.truncated);
            assert_eq!(result.output, format!("{}\n[output truncated]", "y".repeat(32)));
            let cached = h.coordinator.execute("s1", "hostA", "uptime", &ctx).await;
            assert!(cached.from_cache && cached.truncated);
            assert_eq!(cached.output, result.output);
        });
    }

    #[test]
    fn summary_of_tiny_output_is_rejected() {
        paused_runtime().block_on(async {
            let h = harness();
            h.transport.script("hostA", "uptime", Ok(RemoteOutput::stdout("up 3 days")));
            let evidence = h.coordinator.execute("s1", "hostA", "uptime", &ExecContext::new()).await;
            assert!(evidence.ok);
            let checked = h.coordinator.check_summary("s1", &evidence, "host has been up for 3 days");
            assert!(!checked.ok);
            assert_eq!(checked.error_kind, Some(ErrorKind::OutputRejected));
        });
    }

    #[test]
    fn execute_many_summarizes_fleet() {
        paused_runtime().block_on(async {
            let h = harness();
            h.transport.script("hostA", "uptime", Ok(RemoteOutput::stdout("up")));
            h.transport.script("hostB", "uptime", Ok(RemoteOutput::stdout("up")));
            h.transport.script("hostD", "uptime", refused("hostD"));
            let hosts = vec!["hostA".to_string(), "hostB".to_string(), "hostD".to_string()];
            let outcome = h
                .coordinator
                .execute_many("s1", &hosts, "uptime", &ExecContext::new())
                .await;
            assert_eq!(outcome.results.len(), 3);
            assert_eq!(
                outcome.summary,
                BatchSummary {
                    total: 3,
                    succeeded: 2,
                    failed: 1,
                    host_unavailable: 1,
                    pending_approval: 0,
                }
            );
        });
    }

    #[test]
    fn every_request_is_audited() {
        paused_runtime().block_on(async {
            let h = harness();
            h.transport.script("hostA", "uptime", Ok(RemoteOutput::stdout("up")));
            let ctx = ExecContext::new().with_request_id("req-42");
            h.coordinator.execute("s1", "hostA", "uptime", &ctx).await;
            h.coordinator.execute("s1", "hostB", "rm -rf /", &ExecContext::new()).await;
            h.coordinator.execute("s1", "hostC", "iostat -x", &ExecContext::new()).await;

            let records = h.audit.records();
            assert_eq!(records.len(), 3);
            assert_eq!(records[0].id, "req-42");
            assert_eq!(records[0].decision, "allowed");
            assert_eq!(records[1].decision, "rejected");
            assert_eq!(records[2].error_kind, Some(ErrorKind::PendingApproval));
        });
    }

    #[test]
    fn breaker_snapshot_reports_open_host() {
        paused_runtime().block_on(async {
            let h = harness();
            h.transport.script("hostD", "uptime", refused("hostD"));
            for _ in 0..5 {
                h.coordinator.execute("s1", "hostD", "uptime", &ExecContext::new()).await;
            }
            let snapshot = h.coordinator.breaker().snapshot();
            assert_eq!(snapshot.len(), 1);
            assert_eq!(snapshot[0].host, "hostd");
            assert_eq!(snapshot[0].state, BreakerState::Open);
        });
    }
}
