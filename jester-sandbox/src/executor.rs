//! Single-sample execution pipeline: validate, select, cache, govern, record

use crate::analysis::CodeShape;
use crate::audit::{AuditRecord, AuditTrail};
use crate::cache::{fingerprint, ResultCache};
use crate::config::EngineConfig;
use crate::diagnostics::{self, OutputSanitizer};
use crate::error::{EngineError, Result};
use crate::governor::{RawExecutionRecord, ResourceGovernor, TerminationCause, WallClockStart};
use crate::launch::LaunchCommand;
use crate::limits::ResourceLimits;
use crate::policy::StrategyKind;
use crate::selector::StrategySelector;
use crate::types::{ExecutionId, ExecutionRequest, ExecutionResult, ExecutionStatus, ExitInfo};
use crate::validator::SecurityValidator;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
const SIGXCPU: i32 = libc::SIGXCPU;
#[cfg(not(unix))]
const SIGXCPU: i32 = 24;
const SIGKILL: i32 = 9;

/// Per-execution state: the configuration snapshot taken at the checkpoint and the caller's controls
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub client_key: String,
    pub config: Arc<EngineConfig>,
    pub pool: Arc<Semaphore>,
    pub cancel: CancellationToken,
    cache_generation: Option<u64>,
    on_start: Option<WallClockStart>,
}

impl ExecutionContext {
    pub fn new(client_key: impl Into<String>, config: Arc<EngineConfig>, pool: Arc<Semaphore>) -> Self {
        Self {
            execution_id: ExecutionId::new(),
            client_key: client_key.into(),
            config,
            pool,
            cancel: CancellationToken::new(),
            cache_generation: None,
            on_start: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cache generation the configuration snapshot belongs to; without one the
    /// generation current when execution begins is used
    pub fn with_cache_generation(mut self, generation: u64) -> Self {
        self.cache_generation = Some(generation);
        self
    }

    /// Called with the instant the governor starts the wall clock for this execution.
    /// Rejected and cached executions never start one.
    pub fn on_start(mut self, hook: impl FnOnce(Instant) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Box::new(hook));
        self
    }

    /// Sibling context for a sub-execution: fresh id, same snapshot, cancelled with the parent
    pub fn fork(&self) -> Self {
        Self {
            execution_id: ExecutionId::new(),
            client_key: self.client_key.clone(),
            config: self.config.clone(),
            pool: self.pool.clone(),
            cancel: self.cancel.child_token(),
            cache_generation: self.cache_generation,
            on_start: None,
        }
    }

}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("execution_id", &self.execution_id)
            .field("client_key", &self.client_key)
            .finish_non_exhaustive()
    }
}

/// Map a governor record onto a terminal status
pub fn classify(record: &RawExecutionRecord, limits: &ResourceLimits) -> (ExecutionStatus, ExitInfo) {
    let stderr = String::from_utf8_lossy(&record.stderr);
    let out_of_memory = memory_exhausted(&stderr);

    let (status, reason) = match record.termination {
        TerminationCause::WallClock => (
            ExecutionStatus::Timeout,
            format!("wall-clock limit of {} ms exceeded", limits.max_wall_ms),
        ),
        TerminationCause::OutputLimit => (
            ExecutionStatus::ResourceExceeded,
            format!("output exceeded {} bytes", limits.max_output_bytes),
        ),
        TerminationCause::Cancelled => (ExecutionStatus::Failure, "cancelled".to_string()),
        TerminationCause::Exited => match (record.exit_code, record.signal) {
            (_, Some(SIGXCPU)) => (
                ExecutionStatus::ResourceExceeded,
                format!("cpu time limit of {} ms exceeded", limits.max_cpu_ms),
            ),
            (_, Some(SIGKILL)) => (
                ExecutionStatus::ResourceExceeded,
                "killed by an operating system limit".to_string(),
            ),
            (_, Some(signal)) => (
                ExecutionStatus::Failure,
                format!("terminated by signal {}", signal),
            ),
            (Some(0), None) => (ExecutionStatus::Success, "exited normally".to_string()),
            (Some(_), None) if out_of_memory => (
                ExecutionStatus::ResourceExceeded,
                format!("memory limit of {} bytes exceeded", limits.max_memory_bytes),
            ),
            (Some(code), None) => (ExecutionStatus::Failure, format!("exited with code {}", code)),
            (None, None) => (ExecutionStatus::Failure, "unknown termination".to_string()),
        },
    };

    (
        status,
        ExitInfo {
            code: record.exit_code,
            signal: record.signal,
            reason,
        },
    )
}

/// The interpreter ran out of memory: an uncaught `MemoryError` ends the traceback, or the
/// runtime aborted with a fatal allocation error
fn memory_exhausted(stderr: &str) -> bool {
    let fatal = stderr.lines().any(|line| {
        line.starts_with("Fatal Python error:") && line.to_ascii_lowercase().contains("memory")
    });
    let uncaught = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .is_some_and(|last| last == "MemoryError" || last.starts_with("MemoryError:"));
    fatal || uncaught
}

/// Sandboxed executor
pub struct SandboxExecutor {
    governor: Arc<dyn ResourceGovernor>,
    cache: Arc<ResultCache>,
    audit: Arc<AuditTrail>,
    sanitizer: OutputSanitizer,
}

impl SandboxExecutor {
    pub fn new(governor: Arc<dyn ResourceGovernor>, cache: Arc<ResultCache>, audit: Arc<AuditTrail>) -> Self {
        Self {
            governor,
            cache,
            audit,
            sanitizer: OutputSanitizer::new(),
        }
    }

    pub fn with_sanitizer(mut self, sanitizer: OutputSanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn governor(&self) -> &Arc<dyn ResourceGovernor> {
        &self.governor
    }

    /// Run one request to a final result
    pub async fn execute(&self, request: &ExecutionRequest, mut ctx: ExecutionContext) -> Result<ExecutionResult> {
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let config = ctx.config.clone();
        let policy = &config.security;
        let execution_id = ctx.execution_id;
        let generation = match ctx.cache_generation {
            Some(generation) => generation,
            None => self.cache.generation().await,
        };

        let validator = SecurityValidator::new(policy)
            .with_extra_imports(&request.allowed_imports)
            .with_network(request.network_allowed);
        let shape = (request.code.len() <= policy.max_code_bytes).then(|| CodeShape::analyze(&request.code));
        let verdict = match &shape {
            Some(shape) => validator.validate_shape(&request.code, shape),
            None => validator.validate(&request.code),
        };

        let shape = match shape {
            Some(shape) if verdict.allowed => shape,
            _ => {
                tracing::info!(
                    execution_id = %execution_id,
                    violations = verdict.violations.len(),
                    "code rejected by validator"
                );
                let result = ExecutionResult::rejected(verdict.violations.clone(), verdict.summary());
                self.audit
                    .emit(AuditRecord::from_result(execution_id, &ctx.client_key, &result));
                return Ok(result);
            }
        };

        let limits = request
            .limits
            .unwrap_or(config.limits)
            .clamp_to(&policy.limit_ceiling);

        let mut launch_allow = validator.allow_list().clone();
        if request.network_allowed {
            launch_allow.extend(policy.network_modules.iter().cloned());
        }
        let decision = StrategySelector::new(policy)
            .with_allow_list(validator.allow_list().clone())
            .with_network(request.network_allowed)
            .select(&shape, &verdict, request.strategy_hint);
        let strategy = decision.strategy;
        let fingerprint = fingerprint(&request.code, strategy, &limits);

        tracing::debug!(
            execution_id = %execution_id,
            strategy = %strategy,
            reason = %decision.reason,
            description = %request.description,
            "strategy selected"
        );

        if let Some(mut cached) = self.cache.get(&fingerprint).await {
            cached.fingerprint = fingerprint;
            tracing::debug!(execution_id = %execution_id, "served from cache");
            self.audit
                .emit(AuditRecord::from_result(execution_id, &ctx.client_key, &cached));
            return Ok(cached);
        }

        let _permit = tokio::select! {
            permit = ctx.pool.clone().acquire_owned() => permit.map_err(|_| EngineError::Unavailable)?,
            _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        let command = LaunchCommand::for_strategy(
            strategy,
            &request.code,
            &launch_allow,
            &config.interpreter.program,
        );
        let run = match ctx.on_start.take() {
            Some(hook) => {
                self.governor
                    .run_observed(&command, &limits, ctx.cancel.clone(), hook)
                    .await
            }
            None => self.governor.run(&command, &limits, ctx.cancel.clone()).await,
        };
        let record = run.map_err(|e| EngineError::internal(execution_id, e.to_string()))?;

        if record.termination == TerminationCause::Cancelled {
            tracing::info!(execution_id = %execution_id, "execution cancelled");
            return Err(EngineError::Cancelled);
        }

        let result = self.build_result(&request.code, &record, strategy, &limits, fingerprint);

        tracing::info!(
            execution_id = %execution_id,
            strategy = %strategy,
            fingerprint = %&result.fingerprint[..12],
            status = %result.status,
            wall_time_ms = result.wall_time_ms,
            "execution finished"
        );

        self.cache.put(&result.fingerprint, &result, generation).await;
        self.audit
            .emit(AuditRecord::from_result(execution_id, &ctx.client_key, &result));
        Ok(result)
    }

    fn build_result(
        &self,
        code: &str,
        record: &RawExecutionRecord,
        strategy: StrategyKind,
        limits: &ResourceLimits,
        fingerprint: String,
    ) -> ExecutionResult {
        let (status, exit_info) = classify(record, limits);
        let stdout = self.sanitizer.sanitize(&String::from_utf8_lossy(&record.stdout));
        let stderr = self.sanitizer.sanitize(&String::from_utf8_lossy(&record.stderr));
        let suggestions = diagnostics::suggestions(status, &stderr, code);

        ExecutionResult {
            status,
            stdout,
            stderr,
            exit_info,
            wall_time_ms: record.wall_time_ms,
            cpu_time_ms: record.cpu_time_ms,
            peak_memory_bytes: record.peak_memory_bytes,
            strategy_used: Some(strategy),
            cache_hit: false,
            fingerprint,
            output_truncated: record.output_truncated(),
            violations: Vec::new(),
            suggestions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::governor::{ScriptedGovernor, ScriptedRun};
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn executor(governor: ScriptedGovernor) -> (SandboxExecutor, Arc<ScriptedGovernor>) {
        let governor = Arc::new(governor);
        let executor = SandboxExecutor::new(
            governor.clone(),
            Arc::new(ResultCache::new(CacheConfig::default())),
            Arc::new(AuditTrail::new()),
        )
        .with_sanitizer(OutputSanitizer::with_home("/home/tester"));
        (executor, governor)
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("test", Arc::new(EngineConfig::default()), Arc::new(Semaphore::new(2)))
    }

    #[tokio::test]
    async fn test_rejection_never_reaches_governor() {
        let (executor, governor) = executor(ScriptedGovernor::new());
        let result = executor
            .execute(&ExecutionRequest::new("import subprocess"), ctx())
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::SecurityRejected);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(governor.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_import_in_one_line_suite_never_runs() {
        let (executor, governor) = executor(ScriptedGovernor::new().otherwise(ScriptedRun::success("ctypes\n", 1)));
        let result = executor
            .execute(
                &ExecutionRequest::new("for _ in [0]: import ctypes as c\nprint(c.__name__)"),
                ctx(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::SecurityRejected);
        assert_eq!(result.strategy_used, None);
        assert_eq!(governor.spawn_count(), 0);
    }

    #[test]
    fn test_user_error_mentioning_memory_is_failure() {
        let limits = ResourceLimits::default();
        let record = RawExecutionRecord {
            exit_code: Some(1),
            stderr: b"Traceback (most recent call last):\n  File \"<string>\", line 1, in <module>\nValueError: out of memory\n".to_vec(),
            ..RawExecutionRecord::default()
        };
        let (status, info) = classify(&record, &limits);
        assert_eq!(status, ExecutionStatus::Failure);
        assert_eq!(info.reason, "exited with code 1");

        let raised = RawExecutionRecord {
            exit_code: Some(1),
            stderr: b"Traceback (most recent call last):\n  File \"<string>\", line 1, in <module>\nMemoryError: Cannot allocate memory\n".to_vec(),
            ..RawExecutionRecord::default()
        };
        assert_eq!(classify(&raised, &limits).0, ExecutionStatus::ResourceExceeded);
    }

    #[tokio::test]
    async fn test_second_run_is_cache_hit() {
        let (executor, governor) =
            executor(ScriptedGovernor::new().on("print(42)", ScriptedRun::success("42\n", 5)));
        let request = ExecutionRequest::new("print(42)");

        let first = executor.execute(&request, ctx()).await.unwrap();
        let second = executor.execute(&request, ctx()).await.unwrap();

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(first.stdout, second.stdout);
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(governor.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_carries_suggestions() {
        let stderr = "Traceback (most recent call last):\nZeroDivisionError: division by zero\n";
        let (executor, _) = executor(ScriptedGovernor::new().on("print(1/0)", ScriptedRun::failure(stderr, 3)));
        let result = executor
            .execute(&ExecutionRequest::new("print(1/0)"), ctx())
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Failure);
        assert_eq!(result.strategy_used, Some(StrategyKind::ExpressionOnly));
        assert!(result.stderr.contains("ZeroDivisionError"));
        assert_eq!(result.suggestions, vec!["Add checks to prevent division by zero"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_status() {
        let (executor, _) = executor(ScriptedGovernor::new().otherwise(ScriptedRun::success("", 60_000)));
        let request = ExecutionRequest::new("while True: pass")
            .with_limits(ResourceLimits::default().with_wall_ms(200));
        let result = executor.execute(&request, ctx()).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.wall_time_ms, 200);
        assert_eq!(result.strategy_used, Some(StrategyKind::ProcessIsolated));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_internal_error() {
        let (executor, _) = executor(ScriptedGovernor::new().failing_spawn());
        let err = executor
            .execute(&ExecutionRequest::new("print(1)"), ctx())
            .await
            .unwrap_err();
        assert_matches!(err, EngineError::Internal { .. });
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_not_cached() {
        let (executor, governor) = executor(ScriptedGovernor::new().otherwise(ScriptedRun::success("", 1_000)));
        let request = ExecutionRequest::new("x = 1\nprint(x)");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = executor
            .execute(&request, ctx().with_cancel(cancel))
            .await
            .unwrap_err();
        assert_matches!(err, EngineError::Cancelled);

        let rerun = executor.execute(&request, ctx()).await.unwrap();
        assert!(!rerun.cache_hit);
        assert_eq!(governor.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_limits_are_clamped_to_ceiling() {
        let (executor, _) = executor(ScriptedGovernor::new());
        let mut config = EngineConfig::default();
        config.security.limit_ceiling = ResourceLimits::strict();
        let request = ExecutionRequest::new("1 + 1").with_limits(ResourceLimits::permissive());

        let ctx = ExecutionContext::new("test", Arc::new(config), Arc::new(Semaphore::new(1)));
        let result = executor.execute(&request, ctx).await.unwrap();
        assert_eq!(
            result.fingerprint,
            fingerprint("1 + 1", StrategyKind::ExpressionOnly, &ResourceLimits::strict())
        );
    }

    #[test]
    fn test_classify_signals_and_memory() {
        let limits = ResourceLimits::default();
        let killed = RawExecutionRecord {
            signal: Some(SIGXCPU),
            ..RawExecutionRecord::default()
        };
        assert_eq!(classify(&killed, &limits).0, ExecutionStatus::ResourceExceeded);

        let oom = RawExecutionRecord {
            exit_code: Some(1),
            stderr: b"MemoryError\n".to_vec(),
            ..RawExecutionRecord::default()
        };
        assert_eq!(classify(&oom, &limits).0, ExecutionStatus::ResourceExceeded);

        let fatal = RawExecutionRecord {
            exit_code: Some(1),
            stderr: b"Fatal Python error: _PyMem_RawMalloc: out of memory
".to_vec(),
            ..RawExecutionRecord::default()
        };
        assert_eq!(classify(&fatal, &limits).0, ExecutionStatus::ResourceExceeded);

        let segv = RawExecutionRecord {
            signal: Some(11),
            ..RawExecutionRecord::default()
        };
        assert_eq!(classify(&segv, &limits).0, ExecutionStatus::Failure);

        let overflow = RawExecutionRecord {
            termination: TerminationCause::OutputLimit,
            exit_code: Some(0),
            ..RawExecutionRecord::default()
        };
        assert_eq!(classify(&overflow, &limits).0, ExecutionStatus::ResourceExceeded);
    }
}
