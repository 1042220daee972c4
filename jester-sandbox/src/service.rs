//! Sandbox service - main entry point

use crate::audit::{AuditRecord, AuditTrail};
use crate::cache::{CacheStats, ResultCache};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::executor::{ExecutionContext, SandboxExecutor};
use crate::gencode::{RaceTask, RewriteVariantGenerator, VariantGenerator};
use crate::governor::{ProcessGovernor, ResourceGovernor};
use crate::quantum::{QuantumDebugger, RaceOutcome};
use crate::rate_limit::{RateLimitSnapshot, RateLimiter};
use crate::types::{ExecutionRequest, ExecutionResult};
use crate::validator::{SecurityValidator, SecurityVerdict};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

/// Engine statistics on demand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub cache: CacheStats,
    pub rate_limit: RateLimitSnapshot,
    pub governor: String,
    pub spawn_count: u64,
    pub workers: usize,
    pub idle_workers: usize,
}

/// Process-lifetime state of the sandbox: configuration, pool, cache, limiter and audit trail
pub struct SandboxService {
    config: RwLock<Arc<EngineConfig>>,
    pool: RwLock<Arc<Semaphore>>,
    cache: Arc<ResultCache>,
    limiter: RateLimiter,
    audit: Arc<AuditTrail>,
    executor: Arc<SandboxExecutor>,
    generator: Arc<dyn VariantGenerator>,
    closed: AtomicBool,
}

/// State captured at the start of one execution
struct Checkpoint {
    config: Arc<EngineConfig>,
    pool: Arc<Semaphore>,
    cache_generation: u64,
}

impl SandboxService {
    /// Create a service that runs children through the process governor
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_governor(config, Arc::new(ProcessGovernor::new()))
    }

    /// Create a service with a custom governor implementation
    pub fn with_governor(config: EngineConfig, governor: Arc<dyn ResourceGovernor>) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(ResultCache::new(config.cache.clone()));
        let audit = Arc::new(AuditTrail::new());
        let executor = Arc::new(SandboxExecutor::new(governor, cache.clone(), audit.clone()));

        tracing::info!(
            governor = executor.governor().name(),
            workers = config.pool.workers,
            interpreter = %config.interpreter.program,
            "sandbox service ready"
        );

        Ok(Self {
            pool: RwLock::new(Arc::new(Semaphore::new(config.pool.workers))),
            limiter: RateLimiter::new(&config.rate_limit),
            config: RwLock::new(Arc::new(config)),
            cache,
            audit,
            executor,
            generator: Arc::new(RewriteVariantGenerator),
            closed: AtomicBool::new(false),
        })
    }

    /// Replace the variant generator used by [`SandboxService::race`]
    pub fn with_generator(mut self, generator: Arc<dyn VariantGenerator>) -> Self {
        self.generator = generator;
        self
    }

    /// Execute code on behalf of `client_key`
    pub async fn execute(&self, client_key: &str, request: &ExecutionRequest) -> Result<ExecutionResult> {
        self.execute_cancellable(client_key, request, CancellationToken::new())
            .await
    }

    /// Execute code; cancelling `token` kills the child and discards its partial output
    pub async fn execute_cancellable(
        &self,
        client_key: &str,
        request: &ExecutionRequest,
        token: CancellationToken,
    ) -> Result<ExecutionResult> {
        let checkpoint = self.checkpoint().await?;
        self.admit(client_key).await?;

        let ctx = ExecutionContext::new(client_key, checkpoint.config, checkpoint.pool)
            .with_cache_generation(checkpoint.cache_generation)
            .with_cancel(token);
        self.executor.execute(request, ctx).await
    }

    /// Race variants from the installed generator; counts as one admission
    pub async fn race(&self, client_key: &str, task: &RaceTask, variant_count: usize) -> Result<RaceOutcome> {
        self.race_with(client_key, task, variant_count, self.generator.clone())
            .await
    }

    /// Race variants from a caller-supplied generator
    pub async fn race_with(
        &self,
        client_key: &str,
        task: &RaceTask,
        variant_count: usize,
        generator: Arc<dyn VariantGenerator>,
    ) -> Result<RaceOutcome> {
        let checkpoint = self.checkpoint().await?;
        self.admit(client_key).await?;

        let ctx = ExecutionContext::new(client_key, checkpoint.config, checkpoint.pool)
            .with_cache_generation(checkpoint.cache_generation);
        QuantumDebugger::new(self.executor.clone(), generator)
            .race(task, variant_count, ctx)
            .await
    }

    /// Static verdict for `code` under the current policy; nothing is executed or audited
    pub async fn validate(&self, code: &str, network_allowed: bool) -> Result<SecurityVerdict> {
        let checkpoint = self.checkpoint().await?;
        Ok(SecurityValidator::new(&checkpoint.config.security)
            .with_network(network_allowed)
            .validate(code))
    }

    pub async fn stats(&self) -> EngineStats {
        let workers = self.config.read().await.pool.workers;
        let idle_workers = self.pool.read().await.available_permits();
        let governor = self.executor.governor();

        EngineStats {
            cache: self.cache.stats().await,
            rate_limit: self.limiter.snapshot().await,
            governor: governor.name().to_string(),
            spawn_count: governor.spawn_count(),
            workers,
            idle_workers,
        }
    }

    pub fn subscribe_audit(&self) -> broadcast::Receiver<AuditRecord> {
        self.audit.subscribe()
    }

    /// Current configuration snapshot
    pub async fn config(&self) -> Arc<EngineConfig> {
        self.config.read().await.clone()
    }

    /// Install a new configuration. Executions already past their checkpoint keep the old one,
    /// but their results are no longer cached.
    pub async fn reload(&self, config: EngineConfig) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Unavailable);
        }
        config.validate()?;

        let mut current = self.config.write().await;
        if current.pool.workers != config.pool.workers {
            *self.pool.write().await = Arc::new(Semaphore::new(config.pool.workers));
        }
        self.cache.reconfigure(config.cache.clone()).await;
        self.limiter.reconfigure(&config.rate_limit).await;
        *current = Arc::new(config);

        tracing::info!(workers = current.pool.workers, "configuration reloaded");
        Ok(())
    }

    /// Stop accepting work and drop cached results
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cache.clear().await;
        self.pool.read().await.close();
        tracing::info!("sandbox service shut down");
    }

    async fn checkpoint(&self) -> Result<Checkpoint> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Unavailable);
        }
        // reload swaps config and cache generation under the config write lock
        let guard = self.config.read().await;
        let config = guard.clone();
        let cache_generation = self.cache.generation().await;
        let pool = self.pool.read().await.clone();
        drop(guard);
        Ok(Checkpoint {
            config,
            pool,
            cache_generation,
        })
    }

    async fn admit(&self, client_key: &str) -> Result<()> {
        if self.limiter.admit(client_key).await {
            return Ok(());
        }
        let (limit, window) = self.limiter.limit().await;
        tracing::warn!(client = %client_key, limit, "execution throttled");
        Err(EngineError::Throttled {
            client: client_key.to_string(),
            limit,
            window,
        })
    }
}
