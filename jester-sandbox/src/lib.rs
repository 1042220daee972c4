//! Jester Sandbox - sandboxed execution of untrusted Python fragments
//!
//! Validates code statically, picks the weakest isolation strategy that is still safe, runs it in a
//! resource-governed child process, and caches, audits and rate-limits the results. The quantum
//! debugger races several candidate implementations of one task and keeps the best.

mod analysis;
mod audit;
mod cache;
mod config;
mod diagnostics;
mod error;
mod executor;
mod gencode;
mod governor;
mod launch;
mod limits;
mod policy;
mod quantum;
mod rate_limit;
mod selector;
mod service;
mod types;
mod validator;

pub use analysis::{CodeShape, ImportRef, Location};
pub use audit::{AuditRecord, AuditTrail};
pub use cache::{fingerprint, normalize_code, CacheConfig, CacheStats, ResultCache};
pub use config::{EngineConfig, InterpreterConfig, PoolConfig};
pub use diagnostics::{suggestions, OutputSanitizer};
pub use error::{ConfigError, EngineError, GovernorError, Result};
pub use executor::{classify, ExecutionContext, SandboxExecutor};
pub use gencode::{
    RaceTask, RewriteVariantGenerator, StaticVariantGenerator, Variant, VariantGenerator,
    ORIGINAL_VARIANT,
};
pub use governor::{
    ProcessGovernor, RawExecutionRecord, ResourceGovernor, TerminationCause, WallClockStart,
};
#[cfg(any(test, feature = "testing"))]
pub use governor::{ScriptedGovernor, ScriptedRun};
pub use launch::{LaunchCommand, REMOVED_BUILTINS};
pub use limits::ResourceLimits;
pub use policy::{ImportDecision, SecurityPolicy, StrategyKind};
pub use quantum::{
    Improvement, QuantumDebugger, RaceOutcome, VariantScore, MAX_VARIANTS, MIN_VARIANTS,
};
pub use rate_limit::{ClientUsage, RateLimitConfig, RateLimitSnapshot, RateLimiter};
pub use selector::{StrategyDecision, StrategySelector};
pub use service::{EngineStats, SandboxService};
pub use types::{ExecutionId, ExecutionRequest, ExecutionResult, ExecutionStatus, ExitInfo};
pub use validator::{validate, SecurityValidator, SecurityVerdict, Violation, ViolationRule};
