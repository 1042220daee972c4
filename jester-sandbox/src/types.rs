//! Core types for sandbox execution

use crate::limits::ResourceLimits;
use crate::policy::StrategyKind;
use crate::validator::Violation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Unique execution identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub uuid::Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request to execute code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// The code to execute
    pub code: String,

    /// Advisory description, logged only
    #[serde(default)]
    pub description: String,

    /// Limits for this execution (policy defaults when absent, always clamped to the ceiling)
    #[serde(default)]
    pub limits: Option<ResourceLimits>,

    /// Extra module names allowed for this request
    #[serde(default)]
    pub allowed_imports: BTreeSet<String>,

    /// Whether network modules may be imported
    #[serde(default)]
    pub network_allowed: bool,

    /// Explicit strategy request; only `Minimal` is ever honoured
    #[serde(default)]
    pub strategy_hint: Option<StrategyKind>,
}

impl ExecutionRequest {
    /// Create a simple execution request
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: String::new(),
            limits: None,
            allowed_imports: BTreeSet::new(),
            network_allowed: false,
            strategy_hint: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Allow an additional import for this request
    pub fn allow_import(mut self, module: impl Into<String>) -> Self {
        self.allowed_imports.insert(module.into());
        self
    }

    pub fn with_network(mut self, allowed: bool) -> Self {
        self.network_allowed = allowed;
        self
    }

    pub fn with_strategy_hint(mut self, strategy: StrategyKind) -> Self {
        self.strategy_hint = Some(strategy);
        self
    }
}

/// Terminal status of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failure,
    Timeout,
    ResourceExceeded,
    SecurityRejected,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failure => "failure",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::ResourceExceeded => "resource_exceeded",
            ExecutionStatus::SecurityRejected => "security_rejected",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the process ended
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code when the process exited normally
    pub code: Option<i32>,

    /// Terminating signal number
    pub signal: Option<i32>,

    /// Human-readable explanation
    pub reason: String,
}

/// Result of code execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_info: ExitInfo,
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub peak_memory_bytes: u64,
    /// `None` for rejections, which never reach a strategy
    pub strategy_used: Option<StrategyKind>,
    pub cache_hit: bool,

    /// Cache key; empty for rejections
    #[serde(default)]
    pub fingerprint: String,

    /// Captured output was cut at the output ceiling
    #[serde(default)]
    pub output_truncated: bool,

    /// Validator findings, only set for rejections
    #[serde(default)]
    pub violations: Vec<Violation>,

    /// Hints derived from the error output
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl ExecutionResult {
    /// Result for code the validator refused. Carries no execution metrics.
    pub fn rejected(violations: Vec<Violation>, reason: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::SecurityRejected,
            stdout: String::new(),
            stderr: String::new(),
            exit_info: ExitInfo {
                code: None,
                signal: None,
                reason: reason.into(),
            },
            wall_time_ms: 0,
            cpu_time_ms: 0,
            peak_memory_bytes: 0,
            strategy_used: None,
            cache_hit: false,
            fingerprint: String::new(),
            output_truncated: false,
            violations,
            suggestions: Vec::new(),
        }
    }

    /// Check if execution succeeded
    pub fn success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}
