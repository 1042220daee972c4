//! Resource governor abstraction and implementations

#[cfg(all(unix, feature = "process"))]
mod process;
#[cfg(any(test, feature = "testing"))]
mod scripted;

use crate::error::GovernorError;
use crate::launch::LaunchCommand;
use crate::limits::ResourceLimits;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[cfg(all(unix, feature = "process"))]
pub use process::ProcessGovernor;
#[cfg(any(test, feature = "testing"))]
pub use scripted::{ScriptedGovernor, ScriptedRun};

/// Why the child stopped running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    /// Exited or died on its own (including OS limit signals)
    #[default]
    Exited,
    /// Killed by the watchdog at the wall-clock deadline
    WallClock,
    /// Killed because captured output exceeded the ceiling
    OutputLimit,
    /// Killed because the caller cancelled
    Cancelled,
}

/// Everything the governor observed about one child
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawExecutionRecord {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub termination: TerminationCause,
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub peak_memory_bytes: u64,
    pub pid: Option<u32>,
}

impl RawExecutionRecord {
    pub fn output_truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }
}

/// Receives the instant from which a governor measures `wall_time_ms`
pub type WallClockStart = Box<dyn FnOnce(Instant) + Send + Sync>;

/// Imposes resource ceilings on one execution and force-terminates violators
#[async_trait]
pub trait ResourceGovernor: Send + Sync {
    /// Run one command to completion under `limits`
    async fn run(
        &self,
        command: &LaunchCommand,
        limits: &ResourceLimits,
        cancel: CancellationToken,
    ) -> Result<RawExecutionRecord, GovernorError>;

    /// Like [`run`](Self::run), additionally reporting when the wall clock starts.
    ///
    /// `on_start` must receive exactly the instant `wall_time_ms` is measured from. A governor
    /// that cannot tell never calls it.
    async fn run_observed(
        &self,
        command: &LaunchCommand,
        limits: &ResourceLimits,
        cancel: CancellationToken,
        on_start: WallClockStart,
    ) -> Result<RawExecutionRecord, GovernorError> {
        drop(on_start);
        self.run(command, limits, cancel).await
    }

    /// Number of processes spawned so far
    fn spawn_count(&self) -> u64;

    /// Get governor name
    fn name(&self) -> &str;
}

/// Process governor placeholder (when unavailable on this target)
#[cfg(not(all(unix, feature = "process")))]
#[derive(Debug, Default)]
pub struct ProcessGovernor;

#[cfg(not(all(unix, feature = "process")))]
impl ProcessGovernor {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(all(unix, feature = "process")))]
#[async_trait]
impl ResourceGovernor for ProcessGovernor {
    async fn run(
        &self,
        _command: &LaunchCommand,
        _limits: &ResourceLimits,
        _cancel: CancellationToken,
    ) -> Result<RawExecutionRecord, GovernorError> {
        Err(GovernorError::Unsupported)
    }

    fn spawn_count(&self) -> u64 {
        0
    }

    fn name(&self) -> &str {
        "process"
    }
}
