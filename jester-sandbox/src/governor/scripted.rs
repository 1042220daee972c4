//! In-memory governor that replays scripted outcomes keyed by payload

use super::{RawExecutionRecord, ResourceGovernor, TerminationCause, WallClockStart};
use crate::error::GovernorError;
use crate::launch::LaunchCommand;
use crate::limits::ResourceLimits;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SIGKILL: i32 = 9;

/// One scripted outcome
#[derive(Debug, Clone, Default)]
pub struct ScriptedRun {
    /// Simulated running time; also reported as wall time
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub peak_memory_bytes: u64,
}

impl ScriptedRun {
    pub fn success(stdout: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            duration: Duration::from_millis(duration_ms),
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn failure(stderr: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            duration: Duration::from_millis(duration_ms),
            stderr: stderr.into(),
            exit_code: 1,
            ..Self::default()
        }
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.peak_memory_bytes = bytes;
        self
    }

    pub fn killed_by(mut self, signal: i32) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Governor that never spawns a process. Sleeps on tokio time, so paused-clock tests stay exact.
#[derive(Debug, Default)]
pub struct ScriptedGovernor {
    script: HashMap<String, ScriptedRun>,
    fallback: ScriptedRun,
    fail_spawn: bool,
    runs: AtomicU64,
}

impl ScriptedGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcome for a given payload
    pub fn on(mut self, payload: impl Into<String>, run: ScriptedRun) -> Self {
        self.script.insert(payload.into(), run);
        self
    }

    /// Outcome for payloads with no script entry
    pub fn otherwise(mut self, run: ScriptedRun) -> Self {
        self.fallback = run;
        self
    }

    /// Every run fails as if the interpreter could not be started
    pub fn failing_spawn(mut self) -> Self {
        self.fail_spawn = true;
        self
    }
}

impl ScriptedGovernor {
    async fn replay(
        &self,
        command: &LaunchCommand,
        limits: &ResourceLimits,
        cancel: CancellationToken,
        on_start: Option<WallClockStart>,
    ) -> Result<RawExecutionRecord, GovernorError> {
        if self.fail_spawn {
            return Err(GovernorError::Spawn {
                program: command.program.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "scripted spawn failure"),
            });
        }
        self.runs.fetch_add(1, Ordering::Relaxed);

        let run = command
            .payload()
            .and_then(|payload| self.script.get(payload))
            .unwrap_or(&self.fallback);
        let budget = limits.wall_duration();
        if let Some(hook) = on_start {
            hook(tokio::time::Instant::now());
        }

        let (termination, elapsed) = tokio::select! {
            _ = cancel.cancelled() => (TerminationCause::Cancelled, None),
            _ = tokio::time::sleep(run.duration.min(budget)) => {
                if run.duration > budget {
                    (TerminationCause::WallClock, Some(budget))
                } else {
                    (TerminationCause::Exited, Some(run.duration))
                }
            }
        };

        let mut record = RawExecutionRecord {
            termination,
            wall_time_ms: elapsed.unwrap_or_default().as_millis() as u64,
            cpu_time_ms: elapsed.unwrap_or_default().as_millis() as u64,
            peak_memory_bytes: run.peak_memory_bytes,
            ..RawExecutionRecord::default()
        };

        if termination == TerminationCause::Exited {
            let cap = usize::try_from(limits.max_output_bytes).unwrap_or(usize::MAX);
            record.stdout = run.stdout.as_bytes().iter().copied().take(cap).collect();
            record.stderr = run.stderr.as_bytes().iter().copied().take(cap).collect();
            record.stdout_truncated = run.stdout.len() > cap;
            record.stderr_truncated = run.stderr.len() > cap;
            if record.output_truncated() {
                record.termination = TerminationCause::OutputLimit;
            }
            match run.signal {
                Some(signal) => record.signal = Some(signal),
                None => record.exit_code = Some(run.exit_code),
            }
        } else {
            record.signal = Some(SIGKILL);
        }

        Ok(record)
    }
}

#[async_trait]
impl ResourceGovernor for ScriptedGovernor {
    async fn run(
        &self,
        command: &LaunchCommand,
        limits: &ResourceLimits,
        cancel: CancellationToken,
    ) -> Result<RawExecutionRecord, GovernorError> {
        self.replay(command, limits, cancel, None).await
    }

    async fn run_observed(
        &self,
        command: &LaunchCommand,
        limits: &ResourceLimits,
        cancel: CancellationToken,
        on_start: WallClockStart,
    ) -> Result<RawExecutionRecord, GovernorError> {
        self.replay(command, limits, cancel, Some(on_start)).await
    }

    fn spawn_count(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
