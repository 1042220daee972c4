//! Resource limits configuration for sandboxed execution

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource ceilings applied to a single execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Wall-clock budget enforced by the watchdog
    pub max_wall_ms: u64,

    /// CPU-time budget enforced by the OS (rounded up to whole seconds)
    pub max_cpu_ms: u64,

    /// Address-space ceiling in bytes
    pub max_memory_bytes: u64,

    /// Capture ceiling per output stream; exceeding it terminates the process group
    pub max_output_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_wall_ms: 10_000,                 // 10 seconds
            max_cpu_ms: 10_000,                  // 10 seconds CPU
            max_memory_bytes: 256 * 1024 * 1024, // 256 MB
            max_output_bytes: 64 * 1024,         // 64 KB
        }
    }
}

impl ResourceLimits {
    /// Create strict limits for untrusted code
    pub fn strict() -> Self {
        Self {
            max_wall_ms: 2_000,
            max_cpu_ms: 2_000,
            max_memory_bytes: 64 * 1024 * 1024,
            max_output_bytes: 16 * 1024,
        }
    }

    /// Create permissive limits for trusted benchmarks
    pub fn permissive() -> Self {
        Self {
            max_wall_ms: 60_000,
            max_cpu_ms: 60_000,
            max_memory_bytes: 1024 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
        }
    }

    /// Override the wall-clock budget
    pub fn with_wall_ms(mut self, ms: u64) -> Self {
        self.max_wall_ms = ms;
        self
    }

    /// Override the CPU-time budget
    pub fn with_cpu_ms(mut self, ms: u64) -> Self {
        self.max_cpu_ms = ms;
        self
    }

    /// Override the memory ceiling
    pub fn with_memory_bytes(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    /// Override the output ceiling
    pub fn with_output_bytes(mut self, bytes: u64) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Field-wise minimum of `self` and `ceiling`
    pub fn clamp_to(&self, ceiling: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            max_wall_ms: self.max_wall_ms.min(ceiling.max_wall_ms),
            max_cpu_ms: self.max_cpu_ms.min(ceiling.max_cpu_ms),
            max_memory_bytes: self.max_memory_bytes.min(ceiling.max_memory_bytes),
            max_output_bytes: self.max_output_bytes.min(ceiling.max_output_bytes),
        }
    }

    pub fn wall_duration(&self) -> Duration {
        Duration::from_millis(self.max_wall_ms)
    }

    /// CPU limit in whole seconds as understood by `RLIMIT_CPU` (never zero)
    pub fn cpu_seconds(&self) -> u64 {
        self.max_cpu_ms.div_ceil(1000).max(1)
    }

    /// True when any ceiling is zero, which would make every execution fail
    pub fn has_zero_ceiling(&self) -> bool {
        self.max_wall_ms == 0
            || self.max_cpu_ms == 0
            || self.max_memory_bytes == 0
            || self.max_output_bytes == 0
    }
}
