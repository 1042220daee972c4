//! Common test utilities shared across integration and E2E tests

use jester_sandbox::{EngineConfig, ResourceLimits, SandboxService};
use std::process::Command;
use std::sync::OnceLock;

/// Setup logging for tests
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("jester_sandbox=debug")
        .with_test_writer()
        .try_init();
}

/// Whether a usable `python3` is on PATH
pub fn python_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        Command::new("python3")
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    })
}

/// Skip the current test when no interpreter is installed
#[macro_export]
macro_rules! require_python {
    () => {
        if !$crate::common::python_available() {
            eprintln!("python3 not available, skipping");
            return;
        }
    };
}

/// Configuration tuned for tests: short limits, generous rate limit
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.limits = ResourceLimits::default()
        .with_wall_ms(5_000)
        .with_cpu_ms(5_000);
    config.rate_limit.executions_per_window = 1_000;
    config
}

/// Service backed by real child processes
pub fn process_service(config: EngineConfig) -> SandboxService {
    setup_test_logging();
    SandboxService::new(config).expect("valid test configuration")
}
