//! Process governor against a real interpreter

use jester_sandbox::{
    classify, ExecutionStatus, LaunchCommand, ProcessGovernor, ResourceGovernor, ResourceLimits,
    StrategyKind, TerminationCause,
};
use jester_tests::common::setup_test_logging;
use jester_tests::require_python;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn command(code: &str) -> LaunchCommand {
    LaunchCommand::for_strategy(StrategyKind::ProcessIsolated, code, &BTreeSet::new(), "python3")
}

fn process_gone(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == -1 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
}

#[tokio::test]
async fn test_wall_clock_kill_reaps_child() {
    require_python!();
    setup_test_logging();
    let governor = ProcessGovernor::new();
    let limits = ResourceLimits::default().with_wall_ms(200);

    let record = governor
        .run(&command("while True: pass"), &limits, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(record.termination, TerminationCause::WallClock);
    assert!(record.wall_time_ms >= 200 && record.wall_time_ms < 1_500);
    let pid = record.pid.unwrap();
    assert!(process_gone(pid), "pid {} still exists", pid);
    assert_eq!(classify(&record, &limits).0, ExecutionStatus::Timeout);
}

#[tokio::test]
async fn test_cpu_limit_delivers_sigxcpu() {
    require_python!();
    let governor = ProcessGovernor::new();
    let limits = ResourceLimits::default()
        .with_cpu_ms(1_000)
        .with_wall_ms(10_000);

    let record = governor
        .run(&command("while True: pass"), &limits, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(record.termination, TerminationCause::Exited);
    assert_eq!(classify(&record, &limits).0, ExecutionStatus::ResourceExceeded);
    assert!(record.cpu_time_ms >= 900, "cpu {}", record.cpu_time_ms);
}

#[tokio::test]
async fn test_cancellation_kills_child() {
    require_python!();
    let governor = ProcessGovernor::new();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let record = governor
        .run(&command("while True: pass"), &ResourceLimits::default(), cancel)
        .await
        .unwrap();

    assert_eq!(record.termination, TerminationCause::Cancelled);
    assert!(record.wall_time_ms < 2_000);
    assert!(process_gone(record.pid.unwrap()));
}

#[tokio::test]
async fn test_child_environment_is_scrubbed() {
    require_python!();
    std::env::set_var("JESTER_SECRET_TOKEN", "hunter2");
    let governor = ProcessGovernor::new();

    let record = governor
        .run(
            &command("import os\nprint(sorted(os.environ))"),
            &ResourceLimits::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let stdout = String::from_utf8_lossy(&record.stdout);
    assert_eq!(record.exit_code, Some(0));
    assert!(!stdout.contains("JESTER_SECRET_TOKEN"));
    assert!(stdout.contains("PATH"));
    assert_eq!(governor.spawn_count(), 1);
}
