//! Execution pipeline against a real interpreter

use jester_sandbox::{ExecutionRequest, ExecutionStatus, ResourceLimits, StrategyKind};
use jester_tests::common::{process_service, test_config};
use jester_tests::require_python;
use std::time::Instant;

#[tokio::test]
async fn test_division_by_zero_is_failure() {
    require_python!();
    let service = process_service(test_config());

    let result = service
        .execute("it", &ExecutionRequest::new("print(1/0)"))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Failure);
    assert!(result.stderr.contains("ZeroDivisionError"), "stderr: {}", result.stderr);
    assert!(!result.cache_hit);
    assert!(result.violations.is_empty());
    assert!(!result.suggestions.is_empty());
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    require_python!();
    let service = process_service(test_config());
    let request = ExecutionRequest::new("while True: pass")
        .with_limits(ResourceLimits::default().with_wall_ms(200));

    let started = Instant::now();
    let result = service.execute("it", &request).await.unwrap();
    let elapsed = started.elapsed().as_millis() as u64;

    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert!(result.wall_time_ms >= 200);
    assert!(result.wall_time_ms < 1_500, "wall {}", result.wall_time_ms);
    assert!(elapsed < 3_000, "caller waited {} ms", elapsed);
    assert_eq!(result.strategy_used, Some(StrategyKind::ProcessIsolated));
}

#[tokio::test]
async fn test_expression_prints_value() {
    require_python!();
    let service = process_service(test_config());

    let result = service
        .execute("it", &ExecutionRequest::new("2 ** 10"))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.strategy_used, Some(StrategyKind::ExpressionOnly));
    assert_eq!(result.stdout.trim(), "1024");
}

#[tokio::test]
async fn test_allowed_import_runs_restricted() {
    require_python!();
    let service = process_service(test_config());
    let code = "import math\nprint(math.sqrt(16))";

    let result = service.execute("it", &ExecutionRequest::new(code)).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Success, "stderr: {}", result.stderr);
    assert_eq!(result.strategy_used, Some(StrategyKind::Restricted));
    assert_eq!(result.stdout.trim(), "4.0");
}

#[tokio::test]
async fn test_second_run_is_cached() {
    require_python!();
    let service = process_service(test_config());
    let request = ExecutionRequest::new("print('hello')");

    let first = service.execute("it", &request).await.unwrap();
    let second = service.execute("it", &request).await.unwrap();

    assert_eq!(first.status, ExecutionStatus::Success);
    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(first.stdout, second.stdout);
    assert_eq!(first.fingerprint, second.fingerprint);
    assert_eq!(service.stats().await.spawn_count, 1);
}

#[tokio::test]
async fn test_output_flood_is_resource_exceeded() {
    require_python!();
    let service = process_service(test_config());
    let request = ExecutionRequest::new("while True:\n    print('x' * 1000)")
        .with_limits(ResourceLimits::default().with_wall_ms(5_000).with_output_bytes(4_096));

    let result = service.execute("it", &request).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::ResourceExceeded);
    assert!(result.output_truncated);
    assert!(result.stdout.len() <= 4_096);
}

#[tokio::test]
async fn test_rejected_code_spawns_nothing() {
    require_python!();
    let service = process_service(test_config());

    for code in [
        "import os",
        "import socket\nsocket.socket()",
        "eval('1')",
        "",
        "for _ in [0]: import ctypes as c\nprint(c.__name__)",
        "import posix\nposix.system('id')",
    ] {
        let result = service.execute("it", &ExecutionRequest::new(code)).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::SecurityRejected, "code {:?}", code);
        assert!(result.strategy_used.is_none());
        assert!(!result.violations.is_empty());
    }
    assert_eq!(service.stats().await.spawn_count, 0);
}

#[tokio::test]
async fn test_user_error_about_memory_is_failure() {
    require_python!();
    let service = process_service(test_config());

    let result = service
        .execute("it", &ExecutionRequest::new("raise ValueError('out of memory')"))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Failure, "stderr: {}", result.stderr);
    assert!(result.stderr.contains("ValueError: out of memory"));
}
