//! Service-level admission, audit and concurrency behaviour

use assert_matches::assert_matches;
use jester_sandbox::{
    EngineConfig, EngineError, ExecutionRequest, ExecutionStatus, SandboxService, ScriptedGovernor,
    ScriptedRun,
};
use jester_tests::common::{process_service, setup_test_logging, test_config};
use jester_tests::require_python;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_fourth_execution_is_throttled() {
    require_python!();
    let mut config = test_config();
    config.rate_limit.executions_per_window = 3;
    config.rate_limit.window = Duration::from_secs(60);
    let service = process_service(config);

    for i in 0..3 {
        let request = ExecutionRequest::new(format!("print({})", i));
        let result = service.execute("busy", &request).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
    }

    let err = service
        .execute("busy", &ExecutionRequest::new("print(3)"))
        .await
        .unwrap_err();
    assert_matches!(err, EngineError::Throttled { limit: 3, .. });
    assert_eq!(service.stats().await.spawn_count, 3);
}

#[tokio::test(start_paused = true)]
async fn test_pool_bounds_concurrency() {
    setup_test_logging();
    let mut config = EngineConfig::default();
    config.pool.workers = 2;
    let governor = Arc::new(ScriptedGovernor::new().otherwise(ScriptedRun::success("ok\n", 100)));
    let service = Arc::new(SandboxService::with_governor(config, governor).unwrap());

    let started = tokio::time::Instant::now();
    let mut handles = Vec::new();
    for i in 0..4 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let request = ExecutionRequest::new(format!("x = {}\nprint(x)", i));
            service.execute("pool", &request).await
        }));
    }
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
    }

    // four 100 ms runs on two workers take two rounds
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(300));
}

#[tokio::test]
async fn test_audit_records_every_outcome() {
    let governor = Arc::new(ScriptedGovernor::new().otherwise(ScriptedRun::success("", 1)));
    let service = SandboxService::with_governor(EngineConfig::default(), governor).unwrap();
    let mut audit = service.subscribe_audit();

    service
        .execute("auditor", &ExecutionRequest::new("print(1)"))
        .await
        .unwrap();
    service
        .execute("auditor", &ExecutionRequest::new("print(1)"))
        .await
        .unwrap();
    service
        .execute("auditor", &ExecutionRequest::new("import ctypes"))
        .await
        .unwrap();

    let first = audit.recv().await.unwrap();
    let second = audit.recv().await.unwrap();
    let third = audit.recv().await.unwrap();

    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(first.fingerprint, second.fingerprint);
    assert_eq!(third.status, ExecutionStatus::SecurityRejected);
    assert!(third.violation_count >= 1);
    assert_ne!(first.execution_id, second.execution_id);
}
