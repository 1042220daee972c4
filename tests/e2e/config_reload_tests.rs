//! Configuration files and checkpoint reloads

use assert_matches::assert_matches;
use jester_sandbox::{
    ConfigError, EngineConfig, EngineError, ExecutionRequest, ExecutionStatus, SandboxService,
    ScriptedGovernor, ScriptedRun,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn scripted_service(config: EngineConfig) -> SandboxService {
    let governor = ScriptedGovernor::new().otherwise(ScriptedRun::success("done\n", 100));
    SandboxService::with_governor(config, Arc::new(governor)).unwrap()
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jester").join("config.toml");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(
        &path,
        r#"
[limits]
max_wall_ms = 750

[security]
enforce_allow_list = true

[pool]
workers = 1

[interpreter]
program = "/usr/bin/python3"
"#,
    )
    .unwrap();

    let config = EngineConfig::load(&path).unwrap();
    assert_eq!(config.limits.max_wall_ms, 750);
    assert!(config.security.enforce_allow_list);
    assert_eq!(config.pool.workers, 1);
    assert_eq!(config.interpreter.program, "/usr/bin/python3");
}

#[test]
fn test_bad_config_file_names_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[limits\nmax_wall_ms = 1").unwrap();

    let err = EngineConfig::load(&path).unwrap_err();
    assert_matches!(err, ConfigError::Parse { path: ref p, .. } if p == &path);
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_execution_keeps_old_snapshot() {
    let mut config = EngineConfig::default();
    config.limits.max_wall_ms = 1_000;
    let service = Arc::new(scripted_service(config));

    let running = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .execute("a", &ExecutionRequest::new("x = 1\nprint(x)"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // new executions get a 50 ms budget; the running one keeps 1 s
    let mut tighter = EngineConfig::default();
    tighter.limits.max_wall_ms = 50;
    service.reload(tighter).await.unwrap();

    let finished = running.await.unwrap().unwrap();
    assert_eq!(finished.status, ExecutionStatus::Success);

    let after = service
        .execute("a", &ExecutionRequest::new("y = 1\nprint(y)"))
        .await
        .unwrap();
    assert_eq!(after.status, ExecutionStatus::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_execution_is_not_cached() {
    let service = scripted_service(EngineConfig::default());
    let request = ExecutionRequest::new("z = 3\nprint(z)");
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });

    let err = service
        .execute_cancellable("a", &request, token)
        .await
        .unwrap_err();
    assert_matches!(err, EngineError::Cancelled);

    let rerun = service.execute("a", &request).await.unwrap();
    assert!(!rerun.cache_hit);
}
