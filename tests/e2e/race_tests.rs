//! Variant races through the full service

use jester_sandbox::{
    EngineConfig, ExecutionStatus, RaceTask, SandboxService, ScriptedGovernor, ScriptedRun,
    StaticVariantGenerator, Variant, VariantGenerator, ORIGINAL_VARIANT,
};
use jester_tests::common::{process_service, test_config};
use jester_tests::require_python;
use std::sync::Arc;

const APPEND_LOOP: &str = "squares = []\nfor i in range(2000):\n    squares.append(i * i)\nprint(sum(squares))";
const EXPECTED: &str = "2664667000";

#[tokio::test(start_paused = true)]
async fn test_fastest_wins_with_id_tie_break() {
    let governor = ScriptedGovernor::new()
        .on("print('a')", ScriptedRun::success("same\n", 50))
        .on("print('b')", ScriptedRun::success("same\n", 30))
        .on("print('c')", ScriptedRun::success("same\n", 30));
    let service = SandboxService::with_governor(EngineConfig::default(), Arc::new(governor)).unwrap();

    // submission order must not matter
    let generator: Arc<dyn VariantGenerator> = Arc::new(StaticVariantGenerator::new(vec![
        Variant::new("C", "print('c')", ""),
        Variant::new("A", "print('a')", ""),
        Variant::new("B", "print('b')", ""),
    ]));
    let outcome = service
        .race_with("racer", &RaceTask::new("same output", "print('a')"), 3, generator)
        .await
        .unwrap();

    assert_eq!(outcome.winner_id.as_deref(), Some("B"));
    assert_eq!(outcome.winner().unwrap().wall_time_ms, 30);

    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["winner_id"], "B");
    assert_eq!(json["abandoned"][0], "A");
}

#[tokio::test]
async fn test_rewrite_race_on_real_interpreter() {
    require_python!();
    let service = process_service(test_config());
    let task = RaceTask::new("sum of squares", APPEND_LOOP).with_reference_output(EXPECTED);

    let outcome = service.race("racer", &task, 3).await.unwrap();

    assert!(outcome.winner_id.is_some(), "breakdown: {:?}", outcome.score_breakdown);
    assert!(outcome.results.contains_key(ORIGINAL_VARIANT) || outcome.abandoned.contains(&ORIGINAL_VARIANT.to_string()));
    for result in outcome.results.values() {
        assert_eq!(result.status, ExecutionStatus::Success, "stderr: {}", result.stderr);
        assert_eq!(result.stdout.trim(), EXPECTED);
    }
    assert!(!outcome.recommendation.is_empty());
}

#[tokio::test]
async fn test_broken_variant_never_wins() {
    require_python!();
    let service = process_service(test_config());
    let generator: Arc<dyn VariantGenerator> = Arc::new(StaticVariantGenerator::new(vec![
        Variant::new(ORIGINAL_VARIANT, "print(sum(range(10)))", "as written"),
        Variant::new("broken", "print(sum(range(10)) / 0)", "divides by zero"),
    ]));

    let outcome = service
        .race_with("racer", &RaceTask::new("sum", "print(sum(range(10)))"), 2, generator)
        .await
        .unwrap();

    assert_eq!(outcome.winner_id.as_deref(), Some(ORIGINAL_VARIANT));
    assert_eq!(
        outcome.recommendation,
        "The original code is already optimal for the given constraints."
    );
    if let Some(broken) = outcome.results.get("broken") {
        assert_eq!(broken.status, ExecutionStatus::Failure);
        assert!(broken.stderr.contains("ZeroDivisionError"));
    }
}

#[tokio::test]
async fn test_reference_output_rejects_wrong_answers() {
    require_python!();
    let service = process_service(test_config());
    let generator: Arc<dyn VariantGenerator> = Arc::new(StaticVariantGenerator::new(vec![
        Variant::new("off_by_one", "print(sum(range(11)))", ""),
        Variant::new("right", "print(sum(range(10)))", ""),
    ]));
    let task = RaceTask::new("sum below ten", "print(sum(range(10)))").with_reference_output("45");

    let outcome = service.race_with("racer", &task, 2, generator).await.unwrap();

    assert_eq!(outcome.winner_id.as_deref(), Some("right"));
    if let Some(score) = outcome.score_breakdown.iter().find(|s| s.id == "off_by_one") {
        assert!(!score.eligible);
    }
}

#[tokio::test]
async fn test_all_variants_failing_reports_first_failure() {
    require_python!();
    let service = process_service(test_config());
    let generator: Arc<dyn VariantGenerator> = Arc::new(StaticVariantGenerator::new(vec![
        Variant::new("b", "print(undefined_b)", ""),
        Variant::new("a", "print(undefined_a)", ""),
    ]));

    let outcome = service
        .race_with("racer", &RaceTask::new("", ""), 2, generator)
        .await
        .unwrap();

    assert!(outcome.winner_id.is_none());
    assert_eq!(outcome.first_failure.as_deref(), Some("a"));
    assert!(outcome.abandoned.is_empty());
}
