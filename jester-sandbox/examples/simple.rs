//! Simple sandbox example - validate and execute a few fragments

use jester_sandbox::{EngineConfig, ExecutionRequest, ResourceLimits, SandboxService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let service = SandboxService::new(EngineConfig::default())?;

    println!("=== Sandbox Service Example ===\n");

    println!("Example 1: Expression");
    execute_and_print(&service, ExecutionRequest::new("sum(range(10))")).await?;

    println!("\nExample 2: Allowed import");
    execute_and_print(
        &service,
        ExecutionRequest::new("import math\nprint(math.factorial(10))"),
    )
    .await?;

    println!("\nExample 3: Infinite loop under a 500 ms budget");
    let request = ExecutionRequest::new("while True: pass")
        .with_limits(ResourceLimits::default().with_wall_ms(500));
    execute_and_print(&service, request).await?;

    println!("\nExample 4: Rejected before anything runs");
    execute_and_print(&service, ExecutionRequest::new("import subprocess")).await?;

    println!("\nExample 5: Runtime error");
    execute_and_print(&service, ExecutionRequest::new("print(1/0)")).await?;

    let stats = service.stats().await;
    println!(
        "\nSpawned {} processes, cache hit rate {:.0}%",
        stats.spawn_count,
        stats.cache.hit_rate * 100.0
    );
    Ok(())
}

async fn execute_and_print(service: &SandboxService, request: ExecutionRequest) -> anyhow::Result<()> {
    let result = service.execute("example", &request).await?;

    for line in result.stdout.lines() {
        println!("  stdout: {}", line);
    }
    for line in result.stderr.lines() {
        println!("  stderr: {}", line);
    }
    println!(
        "  Result: status={} strategy={} wall={}ms",
        result.status,
        result.strategy_used.map(|s| s.as_str()).unwrap_or("none"),
        result.wall_time_ms
    );
    for violation in &result.violations {
        println!("  Violation: {}", violation);
    }
    for suggestion in &result.suggestions {
        println!("  Suggestion: {}", suggestion);
    }
    Ok(())
}
