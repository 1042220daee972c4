//! Race rewrites of an append loop and print the verdict

use jester_sandbox::{EngineConfig, RaceTask, SandboxService};

const CODE: &str = "squares = []
for i in range(200000):
    squares.append(i * i)
print(sum(squares))";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let service = SandboxService::new(EngineConfig::default())?;
    let task = RaceTask::new("sum of squares", CODE);
    let outcome = service.race("example", &task, 3).await?;

    for score in &outcome.score_breakdown {
        println!(
            "{:<20} rank={:?} wall={:?}ms note={}",
            score.id,
            score.rank,
            score.wall_time_ms,
            score.note.as_deref().unwrap_or("-")
        );
    }
    println!("\n{}", outcome.recommendation);
    Ok(())
}
