//! CLI command implementations
//!
//! Each command builds a [`SandboxService`] from the configuration file, performs one operation and
//! prints the outcome either as JSON or as a short human-readable report. Commands that judge code
//! return whether the outcome was a success so `main` can pick the exit code.

use crate::{CodeSource, OutputArgs};
use anyhow::{bail, Context, Result};
use jester_sandbox::{
    EngineConfig, ExecutionRequest, ExecutionResult, ExecutionStatus, RaceOutcome, RaceTask,
    ResourceLimits, SandboxService, SecurityVerdict, StaticVariantGenerator, StrategyKind, Variant,
    ORIGINAL_VARIANT,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing_appender::non_blocking::WorkerGuard;

/// Options of `jester run`
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub wall_ms: Option<u64>,
    pub memory_mb: Option<u64>,
    pub allow_imports: Vec<String>,
    pub network: bool,
    pub minimal: bool,
    pub client: String,
}

/// Options of `jester race`
#[derive(Debug, Clone)]
pub struct RaceOptions {
    pub variants: usize,
    pub variant_files: Vec<PathBuf>,
    pub expect: Option<String>,
    pub description: String,
    pub client: String,
}

/// Install the stderr layer and, when asked, a non-blocking file layer.
///
/// The returned guard flushes the file writer on drop and must live until exit.
pub fn init_tracing(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let log_level = if verbose { "debug" } else { "info" };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("invalid log file path: {}", path.display()))?;
            let file_appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true),
        )
        .with(file_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "jester={},jester_sandbox={}",
                    log_level, log_level
                ))
            }),
        )
        .init();

    Ok(guard)
}

/// Explicit path (flag or `JESTER_CONFIG`) or the per-user default
pub fn config_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => EngineConfig::default_path().context("cannot locate the configuration file"),
    }
}

fn load_config(path: &Path) -> Result<EngineConfig> {
    EngineConfig::load_or_default(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

async fn read_code(source: &CodeSource) -> Result<String> {
    if let Some(code) = &source.code {
        return Ok(code.clone());
    }
    if let Some(path) = &source.file {
        return tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()));
    }

    let mut code = String::new();
    tokio::io::stdin()
        .read_to_string(&mut code)
        .await
        .context("failed to read code from stdin")?;
    if code.trim().is_empty() {
        bail!("no code given: pass it as an argument, with --file, or on stdin");
    }
    Ok(code)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn print_stats(service: &SandboxService) -> Result<()> {
    let stats = service.stats().await;
    eprintln!("\n--- Engine ---");
    eprintln!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn memory_limit_bytes(memory_mb: u64) -> Result<u64> {
    memory_mb
        .checked_mul(1024 * 1024)
        .with_context(|| format!("memory limit of {} MiB is too large", memory_mb))
}

/// Execute code once
pub async fn run(config_path: &Path, source: &CodeSource, output: &OutputArgs, options: RunOptions) -> Result<bool> {
    let config = load_config(config_path)?;
    let code = read_code(source).await?;

    let mut limits = config.limits;
    if let Some(wall_ms) = options.wall_ms {
        limits = limits.with_wall_ms(wall_ms);
    }
    if let Some(memory_mb) = options.memory_mb {
        limits = limits.with_memory_bytes(memory_limit_bytes(memory_mb)?);
    }

    let mut request = ExecutionRequest::new(code)
        .with_limits(limits)
        .with_network(options.network);
    for module in options.allow_imports {
        request = request.allow_import(module);
    }
    if options.minimal {
        request = request.with_strategy_hint(StrategyKind::Minimal);
    }

    let service = SandboxService::new(config)?;
    let result = service.execute(&options.client, &request).await?;

    if output.json {
        print_json(&result)?;
    } else {
        print_result(&result);
    }
    if output.stats {
        print_stats(&service).await?;
    }

    Ok(result.status == ExecutionStatus::Success)
}

fn print_result(result: &ExecutionResult) {
    print!("{}", result.stdout);
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }

    eprintln!("\n--- Result ---");
    eprintln!("Status: {} ({})", result.status, result.exit_info.reason);
    if let Some(strategy) = result.strategy_used {
        eprintln!("Strategy: {}", strategy);
    }
    eprintln!(
        "Wall: {} ms, CPU: {} ms, Memory: {} KiB{}",
        result.wall_time_ms,
        result.cpu_time_ms,
        result.peak_memory_bytes / 1024,
        if result.cache_hit { " (cached)" } else { "" }
    );
    if result.output_truncated {
        eprintln!("Output was truncated");
    }
    for violation in &result.violations {
        eprintln!("✗ {} at {}: {}", violation.rule.as_str(), violation.location, violation.detail);
    }
    for suggestion in &result.suggestions {
        eprintln!("→ {}", suggestion);
    }
}

/// Race variants of the code
pub async fn race(config_path: &Path, source: &CodeSource, output: &OutputArgs, options: RaceOptions) -> Result<bool> {
    let config = load_config(config_path)?;
    let code = read_code(source).await?;

    let mut task = RaceTask::new(options.description, code.clone());
    if let Some(expected) = options.expect {
        task = task.with_reference_output(expected);
    }

    let service = SandboxService::new(config)?;
    let outcome = if options.variant_files.is_empty() {
        service.race(&options.client, &task, options.variants).await?
    } else {
        let variants = load_variants(&code, &options.variant_files).await?;
        let generator = Arc::new(StaticVariantGenerator::new(variants));
        service
            .race_with(&options.client, &task, options.variants, generator)
            .await?
    };

    if output.json {
        print_json(&outcome)?;
    } else {
        print_race(&outcome);
    }
    if output.stats {
        print_stats(&service).await?;
    }

    Ok(outcome.winner_id.is_some())
}

/// The given code as `original`, then one variant per file named after its stem
async fn load_variants(original: &str, files: &[PathBuf]) -> Result<Vec<Variant>> {
    let mut variants = vec![Variant::new(ORIGINAL_VARIANT, original, "code as submitted")];
    for path in files {
        let source = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read variant {}", path.display()))?;
        let id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .with_context(|| format!("variant path has no file name: {}", path.display()))?;
        let rationale = format!("from {}", path.display());
        variants.push(Variant::new(id, source, rationale));
    }
    Ok(variants)
}

fn print_race(outcome: &RaceOutcome) {
    println!("Winner: {}", outcome.winner_id.as_deref().unwrap_or("none"));
    for score in &outcome.score_breakdown {
        let rank = score.rank.map(|r| format!("#{}", r)).unwrap_or_else(|| "-".to_string());
        let timing = score
            .wall_time_ms
            .map(|ms| format!("{} ms", ms))
            .unwrap_or_else(|| "n/a".to_string());
        let note = score.note.as_deref().map(|n| format!(" ({})", n)).unwrap_or_default();
        println!("  {:>3} {:<20} {:>10}{}", rank, score.id, timing, note);
    }
    if let Some(failure) = &outcome.first_failure {
        println!("First failure: {}", failure);
        if let Some(result) = outcome.results.get(failure) {
            for suggestion in &result.suggestions {
                println!("→ {}", suggestion);
            }
        }
    }
    println!("{}", outcome.recommendation);
}

/// Check code without running it
pub async fn validate(config_path: &Path, source: &CodeSource, network: bool, json: bool) -> Result<bool> {
    let config = load_config(config_path)?;
    let code = read_code(source).await?;
    let service = SandboxService::new(config)?;
    let verdict = service.validate(&code, network).await?;

    if json {
        print_json(&verdict)?;
    } else {
        print_verdict(&verdict);
    }

    Ok(verdict.allowed)
}

fn print_verdict(verdict: &SecurityVerdict) {
    if verdict.allowed {
        println!("✓ Allowed (suggested strategy: {})", verdict.suggested_strategy);
        return;
    }
    println!("✗ Rejected");
    for violation in &verdict.violations {
        println!("  {} at {}: {}", violation.rule.as_str(), violation.location, violation.detail);
    }
    if verdict.truncated {
        println!("  ... further violations omitted");
    }
}

/// Print the effective configuration
pub fn config_show(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

/// Write the default configuration to `path`
pub fn config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    EngineConfig::default().save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
