//! Quantum debugging: race candidate implementations and keep the best one
//!
//! Every variant goes through the regular executor pipeline, so validation, caching, the worker
//! pool and the watchdog apply exactly as for a single execution. The race only adds scheduling and
//! selection on top.

use crate::error::{EngineError, Result};
use crate::executor::{ExecutionContext, SandboxExecutor};
use crate::gencode::{RaceTask, Variant, VariantGenerator, ORIGINAL_VARIANT};
use crate::types::{ExecutionRequest, ExecutionResult, ExecutionStatus};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const MIN_VARIANTS: usize = 2;
pub const MAX_VARIANTS: usize = 5;

const DEFAULT_SETTLE_MARGIN: Duration = Duration::from_millis(5);
const NOTABLE_GAIN: f64 = 1.1;

/// Where a variant ended up in the ranking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantScore {
    pub id: String,
    pub eligible: bool,
    /// 1-based position among eligible variants
    pub rank: Option<usize>,
    pub status: Option<ExecutionStatus>,
    pub wall_time_ms: Option<u64>,
    pub peak_memory_bytes: Option<u64>,
    /// Why the variant did not qualify
    pub note: Option<String>,
}

/// Gain of the winner over the `original` variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Improvement {
    pub time_speedup: f64,
    pub time_improvement_percent: f64,
    pub memory_ratio: f64,
    pub memory_improvement_percent: f64,
}

impl Improvement {
    fn between(original: &ExecutionResult, best: &ExecutionResult) -> Self {
        let (orig_time, best_time) = (original.wall_time_ms as f64, best.wall_time_ms.max(1) as f64);
        let (orig_mem, best_mem) = (
            original.peak_memory_bytes as f64,
            best.peak_memory_bytes.max(1) as f64,
        );
        let percent = |orig: f64, best: f64| {
            if orig > 0.0 {
                (orig - best) / orig * 100.0
            } else {
                0.0
            }
        };

        Self {
            time_speedup: orig_time / best_time,
            time_improvement_percent: percent(orig_time, best.wall_time_ms as f64),
            memory_ratio: orig_mem / best_mem,
            memory_improvement_percent: percent(orig_mem, best.peak_memory_bytes as f64),
        }
    }
}

/// Result of one race
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceOutcome {
    /// Results of every variant that finished before settlement
    pub results: BTreeMap<String, ExecutionResult>,
    pub winner_id: Option<String>,
    pub score_breakdown: Vec<VariantScore>,
    /// Lowest-id ineligible variant, set only when nobody qualified
    pub first_failure: Option<String>,
    /// Variants still running when the winner was settled; their results are ignored
    pub abandoned: Vec<String>,
    pub improvement: Option<Improvement>,
    pub recommendation: String,
}

impl RaceOutcome {
    pub fn winner(&self) -> Option<&ExecutionResult> {
        self.winner_id.as_ref().and_then(|id| self.results.get(id))
    }
}

type SortKey = (u64, u64, String);

type VariantFuture = BoxFuture<'static, (usize, std::result::Result<Result<ExecutionResult>, tokio::task::JoinError>)>;

/// Races variants produced by a generator through the executor
pub struct QuantumDebugger {
    executor: Arc<SandboxExecutor>,
    generator: Arc<dyn VariantGenerator>,
    settle_margin: Duration,
}

impl QuantumDebugger {
    pub fn new(executor: Arc<SandboxExecutor>, generator: Arc<dyn VariantGenerator>) -> Self {
        Self {
            executor,
            generator,
            settle_margin: DEFAULT_SETTLE_MARGIN,
        }
    }

    /// Extra time granted past the best wall time before outstanding variants are abandoned
    pub fn with_settle_margin(mut self, margin: Duration) -> Self {
        self.settle_margin = margin;
        self
    }

    /// Race up to `variant_count` variants of `task`.
    ///
    /// `ctx` supplies the client, configuration snapshot, pool and cancellation for the whole race;
    /// each variant runs under a fork of it.
    pub async fn race(&self, task: &RaceTask, variant_count: usize, ctx: ExecutionContext) -> Result<RaceOutcome> {
        if !(MIN_VARIANTS..=MAX_VARIANTS).contains(&variant_count) {
            return Err(EngineError::InvalidRequest(format!(
                "variant_count must be between {} and {}, got {}",
                MIN_VARIANTS, MAX_VARIANTS, variant_count
            )));
        }

        let mut variants = self.generator.generate(task).await?;
        variants.truncate(variant_count);
        if variants.len() < MIN_VARIANTS {
            return Err(EngineError::InvalidRequest(format!(
                "generator produced {} variant(s), a race needs at least {}",
                variants.len(),
                MIN_VARIANTS
            )));
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = variants.iter().find(|v| !seen.insert(v.id.as_str())) {
            return Err(EngineError::InvalidRequest(format!("duplicate variant id '{}'", dup.id)));
        }

        tracing::info!(
            race_id = %ctx.execution_id,
            client = %ctx.client_key,
            variants = variants.len(),
            description = %task.description,
            "race started"
        );

        let (start_tx, mut start_rx) = mpsc::unbounded_channel::<(usize, Instant)>();
        let mut running: FuturesUnordered<VariantFuture> = FuturesUnordered::new();
        for (idx, variant) in variants.iter().enumerate() {
            let request = variant_request(task, variant);
            let started = start_tx.clone();
            let vctx = ctx.fork().on_start(move |at| {
                let _ = started.send((idx, at));
            });
            let executor = self.executor.clone();
            let handle = tokio::spawn(async move { executor.execute(&request, vctx).await });
            running.push(handle.map(move |joined| (idx, joined)).boxed());
        }
        drop(start_tx);

        let n = variants.len();
        let mut started: Vec<Option<Instant>> = vec![None; n];
        let mut finished = vec![false; n];
        let mut results: BTreeMap<String, ExecutionResult> = BTreeMap::new();
        let mut notes: BTreeMap<String, String> = BTreeMap::new();
        let mut best: Option<SortKey> = None;
        let mut starts_open = true;
        let mut settled = false;

        while !running.is_empty() {
            let settle_at = self.settle_deadline(&started, &finished, best.as_ref());

            tokio::select! {
                Some((idx, joined)) = running.next() => {
                    finished[idx] = true;
                    let id = variants[idx].id.clone();
                    match joined {
                        Ok(Ok(result)) => {
                            match ineligibility(&result, task.reference_output.as_deref()) {
                                None => {
                                    let key = (result.wall_time_ms, result.peak_memory_bytes, id.clone());
                                    if best.as_ref().map_or(true, |b| key < *b) {
                                        best = Some(key);
                                    }
                                }
                                Some(note) => {
                                    notes.insert(id.clone(), note);
                                }
                            }
                            results.insert(id, result);
                        }
                        Ok(Err(EngineError::Cancelled)) => {
                            notes.insert(id, "cancelled".to_string());
                        }
                        Ok(Err(err)) => {
                            tracing::warn!(variant = %id, error = %err, "variant failed to execute");
                            notes.insert(id, err.to_string());
                        }
                        Err(join_err) => {
                            tracing::error!(variant = %id, error = %join_err, "variant task aborted");
                            notes.insert(id, "variant task aborted".to_string());
                        }
                    }
                }
                start = start_rx.recv(), if starts_open => match start {
                    Some((idx, at)) => started[idx] = Some(at),
                    None => starts_open = false,
                },
                _ = sleep_until_opt(settle_at), if settle_at.is_some() => {
                    settled = true;
                    break;
                }
            }
        }

        if ctx.cancel.is_cancelled() {
            tracing::info!(race_id = %ctx.execution_id, "race cancelled");
            return Err(EngineError::Cancelled);
        }

        // dropping the handles detaches the tasks; the watchdog still bounds each one
        drop(running);
        let abandoned: Vec<String> = variants
            .iter()
            .zip(&finished)
            .filter(|(_, done)| !**done)
            .map(|(v, _)| v.id.clone())
            .collect();
        if settled {
            tracing::debug!(abandoned = ?abandoned, "race settled early");
        }

        let outcome = build_outcome(&variants, results, notes, abandoned);
        tracing::info!(
            race_id = %ctx.execution_id,
            winner = outcome.winner_id.as_deref().unwrap_or("none"),
            abandoned = outcome.abandoned.len(),
            "race finished"
        );
        Ok(outcome)
    }

    /// Instant after which no outstanding variant can beat the current best.
    ///
    /// Start instants are the governors' own wall-clock origins, so an outstanding variant
    /// still running at the deadline measures more than the best wall time. Variants that have
    /// not reported a start keep the race open.
    fn settle_deadline(&self, started: &[Option<Instant>], finished: &[bool], best: Option<&SortKey>) -> Option<Instant> {
        let best_wall = Duration::from_millis(best?.0);
        let mut latest: Option<Instant> = None;
        for (start, done) in started.iter().zip(finished) {
            if *done {
                continue;
            }
            let start = (*start)?;
            latest = Some(latest.map_or(start, |l| l.max(start)));
        }
        latest.map(|l| l + best_wall + self.settle_margin)
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn variant_request(task: &RaceTask, variant: &Variant) -> ExecutionRequest {
    ExecutionRequest {
        code: variant.source_code.clone(),
        description: format!("{} [{}]", task.description, variant.id),
        limits: task.limits,
        allowed_imports: task.allowed_imports.clone(),
        network_allowed: false,
        strategy_hint: None,
    }
}

fn ineligibility(result: &ExecutionResult, reference: Option<&str>) -> Option<String> {
    if result.status != ExecutionStatus::Success {
        return Some(format!("finished with status {}", result.status));
    }
    match reference {
        Some(expected) if result.stdout.trim() != expected.trim() => {
            Some("output differs from the reference".to_string())
        }
        _ => None,
    }
}

fn build_outcome(
    variants: &[Variant],
    results: BTreeMap<String, ExecutionResult>,
    mut notes: BTreeMap<String, String>,
    abandoned: Vec<String>,
) -> RaceOutcome {
    for id in &abandoned {
        notes.insert(id.clone(), "abandoned after the winner was settled".to_string());
    }

    let mut ranked: Vec<(&String, &ExecutionResult)> = results
        .iter()
        .filter(|(id, _)| !notes.contains_key(*id))
        .collect();
    ranked.sort_by(|(a_id, a), (b_id, b)| {
        (a.wall_time_ms, a.peak_memory_bytes, *a_id).cmp(&(b.wall_time_ms, b.peak_memory_bytes, *b_id))
    });
    let ranks: BTreeMap<String, usize> = ranked
        .iter()
        .enumerate()
        .map(|(i, (id, _))| ((*id).clone(), i + 1))
        .collect();

    let winner_id = ranked.first().map(|(id, _)| (*id).clone());
    let first_failure = match winner_id {
        Some(_) => None,
        None => notes.keys().next().cloned(),
    };

    let mut score_breakdown: Vec<VariantScore> = variants
        .iter()
        .map(|v| {
            let result = results.get(&v.id);
            VariantScore {
                id: v.id.clone(),
                eligible: ranks.contains_key(&v.id),
                rank: ranks.get(&v.id).copied(),
                status: result.map(|r| r.status),
                wall_time_ms: result.map(|r| r.wall_time_ms),
                peak_memory_bytes: result.map(|r| r.peak_memory_bytes),
                note: notes.get(&v.id).cloned(),
            }
        })
        .collect();
    score_breakdown.sort_by(|a, b| {
        (a.rank.is_none(), a.rank, &a.id).cmp(&(b.rank.is_none(), b.rank, &b.id))
    });

    let improvement = winner_id.as_ref().and_then(|winner| {
        let original = results
            .get(ORIGINAL_VARIANT)
            .filter(|_| ranks.contains_key(ORIGINAL_VARIANT))?;
        Some(Improvement::between(original, results.get(winner)?))
    });

    let winner = winner_id
        .as_ref()
        .and_then(|id| variants.iter().find(|v| &v.id == id));
    let recommendation = recommend(winner, improvement.as_ref());

    RaceOutcome {
        results,
        winner_id,
        score_breakdown,
        first_failure,
        abandoned,
        improvement,
        recommendation,
    }
}

fn recommend(winner: Option<&Variant>, improvement: Option<&Improvement>) -> String {
    match winner {
        None => "No variants executed successfully. Consider reviewing the code for errors.".to_string(),
        Some(v) if v.id == ORIGINAL_VARIANT => {
            "The original code is already optimal for the given constraints.".to_string()
        }
        Some(v) => {
            let label = if v.rationale.is_empty() { &v.id } else { &v.rationale };
            let mut parts = vec![format!("Recommended solution: {}", label)];
            if let Some(gain) = improvement {
                if gain.time_speedup > NOTABLE_GAIN {
                    parts.push(format!("Performance improvement: {:.1}x faster", gain.time_speedup));
                }
                if gain.memory_ratio > NOTABLE_GAIN {
                    parts.push(format!("Memory efficiency: {:.1}x more efficient", gain.memory_ratio));
                }
            }
            if let Some(confidence) = v.confidence {
                parts.push(format!("Confidence: {:.0}%", confidence * 100.0));
            }
            parts.join(" | ")
        }
    }
}
