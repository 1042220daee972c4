//! Result cache keyed by execution fingerprint, with TTL expiry and LRU eviction

use crate::limits::ResourceLimits;
use crate::policy::StrategyKind;
use crate::types::{ExecutionResult, ExecutionStatus};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Configuration for the result cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached results
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Lifetime of a cached result
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// Shorter lifetime for timed-out results
    #[serde(default = "default_timeout_ttl", with = "humantime_serde")]
    pub timeout_ttl: Duration,
}

fn default_capacity() -> usize {
    256
}

fn default_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_timeout_ttl() -> Duration {
    Duration::from_secs(30)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            ttl: default_ttl(),
            timeout_ttl: default_timeout_ttl(),
        }
    }
}

impl CacheConfig {
    /// Lifetime for a result of the given status, `None` when it must not be cached
    pub fn ttl_for(&self, status: ExecutionStatus) -> Option<Duration> {
        match status {
            ExecutionStatus::Success | ExecutionStatus::Failure | ExecutionStatus::ResourceExceeded => {
                Some(self.ttl)
            }
            ExecutionStatus::Timeout => Some(self.timeout_ttl),
            ExecutionStatus::SecurityRejected => None,
        }
    }
}

/// Code normalised for fingerprinting: LF line endings, no trailing whitespace, no trailing blank lines
pub fn normalize_code(code: &str) -> String {
    let mut lines: Vec<&str> = code
        .split('\n')
        .map(|line| line.trim_end_matches('\r').trim_end())
        .collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// SHA-256 hex over normalised code, strategy and limits
pub fn fingerprint(code: &str, strategy: StrategyKind, limits: &ResourceLimits) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_code(code).as_bytes());
    hasher.update([0u8]);
    hasher.update(strategy.as_str().as_bytes());
    hasher.update([0u8]);
    for value in [
        limits.max_wall_ms,
        limits.max_cpu_ms,
        limits.max_memory_bytes,
        limits.max_output_bytes,
    ] {
        hasher.update(value.to_le_bytes());
    }

    hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(64), |mut hex, byte| {
            let _ = write!(hex, "{:02x}", byte);
            hex
        })
}

/// Cache entry with metadata
#[derive(Debug, Clone)]
struct CacheEntry {
    result: ExecutionResult,
    expires_at: Instant,
    last_access: Instant,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
}

#[derive(Debug)]
struct CacheState {
    config: CacheConfig,
    generation: u64,
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl CacheState {
    fn purge_expired(&mut self, now: Instant) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.expirations += (before - self.entries.len()) as u64;
    }

    fn evict_lru(&mut self) {
        while self.entries.len() > self.config.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                    self.evictions += 1;
                }
                None => break,
            }
        }
    }
}

/// In-memory result cache
#[derive(Debug)]
pub struct ResultCache {
    state: Mutex<CacheState>,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState {
                config,
                generation: 0,
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            }),
        }
    }

    /// Look up a live entry. The returned copy is tagged as a cache hit.
    pub async fn get(&self, fingerprint: &str) -> Option<ExecutionResult> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let expired = match state.entries.get_mut(fingerprint) {
            Some(entry) if entry.expires_at > now => {
                entry.last_access = now;
                let mut result = entry.result.clone();
                result.cache_hit = true;
                state.hits += 1;
                return Some(result);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            state.entries.remove(fingerprint);
            state.expirations += 1;
        }
        state.misses += 1;
        None
    }

    /// Configuration generation; bumped whenever the cache is cleared or reconfigured
    pub async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }

    /// Store a result produced under `generation`. Results from an older generation and
    /// statuses that must not be cached are ignored. Returns whether it was stored.
    pub async fn put(&self, fingerprint: &str, result: &ExecutionResult, generation: u64) -> bool {
        let mut state = self.state.lock().await;
        if generation != state.generation {
            tracing::debug!(
                generation,
                current = state.generation,
                "dropping result from a previous configuration"
            );
            return false;
        }
        let Some(ttl) = state.config.ttl_for(result.status) else {
            return false;
        };
        if state.config.capacity == 0 {
            return false;
        }

        let now = Instant::now();
        let mut stored = result.clone();
        stored.cache_hit = false;
        state.entries.insert(
            fingerprint.to_string(),
            CacheEntry {
                result: stored,
                expires_at: now + ttl,
                last_access: now,
            },
        );

        if state.entries.len() > state.config.capacity {
            state.purge_expired(now);
            state.evict_lru();
        }
        true
    }

    /// Drop every entry; counters are kept
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.generation += 1;
        state.entries.clear();
    }

    /// Apply new settings and drop every entry
    pub async fn reconfigure(&self, config: CacheConfig) {
        let mut state = self.state.lock().await;
        state.config = config;
        state.generation += 1;
        state.entries.clear();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        let lookups = state.hits + state.misses;
        CacheStats {
            entries: state.entries.len(),
            capacity: state.config.capacity,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expirations: state.expirations,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }
}
