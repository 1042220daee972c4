//! Per-client admission control over a sliding time window

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Configuration for the rate limiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Admissions allowed per client within one window
    #[serde(default = "default_executions")]
    pub executions_per_window: usize,

    /// Window length
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,
}

fn default_executions() -> usize {
    60
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            executions_per_window: default_executions(),
            window: default_window(),
        }
    }
}

/// Rate limit state for one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientUsage {
    pub used: usize,
    pub remaining: usize,
}

/// Point-in-time view of the limiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub limit: usize,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub clients: BTreeMap<String, ClientUsage>,
}

#[derive(Debug)]
struct LimiterState {
    limit: usize,
    window: Duration,
    log: HashMap<String, VecDeque<Instant>>,
}

impl LimiterState {
    fn expire(&mut self, now: Instant) {
        let window = self.window;
        for stamps in self.log.values_mut() {
            while stamps
                .front()
                .is_some_and(|stamp| now.duration_since(*stamp) >= window)
            {
                stamps.pop_front();
            }
        }
        self.log.retain(|_, stamps| !stamps.is_empty());
    }
}

/// Sliding-window log limiter keyed by client
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                limit: config.executions_per_window,
                window: config.window,
                log: HashMap::new(),
            }),
        }
    }

    /// Record an admission for `client` unless the window is already full
    pub async fn admit(&self, client: &str) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.expire(now);

        let limit = state.limit;
        let stamps = state.log.entry(client.to_string()).or_default();
        if stamps.len() >= limit {
            tracing::debug!(client, limit, "admission denied");
            return false;
        }
        stamps.push_back(now);
        true
    }

    pub async fn limit(&self) -> (usize, Duration) {
        let state = self.state.lock().await;
        (state.limit, state.window)
    }

    /// Apply new settings. Admissions already recorded keep counting.
    pub async fn reconfigure(&self, config: &RateLimitConfig) {
        let mut state = self.state.lock().await;
        state.limit = config.executions_per_window;
        state.window = config.window;
    }

    pub async fn snapshot(&self) -> RateLimitSnapshot {
        let mut state = self.state.lock().await;
        state.expire(Instant::now());

        let limit = state.limit;
        RateLimitSnapshot {
            limit,
            window: state.window,
            clients: state
                .log
                .iter()
                .map(|(client, stamps)| {
                    (
                        client.clone(),
                        ClientUsage {
                            used: stamps.len(),
                            remaining: limit.saturating_sub(stamps.len()),
                        },
                    )
                })
                .collect(),
        }
    }
}
