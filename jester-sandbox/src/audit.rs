//! Audit trail of every execution decision

use crate::policy::StrategyKind;
use crate::types::{ExecutionId, ExecutionResult, ExecutionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const AUDIT_CHANNEL_CAPACITY: usize = 256;

/// One audited execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub execution_id: ExecutionId,
    pub timestamp: DateTime<Utc>,
    pub client_key: String,
    pub fingerprint: String,
    pub status: ExecutionStatus,
    pub strategy: Option<StrategyKind>,
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub peak_memory_bytes: u64,
    pub cache_hit: bool,
    pub violation_count: usize,
}

impl AuditRecord {
    pub fn from_result(execution_id: ExecutionId, client_key: &str, result: &ExecutionResult) -> Self {
        Self {
            execution_id,
            timestamp: Utc::now(),
            client_key: client_key.to_string(),
            fingerprint: result.fingerprint.clone(),
            status: result.status,
            strategy: result.strategy_used,
            wall_time_ms: result.wall_time_ms,
            cpu_time_ms: result.cpu_time_ms,
            peak_memory_bytes: result.peak_memory_bytes,
            cache_hit: result.cache_hit,
            violation_count: result.violations.len(),
        }
    }
}

/// Fan-out of audit records to subscribers and the log
#[derive(Debug)]
pub struct AuditTrail {
    sender: broadcast::Sender<AuditRecord>,
}

impl AuditTrail {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(AUDIT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.sender.subscribe()
    }

    pub fn emit(&self, record: AuditRecord) {
        let fingerprint = record.fingerprint.get(..12).unwrap_or(&record.fingerprint);
        tracing::info!(
            target: "jester_sandbox::audit",
            execution_id = %record.execution_id,
            client = %record.client_key,
            fingerprint = %fingerprint,
            status = %record.status,
            strategy = record.strategy.map(StrategyKind::as_str).unwrap_or("none"),
            wall_time_ms = record.wall_time_ms,
            cpu_time_ms = record.cpu_time_ms,
            peak_memory_bytes = record.peak_memory_bytes,
            cache_hit = record.cache_hit,
            violations = record.violation_count,
            "execution audited"
        );
        // no subscribers is fine
        let _ = self.sender.send(record);
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}
