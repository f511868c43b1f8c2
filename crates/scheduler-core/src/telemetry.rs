//! `TelemetrySink`: structured log/trace events for claims, executions,
//! retries (spec §2.12). Write-only; implementation is external. Each
//! event is a small `Serialize`-able struct so a shipper can encode it
//! however it likes without this crate depending on a wire format.

use crate::tenant::TenantId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ClaimedEvent {
    pub tenant_id: String,
    pub cmd_id: Uuid,
    pub worker_label: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StaleLeaseReclaimedEvent {
    pub tenant_id: String,
    pub reclaimed_count: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionFinishedEvent {
    pub tenant_id: String,
    pub cmd_id: Uuid,
    pub worker_label: String,
    pub succeeded: bool,
    pub duration_ms: i64,
    pub entities_touched: u64,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryScheduledEvent {
    pub tenant_id: String,
    pub cmd_id: Uuid,
    pub retry_count: u32,
    pub next_run_at: DateTime<Utc>,
}

pub trait TelemetrySink: Send + Sync {
    fn claimed(&self, event: ClaimedEvent);
    fn stale_lease_reclaimed(&self, event: StaleLeaseReclaimedEvent);
    fn execution_finished(&self, event: ExecutionFinishedEvent);
    fn retry_scheduled(&self, event: RetryScheduledEvent);
}

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpTelemetrySink;

impl TelemetrySink for NoOpTelemetrySink {
    fn claimed(&self, _event: ClaimedEvent) {}
    fn stale_lease_reclaimed(&self, _event: StaleLeaseReclaimedEvent) {}
    fn execution_finished(&self, _event: ExecutionFinishedEvent) {}
    fn retry_scheduled(&self, _event: RetryScheduledEvent) {}
}
