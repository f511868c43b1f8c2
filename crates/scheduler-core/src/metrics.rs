//! `MetricsSink`: write-only counter/histogram sink for
//! success/failure/duration/bytes-touched (spec §2.11). Implementation
//! is external; the core only ever writes.

use crate::error::ErrorCode;
use crate::tenant::TenantId;

pub trait MetricsSink: Send + Sync {
    fn incr_success(&self, tenant: &TenantId);
    fn incr_failure(&self, tenant: &TenantId, error_code: &ErrorCode);
    fn observe_duration_ms(&self, tenant: &TenantId, ms: i64);
    fn observe_entities_touched(&self, tenant: &TenantId, count: u64);
}

/// Drops everything. Used where a caller hasn't wired a real sink yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetricsSink;

impl MetricsSink for NoOpMetricsSink {
    fn incr_success(&self, _tenant: &TenantId) {}
    fn incr_failure(&self, _tenant: &TenantId, _error_code: &ErrorCode) {}
    fn observe_duration_ms(&self, _tenant: &TenantId, _ms: i64) {}
    fn observe_entities_touched(&self, _tenant: &TenantId, _count: u64) {}
}
