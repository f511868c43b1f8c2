//! `CommandStore`: persistence of command records for one tenant, with
//! the atomic claim/transition/log-append operations (spec §4.2).

use crate::command::{Command, RunError};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// What the Worker decided after running the program, to be applied
/// atomically by the store (spec §4.6). The store is responsible for
/// asserting the calling worker still holds the lease before writing —
/// `SchedulerError::InvariantViolation` otherwise (spec §7).
pub enum FinalizeOutcome {
    SuccessRecurring {
        finished_at: DateTime<Utc>,
        duration_ms: i64,
        entities_touched: u64,
        next_run_at: DateTime<Utc>,
        summary: String,
    },
    SuccessOnce {
        finished_at: DateTime<Utc>,
        duration_ms: i64,
        entities_touched: u64,
        summary: String,
    },
    Failure {
        finished_at: DateTime<Utc>,
        duration_ms: i64,
        entities_touched: u64,
        error: RunError,
        retry_at: Option<DateTime<Utc>>,
    },
}

#[async_trait]
pub trait CommandStore: Send + Sync {
    /// For every record with `lease_until <= now && lease_holder !=
    /// null`, clears the lease, increments `stale_lease_count`, appends
    /// "stale lease auto-released". Idempotent; safe under concurrent
    /// callers.
    async fn sweep_stale_leases(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Atomically claims the single record with the smallest
    /// `(next_run_at, cmd_id)` among eligible records (spec §4.2's
    /// five-way predicate), setting `status = Running`, `lease_holder`,
    /// `lease_until = now + lease_ttl`, and appending a claim log line.
    async fn claim_one_due(
        &self,
        worker_label: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Command>>;

    /// Applies the outcome described in spec §4.6. `worker_label` must
    /// match the record's current `lease_holder` or this is a no-op
    /// `InvariantViolation`.
    async fn finalize(&self, cmd_id: Uuid, worker_label: &str, outcome: FinalizeOutcome) -> Result<()>;

    /// Append-only; never truncates.
    async fn append_logs(&self, cmd_id: Uuid, lines: Vec<(DateTime<Utc>, String)>) -> Result<()>;

    /// The `/set-next-run-at` effect: sets `status = Pending`, clears
    /// the lease, sets `disabled = false`, appends a log line.
    async fn set_schedule(&self, cmd_id: Uuid, next_run_at: DateTime<Utc>, reason: &str) -> Result<()>;

    /// The `/disable` effect: sets `status = Disabled`, `disabled =
    /// true`, clears the lease, appends a log line.
    async fn set_disabled(&self, cmd_id: Uuid, reason: &str) -> Result<()>;

    /// Admin entry point: sets `next_run_at = now`, `disabled = false`.
    /// Fails with `AlreadyLeased` if the record is currently leased.
    async fn run_once(&self, cmd_id: Uuid, now: DateTime<Utc>) -> Result<()>;

    /// Admin entry point: sets `status = Disabled`, `disabled = true`,
    /// regardless of current state ("any state -> external admin ->
    /// DISABLED", spec §4.6's state diagram). Does not force-stop an
    /// in-flight run (spec §5, "Cancellation").
    async fn admin_disable(&self, cmd_id: Uuid, reason: &str) -> Result<()>;

    async fn get(&self, cmd_id: Uuid) -> Result<Option<Command>>;
}
