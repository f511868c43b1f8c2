//! In-memory fakes of every `scheduler-core` port, for unit and
//! integration tests. Nothing here talks to a network or a disk; all
//! state lives behind a `tokio::sync::Mutex` so the fakes are safe to
//! share across a multi-worker `Supervisor` in a test.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use scheduler_core::{
    ClaimedEvent, Clock, Command, CommandStore, Entity, EntityMetadata, EntityQuery, EntityStore,
    ExecutionFinishedEvent, FinalizeOutcome, NewEntity, RetryScheduledEvent, SchedulerError,
    StaleLeaseReclaimedEvent, TelemetrySink, TenantId, TenantRegistry, UpdateEntity,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use uuid::Uuid;

/// A clock frozen at a fixed instant. Advance it with `.set()` between
/// test steps.
pub struct FixedClock(StdMutex<DateTime<Utc>>);

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(StdMutex::new(at))
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.0.lock().unwrap() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.0.lock().unwrap();
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

/// A clock that advances by a fixed step on every `.now()` call, useful
/// for driving a loop deterministically without real sleeps.
pub struct SteppingClock {
    nanos: AtomicI64,
    step: Duration,
}

impl SteppingClock {
    pub fn new(start: DateTime<Utc>, step: Duration) -> Self {
        Self {
            nanos: AtomicI64::new(start.timestamp_nanos_opt().unwrap_or(0)),
            step,
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let step_nanos = self.step.num_nanoseconds().unwrap_or(0);
        let prev = self.nanos.fetch_add(step_nanos, Ordering::SeqCst);
        DateTime::from_timestamp(prev / 1_000_000_000, (prev % 1_000_000_000) as u32).unwrap_or_else(Utc::now)
    }
}

/// An in-memory `CommandStore` for exactly one tenant's records.
#[derive(Default)]
pub struct InMemoryCommandStore {
    records: Mutex<HashMap<Uuid, Command>>,
}

impl InMemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, command: Command) {
        self.records.lock().await.insert(command.cmd_id, command);
    }

    pub async fn snapshot(&self, cmd_id: Uuid) -> Option<Command> {
        self.records.lock().await.get(&cmd_id).cloned()
    }
}

#[async_trait]
impl CommandStore for InMemoryCommandStore {
    async fn sweep_stale_leases(&self, now: DateTime<Utc>) -> scheduler_core::Result<u64> {
        let mut records = self.records.lock().await;
        let mut reclaimed = 0u64;
        for command in records.values_mut() {
            let stale = command.lease_holder.is_some() && command.lease_until.map(|u| u <= now).unwrap_or(false);
            if stale {
                command.status = scheduler_core::CommandStatus::Pending;
                command.lease_holder = None;
                command.lease_until = None;
                command.stale_lease_count += 1;
                command.logs.push(scheduler_core::LogLine::new(now, "stale lease auto-released"));
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn claim_one_due(
        &self,
        worker_label: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> scheduler_core::Result<Option<Command>> {
        let mut records = self.records.lock().await;
        let candidate_id = records
            .values()
            .filter(|c| {
                !c.disabled
                    && c.status == scheduler_core::CommandStatus::Pending
                    && c.next_run_at.map(|t| t <= now).unwrap_or(false)
                    && c.terminate_after.map(|t| t >= now).unwrap_or(true)
            })
            .min_by_key(|c| (c.next_run_at, c.cmd_id))
            .map(|c| c.cmd_id);

        let Some(id) = candidate_id else { return Ok(None) };
        let command = records.get_mut(&id).expect("candidate id came from this map");
        command.status = scheduler_core::CommandStatus::Running;
        command.lease_holder = Some(worker_label.to_string());
        command.lease_until = Some(now + lease_ttl);
        command.logs.push(scheduler_core::LogLine::new(now, format!("claimed by {worker_label}")));
        Ok(Some(command.clone()))
    }

    async fn finalize(&self, cmd_id: Uuid, worker_label: &str, outcome: FinalizeOutcome) -> scheduler_core::Result<()> {
        let mut records = self.records.lock().await;
        let command = records.get_mut(&cmd_id).ok_or_else(|| SchedulerError::NotFound(cmd_id.to_string()))?;
        if command.lease_holder.as_deref() != Some(worker_label) {
            return Err(SchedulerError::InvariantViolation(format!(
                "worker {worker_label} finalizing {cmd_id} without the lease"
            )));
        }
        command.lease_holder = None;
        command.lease_until = None;

        match outcome {
            FinalizeOutcome::SuccessRecurring {
                finished_at,
                duration_ms,
                entities_touched,
                next_run_at,
                summary,
            } => {
                command.status = scheduler_core::CommandStatus::Pending;
                command.next_run_at = Some(next_run_at);
                command.retry_count = 0;
                command.run_count += 1;
                command.success_count += 1;
                command.entities_touched += entities_touched;
                command.last_duration_ms = Some(duration_ms);
                command.last_executed_at = Some(finished_at);
                command.last_error_code = None;
                command.run_logs.push(scheduler_core::RunLogEntry {
                    started_at: finished_at - Duration::milliseconds(duration_ms),
                    ended_at: finished_at,
                    duration_ms,
                    entities_touched,
                    summary,
                    error: None,
                });
            }
            FinalizeOutcome::SuccessOnce {
                finished_at,
                duration_ms,
                entities_touched,
                summary,
            } => {
                command.status = scheduler_core::CommandStatus::SucceededOnce;
                command.disabled = true;
                command.next_run_at = None;
                command.run_count += 1;
                command.success_count += 1;
                command.entities_touched += entities_touched;
                command.last_duration_ms = Some(duration_ms);
                command.last_executed_at = Some(finished_at);
                command.last_error_code = None;
                command.run_logs.push(scheduler_core::RunLogEntry {
                    started_at: finished_at - Duration::milliseconds(duration_ms),
                    ended_at: finished_at,
                    duration_ms,
                    entities_touched,
                    summary,
                    error: None,
                });
            }
            FinalizeOutcome::Failure {
                finished_at,
                duration_ms,
                entities_touched,
                error,
                retry_at,
            } => {
                command.run_count += 1;
                command.failure_count += 1;
                command.entities_touched += entities_touched;
                command.last_duration_ms = Some(duration_ms);
                command.last_executed_at = Some(finished_at);
                command.last_error_code = Some(error.code.clone());
                match retry_at {
                    Some(at) => {
                        command.status = scheduler_core::CommandStatus::Pending;
                        command.next_run_at = Some(at);
                        command.retry_count += 1;
                    }
                    None => {
                        command.status = scheduler_core::CommandStatus::Failed;
                        command.next_run_at = None;
                    }
                }
                command.run_logs.push(scheduler_core::RunLogEntry {
                    started_at: finished_at - Duration::milliseconds(duration_ms),
                    ended_at: finished_at,
                    duration_ms,
                    entities_touched,
                    summary: "failed".to_string(),
                    error: Some(error),
                });
            }
        }
        Ok(())
    }

    async fn append_logs(&self, cmd_id: Uuid, lines: Vec<(DateTime<Utc>, String)>) -> scheduler_core::Result<()> {
        let mut records = self.records.lock().await;
        let command = records.get_mut(&cmd_id).ok_or_else(|| SchedulerError::NotFound(cmd_id.to_string()))?;
        for (at, message) in lines {
            command.logs.push(scheduler_core::LogLine::new(at, message));
        }
        Ok(())
    }

    async fn set_schedule(&self, cmd_id: Uuid, next_run_at: DateTime<Utc>, reason: &str) -> scheduler_core::Result<()> {
        let mut records = self.records.lock().await;
        let command = records.get_mut(&cmd_id).ok_or_else(|| SchedulerError::NotFound(cmd_id.to_string()))?;
        command.status = scheduler_core::CommandStatus::Pending;
        command.lease_holder = None;
        command.lease_until = None;
        command.disabled = false;
        command.next_run_at = Some(next_run_at);
        command.logs.push(scheduler_core::LogLine::new(next_run_at, format!("next run set: {reason}")));
        Ok(())
    }

    async fn set_disabled(&self, cmd_id: Uuid, reason: &str) -> scheduler_core::Result<()> {
        let mut records = self.records.lock().await;
        let command = records.get_mut(&cmd_id).ok_or_else(|| SchedulerError::NotFound(cmd_id.to_string()))?;
        command.status = scheduler_core::CommandStatus::Disabled;
        command.disabled = true;
        command.lease_holder = None;
        command.lease_until = None;
        command.logs.push(scheduler_core::LogLine::new(Utc::now(), format!("disabled: {reason}")));
        Ok(())
    }

    async fn run_once(&self, cmd_id: Uuid, now: DateTime<Utc>) -> scheduler_core::Result<()> {
        let mut records = self.records.lock().await;
        let command = records.get_mut(&cmd_id).ok_or_else(|| SchedulerError::NotFound(cmd_id.to_string()))?;
        if command.lease_holder.is_some() {
            return Err(SchedulerError::AlreadyLeased(cmd_id));
        }
        command.next_run_at = Some(now);
        command.disabled = false;
        if command.status == scheduler_core::CommandStatus::Disabled {
            command.status = scheduler_core::CommandStatus::Pending;
        }
        Ok(())
    }

    async fn admin_disable(&self, cmd_id: Uuid, reason: &str) -> scheduler_core::Result<()> {
        self.set_disabled(cmd_id, reason).await
    }

    async fn get(&self, cmd_id: Uuid) -> scheduler_core::Result<Option<Command>> {
        Ok(self.records.lock().await.get(&cmd_id).cloned())
    }
}

/// An in-memory `EntityStore` for exactly one tenant's entities.
#[derive(Default)]
pub struct InMemoryEntityStore {
    entities: Mutex<HashMap<String, Entity>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn upsert(&self, tenant: &TenantId, entity: NewEntity) -> scheduler_core::Result<Entity> {
        let mut entities = self.entities.lock().await;
        let id = entity.entity_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let record = Entity {
            entity_id: id.clone(),
            entity_type: entity.entity_type,
            data_blob: serde_json::to_vec(&entity.data).unwrap_or_default(),
            metadata: EntityMetadata {
                tenant_id: tenant.as_str().to_string(),
                user_id: entity.metadata.user_id,
                source: entity.metadata.source,
            },
            created_at: entities.get(&id).map(|e| e.created_at).unwrap_or_else(Utc::now),
            deleted_at: None,
        };
        entities.insert(id, record.clone());
        Ok(record)
    }

    async fn update(&self, _tenant: &TenantId, update: UpdateEntity) -> scheduler_core::Result<Entity> {
        let mut entities = self.entities.lock().await;
        let existing = entities
            .get_mut(&update.entity_id)
            .filter(|e| e.deleted_at.is_none())
            .ok_or_else(|| SchedulerError::NotFound(update.entity_id.clone()))?;
        if let Some(entity_type) = update.entity_type {
            existing.entity_type = entity_type;
        }
        existing.data_blob = serde_json::to_vec(&update.data).unwrap_or_default();
        Ok(existing.clone())
    }

    async fn soft_delete(&self, _tenant: &TenantId, entity_id: &str) -> scheduler_core::Result<Entity> {
        let mut entities = self.entities.lock().await;
        let existing = entities
            .get_mut(entity_id)
            .filter(|e| e.deleted_at.is_none())
            .ok_or_else(|| SchedulerError::NotFound(entity_id.to_string()))?;
        let before = existing.clone();
        existing.deleted_at = Some(Utc::now());
        Ok(before)
    }

    async fn find(&self, _tenant: &TenantId, query: EntityQuery) -> scheduler_core::Result<Vec<Entity>> {
        let entities = self.entities.lock().await;
        Ok(entities
            .values()
            .filter(|e| e.deleted_at.is_none())
            .filter(|e| query.ids.as_ref().map(|ids| ids.contains(&e.entity_id)).unwrap_or(true))
            .filter(|e| query.types.as_ref().map(|types| types.contains(&e.entity_type)).unwrap_or(true))
            .cloned()
            .collect())
    }
}

/// A fixed set of tenants, each backed by its own in-memory stores.
pub struct InMemoryTenantRegistry {
    tenants: Vec<TenantId>,
    command_stores: HashMap<TenantId, Arc<dyn CommandStore>>,
    entity_stores: HashMap<TenantId, Arc<dyn EntityStore>>,
}

impl InMemoryTenantRegistry {
    pub fn new() -> Self {
        Self {
            tenants: Vec::new(),
            command_stores: HashMap::new(),
            entity_stores: HashMap::new(),
        }
    }

    /// Registers a tenant in iteration order, backed by fresh in-memory
    /// stores. Returns the stores so the caller can seed records into
    /// them before running a worker.
    pub fn add_tenant(&mut self, tenant: TenantId) -> (Arc<InMemoryCommandStore>, Arc<InMemoryEntityStore>) {
        let commands = Arc::new(InMemoryCommandStore::new());
        let entities = Arc::new(InMemoryEntityStore::new());
        self.tenants.push(tenant.clone());
        self.command_stores.insert(tenant.clone(), commands.clone());
        self.entity_stores.insert(tenant, entities.clone());
        (commands, entities)
    }
}

impl Default for InMemoryTenantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TenantRegistry for InMemoryTenantRegistry {
    async fn list(&self) -> scheduler_core::Result<Vec<TenantId>> {
        Ok(self.tenants.clone())
    }

    fn command_store(&self, tenant: &TenantId) -> scheduler_core::Result<Arc<dyn CommandStore>> {
        self.command_stores
            .get(tenant)
            .cloned()
            .ok_or_else(|| SchedulerError::InvalidTenantId(tenant.as_str().to_string()))
    }

    fn entity_store(&self, tenant: &TenantId) -> scheduler_core::Result<Arc<dyn EntityStore>> {
        self.entity_stores
            .get(tenant)
            .cloned()
            .ok_or_else(|| SchedulerError::InvalidTenantId(tenant.as_str().to_string()))
    }
}

/// Accumulates every event handed to it; tests assert on `.events()`
/// after a run.
#[derive(Default)]
pub struct RecordingTelemetrySink {
    claimed: StdMutex<Vec<ClaimedEvent>>,
    stale_lease_reclaimed: StdMutex<Vec<StaleLeaseReclaimedEvent>>,
    execution_finished: StdMutex<Vec<ExecutionFinishedEvent>>,
    retry_scheduled: StdMutex<Vec<RetryScheduledEvent>>,
}

impl RecordingTelemetrySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution_finished_events(&self) -> Vec<ExecutionFinishedEvent> {
        self.execution_finished.lock().unwrap().clone()
    }

    pub fn retry_scheduled_events(&self) -> Vec<RetryScheduledEvent> {
        self.retry_scheduled.lock().unwrap().clone()
    }

    pub fn claimed_events(&self) -> Vec<ClaimedEvent> {
        self.claimed.lock().unwrap().clone()
    }

    pub fn stale_lease_events(&self) -> Vec<StaleLeaseReclaimedEvent> {
        self.stale_lease_reclaimed.lock().unwrap().clone()
    }
}

impl TelemetrySink for RecordingTelemetrySink {
    fn claimed(&self, event: ClaimedEvent) {
        self.claimed.lock().unwrap().push(event);
    }

    fn stale_lease_reclaimed(&self, event: StaleLeaseReclaimedEvent) {
        self.stale_lease_reclaimed.lock().unwrap().push(event);
    }

    fn execution_finished(&self, event: ExecutionFinishedEvent) {
        self.execution_finished.lock().unwrap().push(event);
    }

    fn retry_scheduled(&self, event: RetryScheduledEvent) {
        self.retry_scheduled.lock().unwrap().push(event);
    }
}

/// Counts calls per tenant without needing a real metrics backend.
#[derive(Default)]
pub struct RecordingMetricsSink {
    successes: StdMutex<HashMap<String, u64>>,
    failures: StdMutex<HashMap<String, u64>>,
}

impl RecordingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success_count(&self, tenant: &TenantId) -> u64 {
        *self.successes.lock().unwrap().get(tenant.as_str()).unwrap_or(&0)
    }

    pub fn failure_count(&self, tenant: &TenantId) -> u64 {
        *self.failures.lock().unwrap().get(tenant.as_str()).unwrap_or(&0)
    }
}

impl scheduler_core::MetricsSink for RecordingMetricsSink {
    fn incr_success(&self, tenant: &TenantId) {
        *self.successes.lock().unwrap().entry(tenant.as_str().to_string()).or_insert(0) += 1;
    }

    fn incr_failure(&self, tenant: &TenantId, _error_code: &scheduler_core::ErrorCode) {
        *self.failures.lock().unwrap().entry(tenant.as_str().to_string()).or_insert(0) += 1;
    }

    fn observe_duration_ms(&self, _tenant: &TenantId, _ms: i64) {}
    fn observe_entities_touched(&self, _tenant: &TenantId, _count: u64) {}
}

/// An `Evaluator` that plays back a scripted sequence of outcomes,
/// ignoring the program bytes entirely, for tests that care about the
/// Worker/Supervisor's own behavior rather than program interpretation.
pub struct ScriptedEvaluator {
    script: Mutex<std::collections::VecDeque<ScriptedRun>>,
}

pub enum ScriptedRun {
    Outcome(scheduler_core::EvalOutcome),
    Error(scheduler_core::EvalError),
    /// Sleeps longer than the run's budget, to exercise timeout handling.
    Hang,
}

impl ScriptedEvaluator {
    pub fn new(script: Vec<ScriptedRun>) -> Self {
        Self {
            script: Mutex::new(script.into()),
        }
    }
}

#[async_trait]
impl scheduler_core::Evaluator for ScriptedEvaluator {
    async fn run(
        &self,
        _program: &[u8],
        _effects: Arc<scheduler_core::EffectTable>,
        budget: std::time::Duration,
    ) -> Result<scheduler_core::EvalOutcome, scheduler_core::EvalError> {
        let next = self.script.lock().await.pop_front();
        match next {
            Some(ScriptedRun::Outcome(outcome)) => Ok(outcome),
            Some(ScriptedRun::Error(err)) => Err(err),
            Some(ScriptedRun::Hang) => {
                tokio::time::sleep(budget + std::time::Duration::from_secs(1)).await;
                Ok(scheduler_core::EvalOutcome::Completed)
            }
            None => Ok(scheduler_core::EvalOutcome::Completed),
        }
    }
}
