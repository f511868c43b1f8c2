//! End-to-end scenarios driving a real `Worker` against the in-memory
//! fakes from `scheduler-testing`. Decryption uses a pass-through test
//! cipher (ciphertext *is* the plaintext) so these tests don't need a
//! real AEAD implementation to exercise the rest of the pipeline.

use chrono::{Duration, Utc};
use scheduler_core::{
    Action, Cipher, CipherEnvelope, Command, CommandStatus, CommandStore, Config, DecryptKey, NewCommand,
    NoOpMetricsSink, PassthroughPorts, StdCronPlanner, TenantId, TenantRegistry, Worker,
};
use scheduler_evaluator_json_stub::JsonLikeEvaluator;
use scheduler_testing::{FixedClock, InMemoryTenantRegistry, RecordingMetricsSink, RecordingTelemetrySink, ScriptedRun};
use std::sync::Arc;
use uuid::Uuid;

/// Ciphertext is the plaintext program bytes, unmodified. Exists only so
/// these tests don't need to depend on the real AEAD crate.
struct PassthroughCipher;

impl Cipher for PassthroughCipher {
    fn decrypt(&self, envelope: &CipherEnvelope, _key: &DecryptKey) -> scheduler_core::Result<Vec<u8>> {
        Ok(envelope.ciphertext.clone())
    }
}

fn envelope(plaintext: &[u8]) -> CipherEnvelope {
    CipherEnvelope {
        ciphertext: plaintext.to_vec(),
        iv: vec![],
        tag: vec![],
    }
}

fn program(ops: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&ops).unwrap()
}

/// Interprets the same op shapes as `scheduler-evaluator-json`, without
/// the dependency — enough to exercise add-object / log / disable /
/// set-next-run-at / failure-with-code end to end.
mod scheduler_evaluator_json_stub {
    use async_trait::async_trait;
    use scheduler_core::{
        AddObjectInput, ControlSignal, EffectTable, EvalError, EvalOutcome, Evaluator, ProgramError,
    };
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    pub struct JsonLikeEvaluator;

    #[async_trait]
    impl Evaluator for JsonLikeEvaluator {
        async fn run(&self, program: &[u8], effects: Arc<EffectTable>, _budget: Duration) -> Result<EvalOutcome, EvalError> {
            let ops: Vec<Value> = serde_json::from_slice(program).map_err(|e| {
                EvalError::Program(ProgramError {
                    message: e.to_string(),
                    code: Some("MALFORMED_PROGRAM".to_string()),
                    stack: None,
                })
            })?;

            for op in ops {
                let kind = op.get("op").and_then(Value::as_str).unwrap_or_default();
                match kind {
                    "add_object" => {
                        effects
                            .add_object(AddObjectInput {
                                id: None,
                                entity_type: op["entity_type"].as_str().unwrap_or_default().to_string(),
                                data: op["data"].clone(),
                            })
                            .await
                            .map_err(|e| EvalError::Program(ProgramError { message: e.to_string(), code: None, stack: None }))?;
                    }
                    "log" => {
                        effects.log(chrono::Utc::now(), op["message"].as_str().unwrap_or_default().to_string()).await;
                    }
                    "disable" => {
                        effects.disable(op["reason"].as_str().unwrap_or_default().to_string());
                        return Ok(EvalOutcome::Signal(ControlSignal::CommandDisabled {
                            reason: op["reason"].as_str().unwrap_or_default().to_string(),
                        }));
                    }
                    "fail" => {
                        return Err(EvalError::Program(ProgramError {
                            message: op["message"].as_str().unwrap_or_default().to_string(),
                            code: op["code"].as_str().map(str::to_string),
                            stack: None,
                        }));
                    }
                    other => panic!("unknown test op {other}"),
                }
            }
            Ok(EvalOutcome::Completed)
        }
    }
}

fn recurring_command(tenant: &TenantId, next_run_at: chrono::DateTime<Utc>) -> Command {
    let new = NewCommand {
        cmd_id: Uuid::new_v4(),
        tenant_id: tenant.clone(),
        user_id: "u1".into(),
        source: "test".into(),
        ciphertext: envelope(&program(serde_json::json!([
            {"op": "add_object", "entity_type": "note", "data": {"n": 1}},
            {"op": "log", "message": "ran"}
        ]))),
        action: Action::RegisterRecurring,
        cron_expr: Some("*/5 * * * *".to_string()),
        next_run_at: Some(next_run_at),
        terminate_after: None,
        max_retries: 3,
        retry_backoff: Duration::seconds(30),
    };
    Command::normalize(new, next_run_at, &StdCronPlanner).unwrap()
}

fn worker_for(
    registry: Arc<dyn TenantRegistry>,
    clock: Arc<FixedClock>,
    evaluator: Arc<JsonLikeEvaluator>,
    telemetry: Arc<RecordingTelemetrySink>,
    metrics: Arc<RecordingMetricsSink>,
) -> Worker {
    Worker::new(
        "w1",
        registry,
        Arc::new(PassthroughCipher),
        Arc::new(DecryptKey([0u8; 32])),
        evaluator,
        clock,
        Arc::new(StdCronPlanner),
        Config::default(),
        metrics,
        telemetry,
        PassthroughPorts::default(),
    )
}

#[tokio::test]
async fn recurring_command_reschedules_after_success() {
    let tenant = TenantId::new("acme").unwrap();
    let now = Utc::now();
    let mut registry = InMemoryTenantRegistry::new();
    let (store, _entities) = registry.add_tenant(tenant.clone());
    let cmd = recurring_command(&tenant, now);
    let cmd_id = cmd.cmd_id;
    store.insert(cmd).await;

    let clock = Arc::new(FixedClock::new(now));
    let telemetry = Arc::new(RecordingTelemetrySink::new());
    let metrics = Arc::new(RecordingMetricsSink::new());
    let worker = worker_for(
        Arc::new(registry),
        clock.clone(),
        Arc::new(scheduler_evaluator_json_stub::JsonLikeEvaluator),
        telemetry.clone(),
        metrics.clone(),
    );

    let outcome = worker.tick().await.unwrap();
    assert_eq!(outcome, scheduler_core::TickOutcome::Claimed);

    let after = store.snapshot(cmd_id).await.unwrap();
    assert_eq!(after.status, CommandStatus::Pending);
    assert_eq!(after.success_count, 1);
    assert!(after.next_run_at.unwrap() > now);
    assert_eq!(metrics.success_count(&tenant), 1);
    assert_eq!(telemetry.execution_finished_events().len(), 1);
}

#[tokio::test]
async fn one_shot_disables_itself_and_still_counts_as_succeeded() {
    let tenant = TenantId::new("acme").unwrap();
    let now = Utc::now();
    let new = NewCommand {
        cmd_id: Uuid::new_v4(),
        tenant_id: tenant.clone(),
        user_id: "u1".into(),
        source: "test".into(),
        ciphertext: envelope(&program(serde_json::json!([
            {"op": "add_object", "entity_type": "report", "data": {}},
            {"op": "disable", "reason": "one-shot done"}
        ]))),
        action: Action::RunOnce,
        cron_expr: None,
        next_run_at: Some(now),
        terminate_after: None,
        max_retries: 0,
        retry_backoff: Duration::seconds(0),
    };
    let cmd = Command::normalize(new, now, &StdCronPlanner).unwrap();
    let cmd_id = cmd.cmd_id;

    let mut registry = InMemoryTenantRegistry::new();
    let (store, _entities) = registry.add_tenant(tenant.clone());
    store.insert(cmd).await;

    let clock = Arc::new(FixedClock::new(now));
    let worker = worker_for(
        Arc::new(registry),
        clock,
        Arc::new(scheduler_evaluator_json_stub::JsonLikeEvaluator),
        Arc::new(RecordingTelemetrySink::new()),
        Arc::new(RecordingMetricsSink::new()),
    );

    worker.tick().await.unwrap();

    let after = store.snapshot(cmd_id).await.unwrap();
    assert_eq!(after.success_count, 1, "the success finalize still ran");
    assert_eq!(after.status, CommandStatus::Disabled, "the disable signal overrides the terminal status");
    assert!(after.disabled);
}

#[tokio::test]
async fn one_shot_success_with_no_disable_op_still_disables_itself() {
    let tenant = TenantId::new("acme").unwrap();
    let now = Utc::now();
    let new = NewCommand {
        cmd_id: Uuid::new_v4(),
        tenant_id: tenant.clone(),
        user_id: "u1".into(),
        source: "test".into(),
        ciphertext: envelope(&program(serde_json::json!([
            {"op": "add_object", "entity_type": "report", "data": {}}
        ]))),
        action: Action::RunOnce,
        cron_expr: None,
        next_run_at: Some(now),
        terminate_after: None,
        max_retries: 0,
        retry_backoff: Duration::seconds(0),
    };
    let cmd = Command::normalize(new, now, &StdCronPlanner).unwrap();
    let cmd_id = cmd.cmd_id;

    let mut registry = InMemoryTenantRegistry::new();
    let (store, _entities) = registry.add_tenant(tenant.clone());
    store.insert(cmd).await;

    let clock = Arc::new(FixedClock::new(now));
    let worker = worker_for(
        Arc::new(registry),
        clock,
        Arc::new(scheduler_evaluator_json_stub::JsonLikeEvaluator),
        Arc::new(RecordingTelemetrySink::new()),
        Arc::new(RecordingMetricsSink::new()),
    );

    worker.tick().await.unwrap();

    let after = store.snapshot(cmd_id).await.unwrap();
    assert_eq!(after.status, CommandStatus::SucceededOnce);
    assert!(after.disabled, "a one-shot must disable itself on success even without an explicit disable op");
    assert_eq!(after.run_count, 1);
    assert_eq!(after.success_count, 1);
    assert_eq!(after.next_run_at, None);
}

#[tokio::test]
async fn failure_retries_until_exhausted_then_terminates() {
    let tenant = TenantId::new("acme").unwrap();
    let now = Utc::now();
    let new = NewCommand {
        cmd_id: Uuid::new_v4(),
        tenant_id: tenant.clone(),
        user_id: "u1".into(),
        source: "test".into(),
        ciphertext: envelope(&program(serde_json::json!([
            {"op": "fail", "message": "boom", "code": "UPSTREAM_DOWN"}
        ]))),
        action: Action::RunOnce,
        cron_expr: None,
        next_run_at: Some(now),
        terminate_after: None,
        max_retries: 1,
        retry_backoff: Duration::milliseconds(0),
    };
    let cmd = Command::normalize(new, now, &StdCronPlanner).unwrap();
    let cmd_id = cmd.cmd_id;

    let mut registry = InMemoryTenantRegistry::new();
    let (store, _entities) = registry.add_tenant(tenant.clone());
    store.insert(cmd).await;

    let clock = Arc::new(FixedClock::new(now));
    let registry: Arc<dyn TenantRegistry> = Arc::new(registry);
    let worker = worker_for(
        registry,
        clock,
        Arc::new(scheduler_evaluator_json_stub::JsonLikeEvaluator),
        Arc::new(RecordingTelemetrySink::new()),
        Arc::new(RecordingMetricsSink::new()),
    );

    // First failure: retry_count 0 -> 1, still <= max_retries(1), so scheduled for retry.
    worker.tick().await.unwrap();
    let after_first = store.snapshot(cmd_id).await.unwrap();
    assert_eq!(after_first.status, CommandStatus::Pending);
    assert_eq!(after_first.retry_count, 1);
    assert_eq!(after_first.failure_count, 1);

    // Second failure: retry_count 1 -> 2, exceeds max_retries(1), terminal.
    worker.tick().await.unwrap();
    let after_second = store.snapshot(cmd_id).await.unwrap();
    assert_eq!(after_second.status, CommandStatus::Failed);
    assert_eq!(after_second.failure_count, 2);
    assert_eq!(after_second.last_error_code.as_deref(), Some("UPSTREAM_DOWN"));
}

#[tokio::test]
async fn stale_lease_is_reclaimed_and_reclaimable_by_another_worker() {
    let tenant = TenantId::new("acme").unwrap();
    let now = Utc::now();
    let mut registry = InMemoryTenantRegistry::new();
    let (store, _entities) = registry.add_tenant(tenant.clone());

    let cmd = recurring_command(&tenant, now);
    let cmd_id = cmd.cmd_id;
    store.insert(cmd).await;

    // Simulate a crashed worker: claim the record directly, then let
    // time pass the lease TTL without ever finalizing it.
    store
        .claim_one_due("dead-worker", Duration::milliseconds(1), now)
        .await
        .unwrap()
        .expect("claim succeeds");

    let later = now + Duration::seconds(5);
    let reclaimed = store.sweep_stale_leases(later).await.unwrap();
    assert_eq!(reclaimed, 1);

    let after = store.snapshot(cmd_id).await.unwrap();
    assert_eq!(after.status, CommandStatus::Pending);
    assert!(after.lease_holder.is_none());
    assert_eq!(after.stale_lease_count, 1);

    // A live worker can now claim it.
    let reclaim = store.claim_one_due("worker-2", Duration::seconds(60), later).await.unwrap();
    assert!(reclaim.is_some());
}

#[tokio::test]
async fn claim_is_exclusive_under_concurrent_workers() {
    let tenant = TenantId::new("acme").unwrap();
    let now = Utc::now();
    let mut registry = InMemoryTenantRegistry::new();
    let (store, _entities) = registry.add_tenant(tenant.clone());
    let cmd = recurring_command(&tenant, now);
    store.insert(cmd).await;

    let (a, b) = tokio::join!(
        store.claim_one_due("worker-a", Duration::seconds(60), now),
        store.claim_one_due("worker-b", Duration::seconds(60), now)
    );
    let claims = [a.unwrap(), b.unwrap()];
    let claimed_count = claims.iter().filter(|c| c.is_some()).count();
    assert_eq!(claimed_count, 1, "exactly one concurrent claimant should win the record");
}

#[tokio::test]
async fn disabled_command_is_never_claimed() {
    let tenant = TenantId::new("acme").unwrap();
    let now = Utc::now();
    let new = NewCommand {
        cmd_id: Uuid::new_v4(),
        tenant_id: tenant.clone(),
        user_id: "u1".into(),
        source: "test".into(),
        ciphertext: envelope(&program(serde_json::json!([]))),
        action: Action::RegisterDisabled,
        cron_expr: None,
        next_run_at: Some(now),
        terminate_after: None,
        max_retries: 0,
        retry_backoff: Duration::seconds(0),
    };
    let cmd = Command::normalize(new, now, &StdCronPlanner).unwrap();

    let mut registry = InMemoryTenantRegistry::new();
    let (store, _entities) = registry.add_tenant(tenant.clone());
    store.insert(cmd).await;

    let claimed = store
        .claim_one_due("w1", Duration::seconds(60), now)
        .await
        .unwrap();
    assert!(claimed.is_none(), "a disabled command must never be claimable");
}

#[tokio::test]
async fn budget_timeout_is_recorded_as_a_failure() {
    let tenant = TenantId::new("acme").unwrap();
    let now = Utc::now();
    let new = NewCommand {
        cmd_id: Uuid::new_v4(),
        tenant_id: tenant.clone(),
        user_id: "u1".into(),
        source: "test".into(),
        ciphertext: envelope(b"irrelevant, the scripted evaluator ignores program bytes"),
        action: Action::RunOnce,
        cron_expr: None,
        next_run_at: Some(now),
        terminate_after: None,
        max_retries: 0,
        retry_backoff: Duration::seconds(0),
    };
    let cmd = Command::normalize(new, now, &StdCronPlanner).unwrap();
    let cmd_id = cmd.cmd_id;

    let mut registry = InMemoryTenantRegistry::new();
    let (store, _entities) = registry.add_tenant(tenant.clone());
    store.insert(cmd).await;

    let mut config = Config::default();
    config.evaluator_budget_ms = 5;

    let worker = Worker::new(
        "w1",
        Arc::new(registry) as Arc<dyn TenantRegistry>,
        Arc::new(PassthroughCipher),
        Arc::new(DecryptKey([0u8; 32])),
        Arc::new(scheduler_testing::ScriptedEvaluator::new(vec![ScriptedRun::Hang])),
        Arc::new(FixedClock::new(now)),
        Arc::new(StdCronPlanner),
        config,
        Arc::new(NoOpMetricsSink),
        Arc::new(RecordingTelemetrySink::new()),
        PassthroughPorts::default(),
    );

    worker.tick().await.unwrap();
    let after = store.snapshot(cmd_id).await.unwrap();
    assert_eq!(after.status, CommandStatus::Failed);
    assert_eq!(after.last_error_code.as_deref(), Some("TIMEOUT"));
}
