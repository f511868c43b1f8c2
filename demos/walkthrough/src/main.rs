//! Runs the scheduler against in-memory fakes: one recurring command,
//! one one-shot command that disables itself mid-run, and one command
//! that fails until it exhausts its retries. Prints each command's
//! bookkeeping after a handful of ticks so the state machine can be
//! watched end to end without a database.

use chrono::{Duration, Utc};
use scheduler_cipher::{seal, AeadCipher};
use scheduler_core::{
    Action, Command, Config, DecryptKey, NoOpMetricsSink, NoOpTelemetrySink, StdCronPlanner, SystemClock, TenantId,
    Worker,
};
use scheduler_evaluator_json::JsonEvaluator;
use scheduler_testing::InMemoryTenantRegistry;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use uuid::Uuid;

fn program(ops: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&ops).expect("ops is always valid json")
}

fn make_command(tenant: &TenantId, action: Action, program_ops: serde_json::Value, key: &DecryptKey) -> Command {
    let now = Utc::now();
    let ciphertext = seal(&program(program_ops), key);
    let new = scheduler_core::NewCommand {
        cmd_id: Uuid::new_v4(),
        tenant_id: tenant.clone(),
        user_id: "demo-user".to_string(),
        source: "walkthrough".to_string(),
        ciphertext,
        action,
        cron_expr: Some("*/1 * * * *".to_string()),
        next_run_at: Some(now),
        terminate_after: None,
        max_retries: 2,
        retry_backoff: Duration::milliseconds(10),
    };
    Command::normalize(new, now, &StdCronPlanner).expect("normalize never fails for a valid cron expr")
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let key = Arc::new(DecryptKey([42u8; 32]));
    let tenant = TenantId::new("acme").unwrap();

    let mut registry = InMemoryTenantRegistry::new();
    let (commands, _entities) = registry.add_tenant(tenant.clone());

    let recurring = make_command(&tenant, Action::RegisterRecurring, serde_json::json!([
        {"op": "add_object", "entity_type": "heartbeat", "data": {"n": 1}},
        {"op": "log", "message": "heartbeat recorded"}
    ]), &key);

    let one_shot = make_command(&tenant, Action::RunOnce, serde_json::json!([
        {"op": "add_object", "entity_type": "report", "data": {"kind": "final"}},
        {"op": "disable", "reason": "one-shot reports never recur"}
    ]), &key);

    let doomed = make_command(&tenant, Action::RunNowThenRecur, serde_json::json!([
        {"op": "fail", "message": "upstream unavailable", "code": "UPSTREAM_DOWN"}
    ]), &key);

    let recurring_id = recurring.cmd_id;
    let one_shot_id = one_shot.cmd_id;
    let doomed_id = doomed.cmd_id;

    commands.insert(recurring).await;
    commands.insert(one_shot).await;
    commands.insert(doomed).await;

    let worker = Worker::new(
        "demo-worker-1",
        Arc::new(registry) as Arc<dyn scheduler_core::TenantRegistry>,
        Arc::new(AeadCipher::new()),
        key,
        Arc::new(JsonEvaluator::new()),
        Arc::new(SystemClock),
        Arc::new(StdCronPlanner),
        Config::default(),
        Arc::new(NoOpMetricsSink),
        Arc::new(NoOpTelemetrySink),
        scheduler_core::PassthroughPorts::default(),
    );

    // Enough ticks to drain all three due commands, plus the doomed
    // command's two retries.
    for _ in 0..6 {
        let _ = worker.tick().await;
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }

    for (label, id) in [("recurring", recurring_id), ("one-shot", one_shot_id), ("doomed", doomed_id)] {
        if let Some(cmd) = commands.snapshot(id).await {
            println!(
                "{label}: status={:?} success_count={} failure_count={} retry_count={} next_run_at={:?}",
                cmd.status, cmd.success_count, cmd.failure_count, cmd.retry_count, cmd.next_run_at
            );
        }
    }
}
