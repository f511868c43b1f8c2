//! PostgreSQL implementation of the scheduler's `CommandStore` port.
//!
//! # Database schema
//!
//! ```sql
//! CREATE TYPE command_action AS ENUM (
//!     'register_recurring', 'run_now_then_recur', 'run_once',
//!     'register_disabled', 'register_active'
//! );
//! CREATE TYPE command_status AS ENUM (
//!     'pending', 'running', 'succeeded_once', 'failed', 'disabled'
//! );
//!
//! CREATE TABLE commands (
//!     cmd_id UUID PRIMARY KEY,
//!     tenant_id TEXT NOT NULL,
//!     user_id TEXT NOT NULL,
//!     source TEXT NOT NULL,
//!
//!     ciphertext BYTEA NOT NULL,
//!     iv BYTEA NOT NULL,
//!     tag BYTEA NOT NULL,
//!
//!     action command_action NOT NULL,
//!     cron_expr TEXT,
//!     next_run_at TIMESTAMPTZ,
//!     terminate_after TIMESTAMPTZ,
//!     disabled BOOLEAN NOT NULL DEFAULT FALSE,
//!     status command_status NOT NULL DEFAULT 'pending',
//!
//!     lease_holder TEXT,
//!     lease_until TIMESTAMPTZ,
//!
//!     retry_count INTEGER NOT NULL DEFAULT 0,
//!     max_retries INTEGER NOT NULL DEFAULT 0,
//!     retry_backoff_ms BIGINT NOT NULL DEFAULT 0,
//!
//!     run_count BIGINT NOT NULL DEFAULT 0,
//!     success_count BIGINT NOT NULL DEFAULT 0,
//!     failure_count BIGINT NOT NULL DEFAULT 0,
//!     entities_touched BIGINT NOT NULL DEFAULT 0,
//!     last_duration_ms BIGINT,
//!     last_executed_at TIMESTAMPTZ,
//!     last_error_code TEXT,
//!     stale_lease_count BIGINT NOT NULL DEFAULT 0,
//!
//!     logs JSONB NOT NULL DEFAULT '[]',
//!     run_logs JSONB NOT NULL DEFAULT '[]',
//!     action_applied_at TIMESTAMPTZ,
//!
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE INDEX idx_commands_claimable ON commands (tenant_id, next_run_at, cmd_id)
//!     WHERE status = 'pending' AND disabled = FALSE;
//! CREATE INDEX idx_commands_lease ON commands (tenant_id, lease_until)
//!     WHERE lease_holder IS NOT NULL;
//! ```
//!
//! Each `PgCommandStore` is scoped to a single tenant; the registry that
//! hands them out is responsible for passing the right `tenant_id` at
//! construction.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use scheduler_core::{
    Action, CipherEnvelope, Command, CommandStatus, CommandStore, FinalizeOutcome, LogLine, RunError,
    RunLogEntry, SchedulerError, TenantId,
};
use sqlx::{PgPool, Row};
use uuid::Uuid;

fn transient(err: sqlx::Error) -> SchedulerError {
    SchedulerError::transient(err)
}

#[derive(Clone)]
pub struct PgCommandStore {
    pool: PgPool,
    tenant: TenantId,
}

impl PgCommandStore {
    pub fn new(pool: PgPool, tenant: TenantId) -> Self {
        Self { pool, tenant }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn action_from_sql(s: &str) -> Action {
    match s {
        "register_recurring" => Action::RegisterRecurring,
        "run_now_then_recur" => Action::RunNowThenRecur,
        "run_once" => Action::RunOnce,
        "register_disabled" => Action::RegisterDisabled,
        _ => Action::RegisterActive,
    }
}

fn status_from_sql(s: &str) -> CommandStatus {
    match s {
        "running" => CommandStatus::Running,
        "succeeded_once" => CommandStatus::SucceededOnce,
        "failed" => CommandStatus::Failed,
        "disabled" => CommandStatus::Disabled,
        _ => CommandStatus::Pending,
    }
}

fn row_to_command(row: &sqlx::postgres::PgRow) -> Result<Command, SchedulerError> {
    let tenant_id = TenantId::new(row.try_get::<String, _>("tenant_id").map_err(transient)?)?;
    let logs_json: serde_json::Value = row.try_get("logs").map_err(transient)?;
    let run_logs_json: serde_json::Value = row.try_get("run_logs").map_err(transient)?;
    let logs: Vec<LogLine> = serde_json::from_value(logs_json).unwrap_or_default();
    let run_logs: Vec<RunLogEntry> = serde_json::from_value(run_logs_json).unwrap_or_default();
    let retry_backoff_ms: i64 = row.try_get("retry_backoff_ms").map_err(transient)?;

    Ok(Command {
        cmd_id: row.try_get("cmd_id").map_err(transient)?,
        tenant_id,
        user_id: row.try_get("user_id").map_err(transient)?,
        source: row.try_get("source").map_err(transient)?,
        ciphertext: CipherEnvelope {
            ciphertext: row.try_get("ciphertext").map_err(transient)?,
            iv: row.try_get("iv").map_err(transient)?,
            tag: row.try_get("tag").map_err(transient)?,
        },
        action: action_from_sql(row.try_get::<String, _>("action").map_err(transient)?.as_str()),
        cron_expr: row.try_get("cron_expr").map_err(transient)?,
        next_run_at: row.try_get("next_run_at").map_err(transient)?,
        terminate_after: row.try_get("terminate_after").map_err(transient)?,
        disabled: row.try_get("disabled").map_err(transient)?,
        status: status_from_sql(row.try_get::<String, _>("status").map_err(transient)?.as_str()),
        lease_holder: row.try_get("lease_holder").map_err(transient)?,
        lease_until: row.try_get("lease_until").map_err(transient)?,
        retry_count: row.try_get::<i32, _>("retry_count").map_err(transient)? as u32,
        max_retries: row.try_get::<i32, _>("max_retries").map_err(transient)? as u32,
        retry_backoff: Duration::milliseconds(retry_backoff_ms),
        run_count: row.try_get::<i64, _>("run_count").map_err(transient)? as u64,
        success_count: row.try_get::<i64, _>("success_count").map_err(transient)? as u64,
        failure_count: row.try_get::<i64, _>("failure_count").map_err(transient)? as u64,
        entities_touched: row.try_get::<i64, _>("entities_touched").map_err(transient)? as u64,
        last_duration_ms: row.try_get("last_duration_ms").map_err(transient)?,
        last_executed_at: row.try_get("last_executed_at").map_err(transient)?,
        last_error_code: row.try_get("last_error_code").map_err(transient)?,
        stale_lease_count: row.try_get::<i64, _>("stale_lease_count").map_err(transient)? as u64,
        logs,
        run_logs,
        action_applied_at: row.try_get("action_applied_at").map_err(transient)?,
    })
}

#[async_trait]
impl CommandStore for PgCommandStore {
    async fn sweep_stale_leases(&self, now: DateTime<Utc>) -> scheduler_core::Result<u64> {
        let log_line = serde_json::json!([{"at": now, "message": "stale lease auto-released"}]);
        let result = sqlx::query(
            r#"
            UPDATE commands
            SET status = 'pending',
                lease_holder = NULL,
                lease_until = NULL,
                stale_lease_count = stale_lease_count + 1,
                logs = logs || $3::jsonb,
                updated_at = NOW()
            WHERE tenant_id = $1
              AND lease_holder IS NOT NULL
              AND lease_until <= $2
            "#,
        )
        .bind(self.tenant.as_str())
        .bind(now)
        .bind(log_line)
        .execute(&self.pool)
        .await
        .map_err(transient)?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            tracing::debug!(tenant = self.tenant.as_str(), reclaimed, "swept stale leases");
        }
        Ok(reclaimed)
    }

    async fn claim_one_due(
        &self,
        worker_label: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> scheduler_core::Result<Option<Command>> {
        let lease_until = now + lease_ttl;
        let log_line = serde_json::json!([{"at": now, "message": format!("claimed by {worker_label}")}]);

        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT cmd_id
                FROM commands
                WHERE tenant_id = $1
                  AND disabled = FALSE
                  AND status = 'pending'
                  AND next_run_at <= $2
                  AND (terminate_after IS NULL OR terminate_after >= $2)
                ORDER BY next_run_at ASC, cmd_id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE commands
            SET status = 'running',
                lease_holder = $3,
                lease_until = $4,
                logs = logs || $5::jsonb,
                updated_at = NOW()
            WHERE cmd_id IN (SELECT cmd_id FROM claimable)
            RETURNING *
            "#,
        )
        .bind(self.tenant.as_str())
        .bind(now)
        .bind(worker_label)
        .bind(lease_until)
        .bind(log_line)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;

        if let Some(r) = &row {
            let cmd_id: Uuid = r.try_get("cmd_id").map_err(transient)?;
            tracing::debug!(tenant = self.tenant.as_str(), %cmd_id, worker_label, "claimed command");
        }
        row.map(|r| row_to_command(&r)).transpose()
    }

    async fn finalize(&self, cmd_id: Uuid, worker_label: &str, outcome: FinalizeOutcome) -> scheduler_core::Result<()> {
        let mut tx = self.pool.begin().await.map_err(transient)?;

        let lease_row = sqlx::query("SELECT lease_holder FROM commands WHERE cmd_id = $1 AND tenant_id = $2 FOR UPDATE")
            .bind(cmd_id)
            .bind(self.tenant.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(transient)?
            .ok_or_else(|| SchedulerError::NotFound(cmd_id.to_string()))?;

        let lease_holder: Option<String> = lease_row.try_get("lease_holder").map_err(transient)?;
        if lease_holder.as_deref() != Some(worker_label) {
            return Err(SchedulerError::InvariantViolation(format!(
                "worker {worker_label} finalizing {cmd_id} without the lease"
            )));
        }

        match outcome {
            FinalizeOutcome::SuccessRecurring {
                finished_at,
                duration_ms,
                entities_touched,
                next_run_at,
                summary,
            } => {
                let run_log = run_log_json(finished_at, duration_ms, entities_touched, &summary, None);
                sqlx::query(
                    r#"
                    UPDATE commands
                    SET status = 'pending',
                        lease_holder = NULL,
                        lease_until = NULL,
                        next_run_at = $3,
                        retry_count = 0,
                        run_count = run_count + 1,
                        success_count = success_count + 1,
                        entities_touched = entities_touched + $4,
                        last_duration_ms = $5,
                        last_executed_at = $6,
                        last_error_code = NULL,
                        run_logs = run_logs || $7::jsonb,
                        updated_at = NOW()
                    WHERE cmd_id = $1 AND tenant_id = $2
                    "#,
                )
                .bind(cmd_id)
                .bind(self.tenant.as_str())
                .bind(next_run_at)
                .bind(entities_touched as i64)
                .bind(duration_ms)
                .bind(finished_at)
                .bind(run_log)
                .execute(&mut *tx)
                .await
                .map_err(transient)?;
            }
            FinalizeOutcome::SuccessOnce {
                finished_at,
                duration_ms,
                entities_touched,
                summary,
            } => {
                let run_log = run_log_json(finished_at, duration_ms, entities_touched, &summary, None);
                sqlx::query(
                    r#"
                    UPDATE commands
                    SET status = 'succeeded_once',
                        disabled = TRUE,
                        lease_holder = NULL,
                        lease_until = NULL,
                        next_run_at = NULL,
                        run_count = run_count + 1,
                        success_count = success_count + 1,
                        entities_touched = entities_touched + $3,
                        last_duration_ms = $4,
                        last_executed_at = $5,
                        last_error_code = NULL,
                        run_logs = run_logs || $6::jsonb,
                        updated_at = NOW()
                    WHERE cmd_id = $1 AND tenant_id = $2
                    "#,
                )
                .bind(cmd_id)
                .bind(self.tenant.as_str())
                .bind(entities_touched as i64)
                .bind(duration_ms)
                .bind(finished_at)
                .bind(run_log)
                .execute(&mut *tx)
                .await
                .map_err(transient)?;
            }
            FinalizeOutcome::Failure {
                finished_at,
                duration_ms,
                entities_touched,
                error,
                retry_at,
            } => {
                let run_log = run_log_json(finished_at, duration_ms, entities_touched, "failed", Some(&error));
                let next_status = if retry_at.is_some() { "pending" } else { "failed" };
                sqlx::query(
                    r#"
                    UPDATE commands
                    SET status = $3,
                        lease_holder = NULL,
                        lease_until = NULL,
                        next_run_at = COALESCE($4, next_run_at),
                        retry_count = CASE WHEN $4 IS NOT NULL THEN retry_count + 1 ELSE retry_count END,
                        run_count = run_count + 1,
                        failure_count = failure_count + 1,
                        entities_touched = entities_touched + $5,
                        last_duration_ms = $6,
                        last_executed_at = $7,
                        last_error_code = $8,
                        run_logs = run_logs || $9::jsonb,
                        updated_at = NOW()
                    WHERE cmd_id = $1 AND tenant_id = $2
                    "#,
                )
                .bind(cmd_id)
                .bind(self.tenant.as_str())
                .bind(next_status)
                .bind(retry_at)
                .bind(entities_touched as i64)
                .bind(duration_ms)
                .bind(finished_at)
                .bind(&error.code)
                .bind(run_log)
                .execute(&mut *tx)
                .await
                .map_err(transient)?;
            }
        }

        tx.commit().await.map_err(transient)?;
        Ok(())
    }

    async fn append_logs(&self, cmd_id: Uuid, lines: Vec<(DateTime<Utc>, String)>) -> scheduler_core::Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let json_lines: Vec<serde_json::Value> = lines
            .into_iter()
            .map(|(at, message)| serde_json::json!({"at": at, "message": message}))
            .collect();

        sqlx::query(
            r#"
            UPDATE commands
            SET logs = logs || $3::jsonb,
                updated_at = NOW()
            WHERE cmd_id = $1 AND tenant_id = $2
            "#,
        )
        .bind(cmd_id)
        .bind(self.tenant.as_str())
        .bind(serde_json::Value::Array(json_lines))
        .execute(&self.pool)
        .await
        .map_err(transient)?;

        Ok(())
    }

    async fn set_schedule(&self, cmd_id: Uuid, next_run_at: DateTime<Utc>, reason: &str) -> scheduler_core::Result<()> {
        let log_line = serde_json::json!([{"at": next_run_at, "message": format!("next run set: {reason}")}]);
        sqlx::query(
            r#"
            UPDATE commands
            SET status = 'pending',
                lease_holder = NULL,
                lease_until = NULL,
                disabled = FALSE,
                next_run_at = $3,
                logs = logs || $4::jsonb,
                updated_at = NOW()
            WHERE cmd_id = $1 AND tenant_id = $2
            "#,
        )
        .bind(cmd_id)
        .bind(self.tenant.as_str())
        .bind(next_run_at)
        .bind(log_line)
        .execute(&self.pool)
        .await
        .map_err(transient)?;

        Ok(())
    }

    async fn set_disabled(&self, cmd_id: Uuid, reason: &str) -> scheduler_core::Result<()> {
        let log_line = serde_json::json!([{"at": Utc::now(), "message": format!("disabled: {reason}")}]);
        sqlx::query(
            r#"
            UPDATE commands
            SET status = 'disabled',
                disabled = TRUE,
                lease_holder = NULL,
                lease_until = NULL,
                logs = logs || $3::jsonb,
                updated_at = NOW()
            WHERE cmd_id = $1 AND tenant_id = $2
            "#,
        )
        .bind(cmd_id)
        .bind(self.tenant.as_str())
        .bind(log_line)
        .execute(&self.pool)
        .await
        .map_err(transient)?;

        Ok(())
    }

    async fn run_once(&self, cmd_id: Uuid, now: DateTime<Utc>) -> scheduler_core::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE commands
            SET next_run_at = $3,
                disabled = FALSE,
                status = CASE WHEN status = 'disabled' THEN 'pending' ELSE status END,
                updated_at = NOW()
            WHERE cmd_id = $1 AND tenant_id = $2 AND lease_holder IS NULL
            "#,
        )
        .bind(cmd_id)
        .bind(self.tenant.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(transient)?;

        if result.rows_affected() == 0 {
            let still_there = self.get(cmd_id).await?;
            return match still_there {
                Some(_) => Err(SchedulerError::AlreadyLeased(cmd_id)),
                None => Err(SchedulerError::NotFound(cmd_id.to_string())),
            };
        }
        Ok(())
    }

    async fn admin_disable(&self, cmd_id: Uuid, reason: &str) -> scheduler_core::Result<()> {
        self.set_disabled(cmd_id, reason).await
    }

    async fn get(&self, cmd_id: Uuid) -> scheduler_core::Result<Option<Command>> {
        let row = sqlx::query("SELECT * FROM commands WHERE cmd_id = $1 AND tenant_id = $2")
            .bind(cmd_id)
            .bind(self.tenant.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(transient)?;

        row.map(|r| row_to_command(&r)).transpose()
    }
}

fn run_log_json(
    finished_at: DateTime<Utc>,
    duration_ms: i64,
    entities_touched: u64,
    summary: &str,
    error: Option<&RunError>,
) -> serde_json::Value {
    let entry = RunLogEntry {
        started_at: finished_at - Duration::milliseconds(duration_ms),
        ended_at: finished_at,
        duration_ms,
        entities_touched,
        summary: summary.to_string(),
        error: error.cloned(),
    };
    serde_json::json!([entry])
}
