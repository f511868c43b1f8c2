//! The polling loop: one instance per process (or several, each with a
//! distinct `worker_label`, for throughput) that repeatedly claims one
//! due command across tenants and drives it through the state machine
//! (spec §2.9, §4.6).

use crate::cipher::{Cipher, DecryptKey};
use crate::clock::Clock;
use crate::command::{Action, Command, RunError};
use crate::config::Config;
use crate::effects::{EffectTableBuilder, PassthroughPorts};
use crate::error::ErrorCode;
use crate::evaluator::{ControlSignal, EvalError, EvalOutcome, Evaluator};
use crate::store::FinalizeOutcome;
use crate::telemetry::{ClaimedEvent, ExecutionFinishedEvent, RetryScheduledEvent, StaleLeaseReclaimedEvent};
use crate::tenant::{TenantId, TenantRegistry};
use crate::cron::CronPlanner;
use crate::metrics::MetricsSink;
use crate::telemetry::TelemetrySink;
use chrono::Utc;
use std::sync::Arc;

/// Result of a single `Worker::tick` call — tells the caller how long to
/// sleep before the next one (spec §4.6 steps 4-5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A command was claimed and run; sleep `inter_command_delay` then
    /// tick again immediately, to keep draining due work.
    Claimed,
    /// Nothing was due; sleep `tick_interval`.
    Idle,
}

pub struct Worker {
    label: String,
    registry: Arc<dyn TenantRegistry>,
    cipher: Arc<dyn Cipher>,
    decrypt_key: Arc<DecryptKey>,
    evaluator: Arc<dyn Evaluator>,
    clock: Arc<dyn Clock>,
    cron_planner: Arc<dyn CronPlanner>,
    config: Config,
    metrics: Arc<dyn MetricsSink>,
    telemetry: Arc<dyn TelemetrySink>,
    passthrough: PassthroughPorts,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        label: impl Into<String>,
        registry: Arc<dyn TenantRegistry>,
        cipher: Arc<dyn Cipher>,
        decrypt_key: Arc<DecryptKey>,
        evaluator: Arc<dyn Evaluator>,
        clock: Arc<dyn Clock>,
        cron_planner: Arc<dyn CronPlanner>,
        config: Config,
        metrics: Arc<dyn MetricsSink>,
        telemetry: Arc<dyn TelemetrySink>,
        passthrough: PassthroughPorts,
    ) -> Self {
        Self {
            label: label.into(),
            registry,
            cipher,
            decrypt_key,
            evaluator,
            clock,
            cron_planner,
            config,
            metrics,
            telemetry,
            passthrough,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// One tick: sweep stale leases on every tenant, then attempt a
    /// single claim across tenants in registry order, executing it if
    /// found.
    pub async fn tick(&self) -> crate::error::Result<TickOutcome> {
        let now = self.clock.now();
        let tenants = self.registry.list().await?;

        for tenant in &tenants {
            let store = self.registry.command_store(tenant)?;
            let reclaimed = store.sweep_stale_leases(now).await?;
            if reclaimed > 0 {
                tracing::warn!(tenant = %tenant, reclaimed, "stale leases auto-released");
                self.telemetry.stale_lease_reclaimed(StaleLeaseReclaimedEvent {
                    tenant_id: tenant.as_str().to_string(),
                    reclaimed_count: reclaimed,
                    at: now,
                });
            }
        }

        for tenant in &tenants {
            let store = self.registry.command_store(tenant)?;
            let lease_ttl = self.config.lease_ttl_chrono();
            if let Some(command) = store.claim_one_due(&self.label, lease_ttl, now).await? {
                tracing::info!(tenant = %tenant, cmd_id = %command.cmd_id, worker = %self.label, "claimed command");
                self.telemetry.claimed(ClaimedEvent {
                    tenant_id: tenant.as_str().to_string(),
                    cmd_id: command.cmd_id,
                    worker_label: self.label.clone(),
                    at: now,
                });
                self.execute_one(tenant, command).await?;
                return Ok(TickOutcome::Claimed);
            }
        }

        Ok(TickOutcome::Idle)
    }

    async fn execute_one(&self, tenant: &TenantId, command: Command) -> crate::error::Result<()> {
        let store = self.registry.command_store(tenant)?;
        let started_at = self.clock.now();

        let plaintext = match self.cipher.decrypt(&command.ciphertext, &self.decrypt_key) {
            Ok(p) => p,
            Err(_) => {
                return self
                    .finalize_failure(
                        tenant,
                        &command,
                        started_at,
                        RunError {
                            message: "decryption failed".to_string(),
                            code: ErrorCode::DecryptFailed.to_string(),
                            stack: None,
                        },
                    )
                    .await;
            }
        };

        let entity_store = self.registry.entity_store(tenant)?;
        let builder = EffectTableBuilder::new(entity_store).with_passthrough(self.passthrough.clone());
        let effects = Arc::new(builder.build(
            tenant.clone(),
            command.user_id.clone(),
            command.source.clone(),
            command.cmd_id,
        ));

        let budget = self.config.evaluator_budget();
        let run_result = tokio::time::timeout(budget, self.evaluator.run(&plaintext, effects.clone(), budget)).await;

        let logs = effects.drain_logs().await;
        if !logs.is_empty() {
            store.append_logs(command.cmd_id, logs).await?;
        }
        let entities_touched = effects.touched();
        let finished_at = self.clock.now();
        let duration_ms = (finished_at - started_at).num_milliseconds();

        match run_result {
            // evaluator hung past budget: outer backstop timeout fired.
            Err(_) => {
                self.finalize_failure_timed(
                    tenant,
                    &command,
                    started_at,
                    finished_at,
                    duration_ms,
                    entities_touched,
                    RunError {
                        message: "evaluator budget exceeded".to_string(),
                        code: ErrorCode::Timeout.to_string(),
                        stack: None,
                    },
                )
                .await
            }
            Ok(Err(EvalError::Timeout)) => {
                self.finalize_failure_timed(
                    tenant,
                    &command,
                    started_at,
                    finished_at,
                    duration_ms,
                    entities_touched,
                    RunError {
                        message: "evaluator budget exceeded".to_string(),
                        code: ErrorCode::Timeout.to_string(),
                        stack: None,
                    },
                )
                .await
            }
            Ok(Err(EvalError::Program(program_error))) => {
                self.finalize_failure_timed(
                    tenant,
                    &command,
                    started_at,
                    finished_at,
                    duration_ms,
                    entities_touched,
                    RunError {
                        message: program_error.message,
                        code: program_error.code.unwrap_or_else(|| ErrorCode::Unexpected.to_string()),
                        stack: program_error.stack,
                    },
                )
                .await
            }
            Ok(Ok(outcome)) => {
                self.finalize_success(
                    tenant,
                    &command,
                    &store,
                    started_at,
                    finished_at,
                    duration_ms,
                    entities_touched,
                    outcome,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize_success(
        &self,
        tenant: &TenantId,
        command: &Command,
        store: &Arc<dyn crate::store::CommandStore>,
        started_at: chrono::DateTime<Utc>,
        finished_at: chrono::DateTime<Utc>,
        duration_ms: i64,
        entities_touched: u64,
        outcome: EvalOutcome,
    ) -> crate::error::Result<()> {
        let _ = started_at;
        let summary = "ok".to_string();

        let finalize_outcome = if command.action == Action::RunOnce {
            FinalizeOutcome::SuccessOnce {
                finished_at,
                duration_ms,
                entities_touched,
                summary: summary.clone(),
            }
        } else {
            let cron_expr = command
                .cron_expr
                .as_deref()
                .expect("recurring command must carry a cron_expr (I5)");
            let next_run_at = self.cron_planner.next(cron_expr, finished_at)?;
            FinalizeOutcome::SuccessRecurring {
                finished_at,
                duration_ms,
                entities_touched,
                next_run_at,
                summary: summary.clone(),
            }
        };

        store.finalize(command.cmd_id, &self.label, finalize_outcome).await?;

        if let EvalOutcome::Signal(signal) = outcome {
            match signal {
                ControlSignal::CommandDisabled { reason } => {
                    store.set_disabled(command.cmd_id, &reason).await?;
                }
                ControlSignal::NextRunSet { instant, reason } => {
                    store.set_schedule(command.cmd_id, instant, &reason).await?;
                    self.telemetry.retry_scheduled(RetryScheduledEvent {
                        tenant_id: tenant.as_str().to_string(),
                        cmd_id: command.cmd_id,
                        retry_count: command.retry_count,
                        next_run_at: instant,
                    });
                }
            }
        }

        self.metrics.incr_success(tenant);
        self.metrics.observe_duration_ms(tenant, duration_ms);
        self.metrics.observe_entities_touched(tenant, entities_touched);
        self.telemetry.execution_finished(ExecutionFinishedEvent {
            tenant_id: tenant.as_str().to_string(),
            cmd_id: command.cmd_id,
            worker_label: self.label.clone(),
            succeeded: true,
            duration_ms,
            entities_touched,
            error_code: None,
        });
        Ok(())
    }

    async fn finalize_failure(
        &self,
        tenant: &TenantId,
        command: &Command,
        started_at: chrono::DateTime<Utc>,
        error: RunError,
    ) -> crate::error::Result<()> {
        let finished_at = self.clock.now();
        let duration_ms = (finished_at - started_at).num_milliseconds();
        self.finalize_failure_timed(tenant, command, started_at, finished_at, duration_ms, 0, error)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize_failure_timed(
        &self,
        tenant: &TenantId,
        command: &Command,
        _started_at: chrono::DateTime<Utc>,
        finished_at: chrono::DateTime<Utc>,
        duration_ms: i64,
        entities_touched: u64,
        error: RunError,
    ) -> crate::error::Result<()> {
        let store = self.registry.command_store(tenant)?;
        let next_retry_count = command.retry_count + 1;
        let retry_at = if next_retry_count <= command.max_retries {
            Some(finished_at + command.retry_backoff)
        } else {
            None
        };

        let error_code = error.code.clone();
        store
            .finalize(
                command.cmd_id,
                &self.label,
                FinalizeOutcome::Failure {
                    finished_at,
                    duration_ms,
                    entities_touched,
                    error,
                    retry_at,
                },
            )
            .await?;

        self.metrics.incr_failure(tenant, &ErrorCode::Custom(error_code.clone()));
        self.telemetry.execution_finished(ExecutionFinishedEvent {
            tenant_id: tenant.as_str().to_string(),
            cmd_id: command.cmd_id,
            worker_label: self.label.clone(),
            succeeded: false,
            duration_ms,
            entities_touched,
            error_code: Some(error_code),
        });
        if let Some(retry_at) = retry_at {
            self.telemetry.retry_scheduled(RetryScheduledEvent {
                tenant_id: tenant.as_str().to_string(),
                cmd_id: command.cmd_id,
                retry_count: next_retry_count,
                next_run_at: retry_at,
            });
        }
        Ok(())
    }
}
