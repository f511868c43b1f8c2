//! A reference `Evaluator`: interprets a flat JSON instruction list
//! against the effect table. Not meant to be the only or even the
//! primary evaluator in a deployment — it exists to exercise every
//! effect operation end to end and to give integration tests something
//! concrete to run programs through.
//!
//! # Program format
//!
//! ```json
//! [
//!   {"op": "add_object", "entity_type": "note", "data": {"text": "hi"}},
//!   {"op": "update_object", "id": "...", "data": {"text": "bye"}},
//!   {"op": "del_object", "id": "..."},
//!   {"op": "log", "message": "did a thing"},
//!   {"op": "disable", "reason": "no longer needed"},
//!   {"op": "set_next_run_at", "instant": "2030-01-01T00:00:00Z", "reason": "backoff"}
//! ]
//! ```
//!
//! Ops run in order. `disable` and `set_next_run_at` stop the program
//! immediately — everything after them is not executed, matching the
//! control-signal contract: they terminate the run, they don't merely
//! log an intent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{AddObjectInput, EffectTable, EntityQuery, EvalError, EvalOutcome, Evaluator, FilterSortPageOptions, ProgramError};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Op {
    AddObject {
        #[serde(default)]
        id: Option<String>,
        entity_type: String,
        data: Value,
    },
    UpdateObject {
        id: String,
        #[serde(default)]
        entity_type: Option<String>,
        data: Value,
    },
    DelObject {
        id: String,
    },
    GetObjectsRaw {
        #[serde(default)]
        ids: Option<Vec<String>>,
        #[serde(default)]
        types: Option<Vec<String>>,
    },
    GetObjectsParsed {
        #[serde(default)]
        ids: Option<Vec<String>>,
        #[serde(default)]
        types: Option<Vec<String>>,
    },
    Log {
        message: Value,
    },
    Disable {
        reason: String,
    },
    SetNextRunAt {
        instant: DateTime<Utc>,
        reason: String,
    },
    /// Used by tests to force a program-raised error with a specific code.
    Fail {
        message: String,
        #[serde(default)]
        code: Option<String>,
    },
}

/// Interprets `program` as a JSON array of [`Op`]s. Checks the wall-clock
/// budget before every op so a program that never calls back into the
/// effect table still can't spin forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEvaluator;

impl JsonEvaluator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Evaluator for JsonEvaluator {
    async fn run(&self, program: &[u8], effects: Arc<EffectTable>, budget: Duration) -> Result<EvalOutcome, EvalError> {
        let ops: Vec<Op> = serde_json::from_slice(program).map_err(|err| {
            EvalError::Program(ProgramError {
                message: format!("malformed program: {err}"),
                code: Some("MALFORMED_PROGRAM".to_string()),
                stack: None,
            })
        })?;

        let deadline = Instant::now() + budget;

        for op in ops {
            if Instant::now() >= deadline {
                return Err(EvalError::Timeout);
            }

            match op {
                Op::AddObject { id, entity_type, data } => {
                    effects
                        .add_object(AddObjectInput { id, entity_type, data })
                        .await
                        .map_err(to_program_error)?;
                }
                Op::UpdateObject { id, entity_type, data } => {
                    effects.update_object(id, entity_type, data).await.map_err(to_program_error)?;
                }
                Op::DelObject { id } => {
                    effects.del_object(&id).await.map_err(to_program_error)?;
                }
                Op::GetObjectsRaw { ids, types } => {
                    effects
                        .get_objects_raw(EntityQuery { ids, types }, FilterSortPageOptions::default())
                        .await
                        .map_err(to_program_error)?;
                }
                Op::GetObjectsParsed { ids, types } => {
                    effects
                        .get_objects_parsed(EntityQuery { ids, types }, FilterSortPageOptions::default())
                        .await
                        .map_err(to_program_error)?;
                }
                Op::Log { message } => {
                    effects.log(Utc::now(), message).await;
                }
                Op::Disable { reason } => {
                    effects.disable(reason);
                    return Ok(EvalOutcome::Signal(effects.control_signal().unwrap().clone()));
                }
                Op::SetNextRunAt { instant, reason } => {
                    effects.set_next_run_at(instant, reason);
                    return Ok(EvalOutcome::Signal(effects.control_signal().unwrap().clone()));
                }
                Op::Fail { message, code } => {
                    return Err(EvalError::Program(ProgramError { message, code, stack: None }));
                }
            }
        }

        Ok(EvalOutcome::Completed)
    }
}

fn to_program_error(err: scheduler_core::SchedulerError) -> EvalError {
    EvalError::Program(ProgramError {
        message: err.to_string(),
        code: Some(err.error_code().as_str().to_string()),
        stack: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_core::TenantId;
    use scheduler_testing::InMemoryEntityStore;
    use std::sync::Arc as StdArc;

    fn effects_for(tenant: &str) -> StdArc<EffectTable> {
        let store: StdArc<dyn scheduler_core::EntityStore> = StdArc::new(InMemoryEntityStore::new());
        let builder = scheduler_core::EffectTableBuilder::new(store);
        StdArc::new(builder.build(
            TenantId::new(tenant).unwrap(),
            "user-1".into(),
            "api".into(),
            uuid::Uuid::new_v4(),
        ))
    }

    #[tokio::test]
    async fn runs_add_object_then_log_to_completion() {
        let effects = effects_for("acme");
        let program = serde_json::to_vec(&serde_json::json!([
            {"op": "add_object", "entity_type": "note", "data": {"text": "hi"}},
            {"op": "log", "message": "done"}
        ]))
        .unwrap();

        let outcome = JsonEvaluator::new().run(&program, effects.clone(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, EvalOutcome::Completed);
        assert_eq!(effects.touched(), 1);
        let logs = effects.drain_logs().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].1, "done");
    }

    #[tokio::test]
    async fn disable_short_circuits_and_surfaces_as_a_signal() {
        let effects = effects_for("acme");
        let program = serde_json::to_vec(&serde_json::json!([
            {"op": "disable", "reason": "done for good"},
            {"op": "add_object", "entity_type": "note", "data": {}}
        ]))
        .unwrap();

        let outcome = JsonEvaluator::new().run(&program, effects.clone(), Duration::from_secs(1)).await.unwrap();
        match outcome {
            EvalOutcome::Signal(scheduler_core::ControlSignal::CommandDisabled { reason }) => {
                assert_eq!(reason, "done for good");
            }
            other => panic!("expected CommandDisabled, got {other:?}"),
        }
        assert_eq!(effects.touched(), 0, "add_object after disable must not run");
    }

    #[tokio::test]
    async fn program_raised_error_carries_its_code() {
        let effects = effects_for("acme");
        let program = serde_json::to_vec(&serde_json::json!([
            {"op": "fail", "message": "boom", "code": "CUSTOM_CODE"}
        ]))
        .unwrap();

        let err = JsonEvaluator::new().run(&program, effects, Duration::from_secs(1)).await.unwrap_err();
        match err {
            EvalError::Program(ProgramError { code: Some(code), .. }) => assert_eq!(code, "CUSTOM_CODE"),
            other => panic!("expected Program error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_program_is_a_program_error() {
        let effects = effects_for("acme");
        let err = JsonEvaluator::new().run(b"not json", effects, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, EvalError::Program(_)));
    }
}
