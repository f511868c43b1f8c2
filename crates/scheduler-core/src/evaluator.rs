//! `Evaluator`: runs a decrypted program string under a wall-clock budget
//! with a supplied effect table (spec §2.7, §4.6). The language/engine is
//! opaque to the core — see `scheduler-evaluator-json` for one concrete,
//! pluggable implementation.

use crate::effects::EffectTable;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// A tagged outcome the program raises to alter its own lifecycle,
/// distinct from an error (spec §9: "Control-flow-by-exception ...
/// model the signal as a tagged result variant"). `/disable` and
/// `/set-next-run-at` surface as these variants, never as a thrown
/// value.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlSignal {
    CommandDisabled { reason: String },
    NextRunSet { instant: DateTime<Utc>, reason: String },
}

/// Any error the program raised that was not a control signal.
#[derive(Debug, Clone, thiserror::Error)]
#[error("program error: {message}")]
pub struct ProgramError {
    pub message: String,
    pub code: Option<String>,
    pub stack: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EvalError {
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error("evaluator budget exceeded")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutcome {
    /// The program ran to completion with no control signal.
    Completed,
    Signal(ControlSignal),
}

/// Isolates the program from host ambient authority: no network, no
/// filesystem, no clock except what `effects` exposes. Must execute to
/// completion or until `budget` elapses, and must preserve an error code
/// carried by a program-raised error.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn run(
        &self,
        program: &[u8],
        effects: Arc<EffectTable>,
        budget: Duration,
    ) -> Result<EvalOutcome, EvalError>;
}
