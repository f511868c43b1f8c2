//! Error taxonomy (spec §7). Kinds, not a grab-bag of `anyhow::Error`s —
//! callers branch on `SchedulerError` to decide retry vs. fatal vs. "skip
//! this tick and log it".

use thiserror::Error;

/// The code written into `Command::last_error_code` on a failure finalize.
/// Wire-stable: programs and operators key off these strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    DecryptFailed,
    Timeout,
    Unexpected,
    Custom(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::DecryptFailed => "DECRYPT_FAILED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Unexpected => "UNEXPECTED",
            ErrorCode::Custom(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Retriable. The Worker logs it, skips this tick, does not mutate the
    /// record it was trying to touch.
    #[error("transient store error: {0}")]
    Transient(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The cipher envelope failed authenticated decryption (bad key,
    /// tampered tag, malformed inputs).
    #[error("decrypt failed: {0}")]
    DecryptFailed(String),

    /// `Evaluator::run` did not return within `evaluatorBudgetMs`.
    #[error("evaluator budget exceeded")]
    EvaluatorTimeout,

    /// Any error the program raised that was not a control signal.
    #[error("program error: {message}")]
    ProgramError {
        message: String,
        code: Option<String>,
    },

    /// A mutation was attempted by a worker that no longer holds the
    /// lease it believes it holds. The caller aborts the finalize; a
    /// later `sweep_stale_leases` recovers the record.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A cron expression failed to parse.
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCronExpression { expr: String, reason: String },

    /// `RunOnce` was requested on a record currently under an active lease.
    #[error("command {0} is already leased")]
    AlreadyLeased(uuid::Uuid),

    /// A tenant id used characters outside the allow-list, or an unknown
    /// tenant id was requested.
    #[error("invalid tenant id {0:?}")]
    InvalidTenantId(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl SchedulerError {
    /// The error code this failure should be recorded under, when it
    /// terminates a run (spec §7: "finalize as failure with code taken
    /// from the error if it carries one, else UNEXPECTED").
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SchedulerError::DecryptFailed(_) => ErrorCode::DecryptFailed,
            SchedulerError::EvaluatorTimeout => ErrorCode::Timeout,
            SchedulerError::ProgramError { code: Some(c), .. } => ErrorCode::Custom(c.clone()),
            _ => ErrorCode::Unexpected,
        }
    }

    pub fn transient(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        SchedulerError::Transient(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
