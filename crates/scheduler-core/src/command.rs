//! The `Command` record (spec §3) and the initial-action normalizer
//! (spec §4.1).

use crate::cron::CronPlanner;
use crate::error::Result;
use crate::tenant::TenantId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// chrono's `Duration` has no serde impl of its own (the `serde` feature
/// only covers `DateTime`/`Naive*`/tz types), so `Command::retry_backoff`
/// round-trips as whole milliseconds instead — the same representation
/// the Postgres adapter stores it under (`retry_backoff_ms BIGINT`).
mod duration_millis {
    use super::{Deserialize, Deserializer, Duration, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i64(duration.num_milliseconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
        let millis = i64::deserialize(deserializer)?;
        Ok(Duration::milliseconds(millis))
    }
}

/// Write-once at creation; selects how the normalizer sets `disabled` and
/// `next_run_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    RegisterRecurring,
    RunNowThenRecur,
    RunOnce,
    RegisterDisabled,
    RegisterActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Pending,
    Running,
    SucceededOnce,
    Failed,
    Disabled,
}

/// Authenticated-encrypted program text. Opaque to everything except the
/// `Cipher` port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherEnvelope {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub tag: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub message: String,
}

impl LogLine {
    pub fn new(at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            at,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub message: String,
    pub code: String,
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub entities_touched: u64,
    pub summary: String,
    pub error: Option<RunError>,
}

/// The central persisted entity. Every mutation after creation flows
/// through `CommandStore` (§4.2) or the `Worker` finalize path (§4.6) —
/// nothing else is permitted to touch `status`/`lease_holder`/
/// `lease_until`/retry bookkeeping, which is how invariants I1-I7 hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub cmd_id: Uuid,
    pub tenant_id: TenantId,
    pub user_id: String,
    pub source: String,
    pub ciphertext: CipherEnvelope,

    pub action: Action,
    pub cron_expr: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub terminate_after: Option<DateTime<Utc>>,
    pub disabled: bool,
    pub status: CommandStatus,

    pub lease_holder: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,

    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub retry_backoff: Duration,

    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub entities_touched: u64,
    pub last_duration_ms: Option<i64>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub last_error_code: Option<String>,
    pub stale_lease_count: u64,

    pub logs: Vec<LogLine>,
    pub run_logs: Vec<RunLogEntry>,
    pub action_applied_at: Option<DateTime<Utc>>,
}

/// The subset of fields the creator of a command record supplies; the
/// normalizer fills in the rest of the scheduling fields before the
/// record is ever persisted.
pub struct NewCommand {
    pub cmd_id: Uuid,
    pub tenant_id: TenantId,
    pub user_id: String,
    pub source: String,
    pub ciphertext: CipherEnvelope,
    pub action: Action,
    pub cron_expr: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub terminate_after: Option<DateTime<Utc>>,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Command {
    /// Applies the initial-action normalizer (spec §4.1) to a freshly
    /// created record. Pure aside from the `CronPlanner` call the two
    /// recurring branches make.
    pub fn normalize(new: NewCommand, now: DateTime<Utc>, planner: &dyn CronPlanner) -> Result<Self> {
        let (disabled, next_run_at) = match new.action {
            Action::RegisterRecurring | Action::RegisterActive => {
                let next = match new.next_run_at {
                    Some(t) => t,
                    None => planner.next(
                        new.cron_expr
                            .as_deref()
                            .expect("cron_expr required unless action = RUN_ONCE"),
                        now,
                    )?,
                };
                (false, Some(next))
            }
            Action::RunNowThenRecur => (false, Some(new.next_run_at.unwrap_or(now))),
            Action::RunOnce => (false, Some(new.next_run_at.unwrap_or(now))),
            Action::RegisterDisabled => (true, new.next_run_at),
        };

        Ok(Command {
            cmd_id: new.cmd_id,
            tenant_id: new.tenant_id,
            user_id: new.user_id,
            source: new.source,
            ciphertext: new.ciphertext,
            action: new.action,
            cron_expr: new.cron_expr,
            next_run_at,
            terminate_after: new.terminate_after,
            disabled,
            status: CommandStatus::Pending,
            lease_holder: None,
            lease_until: None,
            retry_count: 0,
            max_retries: new.max_retries,
            retry_backoff: new.retry_backoff,
            run_count: 0,
            success_count: 0,
            failure_count: 0,
            entities_touched: 0,
            last_duration_ms: None,
            last_executed_at: None,
            last_error_code: None,
            stale_lease_count: 0,
            logs: Vec::new(),
            run_logs: Vec::new(),
            action_applied_at: Some(now),
        })
    }

    /// I3: a succeeded one-shot is permanently unclaimable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            CommandStatus::SucceededOnce | CommandStatus::Failed | CommandStatus::Disabled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::StdCronPlanner;
    use chrono::TimeZone;

    fn tenant() -> TenantId {
        TenantId::new("acme").unwrap()
    }

    fn base(action: Action, cron_expr: Option<&str>, next_run_at: Option<DateTime<Utc>>) -> NewCommand {
        NewCommand {
            cmd_id: Uuid::new_v4(),
            tenant_id: tenant(),
            user_id: "u1".into(),
            source: "api".into(),
            ciphertext: CipherEnvelope {
                ciphertext: vec![],
                iv: vec![],
                tag: vec![],
            },
            action,
            cron_expr: cron_expr.map(str::to_string),
            next_run_at,
            terminate_after: None,
            max_retries: 3,
            retry_backoff: Duration::seconds(5),
        }
    }

    #[test]
    fn recurring_without_next_run_at_asks_planner() {
        let planner = StdCronPlanner;
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 1).unwrap();
        let cmd = Command::normalize(
            base(Action::RegisterRecurring, Some("*/5 * * * *"), None),
            now,
            &planner,
        )
        .unwrap();
        assert!(!cmd.disabled);
        assert_eq!(cmd.next_run_at, Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 5, 0).unwrap()));
        assert_eq!(cmd.action_applied_at, Some(now));
    }

    #[test]
    fn recurring_with_explicit_next_run_at_is_kept() {
        let planner = StdCronPlanner;
        let now = Utc::now();
        let explicit = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let cmd = Command::normalize(
            base(Action::RegisterRecurring, Some("*/5 * * * *"), Some(explicit)),
            now,
            &planner,
        )
        .unwrap();
        assert_eq!(cmd.next_run_at, Some(explicit));
    }

    #[test]
    fn run_once_ignores_cron_expr_and_defaults_to_now() {
        let planner = StdCronPlanner;
        let now = Utc::now();
        let cmd = Command::normalize(base(Action::RunOnce, Some("garbage"), None), now, &planner).unwrap();
        assert!(!cmd.disabled);
        assert_eq!(cmd.next_run_at, Some(now));
    }

    #[test]
    fn register_disabled_sets_disabled_and_leaves_next_run_at() {
        let planner = StdCronPlanner;
        let now = Utc::now();
        let cmd = Command::normalize(base(Action::RegisterDisabled, None, None), now, &planner).unwrap();
        assert!(cmd.disabled);
        assert_eq!(cmd.next_run_at, None);
    }

    #[test]
    fn run_now_then_recur_defaults_next_run_at_to_now() {
        let planner = StdCronPlanner;
        let now = Utc::now();
        let cmd = Command::normalize(
            base(Action::RunNowThenRecur, Some("*/5 * * * *"), None),
            now,
            &planner,
        )
        .unwrap();
        assert!(!cmd.disabled);
        assert_eq!(cmd.next_run_at, Some(now));
    }
}
