//! `CronPlanner`: given a cron expression and a reference instant, returns
//! the next fire instant in UTC (spec §4.3).

use crate::error::{Result, SchedulerError};
use chrono::{DateTime, Utc};
use std::str::FromStr;

/// Deterministic given its inputs; no I/O.
pub trait CronPlanner: Send + Sync {
    /// The smallest instant strictly greater than or equal to `from` that
    /// satisfies `expr`, in UTC, minute granularity.
    fn next(&self, expr: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>>;
}

/// Standard 5-field cron semantics, backed by the `cron` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdCronPlanner;

impl CronPlanner for StdCronPlanner {
    fn next(&self, expr: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        // The `cron` crate's `Schedule` wants a 6- or 7-field expression
        // (seconds first); spec.md is explicit about standard 5-field
        // (minute granularity), so we prepend a "0" seconds field.
        let six_field = format!("0 {expr}");
        let schedule =
            cron::Schedule::from_str(&six_field).map_err(|e| SchedulerError::InvalidCronExpression {
                expr: expr.to_string(),
                reason: e.to_string(),
            })?;

        // `after` is exclusive; spec wants the smallest instant >= `from`,
        // so probe one tick earlier to make the boundary inclusive.
        let probe_from = from - chrono::Duration::seconds(1);
        schedule
            .after(&probe_from)
            .next()
            .ok_or_else(|| SchedulerError::InvalidCronExpression {
                expr: expr.to_string(),
                reason: "expression never fires".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn every_five_minutes_rounds_forward() {
        let planner = StdCronPlanner;
        let from = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 1).unwrap();
        let next = planner.next("*/5 * * * *", from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 1, 0, 5, 0).unwrap());
    }

    #[test]
    fn exact_boundary_is_inclusive() {
        let planner = StdCronPlanner;
        let from = Utc.with_ymd_and_hms(2025, 1, 1, 0, 5, 0).unwrap();
        let next = planner.next("*/5 * * * *", from).unwrap();
        assert_eq!(next, from);
    }

    #[test]
    fn invalid_expression_is_domain_error() {
        let planner = StdCronPlanner;
        let from = Utc::now();
        let err = planner.next("not a cron expr", from).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCronExpression { .. }));
    }
}
