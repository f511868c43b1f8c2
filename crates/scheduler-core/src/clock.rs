//! Monotonic + wall time source, injectable for tests (spec §2.1).

use chrono::{DateTime, Utc};

/// A source of wall-clock instants. Production code uses [`SystemClock`];
/// tests use `scheduler-testing`'s `FixedClock`/`SteppingClock`.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
