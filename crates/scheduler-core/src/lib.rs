//! # scheduler-core
//!
//! A multi-tenant durable command scheduler and sandboxed executor.
//!
//! A worker pool atomically claims due, persisted "command" records from
//! per-tenant stores, decrypts their user-supplied program text, runs the
//! program inside a confined environment with a bounded wall-clock
//! budget, exposes a narrow effect API (the "DAO operations") for the
//! program to read and mutate tenant-owned entities through, and updates
//! the record's bookkeeping (schedule, retry, logs, metrics) under a
//! lease that survives worker crashes.
//!
//! ## Architecture
//!
//! ```text
//! Supervisor
//!     │ .start(workers)
//!     ▼
//! Worker.tick() ──► TenantRegistry.list()
//!     │                   │
//!     │          for each tenant
//!     │                   ▼
//!     │          CommandStore.sweep_stale_leases
//!     │          CommandStore.claim_one_due ──► Command
//!     │                                            │
//!     │                              Cipher.decrypt(ciphertext)
//!     │                                            │
//!     │                         EffectTable::build(tenant, user, cmd)
//!     │                                            │
//!     │                      Evaluator.run(program, effects, budget)
//!     │                                            │
//!     │                                     EvalOutcome / EvalError
//!     │                                            │
//!     └──────────────────────────────► CommandStore.finalize(outcome)
//! ```
//!
//! `EntityStore` is reached only from inside effect handlers — the
//! Worker never touches it directly.
//!
//! ## Key invariants
//!
//! See spec-equivalent invariants I1-I7 on [`command::Command`]. In
//! short: a lease is the only form of mutual exclusion, every mutation
//! to a command record is a conditional update asserting prior state,
//! and exactly one of `success_count`/`failure_count` is incremented on
//! every finalize.
//!
//! ## What this is not
//!
//! This crate does not define the command program language — that is an
//! implementation detail of whichever [`Evaluator`] the caller plugs in.
//! It does not speak HTTP, know about specific third-party integrations,
//! or ship metrics/telemetry anywhere; it only calls the [`MetricsSink`]
//! and [`TelemetrySink`] ports it is given.

mod cipher;
mod clock;
mod command;
mod config;
mod cron;
mod effects;
mod entity;
mod error;
mod evaluator;
mod filter;
mod metrics;
mod store;
mod supervisor;
mod telemetry;
mod tenant;
mod worker;

pub use cipher::{Cipher, DecryptKey};
pub use clock::{Clock, SystemClock};
pub use command::{
    Action, CipherEnvelope, Command, CommandStatus, LogLine, NewCommand, RunError, RunLogEntry,
};
pub use config::{Config, ConfigError, StartupConfig};
pub use cron::{CronPlanner, StdCronPlanner};
pub use effects::{
    AddObjectInput, BulkInsertResult, EffectTable, EffectTableBuilder, ParsedEntity, PassthroughPorts,
};
pub use entity::{Entity, EntityMetadata, EntityQuery, EntityStore, NewEntity, UpdateEntity};
pub use error::{ErrorCode, Result, SchedulerError};
pub use evaluator::{ControlSignal, EvalError, EvalOutcome, Evaluator, ProgramError};
pub use filter::{apply_filter_sort_page, loose_eq, FilterSortPageOptions, SortDirection};
pub use metrics::{MetricsSink, NoOpMetricsSink};
pub use store::{CommandStore, FinalizeOutcome};
pub use supervisor::{Supervisor, SupervisorHandle};
pub use telemetry::{
    ClaimedEvent, ExecutionFinishedEvent, NoOpTelemetrySink, RetryScheduledEvent,
    StaleLeaseReclaimedEvent, TelemetrySink,
};
pub use tenant::{TenantId, TenantRegistry};
pub use worker::{TickOutcome, Worker};
