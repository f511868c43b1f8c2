//! Owns workers' lifecycle: starts/stops on process signals, periodically
//! sweeps stale leases via each worker's own tick (spec §2.10, §4.7).

use crate::config::Config;
use crate::worker::{TickOutcome, Worker};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// A handle to a running Supervisor. Dropping it does not stop the
/// workers — call `.stop()` for orderly shutdown.
pub struct SupervisorHandle {
    shutdown: Arc<Notify>,
    handles: Vec<JoinHandle<()>>,
}

impl SupervisorHandle {
    /// Signals every worker loop to stop claiming new work after its
    /// current tick, then waits for in-flight executions to finish
    /// (bounded by the evaluator budget each worker already enforces).
    /// Leases on any commands still mid-run are left alone — they expire
    /// naturally via `sweep_stale_leases` after `lease_ttl_ms`, and
    /// another worker can reclaim them (spec §4.7).
    pub async fn stop(self) {
        self.shutdown.notify_waiters();
        let _ = futures::future::join_all(self.handles).await;
    }
}

pub struct Supervisor {
    config: Config,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Starts `worker_count` `Worker` tasks, each looping `tick()` until
    /// `.stop()` is called or the process receives SIGINT/SIGTERM via
    /// `tokio::signal::ctrl_c()`.
    pub fn start(&self, workers: Vec<Worker>) -> SupervisorHandle {
        let shutdown = Arc::new(Notify::new());
        let mut handles = Vec::with_capacity(workers.len());

        for worker in workers {
            let shutdown = shutdown.clone();
            let tick_interval = self.config.tick_interval();
            let inter_command_delay = self.config.inter_command_delay();
            let label = worker.label().to_string();

            let handle = tokio::spawn(async move {
                if tick_interval.is_zero() {
                    // Polling disabled; only admin entry points trigger runs.
                    shutdown.notified().await;
                    return;
                }
                loop {
                    let stopped = tokio::select! {
                        biased;
                        _ = shutdown.notified() => true,
                        result = worker.tick() => {
                            match result {
                                Ok(TickOutcome::Claimed) => {
                                    tokio::time::sleep(inter_command_delay).await;
                                    false
                                }
                                Ok(TickOutcome::Idle) => {
                                    tokio::time::sleep(tick_interval).await;
                                    false
                                }
                                Err(err) => {
                                    tracing::warn!(worker = %label, error = %err, "tick failed, retrying next interval");
                                    tokio::time::sleep(tick_interval).await;
                                    false
                                }
                            }
                        }
                    };
                    if stopped {
                        break;
                    }
                }
            });
            handles.push(handle);
        }

        SupervisorHandle { shutdown, handles }
    }

    /// Starts workers and also stops them on SIGINT (ctrl-c), convenient
    /// for a standalone process entry point.
    pub fn start_with_signal_shutdown(&self, workers: Vec<Worker>) -> JoinHandle<()> {
        let handle = self.start(workers);
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, stopping workers");
            handle.stop().await;
        })
    }
}
