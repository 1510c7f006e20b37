//! Background workers
//!
//! Both workers are tokio tasks that sleep for their interval, run one
//! blocking unit of work on the blocking pool, and stop when signalled.
//! A failing unit of work is recorded and logged; only `stop` (or dropping
//! the worker) ends the loop.

use crate::core::{Result, StoreError};
use crate::reconcile::Reconciler;
use crate::registry::Registry;
use log::warn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Level, event};

/// Shortest interval a worker accepts.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Counters shared between a worker task and its handle.
#[derive(Debug, Default)]
pub struct WorkerStats {
    runs: AtomicU64,
    errors: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl WorkerStats {
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    fn record_run(&self) {
        self.runs.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, worker: &str, err: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(err.to_string());
        }
        warn!("{} worker error: {}", worker, err);
    }
}

/// Handle to a running periodic task.
pub struct Worker {
    name: &'static str,
    stats: Arc<WorkerStats>,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns a task running `unit` on the blocking pool every `interval`.
    /// `unit` returns an error description when the run was not clean.
    fn spawn<F>(name: &'static str, interval: Duration, unit: F) -> Self
    where
        F: Fn() -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        let interval = interval.max(MIN_INTERVAL);
        let stats = Arc::new(WorkerStats::default());
        let stats_for_worker = Arc::clone(&stats);
        let unit = Arc::new(unit);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let join_handle = tokio::spawn(async move {
            event!(Level::INFO, worker = name, interval_ms = interval.as_millis() as u64, "worker started");
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    _ = sleep(interval) => {
                        let unit = Arc::clone(&unit);
                        match tokio::task::spawn_blocking(move || (*unit)()).await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => stats_for_worker.record_error(name, &err),
                            Err(err) => stats_for_worker.record_error(name, &err.to_string()),
                        }
                        stats_for_worker.record_run();
                    }
                }
            }
            event!(Level::INFO, worker = name, "worker stopped");
        });

        Self {
            name,
            stats,
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    /// Signals the worker to stop and waits for the current run to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| StoreError::Worker(format!("{} worker join: {}", self.name, err)))?;
        }
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Foreground tick: runs `on_tick` for every registered collection.
pub fn spawn_tick_worker(registry: Arc<Registry>, interval: Duration) -> Worker {
    Worker::spawn("tick", interval, move || {
        let report = registry.tick_all();
        if report.failed > 0 {
            return Err(format!("{} entity saves failed", report.failed));
        }
        Ok(())
    })
}

/// Background reconciliation: one pass per interval.
pub fn spawn_reconcile_worker(reconciler: Arc<Reconciler>, interval: Duration) -> Worker {
    Worker::spawn("reconcile", interval, move || {
        let report = reconciler.run_pass();
        if report.failures.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = report.failures.iter().map(|(coll, _)| coll.as_str()).collect();
        Err(format!("collections failed: {}", names.join(", ")))
    })
}
