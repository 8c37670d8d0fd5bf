//! Background stale sweeper.
//!
//! Periodically marks out-of-scope Pending requests Stale and purges
//! Stale requests. Failures are logged; the loop keeps running until
//! its handle is stopped.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::Result;
use super::Engine;

/// Interval used when a zero interval is requested
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Totals from one or more sweep passes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub passes: usize,
    pub swept: usize,
    pub purged: usize,
    pub errors: usize,
}

impl SweepReport {
    fn absorb(&mut self, other: SweepReport) {
        self.passes += other.passes;
        self.swept += other.swept;
        self.purged += other.purged;
        self.errors += other.errors;
    }
}

/// Runs sweep + purge on an interval for a set of tasks
#[derive(Clone)]
pub struct StaleSweeper {
    engine: Engine,
    /// Tasks to sweep; empty means every task in the store
    task_ids: Vec<String>,
    interval: Duration,
}

impl StaleSweeper {
    /// A zero interval is raised to [`MIN_SWEEP_INTERVAL`]
    pub fn new(engine: Engine, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            warn!("Zero sweep interval requested, using {:?}", MIN_SWEEP_INTERVAL);
            MIN_SWEEP_INTERVAL
        } else {
            interval
        };
        Self {
            engine,
            task_ids: Vec::new(),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn with_tasks(mut self, task_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.task_ids = task_ids.into_iter().map(Into::into).collect();
        self
    }

    async fn targets(&self) -> Result<Vec<String>> {
        if !self.task_ids.is_empty() {
            return Ok(self.task_ids.clone());
        }
        Ok(self
            .engine
            .list_tasks()
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect())
    }

    /// One sweep + purge pass over every target task
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport {
            passes: 1,
            ..Default::default()
        };

        let targets = match self.targets().await {
            Ok(targets) => targets,
            Err(e) => {
                warn!(error = %e, "Failed to list tasks for sweep");
                report.errors += 1;
                return report;
            }
        };

        for task_id in targets {
            match self.engine.sweep_stale(&task_id).await {
                Ok(n) => report.swept += n,
                Err(e) => {
                    warn!(%task_id, error = %e, "Stale sweep failed");
                    report.errors += 1;
                    continue;
                }
            }
            match self.engine.purge_stale(&task_id).await {
                Ok(n) => report.purged += n,
                Err(e) => {
                    warn!(%task_id, error = %e, "Stale purge failed");
                    report.errors += 1;
                }
            }
        }

        debug!(?report, "Sweep pass finished");
        report
    }

    /// Start the sweeper on the current runtime
    pub fn spawn(self) -> SweepHandle {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut total = SweepReport::default();
            let mut ticker = tokio::time::interval(self.interval);
            info!(interval_secs = self.interval.as_secs(), "Stale sweeper started");

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => total.absorb(self.run_once().await),
                }
            }

            info!(passes = total.passes, swept = total.swept, purged = total.purged, "Stale sweeper stopped");
            total
        });

        SweepHandle { stop_tx, task }
    }
}

/// Handle to control a running sweeper
pub struct SweepHandle {
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<SweepReport>,
}

impl SweepHandle {
    /// Stop the sweeper and return its accumulated totals
    pub async fn stop(self) -> anyhow::Result<SweepReport> {
        let _ = self.stop_tx.send(()).await;
        Ok(self.task.await?)
    }
}
