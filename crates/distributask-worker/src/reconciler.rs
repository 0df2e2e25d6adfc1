//! Reconciliation sweep
//!
//! Finds non-terminal task rows that have sat untouched for longer than the grace
//! period and resubmits any whose reference the broker no longer holds. Covers rows
//! left `pending` by a failed enqueue and references lost by the broker.
//!
//! Candidates are paged by `(updated_at, id)` so a backlog of queued rows cannot
//! hide newer orphans behind it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use distributask_core::{Config, TaskStore, UnfinishedCursor};

use crate::distributor::Distributor;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// Rows updated more recently than this are left alone.
    pub grace: Duration,
    /// Page size when scanning candidates.
    pub batch_size: i64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            grace: Duration::from_secs(300),
            batch_size: 500,
        }
    }
}

impl ReconcilerConfig {
    /// `None` when the sweep is disabled.
    pub fn from_config(config: &Config) -> Option<Self> {
        config.reconcile_interval().map(|interval| Self {
            interval,
            grace: Duration::from_secs(config.reconcile.grace_secs),
            ..Self::default()
        })
    }
}

pub struct Reconciler {
    store: Arc<dyn TaskStore>,
    distributor: Distributor,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(store: Arc<dyn TaskStore>, distributor: Distributor, config: ReconcilerConfig) -> Self {
        Self {
            store,
            distributor,
            config,
        }
    }

    /// Run one sweep. Returns the number of tasks resubmitted.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self) -> Result<usize, anyhow::Error> {
        let grace = chrono::Duration::from_std(self.config.grace)?;
        let cutoff = Utc::now() - grace;

        let batch_size = self.config.batch_size.max(1);

        let mut scanned = 0;
        let mut resubmitted = 0;
        let mut cursor = None;
        loop {
            let page = self
                .store
                .list_unfinished(cutoff, cursor, batch_size)
                .await?;
            scanned += page.len();

            for task in &page {
                if self.distributor.broker().contains(task.id).await? {
                    continue;
                }

                tracing::warn!(
                    task_id = task.id,
                    status = %task.status,
                    retry_count = task.retry_count,
                    "Task has no queue reference, resubmitting"
                );
                self.distributor.submit_task(task).await?;
                resubmitted += 1;
            }

            match page.last() {
                Some(last) if page.len() as i64 == batch_size => {
                    cursor = Some(UnfinishedCursor::after(last));
                }
                _ => break,
            }
        }

        tracing::debug!(
            scanned,
            resubmitted,
            "Reconciliation sweep finished"
        );
        Ok(resubmitted)
    }

    /// Run sweeps every `interval` until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.sweep().await {
                            tracing::error!(error = %e, "Reconciliation sweep failed");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            tracing::debug!("Reconciler stopped");
        })
    }
}
