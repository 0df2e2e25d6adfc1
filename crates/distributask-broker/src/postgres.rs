//! Postgres-backed broker
//!
//! References live in `queue_items`, one row per task. Tier and arrival order come from
//! `tier_rank` and a shared sequence; `not_before` hides delayed rows and
//! `lease_token`/`leased_until` mark leased ones. Workers are woken through
//! LISTEN/NOTIFY on [`QUEUE_NOTIFY_CHANNEL`] and fall back to polling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use distributask_core::models::{Priority, QueueReference, TaskId};

use crate::broker::{
    wall_clock_after, Broker, Delivery, EnqueueOptions, LeaseToken, QueueMessage,
};
use crate::error::BrokerError;

/// Channel name for PostgreSQL LISTEN/NOTIFY when a reference becomes visible.
pub const QUEUE_NOTIFY_CHANNEL: &str = "distributask_queue";

const LISTEN_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PgBrokerConfig {
    /// Added to a message's timeout to get its lease duration.
    pub lease_grace: Duration,
    pub poll_interval: Duration,
    /// Wake workers through LISTEN/NOTIFY in addition to polling.
    pub listen: bool,
}

impl Default for PgBrokerConfig {
    fn default() -> Self {
        Self {
            lease_grace: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            listen: true,
        }
    }
}

#[derive(sqlx::FromRow)]
struct QueueItemRow {
    task_id: i64,
    owner_id: i64,
    priority: String,
    timeout_seconds: i32,
    max_retries: i32,
    enqueued_at: DateTime<Utc>,
    not_before: Option<DateTime<Utc>>,
    leased_until: Option<DateTime<Utc>>,
}

impl QueueItemRow {
    fn into_message(self) -> Result<(QueueMessage, Option<DateTime<Utc>>), BrokerError> {
        let priority = self
            .priority
            .parse::<Priority>()
            .map_err(|e| BrokerError::Serialization(format!("task {}: {}", self.task_id, e)))?;

        let message = QueueMessage {
            reference: QueueReference {
                task_id: self.task_id,
                owner_id: self.owner_id,
            },
            priority,
            timeout_seconds: self.timeout_seconds as i64,
            max_retries: self.max_retries,
            enqueued_at: self.enqueued_at,
            not_before: self.not_before,
        };
        Ok((message, self.leased_until))
    }
}

pub struct PgBroker {
    pool: PgPool,
    config: PgBrokerConfig,
    notify: Arc<Notify>,
    listener: Option<JoinHandle<()>>,
}

impl PgBroker {
    /// Create a broker over `pool`. With `config.listen`, spawns a LISTEN task that
    /// reconnects on failure; it is aborted when the broker is dropped.
    pub fn new(pool: PgPool, config: PgBrokerConfig) -> Self {
        let notify = Arc::new(Notify::new());

        let listener = config.listen.then(|| {
            let pool = pool.clone();
            let notify = notify.clone();
            tokio::spawn(async move {
                loop {
                    match sqlx::postgres::PgListener::connect_with(&pool).await {
                        Ok(mut listener) => {
                            if let Err(e) = listener.listen(QUEUE_NOTIFY_CHANNEL).await {
                                tracing::warn!(error = %e, "LISTEN failed, will retry");
                                tokio::time::sleep(LISTEN_RETRY_DELAY).await;
                                continue;
                            }
                            while listener.recv().await.is_ok() {
                                notify.notify_one();
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "PgListener connect failed, will retry");
                            tokio::time::sleep(LISTEN_RETRY_DELAY).await;
                        }
                    }
                }
            })
        });

        Self {
            pool,
            config,
            notify,
            listener,
        }
    }
}

impl Drop for PgBroker {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

#[async_trait]
impl Broker for PgBroker {
    #[tracing::instrument(skip(self, options), fields(priority = %options.priority))]
    async fn enqueue(
        &self,
        reference: QueueReference,
        options: EnqueueOptions,
    ) -> Result<(), BrokerError> {
        let message = QueueMessage::new(reference, options);

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO queue_items (
                task_id, owner_id, priority, tier_rank, timeout_seconds,
                max_retries, enqueued_at, seq
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, nextval('queue_items_seq'))
            ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(reference.task_id)
        .bind(reference.owner_id)
        .bind(message.priority.as_str())
        .bind(message.priority.rank() as i16)
        .bind(message.timeout_seconds as i32)
        .bind(message.max_retries)
        .bind(message.enqueued_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.commit().await?;
            tracing::debug!(task_id = reference.task_id, "Reference already queued");
            return Ok(());
        }

        // Workers also poll, so a failed NOTIFY only delays pickup.
        if let Err(e) = sqlx::query("SELECT pg_notify($1, '')")
            .bind(QUEUE_NOTIFY_CHANNEL)
            .execute(&mut *tx)
            .await
        {
            tracing::warn!(
                error = %e,
                task_id = reference.task_id,
                "Failed to send pg_notify, workers will discover the reference via polling"
            );
        }

        tx.commit().await?;
        Ok(())
    }

    async fn try_dequeue(&self) -> Result<Option<Delivery>, BrokerError> {
        let token = LeaseToken::new();

        // Expired leases are claimable again and keep their original `seq`.
        let row: Option<QueueItemRow> = sqlx::query_as::<Postgres, QueueItemRow>(
            r#"
            WITH next AS (
                SELECT id
                FROM queue_items
                WHERE (lease_token IS NULL OR leased_until <= NOW())
                    AND (not_before IS NULL OR not_before <= NOW())
                ORDER BY tier_rank ASC, seq ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_items q
            SET lease_token = $1,
                leased_until = NOW() + make_interval(secs => q.timeout_seconds + $2),
                not_before = NULL
            FROM next
            WHERE q.id = next.id
            RETURNING
                q.task_id,
                q.owner_id,
                q.priority,
                q.timeout_seconds,
                q.max_retries,
                q.enqueued_at,
                q.not_before,
                q.leased_until
            "#,
        )
        .bind(token.as_uuid())
        .bind(self.config.lease_grace.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            tracing::trace!("No references available in queue");
            return Ok(None);
        };

        let (message, leased_until) = row.into_message()?;
        let leased_until = leased_until
            .unwrap_or_else(|| wall_clock_after(message.timeout() + self.config.lease_grace));

        tracing::debug!(
            task_id = message.reference.task_id,
            priority = %message.priority,
            lease = %token,
            "Reference leased"
        );

        Ok(Some(Delivery {
            message,
            lease: token,
            leased_until,
        }))
    }

    #[tracing::instrument(skip(self))]
    async fn ack(&self, lease: LeaseToken) -> Result<(), BrokerError> {
        let deleted = sqlx::query(
            "DELETE FROM queue_items WHERE lease_token = $1 AND leased_until > NOW()",
        )
        .bind(lease.as_uuid())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if deleted == 0 {
            return Err(BrokerError::LeaseNotFound(lease));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn schedule_retry(
        &self,
        lease: LeaseToken,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE queue_items
            SET lease_token = NULL,
                leased_until = NULL,
                not_before = NOW() + make_interval(secs => $2),
                seq = nextval('queue_items_seq')
            WHERE lease_token = $1 AND leased_until > NOW()
            "#,
        )
        .bind(lease.as_uuid())
        .bind(delay.as_secs_f64())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(BrokerError::LeaseNotFound(lease));
        }

        if delay.is_zero() {
            if let Err(e) = sqlx::query("SELECT pg_notify($1, '')")
                .bind(QUEUE_NOTIFY_CHANNEL)
                .execute(&mut *tx)
                .await
            {
                tracing::warn!(error = %e, "Failed to send pg_notify for retried reference");
            }
        }

        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn cancel(&self, task_id: TaskId) -> Result<bool, BrokerError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM queue_items
            WHERE task_id = $1
                AND (lease_token IS NULL OR leased_until <= NOW())
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(deleted > 0)
    }

    async fn contains(&self, task_id: TaskId) -> Result<bool, BrokerError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM queue_items WHERE task_id = $1)")
                .bind(task_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.notify.notified()).await;
    }

    fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }
}
