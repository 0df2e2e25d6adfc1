//! Broker contract and the types that travel through it

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use distributask_core::models::{Priority, QueueReference, Task, TaskId};

use crate::error::BrokerError;

/// Opaque handle for one delivery of a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for LeaseToken {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl Display for LeaseToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

/// Broker metadata attached to a reference at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub priority: Priority,
    pub timeout: Duration,
    pub max_retries: i32,
}

impl EnqueueOptions {
    pub fn for_task(task: &Task) -> Self {
        Self {
            priority: task.priority,
            timeout: task.timeout(),
            max_retries: task.max_retries,
        }
    }
}

/// Wire shape of a queued reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    #[serde(flatten)]
    pub reference: QueueReference,
    pub priority: Priority,
    pub timeout_seconds: i64,
    pub max_retries: i32,
    pub enqueued_at: DateTime<Utc>,
    pub not_before: Option<DateTime<Utc>>,
}

impl QueueMessage {
    pub fn new(reference: QueueReference, options: EnqueueOptions) -> Self {
        Self {
            reference,
            priority: options.priority,
            timeout_seconds: options.timeout.as_secs().max(1) as i64,
            max_retries: options.max_retries,
            enqueued_at: Utc::now(),
            not_before: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1) as u64)
    }
}

/// Wall-clock instant `delay` from now, saturating at the far future.
pub(crate) fn wall_clock_after(delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A leased reference handed to one worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueueMessage,
    pub lease: LeaseToken,
    pub leased_until: DateTime<Utc>,
}

impl Delivery {
    pub fn reference(&self) -> QueueReference {
        self.message.reference
    }

    pub fn task_id(&self) -> TaskId {
        self.message.reference.task_id
    }
}

/// Durable multi-tier priority queue of task references.
///
/// Tiers drain strictly in [`Priority::ALL`] order and FIFO within a tier. A dequeued
/// reference is leased to exactly one caller and stays invisible until it is acked,
/// rescheduled, or its lease (the message timeout plus a grace period) expires.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Add a reference to its tier. A task that is already held is left untouched.
    async fn enqueue(
        &self,
        reference: QueueReference,
        options: EnqueueOptions,
    ) -> Result<(), BrokerError>;

    /// Lease the next visible reference, if any.
    async fn try_dequeue(&self) -> Result<Option<Delivery>, BrokerError>;

    /// Remove a leased reference permanently.
    async fn ack(&self, lease: LeaseToken) -> Result<(), BrokerError>;

    /// Return a leased reference to its original tier, invisible for `delay`.
    async fn schedule_retry(&self, lease: LeaseToken, delay: Duration)
        -> Result<(), BrokerError>;

    /// Remove an unleased reference. Returns `false` if the task is leased or absent.
    async fn cancel(&self, task_id: TaskId) -> Result<bool, BrokerError>;

    /// Whether the broker holds a reference for the task in any state.
    async fn contains(&self, task_id: TaskId) -> Result<bool, BrokerError>;

    /// Park until new work may be available or `max_wait` passes.
    async fn wait_for_work(&self, max_wait: Duration);

    fn poll_interval(&self) -> Duration;

    /// Block until a reference is leased or `shutdown` fires (`Ok(None)`).
    async fn dequeue(&self, shutdown: &CancellationToken) -> Result<Option<Delivery>, BrokerError> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(None);
            }

            if let Some(delivery) = self.try_dequeue().await? {
                return Ok(Some(delivery));
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = self.wait_for_work(self.poll_interval()) => {}
            }
        }
    }
}
