//! In-process broker
//!
//! Visibility, delays and lease expiry run on `tokio::time`, so tests can drive them
//! with a paused clock.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use distributask_core::models::{Priority, QueueReference, TaskId};

use crate::broker::{
    wall_clock_after, Broker, Delivery, EnqueueOptions, LeaseToken, QueueMessage,
};
use crate::error::BrokerError;

#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    /// Added to a message's timeout to get its lease duration.
    pub lease_grace: Duration,
    pub poll_interval: Duration,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            lease_grace: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Counts of held references by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub visible: usize,
    pub delayed: usize,
    pub leased: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.visible + self.delayed + self.leased
    }
}

struct Lease {
    message: QueueMessage,
    seq: u64,
    expires_at: Instant,
}

struct Delayed {
    message: QueueMessage,
    visible_at: Instant,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    /// One FIFO per tier, keyed by arrival sequence.
    tiers: [BTreeMap<u64, QueueMessage>; 3],
    delayed: Vec<Delayed>,
    leased: HashMap<LeaseToken, Lease>,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn push_visible(&mut self, message: QueueMessage) {
        let seq = self.next_seq();
        self.tiers[message.priority.rank()].insert(seq, message);
    }

    fn holds(&self, task_id: TaskId) -> bool {
        self.tiers
            .iter()
            .any(|tier| tier.values().any(|m| m.reference.task_id == task_id))
            || self
                .delayed
                .iter()
                .any(|d| d.message.reference.task_id == task_id)
            || self
                .leased
                .values()
                .any(|l| l.message.reference.task_id == task_id)
    }

    /// Return expired leases to their tier at their original position and make due
    /// delayed references visible.
    fn release_due(&mut self, now: Instant) {
        let expired: Vec<LeaseToken> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            if let Some(lease) = self.leased.remove(&token) {
                tracing::warn!(
                    task_id = lease.message.reference.task_id,
                    lease = %token,
                    "Lease expired, reference is visible again"
                );
                self.tiers[lease.message.priority.rank()].insert(lease.seq, lease.message);
            }
        }

        if self.delayed.iter().any(|d| d.visible_at <= now) {
            let (mut due, pending): (Vec<Delayed>, Vec<Delayed>) = std::mem::take(&mut self.delayed)
                .into_iter()
                .partition(|d| d.visible_at <= now);
            self.delayed = pending;
            due.sort_by_key(|d| d.visible_at);
            for d in due {
                let mut message = d.message;
                message.not_before = None;
                self.push_visible(message);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let delayed = self.delayed.iter().map(|d| d.visible_at);
        let leases = self.leased.values().map(|l| l.expires_at);
        delayed.chain(leases).min()
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            visible: self.tiers.iter().map(BTreeMap::len).sum(),
            delayed: self.delayed.len(),
            leased: self.leased.len(),
        }
    }
}

pub struct MemoryBroker {
    state: Mutex<State>,
    notify: Notify,
    config: MemoryBrokerConfig,
}

impl MemoryBroker {
    pub fn new(config: MemoryBrokerConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            config,
        }
    }

    pub async fn stats(&self) -> QueueStats {
        let mut state = self.state.lock().await;
        state.release_due(Instant::now());
        state.stats()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerConfig::default())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(
        &self,
        reference: QueueReference,
        options: EnqueueOptions,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if state.holds(reference.task_id) {
            tracing::debug!(task_id = reference.task_id, "Reference already queued");
            return Ok(());
        }
        state.push_visible(QueueMessage::new(reference, options));
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    async fn try_dequeue(&self) -> Result<Option<Delivery>, BrokerError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.release_due(now);

        let Some((seq, message)) = Priority::ALL
            .iter()
            .find_map(|p| state.tiers[p.rank()].pop_first())
        else {
            return Ok(None);
        };

        let lease_duration = message.timeout() + self.config.lease_grace;
        let token = LeaseToken::new();
        let leased_until = wall_clock_after(lease_duration);

        state.leased.insert(
            token,
            Lease {
                message: message.clone(),
                seq,
                expires_at: now + lease_duration,
            },
        );

        Ok(Some(Delivery {
            message,
            lease: token,
            leased_until,
        }))
    }

    async fn ack(&self, lease: LeaseToken) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.release_due(Instant::now());
        state
            .leased
            .remove(&lease)
            .map(|_| ())
            .ok_or(BrokerError::LeaseNotFound(lease))
    }

    async fn schedule_retry(
        &self,
        lease: LeaseToken,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.release_due(now);

        let Lease { mut message, .. } = state
            .leased
            .remove(&lease)
            .ok_or(BrokerError::LeaseNotFound(lease))?;

        if delay.is_zero() {
            state.push_visible(message);
        } else {
            message.not_before = Some(wall_clock_after(delay));
            state.delayed.push(Delayed {
                message,
                visible_at: now + delay,
            });
        }
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    async fn cancel(&self, task_id: TaskId) -> Result<bool, BrokerError> {
        let mut state = self.state.lock().await;
        state.release_due(Instant::now());

        for tier in state.tiers.iter_mut() {
            let found = tier
                .iter()
                .find(|(_, m)| m.reference.task_id == task_id)
                .map(|(seq, _)| *seq);
            if let Some(seq) = found {
                tier.remove(&seq);
                return Ok(true);
            }
        }

        let before = state.delayed.len();
        state
            .delayed
            .retain(|d| d.message.reference.task_id != task_id);
        Ok(state.delayed.len() != before)
    }

    async fn contains(&self, task_id: TaskId) -> Result<bool, BrokerError> {
        Ok(self.state.lock().await.holds(task_id))
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        let now = Instant::now();
        let deadline = {
            let state = self.state.lock().await;
            state.next_deadline()
        };
        let wait = match deadline {
            Some(at) => max_wait.min(at.saturating_duration_since(now)),
            None => max_wait,
        };

        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
    }

    fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }
}
