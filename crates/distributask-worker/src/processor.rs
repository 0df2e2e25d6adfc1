//! Worker pool: lease references, run handlers, persist outcomes.
//!
//! Each worker loops on [`Broker::dequeue`] and hands the delivery to
//! [`Processor::process`], which never returns an error: every failure inside an
//! attempt ends as a [`ProcessOutcome`] so one bad task cannot take a worker down.
//!
//! Shutdown: [`ProcessorHandle::shutdown`] stops workers from leasing new references
//! and waits for in-flight attempts to finish.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use distributask_broker::{Broker, BrokerError, Delivery};
use distributask_core::models::{FailureOutcome, Task};
use distributask_core::{Config, StoreError, TaskError, TaskStore};

use crate::registry::{HandlerRegistry, TaskHandler};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// Delay before redelivering a reference whose store operation failed.
    pub store_retry_delay: Duration,
    /// Pause after a failed dequeue before trying again.
    pub error_backoff: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            store_retry_delay: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl ProcessorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.worker.concurrency.max(1),
            store_retry_delay: config.store_retry_delay(),
            error_backoff: config.poll_interval(),
        }
    }
}

/// How a single delivery was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    /// Transient failure with budget left; the reference comes back after `delay`.
    RetryScheduled { retry_count: i32, delay: Duration },
    /// Handler rejected the input; no retry.
    FailedValidation,
    /// No handler is registered for the task type; no retry.
    FailedUnhandled,
    /// Transient failure with the budget spent.
    FailedExhausted { retry_count: i32 },
    /// The task row no longer exists; the reference was dropped.
    Dropped,
    /// The task was already terminal; acked without running the handler.
    Skipped,
    /// The store could not be used; redelivery was scheduled without touching the budget.
    Deferred { delay: Duration },
}

pub struct Processor {
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    retry_policy: RetryPolicy,
    config: ProcessorConfig,
}

impl Processor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        broker: Arc<dyn Broker>,
        registry: Arc<HandlerRegistry>,
        retry_policy: RetryPolicy,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            broker,
            registry,
            retry_policy,
            config,
        }
    }

    /// Spawn the worker pool.
    pub fn start(self: Arc<Self>) -> ProcessorHandle {
        let shutdown = CancellationToken::new();
        let mut workers = JoinSet::new();

        for worker_id in 0..self.config.concurrency.max(1) {
            let processor = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { processor.run_worker(worker_id, shutdown).await });
        }

        tracing::info!(
            concurrency = self.config.concurrency,
            handlers = ?self.registry.task_types(),
            retry_policy = ?self.retry_policy,
            "Task processor started"
        );

        ProcessorHandle { shutdown, workers }
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize, shutdown: CancellationToken) {
        tracing::debug!(worker_id, "Worker started");

        loop {
            match self.broker.dequeue(&shutdown).await {
                Ok(Some(delivery)) => {
                    let task_id = delivery.task_id();
                    let outcome = self.process(delivery).await;
                    tracing::debug!(worker_id, task_id, outcome = ?outcome, "Delivery processed");
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(worker_id, error = %e, "Dequeue failed, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        tracing::debug!(worker_id, "Worker stopped");
    }

    /// Run one leased delivery through the task lifecycle.
    #[tracing::instrument(
        skip(self, delivery),
        fields(task_id = delivery.task_id(), owner_id = delivery.message.reference.owner_id, lease = %delivery.lease)
    )]
    pub async fn process(&self, delivery: Delivery) -> ProcessOutcome {
        let reference = delivery.reference();

        let task = match self.store.load(reference.task_id, reference.owner_id).await {
            Ok(task) => task,
            Err(StoreError::NotFound { .. }) => {
                tracing::info!("Task no longer exists, dropping reference");
                self.ack(&delivery).await;
                return ProcessOutcome::Dropped;
            }
            Err(e) => return self.defer(&delivery, &e).await,
        };

        if task.is_terminal() {
            tracing::info!(status = %task.status, "Task already finished, acknowledging redelivery");
            self.ack(&delivery).await;
            return ProcessOutcome::Skipped;
        }

        let mut attempt = task;
        attempt.start_attempt(Utc::now());
        let task = match self.persist(&delivery, &attempt).await {
            Ok(task) => task,
            Err(outcome) => return outcome,
        };

        let handler = match self.registry.resolve(&task.task_type) {
            Ok(handler) => handler,
            Err(e) => {
                tracing::error!(error = %e, task_type = %task.task_type, "No handler registered for task type");
                let mut failed = task;
                failed.reject(e.to_string(), Utc::now());
                if let Err(outcome) = self.persist(&delivery, &failed).await {
                    return outcome;
                }
                self.ack(&delivery).await;
                return ProcessOutcome::FailedUnhandled;
            }
        };

        match self.run_handler(handler, &task).await {
            Ok(output) => self.complete(&delivery, task, &output).await,
            Err(e) if !e.is_retryable() => self.reject(&delivery, task, e).await,
            Err(e) => self.fail_attempt(&delivery, task, e).await,
        }
    }

    /// Run the handler in its own task so a panic or an overrun cannot take the worker down.
    async fn run_handler(
        &self,
        handler: Arc<dyn TaskHandler>,
        task: &Task,
    ) -> Result<Vec<u8>, TaskError> {
        let deadline = task.timeout();
        let owned = task.clone();
        let mut attempt = tokio::spawn(async move { handler.handle(&owned).await });

        match tokio::time::timeout(deadline, &mut attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(TaskError::transient(anyhow::anyhow!(
                "handler aborted: {}",
                join_error
            ))),
            Err(_) => {
                attempt.abort();
                Err(TaskError::transient(anyhow::anyhow!(
                    "deadline exceeded after {}s",
                    deadline.as_secs()
                )))
            }
        }
    }

    async fn complete(&self, delivery: &Delivery, mut task: Task, output: &[u8]) -> ProcessOutcome {
        task.complete(STANDARD.encode(output), Utc::now());
        if let Err(outcome) = self.persist(delivery, &task).await {
            return outcome;
        }
        self.ack(delivery).await;

        tracing::info!(
            task_type = %task.task_type,
            retry_count = task.retry_count,
            output_bytes = output.len(),
            "Task completed successfully"
        );
        ProcessOutcome::Completed
    }

    async fn reject(&self, delivery: &Delivery, mut task: Task, error: TaskError) -> ProcessOutcome {
        tracing::error!(
            error = %error,
            task_type = %task.task_type,
            "Task failed validation, will not retry"
        );

        task.reject(error.to_string(), Utc::now());
        if let Err(outcome) = self.persist(delivery, &task).await {
            return outcome;
        }
        self.ack(delivery).await;
        ProcessOutcome::FailedValidation
    }

    async fn fail_attempt(
        &self,
        delivery: &Delivery,
        mut task: Task,
        error: TaskError,
    ) -> ProcessOutcome {
        let attempt = task.retry_count.saturating_add(1);
        let delay = self.retry_policy.delay(attempt, &error);
        let now = Utc::now();
        let next_retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);

        let outcome = task.record_failure(error.to_string(), next_retry_at, now);
        if let Err(outcome) = self.persist(delivery, &task).await {
            return outcome;
        }

        match outcome {
            FailureOutcome::RetryScheduled { .. } => {
                tracing::info!(
                    error = %error,
                    retry_count = task.retry_count,
                    max_retries = task.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Task attempt failed, scheduling retry"
                );
                if let Err(e) = self.broker.schedule_retry(delivery.lease, delay).await {
                    // The reference is still held, either re-leased after expiry or
                    // returned when this lease lapses.
                    tracing::warn!(error = %e, "Failed to schedule retry with broker");
                }
                ProcessOutcome::RetryScheduled {
                    retry_count: task.retry_count,
                    delay,
                }
            }
            FailureOutcome::Exhausted => {
                tracing::error!(
                    error = %error,
                    retry_count = task.retry_count,
                    max_retries = task.max_retries,
                    "Task failed after max retries"
                );
                self.ack(delivery).await;
                ProcessOutcome::FailedExhausted {
                    retry_count: task.retry_count,
                }
            }
        }
    }

    /// Save `task`; on failure, resolve the delivery and return the outcome instead.
    async fn persist(&self, delivery: &Delivery, task: &Task) -> Result<Task, ProcessOutcome> {
        match self.store.save(task).await {
            Ok(saved) => Ok(saved),
            Err(StoreError::NotFound { .. }) => {
                tracing::info!("Task deleted during processing, dropping reference");
                self.ack(delivery).await;
                Err(ProcessOutcome::Dropped)
            }
            Err(e) => Err(self.defer(delivery, &e).await),
        }
    }

    async fn defer(&self, delivery: &Delivery, error: &StoreError) -> ProcessOutcome {
        let delay = self.config.store_retry_delay;
        tracing::warn!(
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "Task store operation failed, redelivering later"
        );
        if let Err(e) = self.broker.schedule_retry(delivery.lease, delay).await {
            tracing::warn!(error = %e, "Failed to reschedule reference after store failure");
        }
        ProcessOutcome::Deferred { delay }
    }

    async fn ack(&self, delivery: &Delivery) {
        match self.broker.ack(delivery.lease).await {
            Ok(()) => {}
            Err(BrokerError::LeaseNotFound(_)) => {
                tracing::warn!("Lease lost before acknowledgement, reference may be redelivered");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to acknowledge reference");
            }
        }
    }
}

/// Running worker pool.
pub struct ProcessorHandle {
    shutdown: CancellationToken,
    workers: JoinSet<()>,
}

impl ProcessorHandle {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop leasing new references and wait for in-flight attempts to finish.
    pub async fn shutdown(mut self) {
        tracing::info!("Initiating task processor shutdown");
        self.shutdown.cancel();

        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task terminated abnormally");
            }
        }

        tracing::info!("Task processor stopped");
    }
}
