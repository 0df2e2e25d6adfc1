//! Task distribution
//!
//! Turns committed task rows into broker references and withdraws them on delete.

use std::sync::Arc;
use std::time::Duration;

use distributask_broker::{Broker, BrokerError, EnqueueOptions};
use distributask_core::models::{OwnerId, Priority, QueueReference, Task, TaskId};

/// Producer side of the broker.
///
/// No retry happens here; failures go straight back to the caller.
#[derive(Clone)]
pub struct Distributor {
    broker: Arc<dyn Broker>,
}

impl Distributor {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Enqueue a reference for an already committed task row.
    #[tracing::instrument(skip(self, timeout), fields(timeout_secs = timeout.as_secs()))]
    pub async fn submit(
        &self,
        task_id: TaskId,
        owner_id: OwnerId,
        priority: Priority,
        timeout: Duration,
        max_retries: i32,
    ) -> Result<(), BrokerError> {
        let reference = QueueReference { task_id, owner_id };
        let options = EnqueueOptions {
            priority,
            timeout,
            max_retries,
        };

        self.broker.enqueue(reference, options).await.map_err(|e| {
            tracing::error!(error = %e, task_id, "Failed to enqueue task reference");
            e
        })?;

        tracing::info!(task_id, priority = %priority, "Task distributed");
        Ok(())
    }

    pub async fn submit_task(&self, task: &Task) -> Result<(), BrokerError> {
        let options = EnqueueOptions::for_task(task);
        self.submit(
            task.id,
            task.owner_id,
            options.priority,
            options.timeout,
            options.max_retries,
        )
        .await
    }

    /// Drop the task's reference if no worker holds it. Returns whether one was removed.
    #[tracing::instrument(skip(self))]
    pub async fn withdraw(&self, task_id: TaskId) -> Result<bool, BrokerError> {
        let removed = self.broker.cancel(task_id).await?;
        if removed {
            tracing::info!(task_id, "Task reference withdrawn");
        } else {
            tracing::debug!(task_id, "No unleased reference to withdraw");
        }
        Ok(removed)
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distributask_broker::MemoryBroker;

    #[tokio::test(start_paused = true)]
    async fn test_submit_carries_metadata() {
        let broker = Arc::new(MemoryBroker::default());
        let distributor = Distributor::new(broker.clone());

        distributor
            .submit(7, 3, Priority::Critical, Duration::from_secs(45), 2)
            .await
            .unwrap();

        let delivery = broker.try_dequeue().await.unwrap().unwrap();
        assert_eq!(
            delivery.reference(),
            QueueReference {
                task_id: 7,
                owner_id: 3
            }
        );
        assert_eq!(delivery.message.priority, Priority::Critical);
        assert_eq!(delivery.message.timeout_seconds, 45);
        assert_eq!(delivery.message.max_retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_withdraw_unleased_reference() {
        let broker = Arc::new(MemoryBroker::default());
        let distributor = Distributor::new(broker.clone());
        distributor
            .submit(1, 1, Priority::Low, Duration::from_secs(30), 5)
            .await
            .unwrap();

        assert!(distributor.withdraw(1).await.unwrap());
        assert!(!distributor.withdraw(1).await.unwrap());
        assert!(!broker.contains(1).await.unwrap());
    }
}
