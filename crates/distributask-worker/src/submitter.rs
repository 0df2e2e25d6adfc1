//! Producer-facing task operations
//!
//! Validates submissions, creates the row, then distributes its reference. The row
//! is committed before the broker is touched, so an enqueue failure leaves a
//! `pending` row with no reference for the reconciler to pick up.

use serde::Deserialize;
use std::sync::Arc;

use distributask_broker::BrokerError;
use distributask_core::config::TaskDefaults;
use distributask_core::models::{ImagePayload, OwnerId, Priority, Task, TaskId, IMAGE_PROCESSING};
use distributask_core::validation::{validate_image_url, validate_max_retries, validate_timeout_seconds};
use distributask_core::{NewTask, StoreError, TaskListQuery, TaskStore};

use crate::distributor::Distributor;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Invalid task: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The row exists but its reference could not be queued.
    #[error("Task {task_id} was stored but could not be queued: {source}")]
    Enqueue {
        task_id: TaskId,
        #[source]
        source: BrokerError,
    },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Submission as clients send it.
///
/// `params` may be given at the top level or inside `payload`; the top-level value
/// wins when both are present.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub priority: Option<PriorityInput>,
    #[serde(default)]
    pub timeout_seconds: Option<i32>,
    #[serde(default)]
    pub max_retries: Option<i32>,
}

/// Priority as a tier name or as a numeric weight (3 critical, 2 default, 1 low).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PriorityInput {
    Named(Priority),
    Weight(i32),
}

impl From<PriorityInput> for Priority {
    fn from(input: PriorityInput) -> Self {
        match input {
            PriorityInput::Named(priority) => priority,
            PriorityInput::Weight(weight) => Priority::from_weight(weight),
        }
    }
}

#[derive(Clone)]
pub struct TaskSubmitter {
    store: Arc<dyn TaskStore>,
    distributor: Distributor,
    defaults: TaskDefaults,
}

impl TaskSubmitter {
    pub fn new(store: Arc<dyn TaskStore>, distributor: Distributor, defaults: TaskDefaults) -> Self {
        Self {
            store,
            distributor,
            defaults,
        }
    }

    /// Validate, insert and distribute a new task for `owner_id`.
    #[tracing::instrument(skip(self, request), fields(task_type = %request.task_type))]
    pub async fn create_task(
        &self,
        owner_id: OwnerId,
        request: CreateTaskRequest,
    ) -> Result<Task, SubmitError> {
        let new_task = self.validate(owner_id, request)?;

        let task = self.store.insert(new_task).await.map_err(|e| {
            tracing::error!(error = %e, owner_id, "Failed to create task in store");
            e
        })?;

        if let Err(source) = self
            .distributor
            .submit(
                task.id,
                task.owner_id,
                task.priority,
                task.timeout(),
                task.max_retries,
            )
            .await
        {
            tracing::warn!(
                task_id = task.id,
                error = %source,
                "Task stored but not queued, leaving it pending for reconciliation"
            );
            return Err(SubmitError::Enqueue {
                task_id: task.id,
                source,
            });
        }

        tracing::info!(
            task_id = task.id,
            owner_id,
            priority = %task.priority,
            "Task submitted"
        );
        Ok(task)
    }

    pub async fn get_task(&self, owner_id: OwnerId, task_id: TaskId) -> Result<Task, SubmitError> {
        Ok(self.store.load(task_id, owner_id).await?)
    }

    pub async fn list_tasks(
        &self,
        owner_id: OwnerId,
        query: TaskListQuery,
    ) -> Result<Vec<Task>, SubmitError> {
        Ok(self.store.list(owner_id, query).await?)
    }

    /// Delete an owner's task and withdraw its reference if no worker holds it.
    ///
    /// A leased reference is left alone; the worker drops it when the row is gone.
    #[tracing::instrument(skip(self))]
    pub async fn delete_task(&self, owner_id: OwnerId, task_id: TaskId) -> Result<bool, SubmitError> {
        // Confirm ownership before touching the shared queue.
        self.store.load(task_id, owner_id).await?;
        self.distributor.withdraw(task_id).await?;
        let deleted = self.store.delete(task_id, owner_id).await?;
        if deleted {
            tracing::info!(task_id, owner_id, "Task deleted");
        }
        Ok(deleted)
    }

    fn validate(&self, owner_id: OwnerId, request: CreateTaskRequest) -> Result<NewTask, SubmitError> {
        if request.task_type != IMAGE_PROCESSING {
            return Err(SubmitError::Validation(format!(
                "only {} type is allowed, got '{}'",
                IMAGE_PROCESSING, request.task_type
            )));
        }

        let mut payload = request.payload;
        if let Some(params) = request.params {
            match payload.as_object_mut() {
                Some(object) => {
                    object.insert("params".to_string(), params);
                }
                None => {
                    return Err(SubmitError::Validation(
                        "payload must be a JSON object".to_string(),
                    ))
                }
            }
        }

        let image = ImagePayload::from_value(&payload)
            .map_err(|e| SubmitError::Validation(e.to_string()))?;
        validate_image_url(&image.url).map_err(|e| SubmitError::Validation(e.to_string()))?;

        let timeout_seconds = request
            .timeout_seconds
            .unwrap_or(self.defaults.timeout_seconds);
        validate_timeout_seconds(timeout_seconds)
            .map_err(|e| SubmitError::Validation(e.to_string()))?;

        let max_retries = request.max_retries.unwrap_or(self.defaults.max_retries);
        validate_max_retries(max_retries).map_err(|e| SubmitError::Validation(e.to_string()))?;

        Ok(NewTask {
            owner_id,
            task_type: request.task_type,
            // Store the normalised form so workers decode exactly what was validated.
            payload: image.to_value(),
            priority: request
                .priority
                .map(Priority::from)
                .unwrap_or(self.defaults.priority),
            timeout_seconds,
            max_retries,
        })
    }
}
