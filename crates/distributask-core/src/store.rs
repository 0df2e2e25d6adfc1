//! Task record store contract
//!
//! The processor and the submitter only talk to persistence through [`TaskStore`].
//! `NotFound` is kept distinct from `Unavailable` so callers can drop references to
//! deleted rows without mistaking an outage for a deletion.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{OwnerId, Priority, Task, TaskId, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Task {task_id} not found")]
    NotFound { task_id: TaskId },

    /// The row changed since it was loaded; `expected` is the stale version.
    #[error("Task {task_id} was modified concurrently (expected version {expected})")]
    Conflict { task_id: TaskId, expected: i32 },

    #[error("Task store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.into())
    }
}

/// Row to insert. Identity, status and timestamps are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub owner_id: OwnerId,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub timeout_seconds: i32,
    pub max_retries: i32,
}

#[derive(Debug, Clone)]
pub struct TaskListQuery {
    pub status: Option<TaskStatus>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for TaskListQuery {
    fn default() -> Self {
        Self {
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// Keyset position for paging through [`TaskStore::list_unfinished`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnfinishedCursor {
    pub updated_at: DateTime<Utc>,
    pub id: TaskId,
}

impl UnfinishedCursor {
    /// Position just past `task`.
    pub fn after(task: &Task) -> Self {
        Self {
            updated_at: task.updated_at,
            id: task.id,
        }
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a `pending` task with `retry_count = 0` and return the stored row.
    async fn insert(&self, task: NewTask) -> Result<Task, StoreError>;

    /// Load a task scoped to its owner.
    async fn load(&self, task_id: TaskId, owner_id: OwnerId) -> Result<Task, StoreError>;

    /// Persist the mutable fields of `task` if its `version` still matches the stored row.
    ///
    /// Returns the row as stored, with the bumped version.
    async fn save(&self, task: &Task) -> Result<Task, StoreError>;

    /// Owner's tasks, newest first.
    async fn list(&self, owner_id: OwnerId, query: TaskListQuery)
        -> Result<Vec<Task>, StoreError>;

    /// Delete an owner's task. Returns `false` if no such row exists.
    async fn delete(&self, task_id: TaskId, owner_id: OwnerId) -> Result<bool, StoreError>;

    /// Non-terminal tasks (pending, in progress, or failed with a retry pending) whose
    /// `updated_at` is older than `updated_before`, ordered by `(updated_at, id)` and
    /// starting strictly after `after` when given.
    async fn list_unfinished(
        &self,
        updated_before: DateTime<Utc>,
        after: Option<UnfinishedCursor>,
        limit: i64,
    ) -> Result<Vec<Task>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_distinct_from_unavailable() {
        assert!(StoreError::NotFound { task_id: 4 }.is_not_found());
        assert!(!StoreError::Unavailable(anyhow::anyhow!("connection refused")).is_not_found());
    }

    #[test]
    fn test_conflict_message_names_version() {
        let err = StoreError::Conflict {
            task_id: 9,
            expected: 2,
        };
        assert_eq!(
            err.to_string(),
            "Task 9 was modified concurrently (expected version 2)"
        );
    }

    #[test]
    fn test_list_query_defaults() {
        let q = TaskListQuery::default();
        assert_eq!(q.limit, 50);
        assert_eq!(q.offset, 0);
        assert!(q.status.is_none());
    }
}
