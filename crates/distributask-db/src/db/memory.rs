//! In-process task store
//!
//! Same contract as the Postgres repository, including optimistic versioning, so the
//! processor can be exercised without a database.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use distributask_core::models::{OwnerId, Task, TaskId, TaskStatus};
use distributask_core::{NewTask, StoreError, TaskListQuery, TaskStore, UnfinishedCursor};

#[derive(Default)]
struct State {
    next_id: TaskId,
    tasks: BTreeMap<TaskId, Task>,
}

#[derive(Default)]
pub struct MemoryTaskStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `StoreError::Unavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of a task regardless of owner.
    pub async fn get(&self, task_id: TaskId) -> Option<Task> {
        self.state.lock().await.tasks.get(&task_id).cloned()
    }

    /// Overwrite a row as-is, bypassing versioning.
    pub async fn put(&self, task: Task) {
        let mut state = self.state.lock().await;
        state.next_id = state.next_id.max(task.id);
        state.tasks.insert(task.id, task);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(anyhow::anyhow!(
                "memory task store marked unavailable"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: NewTask) -> Result<Task, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let now = Utc::now();
        let stored = Task {
            id: state.next_id,
            owner_id: task.owner_id,
            task_type: task.task_type,
            payload: task.payload,
            priority: task.priority,
            status: TaskStatus::Pending,
            timeout_seconds: task.timeout_seconds,
            retry_count: 0,
            max_retries: task.max_retries,
            next_retry_at: None,
            result: None,
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        state.tasks.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn load(&self, task_id: TaskId, owner_id: OwnerId) -> Result<Task, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        state
            .tasks
            .get(&task_id)
            .filter(|t| t.owner_id == owner_id)
            .cloned()
            .ok_or(StoreError::NotFound { task_id })
    }

    async fn save(&self, task: &Task) -> Result<Task, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let stored = state
            .tasks
            .get_mut(&task.id)
            .filter(|t| t.owner_id == task.owner_id)
            .ok_or(StoreError::NotFound { task_id: task.id })?;

        if stored.version != task.version {
            return Err(StoreError::Conflict {
                task_id: task.id,
                expected: task.version,
            });
        }

        stored.status = task.status;
        stored.retry_count = task.retry_count;
        stored.next_retry_at = task.next_retry_at;
        stored.result = task.result.clone();
        stored.last_error = task.last_error.clone();
        stored.updated_at = task.updated_at;
        stored.version += 1;
        Ok(stored.clone())
    }

    async fn list(&self, owner_id: OwnerId, query: TaskListQuery) -> Result<Vec<Task>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let limit = query.limit.clamp(1, 1000) as usize;
        let offset = query.offset.max(0) as usize;

        // Ids are assigned in creation order, so reverse id order is newest first.
        Ok(state
            .tasks
            .values()
            .rev()
            .filter(|t| t.owner_id == owner_id)
            .filter(|t| query.status.map_or(true, |s| t.status == s))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete(&self, task_id: TaskId, owner_id: OwnerId) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.tasks.get(&task_id) {
            Some(t) if t.owner_id == owner_id => {
                state.tasks.remove(&task_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_unfinished(
        &self,
        updated_before: DateTime<Utc>,
        after: Option<UnfinishedCursor>,
        limit: i64,
    ) -> Result<Vec<Task>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let start = after.map(|c| (c.updated_at, c.id));
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| !t.is_terminal() && t.updated_at < updated_before)
            .filter(|t| start.map_or(true, |start| (t.updated_at, t.id) > start))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.updated_at, t.id));
        tasks.truncate(limit.max(0) as usize);
        Ok(tasks)
    }
}
