use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};

use distributask_core::models::{OwnerId, Task, TaskId};
use distributask_core::{NewTask, StoreError, TaskListQuery, TaskStore, UnfinishedCursor};

const TASK_COLUMNS: &str = r#"
    id,
    owner_id,
    "type",
    payload,
    priority,
    status,
    timeout_seconds,
    retry_count,
    max_retries,
    next_retry_at,
    result,
    last_error,
    version,
    created_at,
    updated_at
"#;

/// Postgres-backed [`TaskStore`]
#[derive(Clone)]
pub struct TaskRepository {
    pool: PgPool,
}

impl TaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn unavailable(err: sqlx::Error, action: &'static str) -> StoreError {
        StoreError::Unavailable(anyhow::Error::new(err).context(action))
    }
}

#[async_trait]
impl TaskStore for TaskRepository {
    #[tracing::instrument(skip(self, task), fields(owner_id = task.owner_id, task_type = %task.task_type))]
    async fn insert(&self, task: NewTask) -> Result<Task, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO tasks (
                owner_id, "type", payload, priority, status,
                timeout_seconds, retry_count, max_retries, version
            )
            VALUES ($1, $2, $3, $4, 'pending', $5, 0, $6, 0)
            RETURNING {TASK_COLUMNS}
            "#
        );

        let stored: Task = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(task.owner_id)
            .bind(&task.task_type)
            .bind(&task.payload)
            .bind(task.priority.as_str())
            .bind(task.timeout_seconds)
            .bind(task.max_retries)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %e,
                    owner_id = task.owner_id,
                    "Failed to insert task into database"
                );
                Self::unavailable(e, "Failed to insert task")
            })?;

        tracing::debug!(
            task_id = stored.id,
            owner_id = stored.owner_id,
            priority = %stored.priority,
            "Task row inserted"
        );

        Ok(stored)
    }

    #[tracing::instrument(skip(self))]
    async fn load(&self, task_id: TaskId, owner_id: OwnerId) -> Result<Task, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 AND owner_id = $2");

        sqlx::query_as::<Postgres, Task>(&sql)
            .bind(task_id)
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::unavailable(e, "Failed to fetch task"))?
            .ok_or(StoreError::NotFound { task_id })
    }

    #[tracing::instrument(skip(self, task), fields(task_id = task.id, status = %task.status, version = task.version))]
    async fn save(&self, task: &Task) -> Result<Task, StoreError> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = $3,
                retry_count = $4,
                next_retry_at = $5,
                result = $6,
                last_error = $7,
                updated_at = $8,
                version = version + 1
            WHERE id = $1 AND owner_id = $2 AND version = $9
            RETURNING {TASK_COLUMNS}
            "#
        );

        let updated: Option<Task> = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(task.id)
            .bind(task.owner_id)
            .bind(task.status.to_string())
            .bind(task.retry_count)
            .bind(task.next_retry_at)
            .bind(task.result.as_deref())
            .bind(task.last_error.as_deref())
            .bind(task.updated_at)
            .bind(task.version)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::unavailable(e, "Failed to update task"))?;

        if let Some(updated) = updated {
            return Ok(updated);
        }

        // Nothing matched: either the row is gone or someone saved it first.
        let exists: Option<i32> =
            sqlx::query_scalar("SELECT version FROM tasks WHERE id = $1 AND owner_id = $2")
                .bind(task.id)
                .bind(task.owner_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| Self::unavailable(e, "Failed to check task version"))?;

        match exists {
            Some(current) => {
                tracing::warn!(
                    task_id = task.id,
                    expected = task.version,
                    current = current,
                    "Task version conflict"
                );
                Err(StoreError::Conflict {
                    task_id: task.id,
                    expected: task.version,
                })
            }
            None => Err(StoreError::NotFound { task_id: task.id }),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn list(&self, owner_id: OwnerId, query: TaskListQuery) -> Result<Vec<Task>, StoreError> {
        let limit = query.limit.clamp(1, 1000);
        let offset = query.offset.max(0);

        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE owner_id = $1
                AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#
        );

        let tasks = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(owner_id)
            .bind(query.status.map(|s| s.to_string()))
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::unavailable(e, "Failed to list tasks"))?;

        Ok(tasks)
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, task_id: TaskId, owner_id: OwnerId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1 AND owner_id = $2")
            .bind(task_id)
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::unavailable(e, "Failed to delete task"))?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self))]
    async fn list_unfinished(
        &self,
        updated_before: DateTime<Utc>,
        after: Option<UnfinishedCursor>,
        limit: i64,
    ) -> Result<Vec<Task>, StoreError> {
        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE (
                    status IN ('pending', 'in_progress')
                    OR (status = 'failed' AND next_retry_at IS NOT NULL)
                )
                AND updated_at < $1
                AND ($2::timestamptz IS NULL OR (updated_at, id) > ($2, $3))
            ORDER BY updated_at ASC, id ASC
            LIMIT $4
            "#
        );

        let tasks = sqlx::query_as::<Postgres, Task>(&sql)
            .bind(updated_before)
            .bind(after.map(|c| c.updated_at))
            .bind(after.map(|c| c.id))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list unfinished tasks")
            .map_err(StoreError::Unavailable)?;

        Ok(tasks)
    }
}
