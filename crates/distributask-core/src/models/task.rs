use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use std::time::Duration;

use super::queue::QueueReference;

pub type TaskId = i64;
pub type OwnerId = i64;

/// Task type tag handled by the image transform handler family.
pub const IMAGE_PROCESSING: &str = "image_processing";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid task status: {}", s)),
        }
    }
}

/// Queue tier. Tiers are drained strictly in declaration order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    #[default]
    Default,
    Low,
}

impl Priority {
    /// All tiers in drain order.
    pub const ALL: [Priority; 3] = [Priority::Critical, Priority::Default, Priority::Low];

    /// Position in the drain order; lower ranks are served first.
    pub fn rank(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::Default => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::Default => "default",
            Priority::Low => "low",
        }
    }

    /// Map a legacy numeric weight (3 = critical, 2 = default, 1 = low) onto a tier.
    pub fn from_weight(weight: i32) -> Self {
        match weight {
            i32::MIN..=1 => Priority::Low,
            2 => Priority::Default,
            _ => Priority::Critical,
        }
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Priority::Critical),
            "default" => Ok(Priority::Default),
            "low" => Ok(Priority::Low),
            _ => Err(anyhow::anyhow!("Invalid priority: {}", s)),
        }
    }
}

/// What a failed attempt did to the task's retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Budget remains; the task should become visible again at `next_retry_at`.
    RetryScheduled { next_retry_at: DateTime<Utc> },
    /// Budget is spent; the task is terminally failed.
    Exhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub owner_id: OwnerId,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub status: TaskStatus,
    pub timeout_seconds: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Base64-encoded handler output.
    pub result: Option<String>,
    pub last_error: Option<String>,
    /// Optimistic concurrency token, bumped by the store on every save.
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Task {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Task {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            task_type: row.get("type"),
            payload: row.get("payload"),
            priority: row.get::<String, _>("priority").parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse priority: {}", e).into())
            })?,
            status: row.get::<String, _>("status").parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse status: {}", e).into())
            })?,
            timeout_seconds: row.get("timeout_seconds"),
            retry_count: row.get("retry_count"),
            max_retries: row.get("max_retries"),
            next_retry_at: row.get("next_retry_at"),
            result: row.get("result"),
            last_error: row.get("last_error"),
            version: row.get("version"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

impl Task {
    pub fn reference(&self) -> QueueReference {
        QueueReference {
            task_id: self.id,
            owner_id: self.owner_id,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Completed, or failed with no retry pending.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Completed => true,
            TaskStatus::Failed => self.next_retry_at.is_none(),
            TaskStatus::Pending | TaskStatus::InProgress => false,
        }
    }

    /// Processing deadline for a single attempt (at least one second).
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1) as u64)
    }

    /// Extract the payload as a typed struct, returning an error on failure.
    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn start_attempt(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::InProgress;
        self.next_retry_at = None;
        self.updated_at = now;
    }

    pub fn complete(&mut self, result: String, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.last_error = None;
        self.next_retry_at = None;
        self.updated_at = now;
    }

    /// Terminal failure that consumes no retry budget (bad input, unknown type).
    pub fn reject(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.last_error = Some(error.into());
        self.next_retry_at = None;
        self.updated_at = now;
    }

    /// Record a retryable failure against the retry budget.
    ///
    /// `retry_count` never decreases and never exceeds `max_retries`.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        let attempts = self.retry_count.saturating_add(1);
        self.status = TaskStatus::Failed;
        self.last_error = Some(error.into());
        self.updated_at = now;

        if attempts < self.max_retries {
            self.retry_count = attempts;
            self.next_retry_at = Some(next_retry_at);
            FailureOutcome::RetryScheduled { next_retry_at }
        } else {
            self.retry_count = self.retry_count.max(attempts.min(self.max_retries.max(0)));
            self.next_retry_at = None;
            FailureOutcome::Exhausted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(retry_count: i32, max_retries: i32) -> Task {
        Task {
            id: 1,
            owner_id: 7,
            task_type: IMAGE_PROCESSING.to_string(),
            payload: serde_json::json!({}),
            priority: Priority::Default,
            status: TaskStatus::Pending,
            timeout_seconds: 30,
            retry_count,
            max_retries,
            next_retry_at: None,
            result: None,
            last_error: None,
            version: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_task_status_round_trip_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<TaskStatus>().unwrap(), status);
        }
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
        assert!("running".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_priority_rank_matches_drain_order() {
        let ranks: Vec<usize> = Priority::ALL.iter().map(|p| p.rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2]);
        assert_eq!(Priority::default(), Priority::Default);
    }

    #[test]
    fn test_priority_from_weight() {
        assert_eq!(Priority::from_weight(3), Priority::Critical);
        assert_eq!(Priority::from_weight(10), Priority::Critical);
        assert_eq!(Priority::from_weight(2), Priority::Default);
        assert_eq!(Priority::from_weight(1), Priority::Low);
        assert_eq!(Priority::from_weight(-4), Priority::Low);
    }

    #[test]
    fn test_priority_serde_lowercase() {
        let json = serde_json::to_string(&Priority::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
        let parsed: Priority = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(parsed, Priority::Low);
    }

    #[test]
    fn test_record_failure_schedules_retry_while_budget_remains() {
        let mut t = task(0, 3);
        let now = Utc::now();
        let at = now + chrono::Duration::seconds(20);

        assert_eq!(
            t.record_failure("boom", at, now),
            FailureOutcome::RetryScheduled { next_retry_at: at }
        );
        assert_eq!(t.retry_count, 1);
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.next_retry_at, Some(at));
        assert!(!t.is_terminal());
    }

    #[test]
    fn test_record_failure_exhausts_at_max_retries() {
        let mut t = task(2, 3);
        let now = Utc::now();

        assert_eq!(t.record_failure("boom", now, now), FailureOutcome::Exhausted);
        assert_eq!(t.retry_count, 3);
        assert!(t.next_retry_at.is_none());
        assert!(t.is_terminal());
        assert_eq!(t.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_record_failure_never_exceeds_budget() {
        let mut t = task(0, 0);
        let now = Utc::now();
        assert_eq!(t.record_failure("boom", now, now), FailureOutcome::Exhausted);
        assert_eq!(t.retry_count, 0);

        let mut t = task(3, 3);
        assert_eq!(t.record_failure("boom", now, now), FailureOutcome::Exhausted);
        assert_eq!(t.retry_count, 3);
    }

    #[test]
    fn test_reject_is_terminal_without_consuming_budget() {
        let mut t = task(0, 5);
        t.reject("width must be non-zero", Utc::now());
        assert!(t.is_terminal());
        assert_eq!(t.retry_count, 0);
    }

    #[test]
    fn test_start_then_complete() {
        let mut t = task(1, 3);
        t.next_retry_at = Some(Utc::now());
        t.last_error = Some("earlier".into());

        t.start_attempt(Utc::now());
        assert_eq!(t.status, TaskStatus::InProgress);
        assert!(t.next_retry_at.is_none());
        assert!(!t.is_terminal());

        t.complete("aGVsbG8=".into(), Utc::now());
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.result.as_deref(), Some("aGVsbG8="));
        assert!(t.last_error.is_none());
        assert!(t.is_terminal());
    }

    #[test]
    fn test_timeout_has_one_second_floor() {
        let mut t = task(0, 3);
        t.timeout_seconds = 0;
        assert_eq!(t.timeout(), Duration::from_secs(1));
        t.timeout_seconds = 45;
        assert_eq!(t.timeout(), Duration::from_secs(45));
    }

    #[test]
    fn test_reference_carries_identity() {
        let t = task(0, 3);
        assert_eq!(
            t.reference(),
            QueueReference {
                task_id: 1,
                owner_id: 7
            }
        );
    }
}
