//! Distributask Core Library
//!
//! Domain models, the task store contract, task error classification and
//! configuration shared by every distributask component.

pub mod config;
pub mod models;
pub mod store;
pub mod task_error;
pub mod validation;

// Re-export commonly used types
pub use config::{BackoffKind, BrokerBackend, Config, LogFormat};
pub use store::{NewTask, StoreError, TaskListQuery, TaskStore, UnfinishedCursor};
pub use task_error::{TaskError, TaskErrorKind, TaskResultExt};
