//! Distributask Database Layer
//!
//! Task record persistence: the Postgres repository used in production and an
//! in-process store for tests and single-node runs.

pub mod db;

pub use db::{MemoryTaskStore, TaskRepository};
