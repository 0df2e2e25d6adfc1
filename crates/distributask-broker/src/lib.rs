//! Distributask Queue Broker
//!
//! Multi-tier priority queue of task references with lease semantics. Two backends
//! share the [`Broker`] contract: [`PgBroker`] over a Postgres table and
//! [`MemoryBroker`] for tests and single-process runs.

pub mod broker;
pub mod error;
pub mod memory;
pub mod postgres;

pub use broker::{Broker, Delivery, EnqueueOptions, LeaseToken, QueueMessage};
pub use error::BrokerError;
pub use memory::{MemoryBroker, MemoryBrokerConfig, QueueStats};
pub use postgres::{PgBroker, PgBrokerConfig, QUEUE_NOTIFY_CHANNEL};
