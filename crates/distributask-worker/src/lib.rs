//! Distributask Worker – task distribution and processing.
//!
//! [`Distributor`] puts task references on the broker, [`Processor`] runs a pool of
//! workers that lease them and dispatch to the [`HandlerRegistry`], and
//! [`Reconciler`] resubmits rows whose reference went missing. [`TaskSubmitter`] is
//! the producer-facing entry point that creates rows and distributes them.

mod distributor;
mod processor;
mod reconciler;
mod registry;
mod retry;
mod submitter;

pub use distributor::Distributor;
pub use processor::{ProcessOutcome, Processor, ProcessorConfig, ProcessorHandle};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use registry::{HandlerRegistry, TaskHandler};
pub use retry::RetryPolicy;
pub use submitter::{CreateTaskRequest, PriorityInput, SubmitError, TaskSubmitter};
