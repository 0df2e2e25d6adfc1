//! Test helpers: in-memory store and broker wired to a processor.
//!
//! Run from workspace root: `cargo test -p distributask-worker`.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use distributask_broker::{
    Broker, BrokerError, Delivery, EnqueueOptions, LeaseToken, MemoryBroker, MemoryBrokerConfig,
};
use distributask_core::config::TaskDefaults;
use distributask_core::models::{
    ImagePayload, OwnerId, Priority, QueueReference, Task, TaskId, IMAGE_PROCESSING,
};
use distributask_core::{NewTask, TaskError, TaskResultExt, TaskStore};
use distributask_db::MemoryTaskStore;
use distributask_worker::{
    Distributor, HandlerRegistry, ProcessOutcome, Processor, ProcessorConfig, RetryPolicy,
    TaskHandler, TaskSubmitter,
};

pub const OWNER: OwnerId = 42;

/// What a [`ScriptedHandler`] does on one call.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed(Vec<u8>),
    Transient(&'static str),
    Validation(&'static str),
    /// Sleep, then succeed.
    Sleep(Duration),
    Panic,
}

/// Handler that plays back a script, one step per call, then succeeds.
pub struct ScriptedHandler {
    script: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<TaskId>>,
}

impl ScriptedHandler {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into_iter().collect()),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::new([])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Task ids in the order the handler saw them.
    pub fn seen(&self) -> Vec<TaskId> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    async fn handle(&self, task: &Task) -> Result<Vec<u8>, TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(task.id);
        let step = self.script.lock().unwrap().pop_front();

        match step {
            None => Ok(b"processed".to_vec()),
            Some(Step::Succeed(bytes)) => Ok(bytes),
            Some(Step::Transient(msg)) => Err(TaskError::transient(anyhow::anyhow!(msg))),
            Some(Step::Validation(msg)) => Err(TaskError::validation(anyhow::anyhow!(msg))),
            Some(Step::Sleep(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(b"slow".to_vec())
            }
            Some(Step::Panic) => panic!("scripted handler panic"),
        }
    }
}

/// Handler that decodes the image payload and answers per operation.
pub struct OperationHandler<F> {
    respond: F,
}

impl<F> OperationHandler<F>
where
    F: Fn(&ImagePayload) -> Result<Vec<u8>, TaskError> + Send + Sync + 'static,
{
    pub fn new(respond: F) -> Arc<Self> {
        Arc::new(Self { respond })
    }
}

#[async_trait]
impl<F> TaskHandler for OperationHandler<F>
where
    F: Fn(&ImagePayload) -> Result<Vec<u8>, TaskError> + Send + Sync + 'static,
{
    async fn handle(&self, task: &Task) -> Result<Vec<u8>, TaskError> {
        let payload = ImagePayload::from_value(&task.payload).validation()?;
        (self.respond)(&payload)
    }
}

/// Broker whose every operation fails as unavailable.
pub struct DownBroker;

#[async_trait]
impl Broker for DownBroker {
    async fn enqueue(&self, _: QueueReference, _: EnqueueOptions) -> Result<(), BrokerError> {
        Err(down())
    }

    async fn try_dequeue(&self) -> Result<Option<Delivery>, BrokerError> {
        Err(down())
    }

    async fn ack(&self, _: LeaseToken) -> Result<(), BrokerError> {
        Err(down())
    }

    async fn schedule_retry(&self, _: LeaseToken, _: Duration) -> Result<(), BrokerError> {
        Err(down())
    }

    async fn cancel(&self, _: TaskId) -> Result<bool, BrokerError> {
        Err(down())
    }

    async fn contains(&self, _: TaskId) -> Result<bool, BrokerError> {
        Err(down())
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        tokio::time::sleep(max_wait).await;
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(1)
    }
}

fn down() -> BrokerError {
    BrokerError::Unavailable(anyhow::anyhow!("broker is down"))
}

pub fn resize_payload(width: u32, height: u32) -> serde_json::Value {
    json!({
        "url": "https://example.com/photo.png",
        "operation": "resize",
        "params": {"width": width, "height": height}
    })
}

pub fn crop_payload() -> serde_json::Value {
    json!({
        "url": "https://example.com/photo.jpg",
        "operation": "crop",
        "params": {"x": 0, "y": 0, "width": 10, "height": 10}
    })
}

pub fn new_task(payload: serde_json::Value, priority: Priority, max_retries: i32) -> NewTask {
    NewTask {
        owner_id: OWNER,
        task_type: IMAGE_PROCESSING.to_string(),
        payload,
        priority,
        timeout_seconds: 30,
        max_retries,
    }
}

pub fn defaults() -> TaskDefaults {
    TaskDefaults {
        priority: Priority::Default,
        timeout_seconds: 30,
        max_retries: 5,
    }
}

/// In-memory store and broker with one processor over them.
pub struct Harness {
    pub store: Arc<MemoryTaskStore>,
    pub broker: Arc<MemoryBroker>,
    pub distributor: Distributor,
    pub processor: Arc<Processor>,
}

impl Harness {
    /// `handler` serves `image_processing`; retries use the default fixed 20s delay.
    pub fn new(handler: Arc<dyn TaskHandler>) -> Self {
        let registry = HandlerRegistry::new().with_handler(IMAGE_PROCESSING, handler);
        Self::with_registry(registry, MemoryBrokerConfig::default())
    }

    pub fn with_registry(registry: HandlerRegistry, broker_config: MemoryBrokerConfig) -> Self {
        Self::build(registry, broker_config, ProcessorConfig::default())
    }

    pub fn build(
        registry: HandlerRegistry,
        broker_config: MemoryBrokerConfig,
        processor_config: ProcessorConfig,
    ) -> Self {
        let store = Arc::new(MemoryTaskStore::new());
        let broker = Arc::new(MemoryBroker::new(broker_config));
        let distributor = Distributor::new(broker.clone());
        let processor = Arc::new(Processor::new(
            store.clone(),
            broker.clone(),
            Arc::new(registry),
            RetryPolicy::default(),
            processor_config,
        ));
        Self {
            store,
            broker,
            distributor,
            processor,
        }
    }

    pub fn submitter(&self) -> TaskSubmitter {
        TaskSubmitter::new(self.store.clone(), self.distributor.clone(), defaults())
    }

    /// Insert a row and distribute its reference.
    pub async fn create(&self, task: NewTask) -> Task {
        let task = self.store.insert(task).await.unwrap();
        self.distributor.submit_task(&task).await.unwrap();
        task
    }

    /// Lease the next reference, waiting on the (paused) clock for delayed ones.
    pub async fn next_delivery(&self) -> Delivery {
        let shutdown = CancellationToken::new();
        tokio::time::timeout(Duration::from_secs(3600), self.broker.dequeue(&shutdown))
            .await
            .expect("no delivery within an hour")
            .unwrap()
            .unwrap()
    }

    pub async fn process_next(&self) -> ProcessOutcome {
        let delivery = self.next_delivery().await;
        self.processor.process(delivery).await
    }

    /// Keep processing deliveries until `task_id` is terminal. Returns every outcome.
    pub async fn drive(&self, task_id: TaskId) -> Vec<ProcessOutcome> {
        let mut outcomes = Vec::new();
        while !self.task(task_id).await.is_terminal() {
            outcomes.push(self.process_next().await);
            assert!(outcomes.len() < 100, "task {} never settled", task_id);
        }
        outcomes
    }

    pub async fn task(&self, task_id: TaskId) -> Task {
        self.store.get(task_id).await.unwrap()
    }

    /// Rewrite a stored row, e.g. to age it past the reconcile grace period.
    pub async fn update(&self, task_id: TaskId, f: impl FnOnce(&mut Task)) -> Task {
        let mut task = self.task(task_id).await;
        f(&mut task);
        self.store.put(task.clone()).await;
        task
    }

    pub async fn age(&self, task_id: TaskId, by: chrono::Duration) -> Task {
        self.update(task_id, |t| t.updated_at = Utc::now() - by).await
    }
}
