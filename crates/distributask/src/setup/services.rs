//! Component wiring

use std::sync::Arc;

use anyhow::{Context, Result};

use distributask_broker::{Broker, MemoryBroker, MemoryBrokerConfig, PgBroker, PgBrokerConfig};
use distributask_core::models::IMAGE_PROCESSING;
use distributask_core::{BrokerBackend, Config, TaskStore};
use distributask_db::{MemoryTaskStore, TaskRepository};
use distributask_processing::{ImageHandlerConfig, ImageTaskHandler};
use distributask_worker::{
    Distributor, HandlerRegistry, Processor, ProcessorConfig, Reconciler, ReconcilerConfig,
    RetryPolicy,
};

use super::database;

pub struct Services {
    pub processor: Arc<Processor>,
    pub reconciler: Option<Arc<Reconciler>>,
}

pub async fn initialize_services(config: &Config) -> Result<Services> {
    let (store, broker) = setup_backend(config).await?;

    let image_handler = ImageTaskHandler::http(&ImageHandlerConfig::from_config(config))
        .context("Failed to create image handler")?;
    let registry = HandlerRegistry::new().with_handler(IMAGE_PROCESSING, Arc::new(image_handler));

    let retry_policy = RetryPolicy::from_config(&config.retry);
    tracing::info!(retry_policy = ?retry_policy, "Retry policy configured");

    let processor = Arc::new(Processor::new(
        store.clone(),
        broker.clone(),
        Arc::new(registry),
        retry_policy,
        ProcessorConfig::from_config(config),
    ));

    let reconciler = match ReconcilerConfig::from_config(config) {
        Some(reconcile_config) => {
            tracing::info!(
                interval_secs = reconcile_config.interval.as_secs(),
                grace_secs = reconcile_config.grace.as_secs(),
                "Reconciliation sweep enabled"
            );
            Some(Arc::new(Reconciler::new(
                store,
                Distributor::new(broker),
                reconcile_config,
            )))
        }
        None => {
            tracing::info!("Reconciliation sweep disabled");
            None
        }
    };

    Ok(Services {
        processor,
        reconciler,
    })
}

async fn setup_backend(config: &Config) -> Result<(Arc<dyn TaskStore>, Arc<dyn Broker>)> {
    match config.queue.backend {
        BrokerBackend::Postgres => {
            let pool = database::setup_database(&config.database).await?;
            let store: Arc<dyn TaskStore> = Arc::new(TaskRepository::new(pool.clone()));
            let broker: Arc<dyn Broker> = Arc::new(PgBroker::new(
                pool,
                PgBrokerConfig {
                    lease_grace: config.lease_grace(),
                    poll_interval: config.poll_interval(),
                    listen: true,
                },
            ));
            Ok((store, broker))
        }
        // Local runs only: nothing outside this process can submit into the store.
        BrokerBackend::Memory => {
            tracing::warn!("In-memory backend selected; tasks are lost on restart");
            let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
            let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new(MemoryBrokerConfig {
                lease_grace: config.lease_grace(),
                poll_interval: config.poll_interval(),
            }));
            Ok((store, broker))
        }
    }
}
