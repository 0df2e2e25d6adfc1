use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use distributask_core::models::{ImagePayload, Task};
use distributask_core::{Config, TaskError, TaskResultExt};
use distributask_worker::TaskHandler;

use crate::fetcher::{HttpImageFetcher, ImageFetcher};
use crate::image::ImageTransformer;

#[derive(Debug, Clone)]
pub struct ImageHandlerConfig {
    pub fetch_timeout: Duration,
    pub max_bytes: usize,
}

impl Default for ImageHandlerConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(20),
            max_bytes: 20 * 1024 * 1024,
        }
    }
}

impl ImageHandlerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fetch_timeout: Duration::from_secs(config.image.fetch_timeout_secs),
            max_bytes: config.image.max_bytes,
        }
    }
}

/// Handler for `image_processing` tasks.
pub struct ImageTaskHandler {
    fetcher: Arc<dyn ImageFetcher>,
}

impl ImageTaskHandler {
    pub fn new(fetcher: Arc<dyn ImageFetcher>) -> Self {
        Self { fetcher }
    }

    pub fn http(config: &ImageHandlerConfig) -> Result<Self, anyhow::Error> {
        let fetcher = HttpImageFetcher::new(config.fetch_timeout, config.max_bytes)?;
        Ok(Self::new(Arc::new(fetcher)))
    }
}

#[async_trait]
impl TaskHandler for ImageTaskHandler {
    #[tracing::instrument(skip(self, task), fields(task_id = task.id))]
    async fn handle(&self, task: &Task) -> Result<Vec<u8>, TaskError> {
        let payload = ImagePayload::from_value(&task.payload).validation()?;
        let data = self.fetcher.fetch(&payload.url).await?;

        let operation_name = payload.operation.name();
        let operation = payload.operation;
        let output = tokio::task::spawn_blocking(move || ImageTransformer::apply(&data, &operation))
            .await
            .map_err(|e| TaskError::transient(anyhow::anyhow!("image transform aborted: {}", e)))??;

        tracing::debug!(
            operation = operation_name,
            output_bytes = output.len(),
            "Image operation applied"
        );
        Ok(output)
    }
}
