//! Source image acquisition

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::time::Duration;

use distributask_core::{TaskError, TaskResultExt};

/// Fetches the source bytes for an image task. Called once per attempt.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, TaskError>;
}

/// Downloads images over HTTP(S) with a per-request timeout and a size cap.
#[derive(Clone)]
pub struct HttpImageFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration, max_bytes: usize) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self { client, max_bytes })
    }

    fn too_large(&self, size: usize) -> TaskError {
        TaskError::validation(anyhow::anyhow!(
            "image is {} bytes, limit is {} bytes",
            size,
            self.max_bytes
        ))
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    #[tracing::instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<Bytes, TaskError> {
        let mut response = self.client.get(url).send().await.map_err(|e| {
            tracing::warn!(error = %e, "Failed to download source image");
            TaskError::transient(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let err = anyhow::anyhow!("source image request returned status {}", status);
            // Missing or forbidden sources will not appear on a later attempt.
            return match status.as_u16() {
                400 | 401 | 403 | 404 | 410 => Err(TaskError::validation(err)),
                _ => Err(TaskError::transient(err)),
            };
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes as u64 {
                return Err(self.too_large(length as usize));
            }
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.transient()? {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(self.too_large(body.len() + chunk.len()));
            }
            body.extend_from_slice(&chunk);
        }

        tracing::debug!(bytes = body.len(), "Downloaded source image");
        Ok(body.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_builds() {
        assert!(HttpImageFetcher::new(Duration::from_secs(5), 1024).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        let fetcher = HttpImageFetcher::new(Duration::from_millis(500), 1024).unwrap();
        // Port 9 on loopback refuses connections.
        let err = fetcher
            .fetch("http://127.0.0.1:9/image.png")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
