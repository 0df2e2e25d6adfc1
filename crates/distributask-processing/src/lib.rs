//! Handler family for `image_processing` tasks.
//!
//! Fetches the source image named by the task payload, applies one
//! [`ImageOperation`](distributask_core::models::ImageOperation) and re-encodes the
//! result in the source format.

pub mod fetcher;
pub mod handler;
pub mod image;

pub use fetcher::{HttpImageFetcher, ImageFetcher};
pub use handler::{ImageHandlerConfig, ImageTaskHandler};
pub use crate::image::ImageTransformer;
