//! Image transformer - decodes, applies one operation and re-encodes.
//!
//! CPU-bound; callers run it on the blocking pool.

use image::{DynamicImage, GenericImageView, ImageError, ImageFormat, Limits};
use std::io::Cursor;

use distributask_core::models::{ImageOperation, MAX_IMAGE_DIMENSION};
use distributask_core::{TaskError, TaskResultExt};

use crate::image::orientation::ImageOrientation;
use crate::image::resize::ImageResize;

/// Upper bound on decoder allocations, in bytes.
const MAX_DECODE_ALLOC: u64 = 512 * 1024 * 1024;

pub struct ImageTransformer;

impl ImageTransformer {
    /// Run `operation` over encoded image bytes, returning bytes in the source format.
    ///
    /// Decode and encode failures are transient. Out-of-range parameters, a source
    /// over the decode limits and a crop rectangle that does not fit the decoded
    /// image are validation failures.
    pub fn apply(data: &[u8], operation: &ImageOperation) -> Result<Vec<u8>, TaskError> {
        operation.validate().validation()?;

        let mut reader = image::ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .transient()?;
        reader.limits(Self::decode_limits());
        let source_format = reader.format();
        let img = reader.decode().map_err(|e| match e {
            ImageError::Limits(_) => TaskError::validation(e),
            _ => TaskError::transient(e),
        })?;

        tracing::debug!(
            operation = %operation,
            format = ?source_format,
            width = img.width(),
            height = img.height(),
            "Applying image operation"
        );

        let transformed = Self::transform(img, operation)?;
        Self::encode(&transformed, Self::output_format(source_format))
    }

    /// Bounds applied while decoding so an oversized source fails before allocating.
    pub fn decode_limits() -> Limits {
        let mut limits = Limits::default();
        limits.max_image_width = Some(MAX_IMAGE_DIMENSION);
        limits.max_image_height = Some(MAX_IMAGE_DIMENSION);
        limits.max_alloc = Some(MAX_DECODE_ALLOC);
        limits
    }

    pub fn transform(img: DynamicImage, operation: &ImageOperation) -> Result<DynamicImage, TaskError> {
        match *operation {
            ImageOperation::Resize { width, height } => {
                Ok(ImageResize::resize_exact(&img, width, height))
            }
            ImageOperation::Crop {
                x,
                y,
                width,
                height,
            } => Self::crop(&img, x, y, width, height),
            ImageOperation::Rotate { angle } => Ok(ImageOrientation::rotate(img, angle)),
            ImageOperation::Flip { axis } => Ok(ImageOrientation::flip(img, axis)),
        }
    }

    fn crop(img: &DynamicImage, x: u32, y: u32, width: u32, height: u32) -> Result<DynamicImage, TaskError> {
        let (img_width, img_height) = img.dimensions();
        let fits_x = x.checked_add(width).is_some_and(|right| right <= img_width);
        let fits_y = y.checked_add(height).is_some_and(|bottom| bottom <= img_height);
        if !(fits_x && fits_y) {
            return Err(TaskError::validation(anyhow::anyhow!(
                "crop rectangle {}x{} at ({}, {}) exceeds image bounds {}x{}",
                width,
                height,
                x,
                y,
                img_width,
                img_height
            )));
        }
        Ok(img.crop_imm(x, y, width, height))
    }

    /// Formats we can write back keep their format; anything else becomes PNG.
    pub fn output_format(source: Option<ImageFormat>) -> ImageFormat {
        match source {
            Some(format @ (ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Gif | ImageFormat::WebP)) => {
                format
            }
            _ => ImageFormat::Png,
        }
    }

    pub fn encode(img: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>, TaskError> {
        let (width, height) = img.dimensions();
        let estimated_size = (width as usize).saturating_mul(height as usize).saturating_mul(3);
        let mut buffer = Vec::with_capacity(estimated_size);
        let mut cursor = Cursor::new(&mut buffer);

        let written = match format {
            // JPEG has no alpha channel.
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()).write_to(&mut cursor, format),
            ImageFormat::Png => img.write_to(&mut cursor, format),
            _ => DynamicImage::ImageRgba8(img.to_rgba8()).write_to(&mut cursor, format),
        };
        written.transient()?;

        Ok(buffer)
    }
}
