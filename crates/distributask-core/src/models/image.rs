//! Image task payload.
//!
//! The wire form keeps the `{url, operation, params}` shape clients submit, but
//! decoding goes through [`ImagePayload::from_value`] so that the operation and its
//! parameters arrive as one tagged variant that has already been validated.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

/// Largest width or height accepted for a decoded source or a resize target.
pub const MAX_IMAGE_DIMENSION: u32 = 16_384;

/// Largest pixel count a resize may produce.
pub const MAX_OUTPUT_PIXELS: u64 = 50_000_000;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Malformed image payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid {operation} parameters: {reason}")]
    InvalidParams {
        operation: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlipAxis {
    #[serde(rename = "x", alias = "X")]
    X,
    #[serde(rename = "y", alias = "Y")]
    Y,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "params", rename_all = "snake_case")]
pub enum ImageOperation {
    Resize {
        width: u32,
        height: u32,
    },
    Crop {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    Rotate {
        angle: f64,
    },
    Flip {
        axis: FlipAxis,
    },
}

impl ImageOperation {
    pub fn name(&self) -> &'static str {
        match self {
            ImageOperation::Resize { .. } => "resize",
            ImageOperation::Crop { .. } => "crop",
            ImageOperation::Rotate { .. } => "rotate",
            ImageOperation::Flip { .. } => "flip",
        }
    }

    /// Check parameters that serde cannot express (non-zero and bounded sizes, finite angles).
    pub fn validate(&self) -> Result<(), PayloadError> {
        let invalid = |reason: &str| PayloadError::InvalidParams {
            operation: self.name(),
            reason: reason.to_string(),
        };

        match *self {
            ImageOperation::Resize { width, height } => {
                if width == 0 || height == 0 {
                    return Err(invalid("width and height must be non-zero"));
                }
                if width > MAX_IMAGE_DIMENSION || height > MAX_IMAGE_DIMENSION {
                    return Err(invalid(&format!(
                        "width and height must not exceed {MAX_IMAGE_DIMENSION}"
                    )));
                }
                if u64::from(width) * u64::from(height) > MAX_OUTPUT_PIXELS {
                    return Err(invalid(&format!(
                        "output must not exceed {MAX_OUTPUT_PIXELS} pixels"
                    )));
                }
            }
            ImageOperation::Crop { width, height, .. } => {
                if width == 0 || height == 0 {
                    return Err(invalid("width and height must be non-zero"));
                }
            }
            ImageOperation::Rotate { angle } => {
                if !angle.is_finite() || angle == 0.0 {
                    return Err(invalid("angle must be a non-zero number of degrees"));
                }
            }
            ImageOperation::Flip { .. } => {}
        }
        Ok(())
    }
}

impl Display for ImageOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawImagePayload", into = "RawImagePayload")]
pub struct ImagePayload {
    pub url: String,
    pub operation: ImageOperation,
}

#[derive(Serialize, Deserialize)]
struct RawImagePayload {
    url: String,
    operation: String,
    #[serde(default)]
    params: serde_json::Value,
}

impl TryFrom<RawImagePayload> for ImagePayload {
    type Error = PayloadError;

    fn try_from(raw: RawImagePayload) -> Result<Self, Self::Error> {
        let operation: ImageOperation = serde_json::from_value(serde_json::json!({
            "operation": raw.operation,
            "params": raw.params,
        }))?;
        operation.validate()?;
        Ok(ImagePayload {
            url: raw.url,
            operation,
        })
    }
}

impl From<ImagePayload> for RawImagePayload {
    fn from(payload: ImagePayload) -> Self {
        let mut tagged = serde_json::to_value(&payload.operation).unwrap_or_default();
        let params = tagged
            .get_mut("params")
            .map(serde_json::Value::take)
            .unwrap_or_default();
        RawImagePayload {
            url: payload.url,
            operation: payload.operation.name().to_string(),
            params,
        }
    }
}

impl ImagePayload {
    /// Decode and validate a stored task payload.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, PayloadError> {
        let raw: RawImagePayload = serde_json::from_value(value.clone())?;
        Self::try_from(raw)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}
