//! Submission validation
//!
//! Checks applied to client requests before a task row is created:
//! - Image URL: http/https with a supported image extension
//! - Timeout and retry budget ranges

use anyhow::Result;
use url::Url;

/// Image extensions accepted as task input
pub const IMAGE_EXTENSIONS: &[&str] = &["jpeg", "jpg", "png", "gif"];

/// Longest per-attempt deadline a client may request (one hour)
pub const MAX_TIMEOUT_SECONDS: i32 = 3600;

/// Largest retry budget a client may request
pub const MAX_RETRIES_LIMIT: i32 = 25;

/// Returns true for http(s) URLs whose path ends in a supported image extension.
pub fn is_image_url(raw: &str) -> bool {
    validate_image_url(raw).is_ok()
}

pub fn validate_image_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| anyhow::anyhow!("Invalid URL '{}': {}", raw, e))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(anyhow::anyhow!(
            "URL scheme '{}' is not supported, use http or https",
            url.scheme()
        ));
    }

    let path = url.path().to_ascii_lowercase();
    let extension = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    if !IMAGE_EXTENSIONS.contains(&extension) {
        return Err(anyhow::anyhow!(
            "URL must point to an image ({}), got '{}'",
            IMAGE_EXTENSIONS.join(", "),
            url.path()
        ));
    }

    Ok(url)
}

pub fn validate_timeout_seconds(timeout_seconds: i32) -> Result<()> {
    if !(1..=MAX_TIMEOUT_SECONDS).contains(&timeout_seconds) {
        return Err(anyhow::anyhow!(
            "timeout must be between 1 and {} seconds, got {}",
            MAX_TIMEOUT_SECONDS,
            timeout_seconds
        ));
    }
    Ok(())
}

pub fn validate_max_retries(max_retries: i32) -> Result<()> {
    if !(0..=MAX_RETRIES_LIMIT).contains(&max_retries) {
        return Err(anyhow::anyhow!(
            "max_retries must be between 0 and {}, got {}",
            MAX_RETRIES_LIMIT,
            max_retries
        ));
    }
    Ok(())
}
