//! Retry delay policies

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use distributask_core::config::RetryConfig;
use distributask_core::{BackoffKind, TaskError};

type DelayFn = dyn Fn(i32, &TaskError) -> Duration + Send + Sync;

/// Computes how long a failed task stays invisible before its next attempt.
///
/// `attempt` is the 1-based number of the attempt that just failed.
#[derive(Clone)]
pub enum RetryPolicy {
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
    Custom(Arc<DelayFn>),
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        RetryPolicy::Fixed(delay)
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        RetryPolicy::Exponential { base, max }
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(i32, &TaskError) -> Duration + Send + Sync + 'static,
    {
        RetryPolicy::Custom(Arc::new(f))
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        let base = Duration::from_secs(config.delay_secs);
        match config.backoff {
            BackoffKind::Fixed => Self::fixed(base),
            BackoffKind::Exponential => {
                Self::exponential(base, Duration::from_secs(config.max_delay_secs))
            }
        }
    }

    pub fn delay(&self, attempt: i32, error: &TaskError) -> Duration {
        match self {
            RetryPolicy::Fixed(delay) => *delay,
            RetryPolicy::Exponential { base, max } => {
                let exponent = (attempt.max(1) - 1).min(31) as u32;
                base.saturating_mul(1u32 << exponent).min(*max)
            }
            RetryPolicy::Custom(f) => f(attempt, error),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed(Duration::from_secs(20))
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            RetryPolicy::Exponential { base, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("max", max)
                .finish(),
            RetryPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
