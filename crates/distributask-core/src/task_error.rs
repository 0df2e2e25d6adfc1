//! Task execution error types
//!
//! Handlers return [`TaskError`] so the processor can tell input that will never
//! succeed (validation failures, terminal) apart from faults that may clear up on a
//! later attempt (transient failures, retried within the task's budget).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskErrorKind {
    /// Bad or missing input. The task fails immediately and is never retried.
    Validation,
    /// Network errors, transform errors, deadlines. Retried until the budget is spent.
    Transient,
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskErrorKind::Validation => write!(f, "validation"),
            TaskErrorKind::Transient => write!(f, "transient"),
        }
    }
}

/// Task execution error tagged with its retry classification
#[derive(Debug)]
pub struct TaskError {
    inner: anyhow::Error,
    kind: TaskErrorKind,
}

impl TaskError {
    /// Create a validation error
    ///
    /// Use this for:
    /// - Missing or out-of-range operation parameters
    /// - Unsupported task types or operations
    /// - Input that decodes but can never be processed (e.g. crop outside the image)
    pub fn validation(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            kind: TaskErrorKind::Validation,
        }
    }

    /// Create a transient error
    ///
    /// Use this for:
    /// - Network failures fetching input
    /// - Transform computation errors
    /// - Deadline exceeded
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            kind: TaskErrorKind::Transient,
        }
    }

    pub fn kind(&self) -> TaskErrorKind {
        self.kind
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        self.kind == TaskErrorKind::Transient
    }

    /// Get the inner error
    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    /// Consume self and return the inner error
    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for TaskError {
    /// Untagged errors are treated as transient
    fn from(err: anyhow::Error) -> Self {
        Self::transient(err)
    }
}

/// Extension trait for Result to tag errors with a retry classification
pub trait TaskResultExt<T> {
    /// Mark this result as a validation failure on error
    fn validation(self) -> Result<T, TaskError>;

    /// Mark this result as a transient failure on error
    fn transient(self) -> Result<T, TaskError>;
}

impl<T, E: Into<anyhow::Error>> TaskResultExt<T> for Result<T, E> {
    fn validation(self) -> Result<T, TaskError> {
        self.map_err(|e| TaskError::validation(e.into()))
    }

    fn transient(self) -> Result<T, TaskError> {
        self.map_err(|e| TaskError::transient(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error() {
        let err = TaskError::validation(anyhow::anyhow!("width must be non-zero"));
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), TaskErrorKind::Validation);
        assert!(err.to_string().contains("width must be non-zero"));
    }

    #[test]
    fn test_transient_error() {
        let err = TaskError::transient(anyhow::anyhow!("connection reset"));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_from_anyhow() {
        let err: TaskError = anyhow::anyhow!("Some error").into();
        assert!(err.is_retryable(), "Default should be transient");
    }

    #[test]
    fn test_result_ext() {
        let result: Result<(), anyhow::Error> = Err(anyhow::anyhow!("bad params"));
        let task_result = result.validation();
        assert!(!task_result.unwrap_err().is_retryable());

        let result: Result<(), std::io::Error> = Err(std::io::Error::other("reset"));
        assert!(result.transient().unwrap_err().is_retryable());
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = TaskError::validation(anyhow::anyhow!("bad")).into();
        let kind = err.downcast_ref::<TaskError>().map(TaskError::kind);
        assert_eq!(kind, Some(TaskErrorKind::Validation));
    }
}
