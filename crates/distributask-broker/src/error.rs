use crate::broker::LeaseToken;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),

    /// The lease was acked, rescheduled or expired before this call.
    #[error("Lease {0} not found or expired")]
    LeaseNotFound(LeaseToken),

    #[error("Malformed queue item: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for BrokerError {
    fn from(err: sqlx::Error) -> Self {
        BrokerError::Unavailable(err.into())
    }
}
