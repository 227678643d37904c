use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// The topic was expected to exist already and does not
    #[error("invalid topic '{0}': topic does not exist")]
    InvalidTopic(String),
    /// A concurrent creator won the race; provisioning treats this as success
    #[error("'{0}' already exists")]
    AlreadyExists(String),
    #[error("subscription '{0}' not found")]
    SubscriptionNotFound(String),
    #[error("bus operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("bus operation cancelled")]
    Cancelled,
    #[error("puller is closed or already running")]
    Closed,
    #[error("bus provider error: {0}")]
    Provider(String),
}

impl BusError {
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Errors that are normal shutdown rather than failures.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        BusError::Provider(err.to_string())
    }
}
