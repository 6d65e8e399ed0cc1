use std::fmt;

use crate::broker::BrokerError;
use crate::capabilities::CapabilityError;
use crate::persistence::PersistenceError;
use crate::pipeline::publisher::PublishError;

/// Failure of a stage handler for one message
#[derive(Debug)]
pub enum StageError {
    /// Body did not decode into the stage's event type, or a required field is missing
    InvalidEvent(String),
    Io(std::io::Error),
    Csv(csv::Error),
    Persistence(PersistenceError),
    Capability(CapabilityError),
    Publish(PublishError),
    /// Handler is not wired up; retrying cannot help
    NotImplemented(String),
}

impl StageError {
    /// Programming and configuration errors stop the runtime instead of being retried
    pub fn is_fatal(&self) -> bool {
        match self {
            StageError::NotImplemented(_) => true,
            StageError::Publish(PublishError::Broker(e)) => e.is_fatal(),
            _ => false,
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::InvalidEvent(msg) => write!(f, "Invalid event: {}", msg),
            StageError::Io(e) => write!(f, "I/O error: {}", e),
            StageError::Csv(e) => write!(f, "CSV error: {}", e),
            StageError::Persistence(e) => write!(f, "Persistence error: {}", e),
            StageError::Capability(e) => write!(f, "Capability error: {}", e),
            StageError::Publish(e) => write!(f, "{}", e),
            StageError::NotImplemented(what) => write!(f, "Handler not implemented: {}", what),
        }
    }
}

impl std::error::Error for StageError {}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        StageError::Io(err)
    }
}

impl From<csv::Error> for StageError {
    fn from(err: csv::Error) -> Self {
        StageError::Csv(err)
    }
}

impl From<PersistenceError> for StageError {
    fn from(err: PersistenceError) -> Self {
        StageError::Persistence(err)
    }
}

impl From<CapabilityError> for StageError {
    fn from(err: CapabilityError) -> Self {
        StageError::Capability(err)
    }
}

impl From<PublishError> for StageError {
    fn from(err: PublishError) -> Self {
        StageError::Publish(err)
    }
}

impl From<serde_json::Error> for StageError {
    fn from(err: serde_json::Error) -> Self {
        StageError::InvalidEvent(err.to_string())
    }
}

/// Reasons a consumer runtime stops with an error
#[derive(Debug)]
pub enum ConsumerError {
    Broker(BrokerError),
    /// A handler reported a fatal error; the delivery was left unacknowledged
    Fatal { queue: String, error: StageError },
    /// A handler task panicked
    Panicked { queue: String, reason: String },
}

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerError::Broker(e) => write!(f, "Broker error: {}", e),
            ConsumerError::Fatal { queue, error } => {
                write!(f, "Fatal error consuming '{}': {}", queue, error)
            }
            ConsumerError::Panicked { queue, reason } => {
                write!(f, "Handler for '{}' panicked: {}", queue, reason)
            }
        }
    }
}

impl std::error::Error for ConsumerError {}

impl From<BrokerError> for ConsumerError {
    fn from(err: BrokerError) -> Self {
        ConsumerError::Broker(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(StageError::NotImplemented("document".to_string()).is_fatal());
        assert!(StageError::Publish(PublishError::Broker(BrokerError::TopologyMismatch("q".into()))).is_fatal());

        assert!(!StageError::InvalidEvent("missing userId".to_string()).is_fatal());
        assert!(!StageError::Publish(PublishError::Broker(BrokerError::Closed)).is_fatal());
        assert!(!StageError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone")).is_fatal());
    }
}
