//! Durable JSON publisher
//!
//! Serializes application messages (uuids and timestamps go through their serde
//! representations) and publishes them persistently to an exchange/routing key.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::broker::{BrokerError, Channel, Envelope};
use crate::pipeline::topology::Route;

#[derive(Debug)]
pub enum PublishError {
    Serialization(serde_json::Error),
    Broker(BrokerError),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::Serialization(e) => write!(f, "Failed to serialize message: {}", e),
            PublishError::Broker(e) => write!(f, "Failed to publish message: {}", e),
        }
    }
}

impl std::error::Error for PublishError {}

impl From<serde_json::Error> for PublishError {
    fn from(err: serde_json::Error) -> Self {
        PublishError::Serialization(err)
    }
}

impl From<BrokerError> for PublishError {
    fn from(err: BrokerError) -> Self {
        PublishError::Broker(err)
    }
}

/// Publishes on a channel owned by the caller
#[derive(Clone)]
pub struct Publisher {
    channel: Arc<dyn Channel>,
}

impl Publisher {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }

    pub async fn publish<T: Serialize + ?Sized>(&self, route: &Route, message: &T) -> Result<(), PublishError> {
        let envelope = Envelope::json(message)?;
        self.channel
            .publish(&route.exchange, &route.routing_key, &envelope)
            .await?;

        tracing::debug!(
            exchange = %route.exchange,
            routing_key = %route.routing_key,
            bytes = envelope.body.len(),
            "Published message"
        );
        Ok(())
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker, QueueArguments, JSON_CONTENT_TYPE};
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Stamped {
        file_id: Uuid,
        received_at: DateTime<Utc>,
    }

    #[tokio::test]
    async fn test_publish_serializes_uuid_and_timestamp() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        channel.declare_exchange("ex").await.unwrap();
        channel.declare_queue("q", &QueueArguments::default()).await.unwrap();
        channel.bind_queue("q", "ex", "rk").await.unwrap();

        let file_id = Uuid::new_v4();
        let received_at = DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Publisher::new(channel)
            .publish(&Route::new("ex", "rk"), &Stamped { file_id, received_at })
            .await
            .unwrap();

        let drained = broker.drain("q").await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].content_type.as_deref(), Some(JSON_CONTENT_TYPE));

        let value: serde_json::Value = drained[0].decode().unwrap();
        assert_eq!(value["fileId"], file_id.to_string());
        assert_eq!(value["receivedAt"], "2024-03-01T12:00:00Z");
    }
}
