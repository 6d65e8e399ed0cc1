//! RabbitMQ implementation of the broker gateway
//!
//! Provides connection management, topology declaration, persistent publishing
//! and prefetch-bounded consumption over AMQP 0-9-1.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::broker::envelope::{Envelope, HeaderValue};
use crate::broker::gateway::{
    Acknowledger, Broker, BrokerError, Channel, Deliveries, Delivery, QueueArguments,
};
use crate::config::BrokerSettings;

const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

impl From<lapin::Error> for BrokerError {
    fn from(e: lapin::Error) -> Self {
        match &e {
            lapin::Error::ProtocolError(amqp) => match amqp.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                    BrokerError::TopologyMismatch(amqp.to_string())
                }
                AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => {
                    BrokerError::NotFound(amqp.to_string())
                }
                _ => BrokerError::Channel(e.to_string()),
            },
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
                BrokerError::Closed
            }
            _ => BrokerError::Channel(e.to_string()),
        }
    }
}

pub struct AmqpBroker {
    connection: Connection,
    endpoint: String,
}

impl AmqpBroker {
    /// Connect to RabbitMQ, retrying with a fixed backoff
    pub async fn connect(settings: &BrokerSettings) -> Result<Self, BrokerError> {
        let uri = settings.uri().map_err(|e| BrokerError::Connect {
            attempts: 0,
            reason: e.to_string(),
        })?;
        let attempts = settings.connect_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match Connection::connect(&uri, ConnectionProperties::default()).await {
                Ok(connection) => {
                    tracing::info!(endpoint = %settings.endpoint(), attempt, "Connected to RabbitMQ");
                    return Ok(Self {
                        connection,
                        endpoint: settings.endpoint(),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        endpoint = %settings.endpoint(),
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "RabbitMQ connection attempt failed"
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(settings.connect_backoff()).await;
                    }
                }
            }
        }

        Err(BrokerError::Connect {
            attempts,
            reason: last_error,
        })
    }

    /// Check if the AMQP connection is open
    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let channel = self.connection.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;
        tracing::debug!(endpoint = %self.endpoint, channel_id = channel.id(), "Opened channel");
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.connection.close(REPLY_SUCCESS, "shutdown").await?;
        tracing::info!(endpoint = %self.endpoint, "Closed RabbitMQ connection");
        Ok(())
    }
}

pub struct AmqpChannel {
    channel: lapin::Channel,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, arguments: &QueueArguments) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_arguments_table(arguments),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_temporary_queue(&self) -> Result<String, BrokerError> {
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, envelope: &Envelope) -> Result<(), BrokerError> {
        let mut properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_headers(headers_to_table(&envelope.headers));
        if let Some(content_type) = &envelope.content_type {
            properties = properties.with_content_type(ShortString::from(content_type.clone()));
        }

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &envelope.body,
                properties,
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(BrokerError::PublishRejected {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }

        tracing::debug!(exchange, routing_key, bytes = envelope.body.len(), "Published message");
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<Deliveries, BrokerError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let deliveries = consumer.map(|result| {
            result.map(into_delivery).map_err(BrokerError::from)
        });
        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "consumer stopped").await?;
        }
        Ok(())
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn requeue(self: Box<Self>) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(table_to_headers)
        .unwrap_or_default();
    let content_type = delivery
        .properties
        .content_type()
        .as_ref()
        .map(|ct| ct.as_str().to_string());

    let envelope = Envelope {
        body: delivery.data,
        headers,
        content_type,
    };
    Delivery::new(envelope, delivery.redelivered, Box::new(AmqpAcker(delivery.acker)))
}

fn queue_arguments_table(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(exchange) = &arguments.dead_letter_exchange {
        table.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(exchange.clone())),
        );
    }
    if let Some(routing_key) = &arguments.dead_letter_routing_key {
        table.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(routing_key.clone())),
        );
    }
    if let Some(ttl) = arguments.message_ttl_ms {
        let ttl = i64::try_from(ttl).unwrap_or(i64::MAX);
        table.insert(ShortString::from("x-message-ttl"), AMQPValue::LongLongInt(ttl));
    }
    table
}

fn headers_to_table(headers: &BTreeMap<String, HeaderValue>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        let value = match value {
            HeaderValue::Int(n) => AMQPValue::LongLongInt(*n),
            HeaderValue::Text(s) => AMQPValue::LongString(LongString::from(s.clone())),
            HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}

fn table_to_headers(table: &FieldTable) -> BTreeMap<String, HeaderValue> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| header_value(value).map(|v| (key.as_str().to_string(), v)))
        .collect()
}

/// Integer widths other producers may use for the retry header all map to `Int`
fn header_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::Boolean(b) => Some(HeaderValue::Bool(*b)),
        AMQPValue::ShortShortInt(n) => Some(HeaderValue::Int(i64::from(*n))),
        AMQPValue::ShortShortUInt(n) => Some(HeaderValue::Int(i64::from(*n))),
        AMQPValue::ShortInt(n) => Some(HeaderValue::Int(i64::from(*n))),
        AMQPValue::ShortUInt(n) => Some(HeaderValue::Int(i64::from(*n))),
        AMQPValue::LongInt(n) => Some(HeaderValue::Int(i64::from(*n))),
        AMQPValue::LongUInt(n) => Some(HeaderValue::Int(i64::from(*n))),
        AMQPValue::LongLongInt(n) => Some(HeaderValue::Int(*n)),
        AMQPValue::ShortString(s) => Some(HeaderValue::Text(s.as_str().to_string())),
        AMQPValue::LongString(s) => Some(HeaderValue::Text(
            String::from_utf8_lossy(s.as_bytes()).into_owned(),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_queue_arguments_table() {
        let table = queue_arguments_table(&QueueArguments {
            dead_letter_exchange: Some("chunk_exchange".to_string()),
            dead_letter_routing_key: Some("chunk.process".to_string()),
            message_ttl_ms: Some(10_000),
        });

        let inner = table.inner();
        assert_eq!(inner.len(), 3);
        assert_eq!(
            inner.get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongLongInt(10_000))
        );
    }

    #[test]
    fn test_headers_survive_table_conversion() {
        let mut headers = BTreeMap::new();
        headers.insert("x-retry-count".to_string(), HeaderValue::Int(2));
        headers.insert("x-source".to_string(), HeaderValue::Text("upload".to_string()));

        let back = table_to_headers(&headers_to_table(&headers));
        assert_eq!(back, headers);
    }

    #[test]
    fn test_narrow_integer_headers_are_read() {
        assert_eq!(header_value(&AMQPValue::ShortShortUInt(3)), Some(HeaderValue::Int(3)));
        assert_eq!(header_value(&AMQPValue::LongInt(-1)), Some(HeaderValue::Int(-1)));
        assert_eq!(header_value(&AMQPValue::Void), None);
    }
}
