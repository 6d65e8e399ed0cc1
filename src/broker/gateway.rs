//! Broker gateway abstraction.
//!
//! The rest of the crate only talks to the messaging substrate through these
//! traits. [`Broker`] owns the connection, [`Channel`] is the per-owner handle
//! used to declare topology, publish and consume.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

use crate::broker::envelope::Envelope;

/// Error type for broker operations
#[derive(Debug, Clone)]
pub enum BrokerError {
    /// Connection could not be established within the configured attempts
    Connect { attempts: u32, reason: String },
    /// An exchange or queue already exists with different arguments
    TopologyMismatch(String),
    /// Target exchange or queue does not exist
    NotFound(String),
    /// Publish was negatively acknowledged by the broker
    PublishRejected { exchange: String, routing_key: String },
    /// Protocol or I/O failure on an open channel
    Channel(String),
    /// The connection or channel has been closed
    Closed,
}

impl BrokerError {
    /// Configuration errors that retrying cannot fix
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::TopologyMismatch(_))
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Connect { attempts, reason } => {
                write!(f, "Failed to connect to broker after {} attempts: {}", attempts, reason)
            }
            BrokerError::TopologyMismatch(msg) => write!(f, "Topology mismatch: {}", msg),
            BrokerError::NotFound(msg) => write!(f, "Not found: {}", msg),
            BrokerError::PublishRejected { exchange, routing_key } => write!(
                f,
                "Publish to exchange '{}' with routing key '{}' was rejected",
                exchange, routing_key
            ),
            BrokerError::Channel(msg) => write!(f, "Channel error: {}", msg),
            BrokerError::Closed => write!(f, "Broker connection closed"),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Optional arguments attached to a queue declaration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl_ms: Option<u64>,
}

/// Stream of deliveries for one consumer
pub type Deliveries = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Settles a delivery with the broker
#[async_trait]
pub trait Acknowledger: Send {
    /// Remove the delivery from its queue permanently
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Hand the delivery back to its queue for redelivery
    async fn requeue(self: Box<Self>) -> Result<(), BrokerError>;
}

/// A message delivered to a consumer and not yet settled
pub struct Delivery {
    pub envelope: Envelope,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(envelope: Envelope, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            envelope,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn requeue(self) -> Result<(), BrokerError> {
        self.acker.requeue().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Connection-level handle to the messaging substrate
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a channel owned by the caller
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    /// Close the underlying connection
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Channel-level operations. Every exchange declared here is a durable direct exchange
/// and every queue is durable; all publishes are persistent.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError>;

    async fn declare_queue(&self, queue: &str, arguments: &QueueArguments) -> Result<(), BrokerError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError>;

    /// Declare a server-named exclusive queue and return its name
    async fn declare_temporary_queue(&self) -> Result<String, BrokerError>;

    async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError>;

    async fn publish(&self, exchange: &str, routing_key: &str, envelope: &Envelope) -> Result<(), BrokerError>;

    /// Start consuming `queue`, holding at most `prefetch` unacknowledged deliveries
    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<Deliveries, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
