//! Broker gateway
//!
//! The only part of the crate that touches the messaging transport: AMQP for
//! deployments, an in-process broker for tests and local runs.

pub mod envelope;
pub mod gateway;
pub mod amqp;
pub mod memory;

pub use envelope::{Envelope, HeaderValue, JSON_CONTENT_TYPE, RETRY_COUNT_HEADER};
pub use gateway::{Acknowledger, Broker, BrokerError, Channel, Deliveries, Delivery, QueueArguments};
pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;
