//! # debtflow: queue-driven ingestion of bulk debt files
//!
//! Uploaded CSV files flow through four stages connected by durable queues:
//!
//! ```text
//! upload ─▶ file split ─▶ chunk ingest ─▶ document generation ─▶ notification
//! ```
//!
//! Every stage runs on the same [`pipeline::ConsumerRuntime`]: it declares the
//! stage's exchange, main queue, TTL retry queue and dead-letter queue, keeps a
//! bounded number of deliveries in flight, acks only after the handler finished
//! and sends failures through one [`pipeline::RetryPolicy`] (three retries with
//! an `x-retry-count` header, then the dead-letter queue).
//!
//! Delivery is at-least-once. Handlers stay safe under redelivery because every
//! write is insert-or-ignore on a natural key and debt ids are derived from the
//! file id and source line.
//!
//! ## Example: consuming a stage in-process
//!
//! ```ignore
//! let broker = MemoryBroker::new();
//! let stage = handler_fn("audit", |event: FileReadyEvent| async move {
//!     tracing::info!(file = %event.file_name, "seen");
//!     Ok(())
//! });
//! let runtime = ConsumerRuntime::new(Arc::new(stage), StageKind::FileSplit.topology(10_000), RetryPolicy::default());
//! runtime.run(&broker, tokio::signal::ctrl_c().map(|_| ())).await?;
//! ```

pub mod broker;
pub mod capabilities;
pub mod config;
pub mod health;
pub mod ingress;
pub mod persistence;
pub mod pipeline;
pub mod stages;
pub mod worker;

pub use broker::{AmqpBroker, Broker, BrokerError, Channel, Envelope, MemoryBroker};
pub use config::{ConfigError, Settings};
pub use health::{HealthCheck, HealthReport};
pub use persistence::{DebtStore, DocumentStore, MemoryStore, PersistenceError, PgStore};
pub use pipeline::{
    handler_fn, ConsumerError, ConsumerRuntime, Publisher, QueueTopology, RetryPolicy, Stage, StageError,
};
pub use stages::StageKind;
