//! Queue topology for a pipeline stage.
//!
//! Every stage owns four broker objects derived from its queue name:
//!
//! ```text
//!                 routing_key            ┌──────────────┐
//!   exchange ───────────────────────────▶│ main queue   │──▶ consumer
//!      │                                 └──────────────┘
//!      │          routing_key.retry      ┌──────────────┐  TTL expiry
//!      ├────────────────────────────────▶│ retry queue  │────────────┐
//!      │                                 └──────────────┘            │
//!      │          routing_key.dlq        ┌──────────────┐            │
//!      └────────────────────────────────▶│ dead letters │            │
//!      ▲                                 └──────────────┘            │
//!      └──────────────── dead-letter to routing_key ─────────────────┘
//! ```

use crate::broker::{BrokerError, Channel, QueueArguments};

/// Exchange and routing key a message is published to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub exchange: String,
    pub routing_key: String,
}

impl Route {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub queue_name: String,
    pub exchange_name: String,
    pub routing_key: String,
    pub retry_queue_name: String,
    pub dead_letter_queue_name: String,
    pub retry_delay_ms: u64,
}

impl QueueTopology {
    /// Topology with retry and dead-letter queue names derived from `queue_name`
    pub fn new(
        queue_name: impl Into<String>,
        exchange_name: impl Into<String>,
        routing_key: impl Into<String>,
        retry_delay_ms: u64,
    ) -> Self {
        let queue_name = queue_name.into();
        Self {
            retry_queue_name: format!("{}.retry", queue_name),
            dead_letter_queue_name: format!("{}.dlq", queue_name),
            queue_name,
            exchange_name: exchange_name.into(),
            routing_key: routing_key.into(),
            retry_delay_ms,
        }
    }

    pub fn with_retry_queue(mut self, name: impl Into<String>) -> Self {
        self.retry_queue_name = name.into();
        self
    }

    pub fn with_dead_letter_queue(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_queue_name = name.into();
        self
    }

    /// Where producers publish messages for this stage
    pub fn route(&self) -> Route {
        Route::new(self.exchange_name.clone(), self.routing_key.clone())
    }

    pub fn retry_route(&self) -> Route {
        Route::new(self.exchange_name.clone(), format!("{}.retry", self.routing_key))
    }

    pub fn dead_letter_route(&self) -> Route {
        Route::new(self.exchange_name.clone(), format!("{}.dlq", self.routing_key))
    }

    /// Messages the broker itself dead-letters from the main queue land in the retry queue
    pub fn main_queue_arguments(&self) -> QueueArguments {
        QueueArguments {
            dead_letter_exchange: Some(self.exchange_name.clone()),
            dead_letter_routing_key: Some(self.retry_route().routing_key),
            message_ttl_ms: None,
        }
    }

    /// Expired retry messages are resubmitted on the main routing key
    pub fn retry_queue_arguments(&self) -> QueueArguments {
        QueueArguments {
            dead_letter_exchange: Some(self.exchange_name.clone()),
            dead_letter_routing_key: Some(self.routing_key.clone()),
            message_ttl_ms: Some(self.retry_delay_ms),
        }
    }

    /// Declare exchange, main queue, retry queue and dead-letter queue, in that order.
    ///
    /// Idempotent for identical arguments. An existing queue declared with
    /// different arguments surfaces as [`BrokerError::TopologyMismatch`].
    pub async fn declare(&self, channel: &dyn Channel) -> Result<(), BrokerError> {
        channel.declare_exchange(&self.exchange_name).await?;

        channel
            .declare_queue(&self.queue_name, &self.main_queue_arguments())
            .await?;
        channel
            .bind_queue(&self.queue_name, &self.exchange_name, &self.routing_key)
            .await?;

        let retry = self.retry_route();
        channel
            .declare_queue(&self.retry_queue_name, &self.retry_queue_arguments())
            .await?;
        channel
            .bind_queue(&self.retry_queue_name, &retry.exchange, &retry.routing_key)
            .await?;

        let dead_letter = self.dead_letter_route();
        channel
            .declare_queue(&self.dead_letter_queue_name, &QueueArguments::default())
            .await?;
        channel
            .bind_queue(&self.dead_letter_queue_name, &dead_letter.exchange, &dead_letter.routing_key)
            .await?;

        tracing::info!(
            queue = %self.queue_name,
            exchange = %self.exchange_name,
            routing_key = %self.routing_key,
            retry_delay_ms = self.retry_delay_ms,
            "Declared queue topology"
        );
        Ok(())
    }
}
