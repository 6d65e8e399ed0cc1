//! In-process broker.
//!
//! Models the subset of AMQP semantics the pipeline relies on: durable direct
//! exchanges, bindings, the default exchange, prefetch-bounded competing
//! consumers, explicit acks, redelivery of unsettled deliveries, and queues
//! with a message TTL plus dead-letter target. Such queues act as delay lines:
//! a message routed to them is re-routed to the dead-letter exchange once the
//! TTL elapses, headers intact.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use crate::broker::envelope::Envelope;
use crate::broker::gateway::{
    Acknowledger, Broker, BrokerError, Channel, Deliveries, Delivery, QueueArguments,
};

struct Queued {
    envelope: Envelope,
    redelivered: bool,
}

struct MemoryQueue {
    arguments: QueueArguments,
    exclusive: bool,
    sender: mpsc::UnboundedSender<Queued>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Queued>>>,
}

impl MemoryQueue {
    fn new(arguments: QueueArguments, exclusive: bool) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            arguments,
            exclusive,
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }

    fn delays(&self) -> Option<(Duration, String, Option<String>)> {
        match (&self.arguments.message_ttl_ms, &self.arguments.dead_letter_exchange) {
            (Some(ttl), Some(exchange)) => Some((
                Duration::from_millis(*ttl),
                exchange.clone(),
                self.arguments.dead_letter_routing_key.clone(),
            )),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Registry {
    exchanges: HashSet<String>,
    queues: HashMap<String, MemoryQueue>,
    bindings: HashMap<(String, String), Vec<String>>,
}

#[derive(Default)]
struct Shared {
    registry: Mutex<Registry>,
    unavailable: AtomicBool,
    next_temporary: AtomicU64,
}

/// Cloneable handle; clones share the same exchanges and queues
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing the broker: new channels fail to open
    pub fn set_available(&self, available: bool) {
        self.shared.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Remove and return every message currently waiting in `queue`
    pub async fn drain(&self, queue: &str) -> Vec<Envelope> {
        let receiver = {
            let registry = self.registry();
            match registry.queues.get(queue) {
                Some(q) => Arc::clone(&q.receiver),
                None => return Vec::new(),
            }
        };

        let mut receiver = receiver.lock().await;
        let mut drained = Vec::new();
        while let Ok(queued) = receiver.try_recv() {
            drained.push(queued.envelope);
        }
        drained
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.registry().queues.contains_key(queue)
    }

    pub fn has_binding(&self, exchange: &str, routing_key: &str, queue: &str) -> bool {
        self.registry()
            .bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .map(|queues| queues.iter().any(|q| q == queue))
            .unwrap_or(false)
    }

    pub fn queue_arguments(&self, queue: &str) -> Option<QueueArguments> {
        self.registry().queues.get(queue).map(|q| q.arguments.clone())
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // A panicking test thread must not wedge every other consumer
        self.shared
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn route(&self, exchange: &str, routing_key: &str, envelope: &Envelope) -> Result<(), BrokerError> {
        let mut delayed = Vec::new();
        {
            let registry = self.registry();

            let targets: Vec<String> = if exchange.is_empty() {
                vec![routing_key.to_string()]
            } else {
                if !registry.exchanges.contains(exchange) {
                    return Err(BrokerError::NotFound(format!("no exchange '{}'", exchange)));
                }
                registry
                    .bindings
                    .get(&(exchange.to_string(), routing_key.to_string()))
                    .cloned()
                    .unwrap_or_default()
            };

            if targets.is_empty() {
                tracing::debug!(exchange, routing_key, "Dropped unroutable message");
            }

            for name in targets {
                let Some(queue) = registry.queues.get(&name) else {
                    continue;
                };
                match queue.delays() {
                    Some((ttl, dlx, dlrk)) => {
                        let dlrk = dlrk.unwrap_or_else(|| routing_key.to_string());
                        delayed.push((ttl, dlx, dlrk));
                    }
                    None => {
                        let _ = queue.sender.send(Queued {
                            envelope: envelope.clone(),
                            redelivered: false,
                        });
                    }
                }
            }
        }

        for (ttl, exchange, routing_key) in delayed {
            let broker = self.clone();
            let envelope = envelope.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                if let Err(e) = broker.route(&exchange, &routing_key, &envelope) {
                    tracing::warn!(exchange = %exchange, routing_key = %routing_key, error = %e, "Dead-letter routing failed");
                }
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            exclusive_queues: Mutex::new(Vec::new()),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    exclusive_queues: Mutex<Vec<String>>,
}

impl MemoryChannel {
    fn check_open(&self) -> Result<(), BrokerError> {
        if self.broker.shared.unavailable.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        self.check_open()?;
        self.broker.registry().exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, arguments: &QueueArguments) -> Result<(), BrokerError> {
        self.check_open()?;
        let mut registry = self.broker.registry();
        match registry.queues.get(queue) {
            Some(existing) if existing.arguments != *arguments => {
                Err(BrokerError::TopologyMismatch(format!(
                    "queue '{}' already declared with {:?}, got {:?}",
                    queue, existing.arguments, arguments
                )))
            }
            Some(_) => Ok(()),
            None => {
                registry
                    .queues
                    .insert(queue.to_string(), MemoryQueue::new(arguments.clone(), false));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.check_open()?;
        let mut registry = self.broker.registry();
        if !registry.exchanges.contains(exchange) {
            return Err(BrokerError::NotFound(format!("no exchange '{}'", exchange)));
        }
        if !registry.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("no queue '{}'", queue)));
        }
        let bound = registry
            .bindings
            .entry((exchange.to_string(), routing_key.to_string()))
            .or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    async fn declare_temporary_queue(&self) -> Result<String, BrokerError> {
        self.check_open()?;
        let id = self.broker.shared.next_temporary.fetch_add(1, Ordering::SeqCst);
        let name = format!("amq.gen-{}", id);
        self.broker
            .registry()
            .queues
            .insert(name.clone(), MemoryQueue::new(QueueArguments::default(), true));
        if let Ok(mut owned) = self.exclusive_queues.lock() {
            owned.push(name.clone());
        }
        Ok(name)
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.check_open()?;
        let mut registry = self.broker.registry();
        registry.queues.remove(queue);
        for bound in registry.bindings.values_mut() {
            bound.retain(|q| q != queue);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, envelope: &Envelope) -> Result<(), BrokerError> {
        self.check_open()?;
        self.broker.route(exchange, routing_key, envelope)
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str, prefetch: u16) -> Result<Deliveries, BrokerError> {
        self.check_open()?;
        let (receiver, sender) = {
            let registry = self.broker.registry();
            let q = registry
                .queues
                .get(queue)
                .ok_or_else(|| BrokerError::NotFound(format!("no queue '{}'", queue)))?;
            // Weak so that deleting the queue closes it and ends the stream
            (Arc::clone(&q.receiver), q.sender.downgrade())
        };
        let limiter = Arc::new(Semaphore::new(usize::from(prefetch.max(1))));

        let deliveries = futures::stream::unfold(
            (receiver, sender, limiter),
            |(receiver, sender, limiter)| async move {
                let permit = match Arc::clone(&limiter).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return None,
                };
                let queued = receiver.lock().await.recv().await?;
                let acker = MemoryAcker {
                    requeue_to: sender.clone(),
                    pending: Some(queued.envelope.clone()),
                    _permit: permit,
                };
                let delivery = Delivery::new(queued.envelope, queued.redelivered, Box::new(acker));
                Some((Ok(delivery), (receiver, sender, limiter)))
            },
        );
        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let owned = match self.exclusive_queues.lock() {
            Ok(mut owned) => std::mem::take(&mut *owned),
            Err(_) => Vec::new(),
        };
        let mut registry = self.broker.registry();
        for name in owned {
            if registry.queues.get(&name).map(|q| q.exclusive).unwrap_or(false) {
                registry.queues.remove(&name);
            }
        }
        Ok(())
    }
}

/// Holds a prefetch slot until settled; dropping it unsettled requeues the message
struct MemoryAcker {
    requeue_to: mpsc::WeakUnboundedSender<Queued>,
    pending: Option<Envelope>,
    _permit: OwnedSemaphorePermit,
}

impl MemoryAcker {
    fn put_back(&mut self) {
        let Some(envelope) = self.pending.take() else {
            return;
        };
        // A deleted queue drops its unsettled messages
        if let Some(sender) = self.requeue_to.upgrade() {
            let _ = sender.send(Queued {
                envelope,
                redelivered: true,
            });
        }
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        let mut settled = self;
        settled.pending = None;
        Ok(())
    }

    async fn requeue(self: Box<Self>) -> Result<(), BrokerError> {
        let mut settled = self;
        settled.put_back();
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        self.put_back();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn declared(broker: &MemoryBroker) -> Arc<dyn Channel> {
        let channel = broker.open_channel().await.unwrap();
        channel.declare_exchange("ex").await.unwrap();
        channel.declare_queue("q", &QueueArguments::default()).await.unwrap();
        channel.bind_queue("q", "ex", "rk").await.unwrap();
        channel
    }

    #[tokio::test]
    async fn test_publish_routes_through_binding() {
        let broker = MemoryBroker::new();
        let channel = declared(&broker).await;

        channel.publish("ex", "rk", &Envelope::new(b"one".to_vec())).await.unwrap();
        channel.publish("ex", "other", &Envelope::new(b"lost".to_vec())).await.unwrap();

        let drained = broker.drain("q").await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].body, b"one".to_vec());
    }

    #[tokio::test]
    async fn test_publish_to_unknown_exchange_fails() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        let err = channel.publish("nope", "rk", &Envelope::new(vec![])).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unacked_delivery_is_redelivered() {
        let broker = MemoryBroker::new();
        let channel = declared(&broker).await;
        channel.publish("ex", "rk", &Envelope::new(b"m".to_vec())).await.unwrap();

        let mut deliveries = channel.consume("q", "t", 1).await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        drop(first);

        let second = deliveries.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        second.ack().await.unwrap();

        assert!(broker.drain("q").await.is_empty());
    }

    #[tokio::test]
    async fn test_deleting_queue_ends_its_deliveries() {
        let broker = MemoryBroker::new();
        let channel = declared(&broker).await;
        let mut deliveries = channel.consume("q", "t", 1).await.unwrap();

        channel.delete_queue("q").await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(1), deliveries.next())
            .await
            .unwrap();
        assert!(next.is_none());
        assert!(!broker.has_queue("q"));
    }

    #[tokio::test]
    async fn test_prefetch_bounds_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let channel = declared(&broker).await;
        for i in 0..3u8 {
            channel.publish("ex", "rk", &Envelope::new(vec![i])).await.unwrap();
        }

        let mut deliveries = channel.consume("q", "t", 2).await.unwrap();
        let a = deliveries.next().await.unwrap().unwrap();
        let _b = deliveries.next().await.unwrap().unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), deliveries.next()).await;
        assert!(blocked.is_err(), "third delivery must wait for a free prefetch slot");

        a.ack().await.unwrap();
        let c = tokio::time::timeout(Duration::from_millis(500), deliveries.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(c.envelope.body, vec![2]);
    }

    #[tokio::test]
    async fn test_ttl_queue_dead_letters_after_delay() {
        let broker = MemoryBroker::new();
        let channel = declared(&broker).await;
        channel
            .declare_queue(
                "q.retry",
                &QueueArguments {
                    dead_letter_exchange: Some("ex".to_string()),
                    dead_letter_routing_key: Some("rk".to_string()),
                    message_ttl_ms: Some(20),
                },
            )
            .await
            .unwrap();
        channel.bind_queue("q.retry", "ex", "rk.retry").await.unwrap();

        let envelope = Envelope::new(b"later".to_vec()).with_retry_count(1);
        channel.publish("ex", "rk.retry", &envelope).await.unwrap();
        assert!(broker.drain("q").await.is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let drained = broker.drain("q").await;
        assert_eq!(drained, vec![envelope]);
    }

    #[tokio::test]
    async fn test_mismatched_redeclaration_is_rejected() {
        let broker = MemoryBroker::new();
        let channel = declared(&broker).await;

        channel.declare_queue("q", &QueueArguments::default()).await.unwrap();
        let err = channel
            .declare_queue(
                "q",
                &QueueArguments {
                    message_ttl_ms: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_temporary_queue_is_removed_on_close() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        let name = channel.declare_temporary_queue().await.unwrap();
        assert!(broker.has_queue(&name));

        channel.close().await.unwrap();
        assert!(!broker.has_queue(&name));
    }

    #[tokio::test]
    async fn test_unavailable_broker_refuses_channels() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        assert!(broker.open_channel().await.is_err());
    }
}
