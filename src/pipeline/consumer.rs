//! Consumer runtime shared by every pipeline stage.
//!
//! A runtime owns one channel, declares its stage's topology, and keeps at most
//! `concurrency` deliveries in flight, one task each. A delivery is acked only
//! after its handler finished; failures go through [`RetryPolicy`] before the
//! original is acked. Fatal handler errors leave the delivery unacked and stop
//! the runtime.

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};

use crate::broker::{Broker, BrokerError, Channel, Delivery};
use crate::pipeline::error::{ConsumerError, StageError};
use crate::pipeline::retry::{FailureOutcome, RetryPolicy};
use crate::pipeline::topology::QueueTopology;

pub const DEFAULT_CONCURRENCY: u16 = 10;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Stage-specific message handler
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    type Message: DeserializeOwned + Send + 'static;

    fn name(&self) -> &str;

    async fn handle(&self, message: Self::Message) -> Result<(), StageError>;
}

/// [`Stage`] backed by a closure
pub struct FnStage<M, F> {
    name: String,
    handler: F,
    _message: PhantomData<fn() -> M>,
}

pub fn handler_fn<M, F, Fut>(name: impl Into<String>, handler: F) -> FnStage<M, F>
where
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), StageError>> + Send,
{
    FnStage {
        name: name.into(),
        handler,
        _message: PhantomData,
    }
}

#[async_trait]
impl<M, F, Fut> Stage for FnStage<M, F>
where
    M: DeserializeOwned + Send + 'static,
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), StageError>> + Send,
{
    type Message = M;

    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, message: M) -> Result<(), StageError> {
        (self.handler)(message).await
    }
}

/// Counts of how deliveries were settled during one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub acked: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Handed back to the queue because republishing the failure failed
    pub requeued: usize,
    /// Still in flight when the shutdown grace period ran out
    pub interrupted: usize,
}

enum Settled {
    Acked,
    Retried,
    DeadLettered,
    Requeued,
}

pub struct ConsumerRuntime<S> {
    stage: Arc<S>,
    topology: Arc<QueueTopology>,
    policy: RetryPolicy,
    concurrency: u16,
    shutdown_grace: Duration,
    consumer_tag: String,
}

impl<S: Stage> ConsumerRuntime<S> {
    pub fn new(stage: Arc<S>, topology: QueueTopology, policy: RetryPolicy) -> Self {
        let consumer_tag = format!("{}-{}", stage.name(), uuid::Uuid::new_v4().simple());
        Self {
            stage,
            topology: Arc::new(topology),
            policy,
            concurrency: DEFAULT_CONCURRENCY,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            consumer_tag,
        }
    }

    /// Prefetch limit and number of concurrent handler tasks (at least 1)
    pub fn with_concurrency(mut self, concurrency: u16) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    /// Consume until `shutdown` resolves, the delivery stream ends, or a fatal error occurs.
    ///
    /// On the way out no new deliveries are taken, in-flight handlers get the
    /// grace period to finish, stragglers are aborted (their deliveries stay
    /// unacked) and the channel is closed.
    pub async fn run<F>(&self, broker: &dyn Broker, shutdown: F) -> Result<RunSummary, ConsumerError>
    where
        F: Future<Output = ()> + Send,
    {
        let queue = self.topology.queue_name.clone();
        let channel = broker.open_channel().await?;
        if let Err(e) = self.topology.declare(channel.as_ref()).await {
            let _ = channel.close().await;
            return Err(e.into());
        }

        let mut deliveries = match channel
            .consume(&queue, &self.consumer_tag, self.concurrency)
            .await
        {
            Ok(deliveries) => deliveries,
            Err(e) => {
                let _ = channel.close().await;
                return Err(e.into());
            }
        };

        tracing::info!(
            stage = self.stage.name(),
            queue = %queue,
            consumer_tag = %self.consumer_tag,
            concurrency = self.concurrency,
            "Consumer started"
        );

        let mut summary = RunSummary::default();
        let mut tasks: JoinSet<Result<Settled, ConsumerError>> = JoinSet::new();
        tokio::pin!(shutdown);

        let mut outcome: Result<(), ConsumerError> = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!(queue = %queue, in_flight = tasks.len(), "Consumer stopping");
                    break Ok(());
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = record(&mut summary, joined, &queue) {
                        break Err(e);
                    }
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        tasks.spawn(process(
                            Arc::clone(&self.stage),
                            Arc::clone(&channel),
                            Arc::clone(&self.topology),
                            self.policy,
                            delivery,
                        ));
                    }
                    Some(Err(e)) => break Err(e.into()),
                    // Only shutdown ends a consumer cleanly; a cancelled consumer or a
                    // deleted queue must surface so the worker restarts or exits
                    None => {
                        tracing::error!(queue = %queue, "Delivery stream ended without shutdown");
                        break Err(BrokerError::Closed.into());
                    }
                },
            }
        };
        drop(deliveries);

        let grace = tokio::time::sleep(self.shutdown_grace);
        tokio::pin!(grace);
        while !tasks.is_empty() {
            tokio::select! {
                _ = &mut grace => {
                    summary.interrupted += tasks.len();
                    tracing::warn!(
                        queue = %queue,
                        interrupted = tasks.len(),
                        "Shutdown grace period elapsed, aborting in-flight handlers"
                    );
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                }
                Some(joined) = tasks.join_next() => {
                    if let Err(e) = record(&mut summary, joined, &queue) {
                        if outcome.is_ok() {
                            outcome = Err(e);
                        }
                    }
                }
            }
        }

        if let Err(e) = channel.close().await {
            tracing::debug!(queue = %queue, error = %e, "Channel close failed");
        }

        tracing::info!(
            queue = %queue,
            acked = summary.acked,
            retried = summary.retried,
            dead_lettered = summary.dead_lettered,
            requeued = summary.requeued,
            interrupted = summary.interrupted,
            "Consumer stopped"
        );
        outcome.map(|_| summary)
    }
}

fn record(
    summary: &mut RunSummary,
    joined: Result<Result<Settled, ConsumerError>, JoinError>,
    queue: &str,
) -> Result<(), ConsumerError> {
    match joined {
        Ok(Ok(Settled::Acked)) => summary.acked += 1,
        Ok(Ok(Settled::Retried)) => summary.retried += 1,
        Ok(Ok(Settled::DeadLettered)) => summary.dead_lettered += 1,
        Ok(Ok(Settled::Requeued)) => summary.requeued += 1,
        Ok(Err(e)) => return Err(e),
        Err(e) if e.is_cancelled() => summary.interrupted += 1,
        Err(e) => {
            return Err(ConsumerError::Panicked {
                queue: queue.to_string(),
                reason: e.to_string(),
            })
        }
    }
    Ok(())
}

async fn process<S: Stage>(
    stage: Arc<S>,
    channel: Arc<dyn Channel>,
    topology: Arc<QueueTopology>,
    policy: RetryPolicy,
    delivery: Delivery,
) -> Result<Settled, ConsumerError> {
    tracing::debug!(
        queue = %topology.queue_name,
        retry_count = delivery.envelope.retry_count(),
        redelivered = delivery.redelivered,
        "Received message"
    );

    let result = match delivery.envelope.decode::<S::Message>() {
        Ok(message) => stage.handle(message).await,
        Err(e) => Err(StageError::InvalidEvent(e.to_string())),
    };

    let error = match result {
        Ok(()) => {
            delivery.ack().await?;
            return Ok(Settled::Acked);
        }
        Err(error) if error.is_fatal() => {
            tracing::error!(queue = %topology.queue_name, error = %error, "Fatal handler error");
            return Err(ConsumerError::Fatal {
                queue: topology.queue_name.clone(),
                error,
            });
        }
        Err(error) => error,
    };

    match policy
        .handle_failure(channel.as_ref(), &topology, &delivery.envelope, &error)
        .await
    {
        Ok(outcome) => {
            delivery.ack().await?;
            Ok(match outcome {
                FailureOutcome::Retried { .. } => Settled::Retried,
                FailureOutcome::DeadLettered { .. } => Settled::DeadLettered,
            })
        }
        Err(publish_error) => {
            tracing::error!(
                queue = %topology.queue_name,
                error = %publish_error,
                handler_error = %error,
                "Failed to republish failed message, requeueing original"
            );
            delivery.requeue().await?;
            if publish_error.is_fatal() {
                return Err(publish_error.into());
            }
            Ok(Settled::Requeued)
        }
    }
}
