//! Wires stages to consumer runtimes and runs them as worker instances.

use std::sync::Arc;
use tokio::task::JoinSet;

use crate::broker::Broker;
use crate::capabilities::{BillingDocumentGenerator, LogNotifier};
use crate::config::PipelineSettings;
use crate::persistence::{DebtStore, DocumentStore};
use crate::pipeline::{
    shutdown, ConsumerError, ConsumerRuntime, Publisher, RetryPolicy, RunSummary, ShutdownSignal, Stage,
};
use crate::stages::{
    ChunkIngestStage, DocumentStage, FileSplitStage, NotificationStage, RejectLog, StageKind,
};

/// Shared collaborators handed to every stage instance
#[derive(Clone)]
pub struct Services {
    pub broker: Arc<dyn Broker>,
    pub debts: Arc<dyn DebtStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub settings: PipelineSettings,
}

/// Declare the topology of every stage
pub async fn declare_all(broker: &dyn Broker, retry_delay_ms: u64) -> Result<(), ConsumerError> {
    let channel = broker.open_channel().await?;
    for kind in StageKind::ALL {
        kind.topology(retry_delay_ms).declare(channel.as_ref()).await?;
    }
    channel.close().await?;
    Ok(())
}

/// Run one consumer instance of `kind` until `signal` fires
pub async fn run_stage(
    kind: StageKind,
    services: &Services,
    instance: usize,
    signal: ShutdownSignal,
) -> Result<RunSummary, ConsumerError> {
    let settings = &services.settings;
    let publisher = Publisher::new(services.broker.open_channel().await?);
    // Downstream topology must exist before the first publish
    match kind {
        StageKind::FileSplit => {
            StageKind::ChunkIngest
                .topology(settings.retry_delay_ms)
                .declare(publisher.channel().as_ref())
                .await?
        }
        StageKind::ChunkIngest if settings.emit_document_events => {
            StageKind::DocumentGeneration
                .topology(settings.retry_delay_ms)
                .declare(publisher.channel().as_ref())
                .await?
        }
        StageKind::DocumentGeneration => {
            StageKind::Notification
                .topology(settings.retry_delay_ms)
                .declare(publisher.channel().as_ref())
                .await?
        }
        _ => {}
    }

    let result = match kind {
        StageKind::FileSplit => {
            let stage = FileSplitStage::new(
                publisher.clone(),
                StageKind::ChunkIngest.topology(settings.retry_delay_ms).route(),
                settings.chunk_size,
                RejectLog::new(settings.reject_dir.clone()),
            );
            run_runtime(stage, kind, services, instance, signal).await
        }
        StageKind::ChunkIngest => {
            let stage = ChunkIngestStage::new(
                Arc::clone(&services.debts),
                settings.emit_document_events.then(|| publisher.clone()),
                StageKind::DocumentGeneration.topology(settings.retry_delay_ms).route(),
            );
            run_runtime(stage, kind, services, instance, signal).await
        }
        StageKind::DocumentGeneration => {
            let stage = DocumentStage::new(
                Arc::new(BillingDocumentGenerator::new(Arc::clone(&services.documents))),
                publisher.clone(),
                StageKind::Notification.topology(settings.retry_delay_ms).route(),
            );
            run_runtime(stage, kind, services, instance, signal).await
        }
        StageKind::Notification => {
            let stage = NotificationStage::new(Arc::new(LogNotifier::new(Arc::clone(&services.documents))));
            run_runtime(stage, kind, services, instance, signal).await
        }
    };

    if let Err(e) = publisher.channel().close().await {
        tracing::debug!(stage = %kind, error = %e, "Publisher channel close failed");
    }
    result
}

async fn run_runtime<S: Stage>(
    stage: S,
    kind: StageKind,
    services: &Services,
    instance: usize,
    signal: ShutdownSignal,
) -> Result<RunSummary, ConsumerError> {
    let settings = &services.settings;
    let runtime = ConsumerRuntime::new(
        Arc::new(stage),
        kind.topology(settings.retry_delay_ms),
        RetryPolicy::new(settings.max_retries),
    )
    .with_concurrency(settings.prefetch_count)
    .with_shutdown_grace(settings.shutdown_grace())
    .with_consumer_tag(format!("{}-{}-{}", kind, instance, uuid::Uuid::new_v4().simple()));

    runtime.run(services.broker.as_ref(), signal.wait()).await
}

/// Run `instances` consumers of every stage in `kinds`.
///
/// Returns once all instances stopped. The first instance to fail stops the others
/// and its error is returned.
pub async fn run_workers(
    kinds: &[StageKind],
    instances: usize,
    services: Services,
    signal: ShutdownSignal,
) -> Result<(), ConsumerError> {
    let (abort, aborted) = shutdown::channel();
    let mut workers = JoinSet::new();

    for &kind in kinds {
        for instance in 0..instances.max(1) {
            let services = services.clone();
            let (outer, inner) = (signal.clone(), aborted.clone());
            let (stop, stopper) = shutdown::channel();
            workers.spawn(async move {
                let relay = tokio::spawn(async move {
                    tokio::select! {
                        _ = outer.wait() => {},
                        _ = inner.wait() => {},
                    }
                    stop.trigger();
                });
                let result = run_stage(kind, &services, instance, stopper).await;
                relay.abort();
                (kind, instance, result)
            });
        }
    }
    tracing::info!(stages = kinds.len(), instances, "Workers started");

    let mut first_error = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((kind, instance, Ok(summary))) => {
                tracing::info!(stage = %kind, instance, acked = summary.acked, "Worker finished");
            }
            Ok((kind, instance, Err(e))) => {
                tracing::error!(stage = %kind, instance, error = %e, "Worker failed");
                abort.trigger();
                first_error.get_or_insert(e);
            }
            Err(e) => {
                tracing::error!(error = %e, "Worker task panicked");
                abort.trigger();
                first_error.get_or_insert(ConsumerError::Panicked {
                    queue: "worker".to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
