//! Reachability probes for the store and the broker.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::Broker;
use crate::persistence::DebtStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthDetails {
    pub database: bool,
    pub broker: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub details: HealthDetails,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[derive(Clone)]
pub struct HealthCheck {
    store: Arc<dyn DebtStore>,
    broker: Arc<dyn Broker>,
    timeout: Duration,
}

impl HealthCheck {
    pub fn new(store: Arc<dyn DebtStore>, broker: Arc<dyn Broker>, timeout: Duration) -> Self {
        Self { store, broker, timeout }
    }

    /// Run both probes concurrently, each bounded by the timeout
    pub async fn check(&self) -> HealthReport {
        let (database, broker) = tokio::join!(self.database_ok(), self.broker_ok());
        let status = if database && broker {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        HealthReport {
            status,
            details: HealthDetails { database, broker },
        }
    }

    async fn database_ok(&self) -> bool {
        match tokio::time::timeout(self.timeout, self.store.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Database health probe failed");
                false
            }
            Err(_) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "Database health probe timed out");
                false
            }
        }
    }

    async fn broker_ok(&self) -> bool {
        let probe = async {
            let channel = self.broker.open_channel().await?;
            let declared = channel.declare_temporary_queue().await;
            // Closing the channel discards the exclusive queue
            let _ = channel.close().await;
            declared.map(|_| ())
        };
        match tokio::time::timeout(self.timeout, probe).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Broker health probe failed");
                false
            }
            Err(_) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "Broker health probe timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::persistence::{MemoryStore, PersistenceError, UpsertBatch, UpsertSummary};
    use async_trait::async_trait;
    use std::time::Instant;

    /// Store whose ping never answers in time
    struct StalledStore;

    #[async_trait]
    impl DebtStore for StalledStore {
        async fn upsert_batch(&self, _batch: &UpsertBatch) -> Result<UpsertSummary, PersistenceError> {
            Ok(UpsertSummary::default())
        }

        async fn ping(&self) -> Result<(), PersistenceError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn check(store: &MemoryStore, broker: &MemoryBroker) -> HealthCheck {
        HealthCheck::new(
            Arc::new(store.clone()),
            Arc::new(broker.clone()),
            Duration::from_millis(500),
        )
    }

    #[tokio::test]
    async fn test_healthy_only_when_both_probes_pass() {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new();
        let health = check(&store, &broker);

        let report = health.check().await;
        assert!(report.is_healthy());

        store.set_failing(true);
        let report = health.check().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.details, HealthDetails { database: false, broker: true });

        store.set_failing(false);
        broker.set_available(false);
        let report = health.check().await;
        assert_eq!(report.details, HealthDetails { database: true, broker: false });
    }

    #[tokio::test]
    async fn test_stalled_database_is_reported_within_timeout() {
        let broker = MemoryBroker::new();
        let health = HealthCheck::new(Arc::new(StalledStore), Arc::new(broker), Duration::from_millis(50));

        let started = Instant::now();
        let report = health.check().await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!report.is_healthy());
        assert_eq!(report.details, HealthDetails { database: false, broker: true });
    }

    #[test]
    fn test_report_shape() {
        let report = HealthReport {
            status: HealthStatus::Unhealthy,
            details: HealthDetails { database: true, broker: false },
        };
        assert_eq!(
            serde_json::to_value(report).unwrap(),
            serde_json::json!({"status": "unhealthy", "details": {"database": true, "broker": false}})
        );
    }
}
