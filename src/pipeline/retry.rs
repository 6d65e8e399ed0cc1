//! Bounded retry with dead-lettering.
//!
//! The only place failure policy lives. A failed delivery is republished as a
//! new message to the stage's retry routing key with its attempt count bumped,
//! or, once the count reaches the maximum, to the dead-letter routing key with
//! every header stripped.

use crate::broker::{BrokerError, Channel, Envelope};
use crate::pipeline::topology::QueueTopology;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What happened to a failed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Republished for another attempt; `attempt` is the new retry count
    Retried { attempt: u32 },
    /// Moved to the dead-letter queue after `attempts` retries
    DeadLettered { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn decide(&self, envelope: &Envelope) -> FailureOutcome {
        let retry_count = envelope.retry_count();
        if retry_count < self.max_retries {
            FailureOutcome::Retried {
                attempt: retry_count + 1,
            }
        } else {
            FailureOutcome::DeadLettered {
                attempts: retry_count,
            }
        }
    }

    /// Republish `original` according to [`RetryPolicy::decide`].
    ///
    /// The caller still owns the original delivery and settles it afterwards.
    pub async fn handle_failure(
        &self,
        channel: &dyn Channel,
        topology: &QueueTopology,
        original: &Envelope,
        error: &(dyn std::fmt::Display + Sync),
    ) -> Result<FailureOutcome, BrokerError> {
        let outcome = self.decide(original);
        match outcome {
            FailureOutcome::Retried { attempt } => {
                let route = topology.retry_route();
                channel
                    .publish(&route.exchange, &route.routing_key, &original.with_retry_count(attempt))
                    .await?;
                tracing::warn!(
                    queue = %topology.queue_name,
                    retry_count = attempt,
                    max_retries = self.max_retries,
                    delay_ms = topology.retry_delay_ms,
                    error = %error,
                    "Message failed, scheduled for retry"
                );
            }
            FailureOutcome::DeadLettered { attempts } => {
                let route = topology.dead_letter_route();
                channel
                    .publish(&route.exchange, &route.routing_key, &original.without_retry_metadata())
                    .await?;
                tracing::error!(
                    queue = %topology.queue_name,
                    dead_letter_queue = %topology.dead_letter_queue_name,
                    attempts,
                    error = %error,
                    "Message exhausted retries, moved to dead-letter queue"
                );
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, HeaderValue, MemoryBroker, RETRY_COUNT_HEADER};

    #[test]
    fn test_decide_counts_up_to_the_maximum() {
        let policy = RetryPolicy::default();
        let fresh = Envelope::new(b"{}".to_vec());

        assert_eq!(policy.decide(&fresh), FailureOutcome::Retried { attempt: 1 });
        assert_eq!(policy.decide(&fresh.with_retry_count(2)), FailureOutcome::Retried { attempt: 3 });
        assert_eq!(
            policy.decide(&fresh.with_retry_count(3)),
            FailureOutcome::DeadLettered { attempts: 3 }
        );
    }

    #[test]
    fn test_unreadable_header_favours_a_retry() {
        let mut envelope = Envelope::new(b"{}".to_vec());
        envelope
            .headers
            .insert(RETRY_COUNT_HEADER.to_string(), HeaderValue::Text("lots".to_string()));
        assert_eq!(RetryPolicy::default().decide(&envelope), FailureOutcome::Retried { attempt: 1 });
    }

    #[test]
    fn test_zero_retries_dead_letters_immediately() {
        let policy = RetryPolicy::new(0);
        assert_eq!(
            policy.decide(&Envelope::new(vec![])),
            FailureOutcome::DeadLettered { attempts: 0 }
        );
    }

    #[tokio::test]
    async fn test_handle_failure_republishes_to_retry_and_dead_letter_keys() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        // Long delay keeps retried messages parked in the retry queue
        let topology = QueueTopology::new("q", "ex", "rk", 60_000);
        topology.declare(channel.as_ref()).await.unwrap();
        let policy = RetryPolicy::default();

        let mut original = Envelope::new(br#"{"k":1}"#.to_vec()).with_retry_count(1);
        original
            .headers
            .insert("x-origin".to_string(), HeaderValue::Text("upload".to_string()));

        let outcome = policy
            .handle_failure(channel.as_ref(), &topology, &original, &"boom")
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Retried { attempt: 2 });

        let exhausted = original.with_retry_count(3);
        let outcome = policy
            .handle_failure(channel.as_ref(), &topology, &exhausted, &"boom")
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::DeadLettered { attempts: 3 });

        let dead = broker.drain("q.dlq").await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, original.body);
        assert!(dead[0].headers.is_empty());
        assert!(broker.drain("q").await.is_empty());
    }
}
