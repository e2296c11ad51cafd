use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::channel::{Channel, ChannelError};
use crate::config::PublishRetryConfig;
use crate::payload::BatchPayload;
use crate::retry::RetryPolicy;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to encode batch {batch_id}: {error}")]
    Encode {
        batch_id: String,
        #[source]
        error: serde_json::Error,
    },
    #[error("failed to publish to '{queue}' after {retries} retries: {last}")]
    Exhausted {
        queue: String,
        retries: u32,
        #[source]
        last: ChannelError,
    },
}

/// Wraps a channel's raw send with full-jitter exponential backoff.
///
/// Dropping the returned future stops retrying at the next await point.
pub struct ReliablePublisher {
    channel: Arc<dyn Channel + Send + Sync>,
    max_retries: u32,
    retry_policy: RetryPolicy,
}

impl ReliablePublisher {
    pub fn new(
        channel: Arc<dyn Channel + Send + Sync>,
        max_retries: u32,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            channel,
            max_retries,
            retry_policy,
        }
    }

    pub fn from_config(channel: Arc<dyn Channel + Send + Sync>, config: &PublishRetryConfig) -> Self {
        Self::new(channel, config.publish_max_retries, config.policy())
    }

    pub async fn publish(&self, payload: &BatchPayload, queue: &str) -> Result<(), PublishError> {
        let encoded = payload.encode().map_err(|error| PublishError::Encode {
            batch_id: payload.batch_id.clone(),
            error,
        })?;
        let labels = [("queue", queue.to_owned())];
        let mut attempt = 0;

        loop {
            let error = match self.channel.send(queue, &encoded).await {
                Ok(()) => {
                    if attempt > 0 {
                        info!(queue, batch_id = %payload.batch_id, retries = attempt, "publish succeeded after retries");
                    }
                    metrics::counter!("reprocess_publish_total", &labels).increment(1);
                    return Ok(());
                }
                Err(error) => error,
            };

            if attempt >= self.max_retries {
                error!(
                    queue,
                    batch_id = %payload.batch_id,
                    retries = self.max_retries,
                    %error,
                    "publish failed after max retries"
                );
                metrics::counter!("reprocess_publish_failed_total", &labels).increment(1);
                return Err(PublishError::Exhausted {
                    queue: queue.to_owned(),
                    retries: self.max_retries,
                    last: error,
                });
            }

            let sleep = self.retry_policy.jittered(attempt);
            warn!(
                queue,
                batch_id = %payload.batch_id,
                %error,
                attempt = attempt + 1,
                next_delay_ms = sleep.as_millis() as u64,
                "publish failed, retry scheduled"
            );
            metrics::counter!("reprocess_publish_retries_total", &labels).increment(1);
            tokio::time::sleep(sleep).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use std::time::Duration;

    fn payload() -> BatchPayload {
        BatchPayload::new("cafebabe", vec![1, 2], false, 1, 1)
    }

    async fn connected_channel() -> MemoryChannel {
        let channel = MemoryChannel::new();
        channel.connect().await.unwrap();
        channel
    }

    fn publisher(channel: &MemoryChannel) -> ReliablePublisher {
        ReliablePublisher::new(
            Arc::new(channel.clone()),
            DEFAULT_MAX_RETRIES,
            RetryPolicy::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_recovers_within_retries() {
        let channel = connected_channel().await.fail_next_sends(3);
        let payload = payload();

        publisher(&channel)
            .publish(&payload, "q")
            .await
            .expect("fourth attempt should succeed");

        let sent = channel.sent("q");
        assert_eq!(sent.len(), 1);
        assert_eq!(BatchPayload::decode(&sent[0]).unwrap(), payload);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_raises_after_exhaustion() {
        let channel = connected_channel().await.fail_next_sends(4);

        let err = publisher(&channel)
            .publish(&payload(), "q")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PublishError::Exhausted {
                retries: DEFAULT_MAX_RETRIES,
                last: ChannelError::Send { .. },
                ..
            }
        ));
        assert!(channel.sent("q").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_backoff_is_bounded_by_policy() {
        let channel = connected_channel().await.fail_next_sends(10);
        let policy = RetryPolicy::new(2.0, Duration::from_millis(500), Duration::from_secs(10));
        let publisher = ReliablePublisher::new(Arc::new(channel.clone()), 3, policy);

        let start = tokio::time::Instant::now();
        assert!(publisher.publish(&payload(), "q").await.is_err());

        // Full jitter never sleeps longer than 0.5 + 1 + 2 seconds over three retries.
        assert!(start.elapsed() <= Duration::from_millis(3500));
    }

    #[tokio::test]
    async fn test_publish_without_connection_fails() {
        let channel = MemoryChannel::new();
        let publisher = ReliablePublisher::new(
            Arc::new(channel.clone()),
            0,
            RetryPolicy::default(),
        );

        let err = publisher.publish(&payload(), "q").await.unwrap_err();
        assert!(matches!(
            err,
            PublishError::Exhausted {
                last: ChannelError::NotConnected,
                ..
            }
        ));
    }
}
