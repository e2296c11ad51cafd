use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct RedisConfig {
    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    // Per-command timeout; SMISMEMBER over 1000 members stays well under this.
    #[envconfig(default = "1000")]
    pub redis_timeout: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct DedupConfig {
    #[envconfig(default = "259200")]
    pub dedup_ttl_seconds: u64,

    #[envconfig(default = "1000")]
    pub dedup_batch_size: usize,

    #[envconfig(default = "3")]
    pub dedup_max_attempts: u32,

    #[envconfig(default = "100")]
    pub dedup_retry_delay: EnvMsDuration,

    #[envconfig(default = "dispatched:match_ids")]
    pub dedup_dispatched_key: NonEmptyString,

    #[envconfig(default = "processed:match_ids")]
    pub dedup_processed_key: NonEmptyString,
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "reprocess-worker")]
    pub kafka_consumer_group: String,

    // We default to "earliest" so batches published before the first worker starts are not lost
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "1000")]
    pub kafka_redelivery_backoff: EnvMsDuration,

    // Nacked batches go here; defaults to the topic they were consumed from
    pub kafka_retry_topic: Option<NonEmptyString>,
}

#[derive(Envconfig, Clone)]
pub struct PublishRetryConfig {
    #[envconfig(default = "3")]
    pub publish_max_retries: u32,

    #[envconfig(default = "500")]
    pub publish_initial_delay: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub publish_max_delay: EnvMsDuration,

    #[envconfig(default = "2.0")]
    pub publish_backoff_factor: f64,
}

impl PublishRetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.publish_backoff_factor,
            self.publish_initial_delay.0,
            self.publish_max_delay.0,
        )
    }
}
