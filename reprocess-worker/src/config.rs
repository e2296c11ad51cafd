use envconfig::Envconfig;

use reprocess_common::config::{DedupConfig, EnvMsDuration, KafkaConfig, NonEmptyString, RedisConfig};
use reprocess_common::queues;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "process_match_batch")]
    pub queue_name: NonEmptyString,

    #[envconfig(default = "http://localhost:8000/internal/matches/reprocess")]
    pub processor_url: String,

    #[envconfig(default = "30000")]
    pub processor_request_timeout: EnvMsDuration,

    // Chunk size within a batch, the same constant the scheduler slices batches with
    #[envconfig(default = "100")]
    pub batch_size: usize,

    #[envconfig(default = "120000")]
    pub chunk_timeout: EnvMsDuration,

    #[envconfig(default = "3")]
    pub chunk_max_attempts: u32,

    #[envconfig(default = "1000")]
    pub chunk_retry_base_delay: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub chunk_retry_max_delay: EnvMsDuration,

    #[envconfig(default = "5")]
    pub circuit_breaker_threshold: u32,

    #[envconfig(default = "60000")]
    pub circuit_breaker_recovery: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub graceful_shutdown_timeout: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub health_check_interval: EnvMsDuration,

    #[envconfig(default = "3")]
    pub connect_max_attempts: u32,

    #[envconfig(default = "1000")]
    pub connect_retry_delay: EnvMsDuration,

    #[envconfig(nested = true)]
    pub redis: RedisConfig,

    #[envconfig(nested = true)]
    pub dedup: DedupConfig,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("BATCH_SIZE must be positive".to_owned());
        }
        if self.chunk_max_attempts == 0 {
            return Err("CHUNK_MAX_ATTEMPTS must be positive".to_owned());
        }
        if self.circuit_breaker_threshold == 0 {
            return Err("CIRCUIT_BREAKER_THRESHOLD must be positive".to_owned());
        }
        if !queues::is_known(self.queue_name.as_str()) {
            return Err(format!("unknown queue name: {}", self.queue_name.as_str()));
        }
        Ok(())
    }
}
