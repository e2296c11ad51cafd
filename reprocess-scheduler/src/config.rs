use envconfig::Envconfig;

use reprocess_common::config::{
    DedupConfig, EnvMsDuration, KafkaConfig, NonEmptyString, PublishRetryConfig, RedisConfig,
};
use reprocess_common::queues;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "SCHEDULER_MODE", default = "schedule")]
    pub mode: String,

    #[envconfig(default = "false")]
    pub force: bool,

    #[envconfig(default = "process_match_batch")]
    pub queue_name: NonEmptyString,

    #[envconfig(default = "100")]
    pub batch_size: usize,

    #[envconfig(default = "10")]
    pub max_publish_concurrency: usize,

    #[envconfig(default = "5")]
    pub batch_priority: i32,

    // Passed on to workers as the per-batch chunk concurrency
    #[envconfig(default = "10")]
    pub worker_concurrency: usize,

    #[envconfig(default = "3")]
    pub connect_max_attempts: u32,

    #[envconfig(default = "1000")]
    pub connect_retry_delay: EnvMsDuration,

    #[envconfig(nested = true)]
    pub publish_retry: PublishRetryConfig,

    #[envconfig(nested = true)]
    pub redis: RedisConfig,

    #[envconfig(nested = true)]
    pub dedup: DedupConfig,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("BATCH_SIZE must be positive".to_owned());
        }
        if self.max_publish_concurrency == 0 {
            return Err("MAX_PUBLISH_CONCURRENCY must be positive".to_owned());
        }
        if !queues::is_known(self.queue_name.as_str()) {
            return Err(format!("unknown queue name: {}", self.queue_name.as_str()));
        }
        Ok(())
    }
}
