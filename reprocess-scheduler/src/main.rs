use std::sync::Arc;

use envconfig::Envconfig;
use eyre::{eyre, Result};
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use reprocess_common::channel::Channel;
use reprocess_common::dedup::DedupStore;
use reprocess_common::kafka::KafkaChannel;
use reprocess_common::publisher::ReliablePublisher;
use reprocess_common::redis::RedisClient;
use reprocess_scheduler::batcher::Batcher;
use reprocess_scheduler::config::Config;
use reprocess_scheduler::connect::connect_with_retry;
use reprocess_scheduler::mode::{parse_match_ids, SchedulerMode};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env()?;
    config.validate().map_err(|e| eyre!(e))?;
    let mode: SchedulerMode = config.mode.parse()?;

    let redis = RedisClient::new(&config.redis.redis_url, config.redis.redis_timeout.0).await?;
    let dispatched = DedupStore::from_config(
        Arc::new(redis),
        config.dedup.dedup_dispatched_key.as_str(),
        &config.dedup,
    );

    match mode {
        SchedulerMode::Count => {
            let count = dispatched.count().await?;
            info!(key = dispatched.key(), count, "dispatch dedup set size");
            println!("{count}");
        }
        SchedulerMode::Clear => {
            let removed = dispatched.clear().await?;
            info!(key = dispatched.key(), removed, "cleared dispatch dedup set");
        }
        SchedulerMode::Schedule => {
            let mut input = String::new();
            tokio::io::stdin().read_to_string(&mut input).await?;
            let ids = parse_match_ids(&input)?;

            let channel = Arc::new(KafkaChannel::new(config.kafka.clone()));
            connect_with_retry(
                channel.as_ref(),
                config.connect_max_attempts,
                config.connect_retry_delay.0,
            )
            .await?;

            let publisher = ReliablePublisher::from_config(channel.clone(), &config.publish_retry);
            let batcher = Batcher::from_config(publisher, dispatched, &config);
            let result = batcher.schedule(&ids, config.force).await;
            channel.close().await;

            println!("{}", serde_json::to_string(&result?)?);
        }
    }

    Ok(())
}
