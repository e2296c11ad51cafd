//! Consume scheduled match batches and run them through the reprocessing action.
use std::sync::Arc;

use axum::{routing::get, Json, Router};
use envconfig::Envconfig;
use eyre::{eyre, Result};
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use reprocess_common::dedup::DedupStore;
use reprocess_common::kafka::KafkaChannel;
use reprocess_common::metrics::{serve, setup_metrics_routes};
use reprocess_common::redis::RedisClient;
use reprocess_worker::breaker::CircuitBreaker;
use reprocess_worker::chunk::ChunkProcessor;
use reprocess_worker::config::Config;
use reprocess_worker::consumer::BatchConsumer;
use reprocess_worker::manager::{ManagerSettings, WorkerManager};
use reprocess_worker::processor::HttpMatchProcessor;
use reprocess_worker::stats::WorkerMetrics;

fn app(manager: Arc<WorkerManager>) -> Router {
    Router::new()
        .route("/", get(|| async { "reprocess worker" }))
        .route(
            "/_liveness",
            get(move || {
                let manager = manager.clone();
                async move {
                    let breaker = manager.consumer().breaker().state();
                    Json(json!({
                        "state": manager.state(),
                        "circuit_breaker": {
                            "state": breaker.state,
                            "consecutive_failures": breaker.consecutive_failures,
                        },
                        "metrics": manager.consumer().metrics().snapshot(),
                    }))
                }
            }),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env()?;
    config.validate().map_err(|e| eyre!(e))?;

    let redis = RedisClient::new(&config.redis.redis_url, config.redis.redis_timeout.0).await?;
    let processed = DedupStore::from_config(
        Arc::new(redis),
        config.dedup.dedup_processed_key.as_str(),
        &config.dedup,
    );
    let processor = HttpMatchProcessor::new(&config.processor_url, config.processor_request_timeout.0)?;

    let chunks = ChunkProcessor::from_config(Arc::new(processor), processed, &config);
    let breaker = CircuitBreaker::new(
        config.queue_name.as_str(),
        config.circuit_breaker_threshold,
        config.circuit_breaker_recovery.0,
    );
    let consumer = BatchConsumer::new(chunks, breaker, Arc::new(WorkerMetrics::new()))
        .chunk_size(config.batch_size);

    let channel = Arc::new(KafkaChannel::new(config.kafka.clone()));
    let manager = Arc::new(WorkerManager::new(
        channel,
        consumer,
        ManagerSettings::from_config(&config),
    ));

    let router = setup_metrics_routes(app(manager.clone()))?;
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve metrics: {}", e);
        }
    });

    info!(queue = config.queue_name.as_str(), "starting reprocess worker");
    manager.run().await?;

    Ok(())
}
