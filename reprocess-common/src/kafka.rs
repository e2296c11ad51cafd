use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Message};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, ChannelError, Delivery, Outcome, Subscription};
use crate::config::KafkaConfig;

pub struct KafkaContext;

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        metrics::gauge!("reprocess_kafka_callback_queue_depth").set(stats.replyq as f64);
        metrics::gauge!("reprocess_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        metrics::gauge!("reprocess_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        metrics::gauge!("reprocess_kafka_producer_queue_bytes").set(stats.msg_size as f64);
        metrics::gauge!("reprocess_kafka_producer_queue_bytes_limit")
            .set(stats.msg_size_max as f64);
    }
}

/// Kafka-backed channel: each queue name is a topic.
pub struct KafkaChannel {
    config: KafkaConfig,
    producer: Mutex<Option<FutureProducer<KafkaContext>>>,
}

impl KafkaChannel {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            producer: Mutex::new(None),
        }
    }

    fn base_client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.config.kafka_hosts)
            .set("statistics.interval.ms", "10000");

        if self.config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        client_config
    }

    fn create_producer(&self) -> Result<FutureProducer<KafkaContext>, ChannelError> {
        let mut client_config = self.base_client_config();
        client_config
            .set("linger.ms", self.config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                self.config.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "compression.codec",
                self.config.kafka_compression_codec.to_owned(),
            )
            .set(
                "queue.buffering.max.kbytes",
                (self.config.kafka_producer_queue_mib * 1024).to_string(),
            );

        debug!("rdkafka producer configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> = client_config
            .create_with_context(KafkaContext)
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        // "Ping" the Kafka brokers by requesting metadata
        match producer
            .client()
            .fetch_metadata(None, Duration::from_secs(15))
        {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(ChannelError::Connect(error.to_string()));
            }
        }

        Ok(producer)
    }

    async fn producer(&self) -> Result<FutureProducer<KafkaContext>, ChannelError> {
        self.producer
            .lock()
            .await
            .clone()
            .ok_or(ChannelError::NotConnected)
    }

    fn send_timeout(&self) -> Timeout {
        Timeout::After(Duration::from_millis(u64::from(
            self.config.kafka_message_timeout_ms,
        )))
    }
}

#[async_trait]
impl Channel for KafkaChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        let mut producer = self.producer.lock().await;
        if producer.is_none() {
            *producer = Some(self.create_producer()?);
        }

        Ok(())
    }

    async fn send(&self, queue: &str, payload: &[u8]) -> Result<(), ChannelError> {
        let producer = self.producer().await?;
        let record = FutureRecord::<(), [u8]>::to(queue).payload(payload);

        match producer.send(record, self.send_timeout()).await {
            Ok(_) => Ok(()),
            Err((error, _)) => Err(ChannelError::Send {
                queue: queue.to_owned(),
                error: error.to_string(),
            }),
        }
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription + Send>, ChannelError> {
        let producer = self.producer().await?;

        let mut client_config = self.base_client_config();
        client_config
            .set("group.id", &self.config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &self.config.kafka_consumer_offset_reset,
            )
            // Offsets are stored by hand once a batch is settled, and committed in the background.
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "true");

        let consumer: StreamConsumer = client_config
            .create()
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        consumer
            .subscribe(&[queue])
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        let retry_topic = self
            .config
            .kafka_retry_topic
            .as_ref()
            .map_or_else(|| queue.to_owned(), |topic| topic.as_str().to_owned());

        info!(queue, retry_topic = %retry_topic, "subscribed to kafka topic");

        Ok(Box::new(KafkaSubscription {
            consumer,
            producer,
            queue: queue.to_owned(),
            retry_topic,
            redelivery_backoff: self.config.kafka_redelivery_backoff.0,
            send_timeout: self.send_timeout(),
        }))
    }

    async fn close(&self) {
        let Some(producer) = self.producer.lock().await.take() else {
            return;
        };
        if let Err(error) = producer.flush(Duration::from_secs(10)) {
            warn!("failed to flush kafka producer on close: {}", error);
        }
        info!("kafka channel closed");
    }
}

struct KafkaSubscription {
    consumer: StreamConsumer,
    producer: FutureProducer<KafkaContext>,
    queue: String,
    retry_topic: String,
    redelivery_backoff: Duration,
    send_timeout: Timeout,
}

impl KafkaSubscription {
    // The stored offset is the next one to consume.
    fn store(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        self.consumer
            .store_offset(&delivery.queue, delivery.partition, delivery.offset + 1)
            .map_err(|e| ChannelError::Settle {
                queue: delivery.queue.clone(),
                error: e.to_string(),
            })
    }
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn recv(&mut self) -> Result<Delivery, ChannelError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| ChannelError::Recv {
                queue: self.queue.clone(),
                error: e.to_string(),
            })?;

        Ok(Delivery {
            queue: message.topic().to_owned(),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            partition: message.partition(),
            offset: message.offset(),
        })
    }

    async fn settle(&mut self, delivery: Delivery, outcome: Outcome) -> Result<(), ChannelError> {
        if outcome == Outcome::Nack {
            // Kafka has no per-message redelivery: put the batch back on the retry topic before
            // moving past it. Sleeping here also slows the loop down while the breaker is open.
            tokio::time::sleep(self.redelivery_backoff).await;

            let record = FutureRecord::<(), [u8]>::to(&self.retry_topic).payload(&delivery.payload);
            if let Err((error, _)) = self.producer.send(record, self.send_timeout).await {
                return Err(ChannelError::Settle {
                    queue: delivery.queue,
                    error: format!("failed to redeliver to {}: {}", self.retry_topic, error),
                });
            }
            metrics::counter!("reprocess_kafka_redeliveries_total").increment(1);
        }

        self.store(&delivery)
    }
}
