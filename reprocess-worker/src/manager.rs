use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::signal::unix::SignalKind;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use reprocess_common::channel::{Channel, ChannelError, Subscription};

use crate::config::Config;
use crate::consumer::BatchConsumer;
use crate::error::WorkerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerState {
    Created,
    Connected,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub queue: String,
    pub connect_max_attempts: u32,
    pub connect_retry_delay: Duration,
    pub graceful_shutdown_timeout: Duration,
    pub health_check_interval: Duration,
    /// Cancel on SIGINT/SIGTERM.
    pub trap_signals: bool,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue: config.queue_name.as_str().to_owned(),
            connect_max_attempts: config.connect_max_attempts,
            connect_retry_delay: config.connect_retry_delay.0,
            graceful_shutdown_timeout: config.graceful_shutdown_timeout.0,
            health_check_interval: config.health_check_interval.0,
            trap_signals: true,
        }
    }
}

/// Owns a worker's lifecycle: connect, consume until told to stop, then shut down within the
/// graceful timeout.
pub struct WorkerManager {
    channel: Arc<dyn Channel + Send + Sync>,
    consumer: Arc<BatchConsumer>,
    settings: ManagerSettings,
    state: Mutex<ManagerState>,
    shutdown: CancellationToken,
}

impl WorkerManager {
    pub fn new(
        channel: Arc<dyn Channel + Send + Sync>,
        consumer: BatchConsumer,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            channel,
            consumer: Arc::new(consumer),
            settings,
            state: Mutex::new(ManagerState::Created),
            shutdown: CancellationToken::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> ManagerState {
        *self.lock_state()
    }

    fn transition(&self, next: ManagerState) {
        let mut state = self.lock_state();
        info!(from = ?*state, to = ?next, "worker state changed");
        *state = next;
    }

    /// Cancelling this token stops the worker.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn consumer(&self) -> &Arc<BatchConsumer> {
        &self.consumer
    }

    /// Connect, consume until shutdown is requested or the channel closes, then stop.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let current = self.state();
        if current != ManagerState::Created {
            return Err(WorkerError::InvalidState(current));
        }

        if let Err(error) = self.connect_with_retry().await {
            self.transition(ManagerState::Stopped);
            return Err(error);
        }
        self.transition(ManagerState::Connected);

        let signals = self.settings.trap_signals.then(|| {
            let token = self.shutdown.clone();
            tokio::spawn(async move {
                wait_for_shutdown_signal().await;
                token.cancel();
            })
        });

        let health_token = self.shutdown.child_token();
        let health = tokio::spawn(health_loop(
            self.consumer.clone(),
            self.settings.health_check_interval,
            health_token.clone(),
        ));

        let subscription = match self.channel.subscribe(&self.settings.queue).await {
            Ok(subscription) => subscription,
            Err(error) => {
                self.stop(None, health, health_token, signals).await;
                return Err(WorkerError::Channel(error));
            }
        };

        self.transition(ManagerState::Running);
        info!(queue = %self.settings.queue, "worker consuming");

        let mut receive = tokio::spawn(receive_loop(
            subscription,
            self.consumer.clone(),
            self.shutdown.clone(),
        ));

        tokio::select! {
            result = &mut receive => {
                if let Err(error) = result {
                    error!(%error, "receive loop did not complete");
                }
                self.stop(None, health, health_token, signals).await;
            }
            _ = self.shutdown.cancelled() => {
                info!("shutdown requested");
                self.stop(Some(receive), health, health_token, signals).await;
            }
        }

        Ok(())
    }

    async fn connect_with_retry(&self) -> Result<(), WorkerError> {
        let attempts = self.settings.connect_max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.channel.connect().await {
                Ok(()) => {
                    info!(attempt, "connected to channel");
                    return Ok(());
                }
                Err(error) if attempt < attempts => {
                    let delay = self.settings.connect_retry_delay * attempt;
                    warn!(attempt, %error, retry_in_ms = delay.as_millis() as u64, "failed to connect to channel");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => {
                            return Err(WorkerError::Connect { attempts: attempt, last: error });
                        }
                    }
                    attempt += 1;
                }
                Err(error) => {
                    error!(attempts = attempt, %error, "giving up connecting to channel");
                    return Err(WorkerError::Connect {
                        attempts: attempt,
                        last: error,
                    });
                }
            }
        }
    }

    async fn stop(
        &self,
        receive: Option<JoinHandle<()>>,
        health: JoinHandle<()>,
        health_token: CancellationToken,
        signals: Option<JoinHandle<()>>,
    ) {
        self.transition(ManagerState::Stopping);
        self.shutdown.cancel();

        if let Some(mut receive) = receive {
            let timeout = self.settings.graceful_shutdown_timeout;
            match tokio::time::timeout(timeout, &mut receive).await {
                Ok(Ok(())) => info!("receive loop drained"),
                Ok(Err(error)) => error!(%error, "receive loop did not complete"),
                Err(_elapsed) => {
                    warn!(
                        timeout_s = timeout.as_secs_f64(),
                        "graceful shutdown timed out, aborting in-flight batch"
                    );
                    receive.abort();
                }
            }
        }

        health_token.cancel();
        if let Err(error) = health.await {
            warn!(%error, "health loop did not complete");
        }
        if let Some(signals) = signals {
            signals.abort();
        }

        self.channel.close().await;
        self.transition(ManagerState::Stopped);
        info!(metrics = ?self.consumer.metrics().snapshot(), "worker stopped");
    }
}

async fn receive_loop(
    mut subscription: Box<dyn Subscription + Send>,
    consumer: Arc<BatchConsumer>,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => return,
            received = subscription.recv() => received,
        };

        let delivery = match received {
            Ok(delivery) => delivery,
            Err(ChannelError::Closed) => {
                info!("channel closed, receive loop exiting");
                return;
            }
            Err(error) => {
                warn!(%error, "failed to receive from channel");
                metrics::counter!("reprocess_worker_receive_errors_total").increment(1);
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                }
            }
        };

        // A batch that started is finished, or aborted once the graceful timeout runs out.
        let outcome = consumer.handle(&delivery).await;
        if let Err(error) = subscription.settle(delivery, outcome).await {
            error!(%error, ?outcome, "failed to settle delivery");
        }
    }
}

async fn health_loop(consumer: Arc<BatchConsumer>, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {
                let snapshot = consumer.metrics().snapshot();
                let breaker = consumer.breaker().state();
                info!(
                    batches_processed = snapshot.batches_processed,
                    batches_failed = snapshot.batches_failed,
                    items_processed = snapshot.items_processed,
                    items_failed = snapshot.items_failed,
                    success_rate_pct = snapshot.success_rate_pct,
                    avg_processing_time_s = snapshot.avg_processing_time_s,
                    uptime_s = snapshot.uptime_s,
                    breaker = ?breaker.state,
                    consecutive_failures = breaker.consecutive_failures,
                    "worker health"
                );
            }
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match tokio::signal::unix::signal(SignalKind::terminate()) {
        Ok(sigterm) => Some(sigterm),
        Err(error) => {
            error!(%error, "failed to install SIGTERM handler");
            None
        }
    };
    let terminate = async {
        match sigterm.as_mut() {
            Some(sigterm) => sigterm.recv().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
