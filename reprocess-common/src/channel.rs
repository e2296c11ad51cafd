use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("channel has been closed")]
    Closed,
    #[error("failed to connect to channel: {0}")]
    Connect(String),
    #[error("failed to send to {queue}: {error}")]
    Send { queue: String, error: String },
    #[error("failed to receive from {queue}: {error}")]
    Recv { queue: String, error: String },
    #[error("failed to settle delivery from {queue}: {error}")]
    Settle { queue: String, error: String },
}

/// How a consumer finished with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Processed, or dropped as malformed: never deliver again.
    Ack,
    /// Failed: the channel should deliver it again under its own policy.
    Nack,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub payload: Vec<u8>,
    pub partition: i32,
    pub offset: i64,
}

/// A pub/sub transport carrying encoded batch payloads.
#[async_trait]
pub trait Channel {
    /// Idempotent; concurrent callers connect once.
    async fn connect(&self) -> Result<(), ChannelError>;

    async fn send(&self, queue: &str, payload: &[u8]) -> Result<(), ChannelError>;

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription + Send>, ChannelError>;

    async fn close(&self);
}

#[async_trait]
pub trait Subscription {
    /// Wait for the next delivery. Cancel safe.
    async fn recv(&mut self) -> Result<Delivery, ChannelError>;

    async fn settle(&mut self, delivery: Delivery, outcome: Outcome) -> Result<(), ChannelError>;
}

#[derive(Default)]
struct MemoryState {
    connected: bool,
    closed: bool,
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    sent: Vec<(String, Vec<u8>)>,
    failing_sends: usize,
    failing_connects: usize,
    acked: usize,
    nacked: usize,
    next_offset: i64,
}

#[derive(Default)]
struct MemoryInner {
    state: Mutex<MemoryState>,
    notify: Notify,
}

/// An in-process channel, for tests and local runs without Kafka.
///
/// Nacked deliveries go back to the end of their queue.
#[derive(Clone, Default)]
pub struct MemoryChannel {
    inner: Arc<MemoryInner>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The next `times` sends fail with a `ChannelError::Send`.
    pub fn fail_next_sends(&self, times: usize) -> Self {
        self.lock_state().failing_sends += times;
        self.clone()
    }

    /// The next `times` connects fail with a `ChannelError::Connect`.
    pub fn fail_next_connects(&self, times: usize) -> Self {
        self.lock_state().failing_connects += times;
        self.clone()
    }

    /// Every payload that was sent successfully, in send order.
    pub fn sent(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock_state()
            .sent
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn pending(&self, queue: &str) -> usize {
        self.lock_state().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn acked(&self) -> usize {
        self.lock_state().acked
    }

    pub fn nacked(&self) -> usize {
        self.lock_state().nacked
    }

    pub fn is_connected(&self) -> bool {
        self.lock_state().connected
    }

    /// Put a raw payload on a queue without going through `send`.
    pub fn inject(&self, queue: &str, payload: Vec<u8>) {
        self.lock_state()
            .queues
            .entry(queue.to_owned())
            .or_default()
            .push_back(payload);
        self.inner.notify.notify_waiters();
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(ChannelError::Connect("injected failure".to_owned()));
        }
        state.connected = true;
        Ok(())
    }

    async fn send(&self, queue: &str, payload: &[u8]) -> Result<(), ChannelError> {
        {
            let mut state = self.lock_state();
            if !state.connected {
                return Err(ChannelError::NotConnected);
            }
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                return Err(ChannelError::Send {
                    queue: queue.to_owned(),
                    error: "injected failure".to_owned(),
                });
            }
            state.sent.push((queue.to_owned(), payload.to_vec()));
            state
                .queues
                .entry(queue.to_owned())
                .or_default()
                .push_back(payload.to_vec());
        }
        self.inner.notify.notify_waiters();

        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription + Send>, ChannelError> {
        if !self.lock_state().connected {
            return Err(ChannelError::NotConnected);
        }

        Ok(Box::new(MemorySubscription {
            channel: self.clone(),
            queue: queue.to_owned(),
        }))
    }

    async fn close(&self) {
        {
            let mut state = self.lock_state();
            state.connected = false;
            state.closed = true;
        }
        self.inner.notify.notify_waiters();
    }
}

struct MemorySubscription {
    channel: MemoryChannel,
    queue: String,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> Result<Delivery, ChannelError> {
        loop {
            // Registered before checking, so a send between the check and the await still wakes us.
            let notified = self.channel.inner.notify.notified();
            {
                let mut state = self.channel.lock_state();
                if state.closed {
                    return Err(ChannelError::Closed);
                }
                let next = state
                    .queues
                    .get_mut(&self.queue)
                    .and_then(VecDeque::pop_front);
                if let Some(payload) = next {
                    state.next_offset += 1;
                    return Ok(Delivery {
                        queue: self.queue.clone(),
                        payload,
                        partition: 0,
                        offset: state.next_offset,
                    });
                }
            }
            notified.await;
        }
    }

    async fn settle(&mut self, delivery: Delivery, outcome: Outcome) -> Result<(), ChannelError> {
        match outcome {
            Outcome::Ack => self.channel.lock_state().acked += 1,
            Outcome::Nack => {
                self.channel.lock_state().nacked += 1;
                self.channel.inject(&delivery.queue, delivery.payload);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_requires_connect() {
        let channel = MemoryChannel::new();
        assert!(matches!(
            channel.send("q", b"x").await,
            Err(ChannelError::NotConnected)
        ));

        channel.connect().await.unwrap();
        channel.send("q", b"x").await.unwrap();
        assert_eq!(channel.sent("q"), vec![b"x".to_vec()]);
    }

    #[tokio::test]
    async fn test_recv_waits_for_send() {
        let channel = MemoryChannel::new();
        channel.connect().await.unwrap();
        let mut subscription = channel.subscribe("q").await.unwrap();

        let sender = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sender.send("q", b"late").await.unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .expect("timed out waiting for delivery")
            .unwrap();
        assert_eq!(delivery.payload, b"late".to_vec());
    }

    #[tokio::test]
    async fn test_nack_redelivers() {
        let channel = MemoryChannel::new();
        channel.connect().await.unwrap();
        let mut subscription = channel.subscribe("q").await.unwrap();
        channel.send("q", b"again").await.unwrap();

        let first = subscription.recv().await.unwrap();
        subscription.settle(first, Outcome::Nack).await.unwrap();
        assert_eq!(channel.pending("q"), 1);

        let second = subscription.recv().await.unwrap();
        assert_eq!(second.payload, b"again".to_vec());
        subscription.settle(second, Outcome::Ack).await.unwrap();

        assert_eq!(channel.nacked(), 1);
        assert_eq!(channel.acked(), 1);
        assert_eq!(channel.pending("q"), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_subscribers() {
        let channel = MemoryChannel::new();
        channel.connect().await.unwrap();
        let mut subscription = channel.subscribe("q").await.unwrap();

        let closer = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close().await;
        });

        assert!(matches!(
            subscription.recv().await,
            Err(ChannelError::Closed)
        ));
    }
}
