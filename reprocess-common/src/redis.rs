use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use thiserror::Error;
use tokio::time::timeout;

pub use redis::ErrorKind as RedisErrorKind;

use crate::payload::MatchId;

#[derive(Error, Debug, Clone)]
pub enum CustomRedisError {
    #[error("Timeout error")]
    Timeout,
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for CustomRedisError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CustomRedisError::Timeout
        } else {
            CustomRedisError::Redis(Arc::new(err))
        }
    }
}

impl CustomRedisError {
    /// Create a Redis error from an ErrorKind (primarily for testing)
    pub fn from_redis_kind(kind: redis::ErrorKind, description: &'static str) -> Self {
        CustomRedisError::Redis(Arc::new(redis::RedisError::from((kind, description))))
    }

    /// Whether retrying the same command could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CustomRedisError::Timeout => true,
            CustomRedisError::Redis(err) => !matches!(
                err.kind(),
                redis::ErrorKind::InvalidClientConfig
                    | redis::ErrorKind::AuthenticationFailed
                    | redis::ErrorKind::TypeError
                    | redis::ErrorKind::ResponseError
            ),
        }
    }
}

/// The set primitives the dedup store needs from a key/value store.
#[async_trait]
pub trait Client {
    async fn smismember(&self, key: &str, members: &[MatchId])
        -> Result<Vec<bool>, CustomRedisError>;

    /// SADD the members and refresh the key's TTL in a single pipeline.
    async fn sadd_with_expire(
        &self,
        key: &str,
        members: &[MatchId],
        ttl_seconds: u64,
    ) -> Result<(), CustomRedisError>;

    async fn srem(&self, key: &str, members: &[MatchId]) -> Result<u64, CustomRedisError>;

    async fn del(&self, key: &str) -> Result<bool, CustomRedisError>;

    async fn scard(&self, key: &str) -> Result<u64, CustomRedisError>;
}

/// A Redis client holding one multiplexed connection for the lifetime of the process.
pub struct RedisClient {
    connection: MultiplexedConnection,
    command_timeout: Duration,
}

impl RedisClient {
    pub async fn new(addr: &str, command_timeout: Duration) -> Result<RedisClient, CustomRedisError> {
        let client = redis::Client::open(addr)?;
        let connection = timeout(command_timeout, client.get_multiplexed_tokio_connection())
            .await
            .map_err(|_| CustomRedisError::Timeout)??;

        Ok(RedisClient {
            connection,
            command_timeout,
        })
    }

    async fn run<T: redis::FromRedisValue + Send>(
        &self,
        cmd: &redis::Cmd,
    ) -> Result<T, CustomRedisError> {
        let mut conn = self.connection.clone();
        let fut = cmd.query_async::<_, T>(&mut conn);

        Ok(timeout(self.command_timeout, fut)
            .await
            .map_err(|_| CustomRedisError::Timeout)??)
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn smismember(
        &self,
        key: &str,
        members: &[MatchId],
    ) -> Result<Vec<bool>, CustomRedisError> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("SMISMEMBER");
        cmd.arg(key).arg(members);

        self.run(&cmd).await
    }

    async fn sadd_with_expire(
        &self,
        key: &str,
        members: &[MatchId],
        ttl_seconds: u64,
    ) -> Result<(), CustomRedisError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SADD")
            .arg(key)
            .arg(members)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_seconds)
            .ignore();

        let mut conn = self.connection.clone();
        let fut = pipe.query_async::<_, ()>(&mut conn);

        timeout(self.command_timeout, fut)
            .await
            .map_err(|_| CustomRedisError::Timeout)??;
        Ok(())
    }

    async fn srem(&self, key: &str, members: &[MatchId]) -> Result<u64, CustomRedisError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("SREM");
        cmd.arg(key).arg(members);

        self.run(&cmd).await
    }

    async fn del(&self, key: &str) -> Result<bool, CustomRedisError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);

        let removed: u64 = self.run(&cmd).await?;
        Ok(removed > 0)
    }

    async fn scard(&self, key: &str) -> Result<u64, CustomRedisError> {
        let mut cmd = redis::cmd("SCARD");
        cmd.arg(key);

        self.run(&cmd).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MockRedisCall {
    Smismember { key: String, members: Vec<MatchId> },
    SaddWithExpire { key: String, members: Vec<MatchId>, ttl_seconds: u64 },
    Srem { key: String, members: Vec<MatchId> },
    Del { key: String },
    Scard { key: String },
}

#[derive(Default)]
struct MockState {
    sets: HashMap<String, HashSet<MatchId>>,
    ttls: HashMap<String, u64>,
    failures: Vec<CustomRedisError>,
    failures_at: HashMap<usize, CustomRedisError>,
    calls: Vec<MockRedisCall>,
}

/// In-memory stand-in for Redis sets, recording every call.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    state: Arc<Mutex<MockState>>,
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    // Helper method to safely lock the state mutex
    fn lock_state(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The next `times` calls fail with `error`, whatever command they are.
    pub fn fail_next(&self, times: usize, error: CustomRedisError) -> Self {
        let mut state = self.lock_state();
        state
            .failures
            .extend(std::iter::repeat(error).take(times));
        drop(state);
        self.clone()
    }

    /// The `call`-th call (counting from 1) fails with `error`.
    pub fn fail_call(&self, call: usize, error: CustomRedisError) -> Self {
        self.lock_state().failures_at.insert(call, error);
        self.clone()
    }

    pub fn with_members(&self, key: &str, members: &[MatchId]) -> Self {
        self.lock_state()
            .sets
            .entry(key.to_owned())
            .or_default()
            .extend(members.iter().copied());
        self.clone()
    }

    pub fn members(&self, key: &str) -> HashSet<MatchId> {
        self.lock_state().sets.get(key).cloned().unwrap_or_default()
    }

    pub fn ttl(&self, key: &str) -> Option<u64> {
        self.lock_state().ttls.get(key).copied()
    }

    pub fn get_calls(&self) -> Vec<MockRedisCall> {
        self.lock_state().calls.clone()
    }

    fn record(&self, call: MockRedisCall) -> Result<MutexGuard<'_, MockState>, CustomRedisError> {
        let mut state = self.lock_state();
        state.calls.push(call);
        let number = state.calls.len();
        if let Some(error) = state.failures_at.remove(&number) {
            return Err(error);
        }
        if state.failures.is_empty() {
            Ok(state)
        } else {
            Err(state.failures.remove(0))
        }
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn smismember(
        &self,
        key: &str,
        members: &[MatchId],
    ) -> Result<Vec<bool>, CustomRedisError> {
        let state = self.record(MockRedisCall::Smismember {
            key: key.to_owned(),
            members: members.to_vec(),
        })?;
        let set = state.sets.get(key);

        Ok(members
            .iter()
            .map(|m| set.is_some_and(|s| s.contains(m)))
            .collect())
    }

    async fn sadd_with_expire(
        &self,
        key: &str,
        members: &[MatchId],
        ttl_seconds: u64,
    ) -> Result<(), CustomRedisError> {
        let mut state = self.record(MockRedisCall::SaddWithExpire {
            key: key.to_owned(),
            members: members.to_vec(),
            ttl_seconds,
        })?;
        state
            .sets
            .entry(key.to_owned())
            .or_default()
            .extend(members.iter().copied());
        state.ttls.insert(key.to_owned(), ttl_seconds);

        Ok(())
    }

    async fn srem(&self, key: &str, members: &[MatchId]) -> Result<u64, CustomRedisError> {
        let mut state = self.record(MockRedisCall::Srem {
            key: key.to_owned(),
            members: members.to_vec(),
        })?;
        let removed = match state.sets.get_mut(key) {
            Some(set) => members.iter().filter(|m| set.remove(m)).count(),
            None => 0,
        };

        Ok(removed as u64)
    }

    async fn del(&self, key: &str) -> Result<bool, CustomRedisError> {
        let mut state = self.record(MockRedisCall::Del {
            key: key.to_owned(),
        })?;
        state.ttls.remove(key);

        Ok(state.sets.remove(key).is_some_and(|set| !set.is_empty()))
    }

    async fn scard(&self, key: &str) -> Result<u64, CustomRedisError> {
        let state = self.record(MockRedisCall::Scard {
            key: key.to_owned(),
        })?;

        Ok(state.sets.get(key).map_or(0, |set| set.len() as u64))
    }
}
