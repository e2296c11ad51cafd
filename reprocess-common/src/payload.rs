use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Opaque identifier of a unit of reprocessing work.
pub type MatchId = u64;

pub const DEFAULT_PRIORITY: i32 = 5;
pub const DEFAULT_CONCURRENCY_HINT: usize = 10;

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_concurrency_hint() -> usize {
    DEFAULT_CONCURRENCY_HINT
}

/// A slice of match ids dispatched as a single channel message.
///
/// Payloads written by older producers used `match_ids`, `force_update` and `concurrency`;
/// those names are still accepted when decoding.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BatchPayload {
    #[serde(alias = "match_ids")]
    pub ids: Vec<MatchId>,
    #[serde(default, alias = "force_update")]
    pub force: bool,
    /// `{operation_id}-{batch_number}`.
    pub batch_id: String,
    pub batch_number: u32,
    pub total_batches: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_concurrency_hint", alias = "concurrency")]
    pub concurrency_hint: usize,
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("received empty payload")]
    Empty,
    #[error("batch_number {batch_number} is outside 1..={total_batches}")]
    BatchNumberOutOfRange {
        batch_number: u32,
        total_batches: u32,
    },
}

/// Every shape a batch has been observed to arrive in on the wire.
#[derive(Deserialize)]
#[serde(untagged)]
enum WirePayload {
    Object(BatchPayload),
    // Some producers serialized the json document a second time.
    Encoded(String),
}

impl BatchPayload {
    pub fn new(
        operation_id: &str,
        ids: Vec<MatchId>,
        force: bool,
        batch_number: u32,
        total_batches: u32,
    ) -> Self {
        Self {
            ids,
            force,
            batch_id: format!("{operation_id}-{batch_number}"),
            batch_number,
            total_batches,
            created_at: Utc::now(),
            priority: DEFAULT_PRIORITY,
            concurrency_hint: DEFAULT_CONCURRENCY_HINT,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_concurrency_hint(mut self, concurrency_hint: usize) -> Self {
        self.concurrency_hint = concurrency_hint;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Normalize a raw channel message into a validated payload.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        if raw.is_empty() {
            return Err(DecodeError::Empty);
        }

        let payload = match serde_json::from_slice::<WirePayload>(raw)? {
            WirePayload::Object(payload) => payload,
            WirePayload::Encoded(inner) => serde_json::from_str::<BatchPayload>(&inner)?,
        };
        payload.normalize()
    }

    /// Repeated ids collapse into their first occurrence.
    fn normalize(mut self) -> Result<Self, DecodeError> {
        if self.batch_number < 1 || self.total_batches < 1 || self.batch_number > self.total_batches
        {
            return Err(DecodeError::BatchNumberOutOfRange {
                batch_number: self.batch_number,
                total_batches: self.total_batches,
            });
        }

        let received = self.ids.len();
        let mut seen = HashSet::with_capacity(received);
        self.ids.retain(|id| seen.insert(*id));
        if self.ids.len() < received {
            warn!(
                batch_id = %self.batch_id,
                duplicates = received - self.ids.len(),
                "collapsed repeated match ids in batch"
            );
        }

        Ok(self)
    }
}

/// Telemetry returned by one scheduling call.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct PublishResult {
    pub queue: String,
    pub initial_ids: usize,
    pub already_processed: usize,
    pub ids_to_publish: usize,
    pub ids_published: usize,
    pub batches_created: usize,
    pub batches_failed: usize,
    pub duration_s: f64,
}

impl PublishResult {
    pub fn empty(queue: &str, initial_ids: usize, already_processed: usize) -> Self {
        Self {
            queue: queue.to_owned(),
            initial_ids,
            already_processed,
            ..Default::default()
        }
    }
}
