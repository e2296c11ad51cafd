use std::time::Duration;

use thiserror::Error;

use reprocess_common::channel::ChannelError;
use reprocess_common::dedup::DedupError;

use crate::breaker::CircuitOpen;
use crate::manager::ManagerState;
use crate::processor::ProcessError;

/// Why a single attempt at a chunk failed.
#[derive(Error, Debug)]
pub enum AttemptError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("chunk timed out after {0:?}")]
    Timeout(Duration),
}

impl AttemptError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Process(error) => error.is_retryable(),
            AttemptError::Timeout(_) => true,
        }
    }
}

/// Enumeration of errors for a chunk of a batch.
#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("chunk rejected: {0}")]
    Rejected(#[source] AttemptError),
    #[error("chunk failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: AttemptError,
    },
    #[error("processed dedup store unavailable: {0}")]
    Dedup(#[from] DedupError),
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),
    #[error("chunk task did not complete: {0}")]
    Task(String),
}

/// Enumeration of errors for a whole delivered batch. Either one nacks the delivery.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("batch not attempted: {0}")]
    CircuitOpen(#[from] CircuitOpen),
    #[error("{failed} of {total} chunks failed")]
    PartialFailure { failed: usize, total: usize },
}

/// Enumeration of errors related to running the worker itself.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to connect after {attempts} attempts: {last}")]
    Connect {
        attempts: u32,
        #[source]
        last: ChannelError,
    },
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("worker cannot start from state {0:?}")]
    InvalidState(ManagerState),
}
