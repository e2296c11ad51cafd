use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use reprocess_common::channel::{Channel, ChannelError};

#[derive(Error, Debug)]
#[error("failed to connect after {attempts} attempts: {last}")]
pub struct ConnectError {
    pub attempts: u32,
    #[source]
    pub last: ChannelError,
}

/// Connect, waiting `retry_delay * attempt` between failed attempts.
pub async fn connect_with_retry(
    channel: &(dyn Channel + Send + Sync),
    max_attempts: u32,
    retry_delay: Duration,
) -> Result<(), ConnectError> {
    let attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match channel.connect().await {
            Ok(()) => {
                info!(attempt, "connected to channel");
                return Ok(());
            }
            Err(error) if attempt < attempts => {
                let delay = retry_delay * attempt;
                warn!(attempt, %error, retry_in_ms = delay.as_millis() as u64, "failed to connect to channel");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                error!(attempts = attempt, %error, "giving up connecting to channel");
                return Err(ConnectError {
                    attempts: attempt,
                    last: error,
                });
            }
        }
    }
}
