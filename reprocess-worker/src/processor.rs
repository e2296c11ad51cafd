use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::Serialize;
use thiserror::Error;

use reprocess_common::payload::MatchId;

#[derive(Error, Debug)]
pub enum ProcessError {
    /// The ids were rejected and will never process successfully.
    #[error("match ids were rejected: {0}")]
    Validation(String),
    #[error("match processing failed: {0}")]
    Transient(String),
}

impl ProcessError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessError::Transient(_))
    }
}

/// The domain action run for every chunk of match ids.
#[async_trait]
pub trait MatchProcessor {
    async fn process(&self, ids: &[MatchId], force: bool) -> Result<(), ProcessError>;
}

#[derive(Serialize)]
struct ProcessRequest<'a> {
    match_ids: &'a [MatchId],
    force: bool,
}

/// Hands chunks to the reprocessing service over HTTP.
pub struct HttpMatchProcessor {
    client: reqwest::Client,
    url: String,
}

impl HttpMatchProcessor {
    pub fn new(url: &str, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Reprocess Worker")
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            url: url.to_owned(),
        })
    }
}

#[async_trait]
impl MatchProcessor for HttpMatchProcessor {
    async fn process(&self, ids: &[MatchId], force: bool) -> Result<(), ProcessError> {
        let response = self
            .client
            .post(&self.url)
            .json(&ProcessRequest {
                match_ids: ids,
                force,
            })
            .send()
            .await
            .map_err(|e| ProcessError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("{status}: {body}");
        if is_retryable_status(status) {
            Err(ProcessError::Transient(message))
        } else {
            Err(ProcessError::Validation(message))
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_status() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::UNPROCESSABLE_ENTITY));
    }

    #[test]
    fn test_request_body() {
        let body = serde_json::to_value(ProcessRequest {
            match_ids: &[7, 8],
            force: true,
        })
        .unwrap();

        assert_eq!(body, serde_json::json!({"match_ids": [7, 8], "force": true}));
    }
}
