use std::{
    fmt::{Display, Formatter},
    time::Duration,
};

use anyhow::{Error, Result, anyhow};
use reqwest::{Client, Response, StatusCode, Url};

/// Failure of one HTTP exchange, split by whether another attempt can help.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpFailure {
    Transient(String),
    Permanent(String),
}

impl HttpFailure {
    pub fn is_transient(&self) -> bool {
        matches!(self, HttpFailure::Transient(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            HttpFailure::Transient(reason) | HttpFailure::Permanent(reason) => reason,
        }
    }

    /// 5xx, 408 and 429 are worth retrying. Every other non-success status is final.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let reason = if body.is_empty() {
            format!("status {}", status)
        } else {
            format!("status {}: {}", status, body)
        };

        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            HttpFailure::Transient(reason)
        } else {
            HttpFailure::Permanent(reason)
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_decode() {
            HttpFailure::Permanent(format!("invalid response body: {}", err))
        } else {
            HttpFailure::Transient(err.to_string())
        }
    }

    /// Reads the body of a non-success response and classifies it.
    pub async fn from_response(response: Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self::from_status(status, body.trim())
    }
}

impl Display for HttpFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason())
    }
}

impl std::error::Error for HttpFailure {}

pub fn build_client(timeout: Duration) -> Result<Client, Error> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))
}

/// Appends percent-encoded path segments to a base URL.
pub fn endpoint(base_url: &str, segments: &[&str]) -> Result<Url, Error> {
    let mut url =
        Url::parse(base_url).map_err(|e| anyhow!("Invalid base URL '{}': {}", base_url, e))?;

    url.path_segments_mut()
        .map_err(|_| anyhow!("Base URL '{}' cannot take a path", base_url))?
        .pop_if_empty()
        .extend(segments);

    Ok(url)
}
