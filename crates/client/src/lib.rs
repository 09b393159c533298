//! HTTP client for the generation service.
//!
//! Submits an image, then polls `GET /status/{id}` on a fixed interval
//! until the request reaches a terminal state or the attempt budget runs
//! out. The server never times a request out on the consumer's behalf, so
//! that bound lives here in [`PollPolicy`].

use std::time::Duration;

use base64::Engine;
use meshgen_core::job::JobState;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// URL prefix under which the service publishes generated models.
const STATIC_PREFIX: &str = "/static/";

/// How often and how long [`GenerationClient::generate`] polls.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    /// Deadline for `POST /generate`, which carries the whole image.
    pub submit_timeout: Duration,
    /// Deadline for a single `GET /status` call. A poll that runs out
    /// counts as a failed attempt and polling continues.
    pub status_timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 60,
            submit_timeout: Duration::from_secs(30),
            status_timeout: Duration::from_secs(10),
        }
    }
}

/// Status payload returned by both service endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStatus {
    pub status: JobState,
    pub message: String,
    #[serde(default)]
    pub model_url: Option<String>,
    pub request_id: String,
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    id: &'a str,
    image: &'a str,
}

/// Errors from the generation client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The request could not be sent, timed out, or the body could not
    /// be decoded.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service answered with a non-2xx status code.
    #[error("Service error ({status}): {body}")]
    Http { status: u16, body: String },

    /// The service reported the request as failed.
    #[error("Generation failed: {0}")]
    Failed(String),

    /// No terminal state was observed within the poll budget.
    #[error("Request {request_id} did not finish after {attempts} polls")]
    Timeout { request_id: String, attempts: u32 },
}

impl ClientError {
    /// Whether polling should keep going after this error.
    fn is_transient(&self) -> bool {
        match self {
            ClientError::Request(_) => true,
            ClientError::Http { status, .. } => {
                *status >= 500
                    || *status == StatusCode::REQUEST_TIMEOUT.as_u16()
                    || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            ClientError::Failed(_) | ClientError::Timeout { .. } => false,
        }
    }
}

/// Client for one generation service instance.
pub struct GenerationClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    poll: PollPolicy,
    public_prefix: Option<String>,
}

impl GenerationClient {
    /// * `base_url` - Service root, e.g. `http://localhost:8001`.
    /// * `token` - Bearer token from the service's allow-set.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            poll: PollPolicy::default(),
            public_prefix: None,
        }
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Rewrite the leading `/static/` of returned model URLs to `prefix`,
    /// for consumers that mount the output directory elsewhere.
    pub fn with_public_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.public_prefix = Some(prefix.into());
        self
    }

    /// Submit a request. The service acknowledges before any work starts.
    pub async fn submit(
        &self,
        id: &str,
        image_base64: &str,
    ) -> Result<GenerationStatus, ClientError> {
        let response = self
            .client
            .post(format!("{}/generate", self.base_url))
            .bearer_auth(&self.token)
            .timeout(self.poll.submit_timeout)
            .json(&GenerateBody {
                id,
                image: image_base64,
            })
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Fetch the current status of a request.
    pub async fn status(&self, id: &str) -> Result<GenerationStatus, ClientError> {
        let response = self
            .client
            .get(format!("{}/status/{}", self.base_url, id))
            .bearer_auth(&self.token)
            .timeout(self.poll.status_timeout)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Generate a model from raw image bytes and wait for it.
    ///
    /// Returns the model URL, rewritten to the public prefix if one is set.
    pub async fn generate(&self, image: &[u8]) -> Result<String, ClientError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);

        self.submit(&request_id, &encoded).await?;
        tracing::info!(request_id = %request_id, "Generation request submitted");

        for attempt in 1..=self.poll.max_attempts {
            tokio::time::sleep(self.poll.interval).await;

            let status = match self.status(&request_id).await {
                Ok(status) => status,
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        request_id = %request_id,
                        attempt,
                        error = %e,
                        "Status poll failed, retrying",
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            match status.status {
                JobState::Completed => {
                    let url = status.model_url.ok_or_else(|| {
                        ClientError::Failed("Completed without a model URL".into())
                    })?;
                    return Ok(self.public_url(&url));
                }
                JobState::Error => return Err(ClientError::Failed(status.message)),
                JobState::Queued | JobState::Processing => {
                    tracing::debug!(
                        request_id = %request_id,
                        attempt,
                        state = %status.status.as_str(),
                        "Still waiting",
                    );
                }
            }
        }

        Err(ClientError::Timeout {
            request_id,
            attempts: self.poll.max_attempts,
        })
    }

    fn public_url(&self, url: &str) -> String {
        match (&self.public_prefix, url.strip_prefix(STATIC_PREFIX)) {
            (Some(prefix), Some(rest)) => {
                format!("{}/{}", prefix.trim_end_matches('/'), rest)
            }
            _ => url.to_string(),
        }
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ClientError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_prefix_rewrites_static_urls_only() {
        let client = GenerationClient::new("http://x/", "t").with_public_prefix("/output/");
        assert_eq!(client.public_url("/static/3D/a.glb"), "/output/3D/a.glb");
        assert_eq!(client.public_url("/elsewhere/a.glb"), "/elsewhere/a.glb");

        let plain = GenerationClient::new("http://x", "t");
        assert_eq!(plain.public_url("/static/3D/a.glb"), "/static/3D/a.glb");
    }

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        let http = |status| ClientError::Http {
            status,
            body: String::new(),
        };
        assert!(http(503).is_transient());
        assert!(http(429).is_transient());
        assert!(!http(401).is_transient());
        assert!(!http(404).is_transient());
        assert!(!ClientError::Failed("x".into()).is_transient());
    }

    #[test]
    fn default_policy_bounds_every_request() {
        let poll = PollPolicy::default();
        assert_eq!(poll.submit_timeout, Duration::from_secs(30));
        assert_eq!(poll.status_timeout, Duration::from_secs(10));
    }

    #[test]
    fn base_url_trailing_slash_is_dropped() {
        assert_eq!(GenerationClient::new("http://x:1/", "t").base_url, "http://x:1");
    }
}
