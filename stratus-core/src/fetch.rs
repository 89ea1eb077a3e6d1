//! Upstream retrieval: the transport boundary and the per-entity retry loop.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::UpstreamConfig;
use crate::error::FetchError;
use crate::retry::{Retryability, RetryPolicy};
use crate::types::{Entity, FetchOutcome, RawPayload, TargetDate};

/// A single request/response exchange with the upstream API.
///
/// Implementations make exactly one attempt; retrying is the fetcher's job.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn request(&self, entity: &Entity, date: TargetDate) -> Result<RawPayload, FetchError>;
}

/// Query parameters for one entity and date, in a stable order.
pub fn request_params(
    entity: &Entity,
    date: TargetDate,
    hourly_variables: &[String],
) -> Vec<(&'static str, String)> {
    let day = date.to_string();
    vec![
        ("latitude", entity.latitude.to_string()),
        ("longitude", entity.longitude.to_string()),
        ("hourly", hourly_variables.join(",")),
        ("timezone", entity.timezone.clone()),
        ("start_date", day.clone()),
        ("end_date", day),
    ]
}

/// Map a non-success HTTP status to a fetch error.
pub fn map_http_status(status: u16, body: &str, retry_after_secs: Option<u64>) -> FetchError {
    let message: String = body.chars().take(200).collect();
    match status {
        429 => FetchError::RateLimited {
            retry_after_secs: retry_after_secs.unwrap_or(0),
        },
        500 | 502 | 503 | 504 => FetchError::ServerUnavailable { status, message },
        400 | 422 => FetchError::BadRequest { status, message },
        401 | 403 => FetchError::AuthFailed { status },
        404 => FetchError::NotFound { message },
        _ => FetchError::UnexpectedStatus { status, message },
    }
}

/// Check that a 200 body has the structure the transformer relies on.
///
/// Fewer time slices than a full day is still accepted here.
pub fn check_response_shape(body: &[u8]) -> Result<(), FetchError> {
    let json: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| FetchError::InvalidResponse {
            message: format!("body is not JSON: {}", e),
        })?;
    let Some(hourly) = json.get("hourly") else {
        return Err(FetchError::InvalidResponse {
            message: "response missing 'hourly' key".to_string(),
        });
    };
    let has_slices = hourly
        .get("time")
        .and_then(|t| t.as_array())
        .is_some_and(|t| !t.is_empty());
    if !has_slices {
        return Err(FetchError::InvalidResponse {
            message: "hourly time array is empty or missing".to_string(),
        });
    }
    Ok(())
}

/// `reqwest`-backed client for an Open-Meteo style hourly endpoint.
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
    hourly_variables: Vec<String>,
    timeout: Duration,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("stratus/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Connection {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            hourly_variables: config.hourly_variables.clone(),
            timeout: config.timeout(),
        })
    }

    fn map_transport_error(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                timeout_secs: self.timeout.as_secs(),
            }
        } else if err.is_builder() {
            FetchError::BadRequest {
                status: 0,
                message: err.to_string(),
            }
        } else {
            FetchError::Connection {
                message: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn request(&self, entity: &Entity, date: TargetDate) -> Result<RawPayload, FetchError> {
        let params = request_params(entity, date, &self.hourly_variables);
        debug!(url = %self.base_url, ?params, "Requesting upstream");

        let response = self
            .client
            .get(&self.base_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !status.is_success() {
            return Err(map_http_status(
                status.as_u16(),
                &String::from_utf8_lossy(&body),
                retry_after,
            ));
        }

        check_response_shape(&body)?;
        Ok(RawPayload::new(body))
    }
}

/// Retrieves one entity's raw data, applying the retry policy around the transport call only.
pub struct EntityFetcher {
    client: Arc<dyn UpstreamClient>,
    policy: RetryPolicy,
}

impl EntityFetcher {
    pub fn new(client: Arc<dyn UpstreamClient>, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// Fetch with retries. Failure is a returned outcome, never a propagated error.
    pub async fn fetch(&self, entity: &Entity, date: TargetDate) -> FetchOutcome {
        let max_attempts = self.policy.max_attempts();
        info!(entity = %entity.name, date = %date, "Fetching");

        let mut attempt = 1;
        loop {
            let started = Instant::now();
            let result = self.client.request(entity, date).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(payload) => {
                    info!(
                        entity = %entity.name,
                        attempt,
                        max_attempts,
                        outcome = "success",
                        latency_ms,
                        bytes = payload.len(),
                        "Fetch attempt succeeded"
                    );
                    return FetchOutcome::Success {
                        payload,
                        attempts: attempt,
                    };
                }
                Err(err) => {
                    let retryable = self.policy.classify(&err) == Retryability::Retryable;
                    if retryable && self.policy.has_attempts_left(attempt) {
                        let wait = self.policy.delay_for(attempt, &err);
                        warn!(
                            entity = %entity.name,
                            attempt,
                            max_attempts,
                            outcome = "retryable",
                            latency_ms,
                            backoff_ms = wait.as_millis() as u64,
                            error = %err,
                            "Fetch attempt failed, retrying"
                        );
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                        continue;
                    }

                    error!(
                        entity = %entity.name,
                        attempt,
                        max_attempts,
                        outcome = if retryable { "exhausted" } else { "terminal" },
                        latency_ms,
                        kind = %err.kind(),
                        error = %err,
                        "Fetch failed"
                    );
                    return FetchOutcome::Failure {
                        error: err,
                        attempts_used: attempt,
                    };
                }
            }
        }
    }
}
