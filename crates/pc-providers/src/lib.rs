//! Thin HTTP clients for the two generator kinds and
//! for judge calls, sharing one retry/backoff policy.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_CAP: Duration = Duration::from_secs(6);
const MAX_RETRIES: u32 = 2;
/// Coordinator-imposed ceiling; upstream timeouts are otherwise the provider's own affair.
pub const CATASTROPHIC_CEILING: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream rejected the request ({status}): {body}")]
    ClientError { status: StatusCode, body: String },
    #[error("upstream failed after retries ({status}): {body}")]
    ServerError { status: StatusCode, body: String },
    #[error("response body could not be parsed: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratorRequest<'a> {
    pub prompt: &'a str,
    pub config: &'a Value,
}

#[derive(Debug, Clone)]
pub struct GeneratorResponse {
    pub artifact_bytes: Vec<u8>,
    pub cost_usd: f64,
    pub token_count: u64,
    pub duration_ms: u64,
    pub source_refs: Option<Vec<String>>,
    pub response_headers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct GeneratorWireResponse {
    content: String,
    #[serde(default)]
    cost_usd: f64,
    #[serde(default)]
    token_count: u64,
    #[serde(default)]
    source_refs: Option<Vec<String>>,
}

#[async_trait]
pub trait GeneratorClient: Send + Sync {
    async fn generate(
        &self,
        endpoint: &str,
        credentials: &HashMap<String, String>,
        request: &GeneratorRequest<'_>,
    ) -> Result<GeneratorResponse, ProviderError>;
}

#[async_trait]
pub trait JudgeClient: Send + Sync {
    /// Returns the raw judge response text plus response headers (so the caller can
    /// feed them back into the rate limiter). Parsing the judge's output-format
    /// contract is the Judge Runner's job, not this client's.
    async fn judge(
        &self,
        endpoint: &str,
        credentials: &HashMap<String, String>,
        prompt: &str,
    ) -> Result<(String, HashMap<String, String>), ProviderError>;
}

/// One HTTP client shared by every generator/judge kind; the differences between
/// generator kinds live in prompt construction upstream of this client, not here.
pub struct HttpProviderClient {
    http: Client,
}

impl HttpProviderClient {
    pub fn new() -> Self {
        Self {
            http: Client::builder()
                .timeout(CATASTROPHIC_CEILING)
                .build()
                .expect("reqwest client builds with static config"),
        }
    }
}

impl Default for HttpProviderClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GeneratorClient for HttpProviderClient {
    async fn generate(
        &self,
        endpoint: &str,
        credentials: &HashMap<String, String>,
        request: &GeneratorRequest<'_>,
    ) -> Result<GeneratorResponse, ProviderError> {
        let started = std::time::Instant::now();
        // generation calls have no side effects this system must dedupe against, so
        // they're treated as idempotent for retry purposes.
        let (body, headers) = post_with_retry(&self.http, endpoint, credentials, request, true).await?;
        let parsed: GeneratorWireResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        Ok(GeneratorResponse {
            artifact_bytes: parsed.content.into_bytes(),
            cost_usd: parsed.cost_usd,
            token_count: parsed.token_count,
            duration_ms: started.elapsed().as_millis() as u64,
            source_refs: parsed.source_refs,
            response_headers: headers,
        })
    }
}

#[async_trait]
impl JudgeClient for HttpProviderClient {
    async fn judge(
        &self,
        endpoint: &str,
        credentials: &HashMap<String, String>,
        prompt: &str,
    ) -> Result<(String, HashMap<String, String>), ProviderError> {
        let config = Value::Null;
        let request = GeneratorRequest { prompt, config: &config };
        post_with_retry(&self.http, endpoint, credentials, &request, true).await
    }
}

/// Posts `request` to `endpoint` with the per-tenant credential headers, retrying
/// transient 5xx/timeouts with exponential backoff and full jitter. 4xx never retries:
/// the caller did something the server won't accept regardless of when
/// it's asked again.
async fn post_with_retry(
    http: &Client,
    endpoint: &str,
    credentials: &HashMap<String, String>,
    request: &GeneratorRequest<'_>,
    idempotent: bool,
) -> Result<(String, HashMap<String, String>), ProviderError> {
    let mut attempt = 0;
    loop {
        let mut builder = http.post(endpoint).json(request);
        for (key, value) in credentials {
            builder = builder.header(key, value);
        }

        let result = builder.send().await;
        let response = match result {
            Ok(response) => response,
            Err(e) if idempotent && attempt < MAX_RETRIES && (e.is_timeout() || e.is_connect()) => {
                let delay = backoff_delay(attempt);
                tracing::warn!(endpoint, attempt, ?delay, "transient transport error, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            Err(e) => return Err(ProviderError::Transport(e)),
        };

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect::<HashMap<_, _>>();

        if status.is_success() {
            let body = response.text().await?;
            return Ok((body, headers));
        }

        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::ClientError { status, body });
        }

        if idempotent && attempt < MAX_RETRIES {
            let delay = backoff_delay(attempt);
            tracing::warn!(endpoint, attempt, %status, ?delay, "transient upstream error, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
            continue;
        }

        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::ServerError { status, body });
    }
}

/// `base * 2^attempt` capped at `RETRY_CAP`, then full jitter over `[0, capped]`.
fn backoff_delay(attempt: u32) -> Duration {
    let scaled = RETRY_BASE.saturating_mul(1 << attempt.min(8));
    let capped = scaled.min(RETRY_CAP);
    let jittered_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64);
    Duration::from_millis(jittered_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_the_cap() {
        for attempt in 0..10 {
            assert!(backoff_delay(attempt) <= RETRY_CAP);
        }
    }

    #[test]
    fn backoff_grows_with_attempt_on_average() {
        // not a statistical proof, just a sanity bound: attempt 0's jitter ceiling is
        // the base delay, attempt 2's ceiling is the (capped) max delay.
        assert!(RETRY_BASE <= RETRY_CAP);
        let attempt0_ceiling = RETRY_BASE.saturating_mul(1 << 0).min(RETRY_CAP);
        let attempt2_ceiling = RETRY_BASE.saturating_mul(1 << 2).min(RETRY_CAP);
        assert!(attempt2_ceiling >= attempt0_ceiling);
    }
}
