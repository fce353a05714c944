//! Messages API client with retry and pool-backed auth.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use swarm_domain::error::{Error, Result};
use swarm_pool::{refresh, AccountPool};

use crate::error::{ApiError, ApiErrorKind};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";

const MAX_RETRIES: u32 = 5;
const BASE_DELAY: Duration = Duration::from_secs(1);

/// Delay before the given retry attempt: exponential from the base
/// (1 s, 2 s, 4 s, 8 s, 16 s), unless the server declared its own.
fn backoff_delay(attempt: u32, retry_after: Option<u64>) -> Duration {
    match retry_after {
        Some(secs) => Duration::from_secs(secs),
        None => BASE_DELAY * 2u32.saturating_pow(attempt),
    }
}

/// Upstream client bound to the shared credential pool.
///
/// Credentials are re-selected from disk for every attempt, so refreshes
/// and rate-limit marks made by sibling processes take effect on the next
/// call.
pub struct AnthropicClient {
    http: reqwest::Client,
    pool: Arc<AccountPool>,
    api_url: String,
    /// Where auth failures dump status/headers/body for inspection.
    requests_log: Option<PathBuf>,
}

impl AnthropicClient {
    pub fn new(pool: Arc<AccountPool>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| Error::Http(format!("building HTTP client: {e}")))?;
        Ok(Self {
            http,
            pool,
            api_url: API_URL.to_owned(),
            requests_log: None,
        })
    }

    /// Capture failed-request details to a log file.
    pub fn with_requests_log(mut self, path: PathBuf) -> Self {
        self.requests_log = Some(path);
        self
    }

    /// Send a Messages API request body, retrying recoverable failures
    /// with exponential backoff and failing over across pool accounts on
    /// rate limits. Returns the parsed response body.
    pub async fn send(&self, request_body: &Value) -> Result<Value> {
        let mut last_error = String::new();

        for attempt in 0..=MAX_RETRIES {
            let outcome = self.send_once(request_body).await;
            let api_error = match outcome {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            last_error = api_error.to_string();

            if api_error.kind == ApiErrorKind::Auth {
                return Err(Error::Auth(last_error));
            }
            if !api_error.is_recoverable() {
                return Err(Error::Http(last_error));
            }
            if attempt == MAX_RETRIES {
                tracing::error!(attempts = MAX_RETRIES, "max retries reached for API request");
                break;
            }

            let delay = backoff_delay(attempt, api_error.retry_after);
            tracing::warn!(
                attempt = attempt + 1,
                max = MAX_RETRIES,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "retrying API request"
            );
            tokio::time::sleep(delay).await;
        }

        Err(Error::Http(format!(
            "request failed after {MAX_RETRIES} retries: {last_error}"
        )))
    }

    async fn send_once(&self, request_body: &Value) -> std::result::Result<Value, ApiError> {
        // Fresh account selection per attempt: a rate-limited account is
        // skipped, a near-expiry token is refreshed first.
        let credentials = match self.pool.get_best_available_account() {
            Ok(Some(c)) => c,
            Ok(None) => {
                return Err(ApiError {
                    kind: ApiErrorKind::Auth,
                    message: "no usable account in the credential pool".into(),
                    status: None,
                    retry_after: None,
                })
            }
            Err(e) => {
                return Err(ApiError {
                    kind: ApiErrorKind::Auth,
                    message: format!("credential pool error: {e}"),
                    status: None,
                    retry_after: None,
                })
            }
        };

        let credentials = if refresh::needs_refresh(&credentials) {
            match refresh::refresh_account(&self.http, &self.pool, &credentials).await {
                Ok(refreshed) => refreshed,
                Err(e) => {
                    tracing::warn!(error = %e, "token refresh failed, using stored token");
                    credentials
                }
            }
        } else {
            credentials
        };

        let response = self
            .http
            .post(&self.api_url)
            .header("content-type", "application/json")
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("anthropic-beta", OAUTH_BETA)
            .bearer_auth(&credentials.access_token)
            .json(request_body)
            .send()
            .await
            .map_err(|e| ApiError {
                kind: ApiErrorKind::Network,
                message: format!("network error: {e}"),
                status: None,
                retry_after: None,
            })?;

        let status = response.status().as_u16();
        let retry_after_header = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let headers_snapshot = format!("{:?}", response.headers());
        let body = response.text().await.map_err(|e| ApiError {
            kind: ApiErrorKind::Network,
            message: format!("network error reading body: {e}"),
            status: Some(status),
            retry_after: None,
        })?;

        if (200..300).contains(&status) {
            return serde_json::from_str(&body).map_err(|e| ApiError {
                kind: ApiErrorKind::Parse,
                message: format!("JSON parse error: {e}"),
                status: Some(status),
                retry_after: None,
            });
        }

        // Error bodies are usually {"error":{"message":...}} but 5xx can
        // be arbitrary text from a proxy; classify either way.
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| {
                v.pointer("/error/message")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| truncate(&body, 500));

        let api_error = ApiError::from_response(&message, status, retry_after_header.as_deref());

        match api_error.kind {
            ApiErrorKind::RateLimit => {
                let retry_after = api_error.retry_after.unwrap_or_default() as i64;
                if let Err(e) = self
                    .pool
                    .mark_rate_limited(&credentials.account_uuid, retry_after)
                {
                    tracing::warn!(error = %e, "failed to persist rate-limit mark");
                }
            }
            ApiErrorKind::Auth => {
                self.log_failed_request(status, &headers_snapshot, &body);
            }
            _ => {}
        }

        Err(api_error)
    }

    /// Append an auth-failure record to the requests log.
    fn log_failed_request(&self, status: u16, headers: &str, body: &str) {
        let Some(path) = &self.requests_log else {
            return;
        };
        let record = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "status": status,
            "headers": headers,
            "body": truncate(body, 4096),
        });
        let line = format!("{record}\n");
        if let Err(e) = append_to_file(path, &line) {
            tracing::warn!(error = %e, path = %path.display(), "requests log write failed");
        }
    }
}

fn append_to_file(path: &PathBuf, line: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_owned()
    } else {
        let mut end = max;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}
