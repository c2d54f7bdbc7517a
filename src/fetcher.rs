//! Source retrieval over HTTP(S).
//!
//! Uses a direct (no-proxy) client: sources must be reachable without any
//! of the proxies this crate collects. Transient failures are retried with
//! capped exponential backoff plus jitter; the final outcome of each fetch is
//! reported to the [`StateManager`] when one is attached.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::codec::scan::MAX_BLOB_LINE;
use crate::codec::{decode_base64_text, parse_configs_from_text, RawCandidate};
use crate::config::{RuntimeConfig, SourceDescriptor};
use crate::error::FetchError;
use crate::state::machine::data;
use crate::state::{SourceEvent, StateManager};

/// Bytes requested by the ranged-GET fallback of the availability check.
const CHECK_RANGE: &str = "bytes=0-1023";

/// Backoff schedule between fetch attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base: Duration,
    /// Upper bound of the random delay added to every wait.
    pub jitter: Duration,
    pub cap: Duration,
    /// Give up at once on 4xx other than 408 / 429. Off: every non-2xx is retried.
    pub fail_fast_client_errors: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_millis(500),
            jitter: Duration::from_millis(250),
            cap: Duration::from_secs(8),
            fail_fast_client_errors: false,
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (0-based): `base * 2^retry + jitter`, capped.
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = self.base.saturating_mul(2u32.saturating_pow(retry.min(16)));
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::random::<u64>() % (jitter_ms + 1))
        };
        exp.saturating_add(jitter).min(self.cap)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchSettings {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    pub retry: RetryPolicy,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("proxy-harvest/{}", env!("CARGO_PKG_VERSION")),
            retry: RetryPolicy::default(),
        }
    }
}

impl FetchSettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            connect_timeout: config.connect_timeout(),
            user_agent: config.user_agent.clone(),
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base: Duration::from_millis(config.retry_base_ms),
                jitter: Duration::from_millis(config.retry_jitter_ms),
                cap: Duration::from_millis(config.retry_cap_ms),
                fail_fast_client_errors: config.fail_fast_client_errors,
            },
        }
    }
}

/// HTTP fetcher for config sources.
pub struct Fetcher {
    client: reqwest::Client,
    settings: FetchSettings,
    state: Option<Arc<StateManager>>,
}

impl Fetcher {
    pub fn new(settings: FetchSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.connect_timeout)
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build source HTTP client: {e}"))?;
        Ok(Self {
            client,
            settings,
            state: None,
        })
    }

    /// Report fetch outcomes to `state`.
    pub fn with_state(mut self, state: Arc<StateManager>) -> Self {
        self.state = Some(state);
        self
    }

    /// Fetch `source` and split its body into raw candidates.
    ///
    /// Reports `Success` or `Failure` for the source. A body with no
    /// recognizable configs is a success that yields nothing.
    pub async fn fetch_source(
        &self,
        cancel: &CancellationToken,
        source: &SourceDescriptor,
    ) -> Result<Vec<RawCandidate>, FetchError> {
        match self.fetch_text(cancel, &source.url).await {
            Ok(body) => {
                let text = decode_subscription_body(&body);
                let candidates: Vec<RawCandidate> = parse_configs_from_text(&text)
                    .into_iter()
                    .map(RawCandidate::new)
                    .collect();
                tracing::debug!(source = %source.url, candidates = candidates.len(), "fetch: body scanned");
                self.report(&source.url, SourceEvent::Success, "fetched");
                Ok(candidates)
            }
            Err(FetchError::Cancelled { url }) => Err(FetchError::Cancelled { url }),
            Err(e) => {
                tracing::warn!(source = %source.url, "fetch: source skipped this round: {e}");
                self.report_error(&source.url, &e);
                Err(e)
            }
        }
    }

    /// Body of `url` as text, with retries.
    pub async fn fetch_text(&self, cancel: &CancellationToken, url: &str) -> Result<String, FetchError> {
        let retry = &self.settings.retry;
        let mut last_error = String::new();

        for attempt in 0..=retry.max_retries {
            if attempt > 0 {
                let wait = retry.delay(attempt - 1);
                tracing::debug!(url, attempt, wait_ms = wait.as_millis() as u64, "fetch: retrying");
                tokio::select! {
                    () = cancel.cancelled() => return Err(FetchError::Cancelled { url: url.to_string() }),
                    () = tokio::time::sleep(wait) => {}
                }
            }

            let outcome = tokio::select! {
                () = cancel.cancelled() => return Err(FetchError::Cancelled { url: url.to_string() }),
                outcome = self.try_once(url) => outcome,
            };
            match outcome {
                Ok(body) => return Ok(body),
                Err(FetchError::Status { status, .. })
                    if retry.fail_fast_client_errors && !is_retryable(status) =>
                {
                    return Err(FetchError::Status {
                        url: url.to_string(),
                        status,
                    });
                }
                Err(e) => {
                    tracing::debug!(url, attempt, "fetch: attempt failed: {e}");
                    last_error = e.to_string();
                }
            }
        }

        Err(FetchError::Exhausted {
            url: url.to_string(),
            attempts: retry.max_retries + 1,
            last: last_error,
        })
    }

    async fn try_once(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.client.get(url).send().await.map_err(|e| transport_error(url, &e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let bytes = resp.bytes().await.map_err(|e| transport_error(url, &e))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Lightweight liveness check: HEAD, falling back to a ranged GET when
    /// the server rejects HEAD with a 4xx.
    pub async fn test_source_availability(&self, url: &str) -> bool {
        match self.client.head(url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) if resp.status().is_client_error() => {
                match self.client.get(url).header(reqwest::header::RANGE, CHECK_RANGE).send().await {
                    Ok(resp) => resp.status().is_success(),
                    Err(e) => {
                        tracing::debug!(url, "fetch: ranged GET check failed: {e}");
                        false
                    }
                }
            }
            Ok(resp) => {
                tracing::debug!(url, status = %resp.status(), "fetch: HEAD check rejected");
                false
            }
            Err(e) => {
                tracing::debug!(url, "fetch: HEAD check failed: {e}");
                false
            }
        }
    }

    /// Report a failed availability check for `url`.
    pub fn report_unavailable(&self, url: &str) {
        self.report(url, SourceEvent::Failure, "unavailable");
    }

    fn report_error(&self, url: &str, error: &FetchError) {
        if let Some(state) = &self.state {
            let mut info = data("reason", "fetch_failed");
            info.insert("error".into(), error.to_string());
            state.signal(url, SourceEvent::Failure, info);
        }
    }

    fn report(&self, url: &str, event: SourceEvent, reason: &str) {
        if let Some(state) = &self.state {
            state.signal(url, event, data("reason", reason));
        }
    }
}

/// Under fail-fast, only server errors, throttling and request timeouts get another try.
fn is_retryable(status: u16) -> bool {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn transport_error(url: &str, e: &reqwest::Error) -> FetchError {
    let reason = if e.is_timeout() {
        "timed out".to_string()
    } else if e.is_connect() {
        format!("connect failed: {e}")
    } else {
        e.to_string()
    };
    FetchError::Transport {
        url: url.to_string(),
        reason,
    }
}

/// Whole-body base64 detection.
///
/// A single-line body is decoded when the decoded text carries more
/// `://` markers than the raw text; otherwise the raw body is kept.
pub fn decode_subscription_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed.contains('\n') {
        return body.to_string();
    }
    match decode_base64_text(trimmed, MAX_BLOB_LINE) {
        Some(decoded) if decoded.matches("://").count() > trimmed.matches("://").count() => decoded,
        _ => body.to_string(),
    }
}
