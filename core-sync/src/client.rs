//! # Rate-Limited Client
//!
//! Paces and retries calls to external services.
//!
//! ## Overview
//!
//! Each service name owns a token bucket whose capacity equals its
//! requests-per-second limit. The bucket starts full (an initial burst of
//! `capacity` requests) and refills continuously. Waiting for a token is the
//! only pacing suspension point; it has no timeout of its own.
//!
//! Every attempt, retries included, consumes a token. Transport failures, HTTP
//! 429 and HTTP 5xx are retried with exponential backoff plus jitter. Any other
//! non-2xx status is returned immediately as [`ClientError::Rejected`].

use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse, RetryPolicy};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, warn};

const MICROS_PER_TOKEN: u64 = 1_000_000;
const MAX_BODY_IN_ERROR: usize = 512;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("{service} rejected the request with HTTP {status}: {body}")]
    Rejected {
        service: String,
        status: u16,
        body: String,
    },

    #[error("{service} request failed after {attempts} attempt(s): {last}")]
    Exhausted {
        service: String,
        attempts: u32,
        last: String,
    },

    #[error("No rate limit configured for service '{0}'")]
    UnknownService(String),

    #[error("Unexpected response from {service}: {message}")]
    InvalidResponse { service: String, message: String },
}

impl ClientError {
    /// HTTP status of the final response, when there was one
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Continuously refilled token bucket
///
/// Tokens are tracked in millionths so refill arithmetic stays exact.
pub struct TokenBucket {
    rate: u64,
    state: Mutex<BucketState>,
}

struct BucketState {
    micro_tokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket allowing `requests_per_second` with an equal initial burst
    pub fn new(requests_per_second: u32) -> Self {
        let rate = u64::from(requests_per_second.max(1));
        Self {
            rate,
            state: Mutex::new(BucketState {
                micro_tokens: rate * MICROS_PER_TOKEN,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Suspend until a token is available, then take it
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);

                if state.micro_tokens >= MICROS_PER_TOKEN {
                    state.micro_tokens -= MICROS_PER_TOKEN;
                    return;
                }

                let deficit = MICROS_PER_TOKEN - state.micro_tokens;
                Duration::from_micros(deficit.div_ceil(self.rate))
            };

            sleep(wait).await;
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_micros();
        if elapsed == 0 {
            return;
        }

        let elapsed = u64::try_from(elapsed).unwrap_or(u64::MAX);
        let capacity = self.rate * MICROS_PER_TOKEN;
        state.micro_tokens = state
            .micro_tokens
            .saturating_add(elapsed.saturating_mul(self.rate))
            .min(capacity);
        state.last_refill = now;
    }
}

/// HTTP client wrapper enforcing per-service rate limits and retries
///
/// Cheap to share behind an `Arc`; all callers of one instance draw from the
/// same buckets.
pub struct RateLimitedClient {
    http: Arc<dyn HttpClient>,
    buckets: HashMap<String, Arc<TokenBucket>>,
    policy: RetryPolicy,
}

impl RateLimitedClient {
    pub fn new(
        http: Arc<dyn HttpClient>,
        rate_limits: &HashMap<String, u32>,
        policy: RetryPolicy,
    ) -> Self {
        let buckets = rate_limits
            .iter()
            .map(|(service, rps)| (service.clone(), Arc::new(TokenBucket::new(*rps))))
            .collect();

        Self {
            http,
            buckets,
            policy,
        }
    }

    /// Send `request` to `service`, pacing and retrying as configured
    ///
    /// # Errors
    ///
    /// - [`ClientError::Rejected`] for a non-retryable status (no retry happens)
    /// - [`ClientError::Exhausted`] once every attempt failed transiently
    /// - [`ClientError::UnknownService`] when `service` has no rate limit
    pub async fn request(&self, service: &str, request: HttpRequest) -> Result<HttpResponse> {
        let bucket = self
            .buckets
            .get(service)
            .ok_or_else(|| ClientError::UnknownService(service.to_string()))?;

        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            bucket.acquire().await;

            debug!(
                service,
                attempt = attempt + 1,
                max_attempts,
                method = ?request.method,
                url = %request.url,
                "Sending request"
            );

            let mut retry_after = None;

            match self.http.execute(request.clone()).await {
                Ok(response) if response.is_success() => {
                    debug!(service, status = response.status, attempt = attempt + 1, "Request succeeded");
                    return Ok(response);
                }
                Ok(response) if response.is_retryable() => {
                    warn!(
                        service,
                        status = response.status,
                        attempt = attempt + 1,
                        "Request failed with retryable status"
                    );
                    if response.status == 429 {
                        retry_after = parse_retry_after(&response);
                    }
                    last_error = format!("HTTP {}", response.status);
                }
                Ok(response) => {
                    let mut body = response.text_lossy();
                    if body.len() > MAX_BODY_IN_ERROR {
                        let cut = (0..=MAX_BODY_IN_ERROR)
                            .rev()
                            .find(|i| body.is_char_boundary(*i))
                            .unwrap_or(0);
                        body.truncate(cut);
                    }
                    warn!(service, status = response.status, "Request rejected");
                    return Err(ClientError::Rejected {
                        service: service.to_string(),
                        status: response.status,
                        body,
                    });
                }
                Err(e) => {
                    warn!(service, error = %e, attempt = attempt + 1, "Request failed");
                    last_error = e.to_string();
                }
            }

            if attempt + 1 < max_attempts {
                let mut delay = self.policy.backoff_delay(attempt, rand::random::<f64>());
                if let Some(wait) = retry_after {
                    delay = delay.max(wait).min(self.policy.max_delay);
                }
                debug!(service, delay_ms = delay.as_millis() as u64, "Retrying after delay");
                sleep(delay).await;
            }
        }

        error!(service, attempts = max_attempts, last_error = %last_error, "Retries exhausted");
        Err(ClientError::Exhausted {
            service: service.to_string(),
            attempts: max_attempts,
            last: last_error,
        })
    }
}

/// Numeric `Retry-After` seconds; HTTP-date values are ignored
fn parse_retry_after(response: &HttpResponse) -> Option<Duration> {
    response
        .header("Retry-After")
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
