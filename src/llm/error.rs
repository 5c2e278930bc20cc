//! Backend call failures and the retry policy applied to them.

use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;

/// What went wrong, as far as retrying is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// HTTP 429
    RateLimited,
    /// HTTP 5xx, or any other non-success status outside 4xx
    Unavailable,
    /// HTTP 4xx other than 429: bad request, auth, unknown model
    Rejected,
    /// Connection refused, reset, DNS, transport timeout
    Transport,
    /// Success status but a body we could not read
    Malformed,
    /// The dispatcher's deadline expired
    Timeout,
    /// Missing credentials or endpoint
    NotConfigured,
}

impl LlmErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => LlmErrorKind::RateLimited,
            400..=499 => LlmErrorKind::Rejected,
            _ => LlmErrorKind::Unavailable,
        }
    }

    /// Worth trying the same request again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimited | LlmErrorKind::Unavailable | LlmErrorKind::Transport
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LlmErrorKind::RateLimited => "Rate limited",
            LlmErrorKind::Unavailable => "Backend unavailable",
            LlmErrorKind::Rejected => "Request rejected",
            LlmErrorKind::Transport => "Transport error",
            LlmErrorKind::Malformed => "Malformed response",
            LlmErrorKind::Timeout => "Timeout",
            LlmErrorKind::NotConfigured => "Not configured",
        }
    }
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn http_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" (HTTP {})", code)).unwrap_or_default()
}

#[derive(Debug, Clone, Error)]
#[error("{kind}{}: {message}", http_suffix(.status))]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Server-provided `Retry-After`
    pub retry_after: Option<Duration>,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Non-success HTTP response. The body becomes the message.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        Self {
            status: Some(status),
            retry_after,
            ..Self::new(LlmErrorKind::from_status(status), body.trim())
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let what = if err.is_timeout() {
            "request timed out"
        } else if err.is_connect() {
            "connection failed"
        } else {
            "request failed"
        };
        Self::new(LlmErrorKind::Transport, format!("{}: {}", what, err))
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Malformed, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            LlmErrorKind::Timeout,
            format!("no response within {}s", after.as_secs_f64()),
        )
    }

    pub fn not_configured(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::NotConfigured, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// How a client retries transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// No retry is started once this much time has passed
    pub max_elapsed: Duration,
    /// Backoff before the first retry; doubles per attempt
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_elapsed: Duration::from_secs(120),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Whether `error`, seen on attempt number `attempt` (0-based), earns another try.
    pub fn allows(&self, error: &LlmError, attempt: u32) -> bool {
        error.is_transient() && attempt < self.max_retries
    }

    /// Wait before retrying after `error` on `attempt`.
    ///
    /// A server-provided `Retry-After` wins; otherwise exponential backoff,
    /// doubled again for rate limits. Always capped at `max_backoff`.
    pub fn backoff(&self, error: &LlmError, attempt: u32) -> Duration {
        let delay = error.retry_after.unwrap_or_else(|| {
            let factor = 2u32.saturating_pow(attempt);
            let base = self.initial_backoff.saturating_mul(factor);
            if error.kind == LlmErrorKind::RateLimited {
                base.saturating_mul(2)
            } else {
                base
            }
        });
        delay.min(self.max_backoff)
    }

    /// Run `call` until it succeeds, fails permanently, or the budget is spent.
    pub async fn run<T, F, Fut>(&self, backend: &str, mut call: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            let error = match call().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(
                            "{} call succeeded after {} retries ({:?})",
                            backend,
                            attempt,
                            started.elapsed()
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !self.allows(&error, attempt) {
                tracing::error!("{} call failed after {} retries: {}", backend, attempt, error);
                return Err(error);
            }
            let remaining = self.max_elapsed.saturating_sub(started.elapsed());
            let delay = self.backoff(&error, attempt);
            if delay >= remaining {
                tracing::warn!(
                    "{} call failed and the retry budget is spent: {}",
                    backend,
                    error
                );
                return Err(error);
            }

            attempt += 1;
            tracing::warn!(
                "{} call failed ({}); retry {} of {} in {:?}",
                backend,
                error,
                attempt,
                self.max_retries,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
