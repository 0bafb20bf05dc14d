//! Retry and fallback policies for download attempts
//!
//! `with_retries` repeats one candidate a bounded number of times;
//! `for_each_candidate` walks candidates in order until one succeeds. Both
//! are independent of the transfer mechanics and stop immediately on
//! cancellation.

use crate::error::DownloadError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a single attempt (or a whole candidate list) did not succeed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttemptError {
    /// Network or process failure; retried
    #[error("{0}")]
    Unreachable(String),

    /// No progress within the stall timeout; retried
    #[error("stalled: no progress for {}s", .0.as_secs())]
    Stalled(Duration),

    /// Candidate unusable (URL not allowed, bad command); never retried
    #[error("skipped: {0}")]
    Skipped(String),

    #[error("cancelled")]
    Cancelled,

    /// Every candidate failed
    #[error("all methods failed")]
    Exhausted,
}

impl AttemptError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Stalled(_))
    }

    /// Short label for logs and metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => "unreachable",
            Self::Stalled(_) => "stalled",
            Self::Skipped(_) => "skipped",
            Self::Cancelled => "cancelled",
            Self::Exhausted => "exhausted",
        }
    }
}

impl From<AttemptError> for DownloadError {
    fn from(err: AttemptError) -> Self {
        match err {
            AttemptError::Unreachable(reason) => Self::SourceUnreachable(reason),
            AttemptError::Stalled(timeout) => Self::Stalled(timeout.as_secs()),
            AttemptError::Skipped(reason) => Self::InvalidInput(reason),
            AttemptError::Cancelled => Self::Cancelled,
            AttemptError::Exhausted => Self::AllSourcesExhausted,
        }
    }
}

/// Bounded retry of a single candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Pause between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` is reached. The attempt closure receives the
/// 1-based attempt number. The backoff sleep is interrupted by cancellation.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T, AttemptError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut n = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(AttemptError::Cancelled);
        }

        match attempt(n).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && n < max_attempts => {
                tracing::debug!(
                    attempt = n,
                    max_attempts = max_attempts,
                    reason = e.reason(),
                    backoff_ms = policy.backoff.as_millis() as u64,
                    "Attempt failed, retrying"
                );

                tokio::select! {
                    () = cancel.cancelled() => return Err(AttemptError::Cancelled),
                    () = tokio::time::sleep(policy.backoff) => {}
                }
                n += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Try each candidate in order, returning the first success
///
/// Cancellation stops the walk at once; any other failure moves on to the
/// next candidate. If every candidate fails the result is
/// [`AttemptError::Exhausted`].
pub async fn for_each_candidate<'a, C, T, F, Fut>(
    candidates: &'a [C],
    cancel: &CancellationToken,
    mut run: F,
) -> Result<T, AttemptError>
where
    F: FnMut(usize, &'a C) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    for (i, candidate) in candidates.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(AttemptError::Cancelled);
        }

        match run(i, candidate).await {
            Ok(value) => return Ok(value),
            Err(AttemptError::Cancelled) => return Err(AttemptError::Cancelled),
            Err(e) => {
                tracing::debug!(candidate = i, reason = e.reason(), "Candidate failed");
            }
        }
    }

    Err(AttemptError::Exhausted)
}
