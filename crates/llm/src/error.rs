use std::time::Duration;

use thiserror::Error;

/// Failure kinds of a completion call.
///
/// The retry policy keys off the variant: `Unauthorized` (401/402/403) is
/// never retried and moves straight to the next fallback; `RateLimited` and
/// `Timeout` get a single quick retry; everything else retries with
/// exponential backoff.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("llm call timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("bad response: {0}")]
    BadResponse(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LlmError::Unauthorized(_))
    }
}
