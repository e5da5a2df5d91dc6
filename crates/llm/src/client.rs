//! Completion client with retry, fallback chain and terminal fallback text.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::backend::{CompletionBackend, CompletionRequest, LlmSelection};
use crate::error::LlmError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per candidate for retryable errors (initial call included).
    pub attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
    /// Fraction of the delay randomized in each direction.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), jittered.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exponential =
            self.base_delay.as_millis() as f64 * self.factor.powi(attempt.saturating_sub(1) as i32);
        let jitter_range = exponential * self.jitter;
        let jittered = if jitter_range > 0.0 {
            let offset = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            (exponential + offset).max(0.0)
        } else {
            exponential
        };
        Duration::from_millis(jittered as u64)
    }
}

/// The one LLM entry point for every component.
///
/// A call walks the primary selection and then each fallback in order.
/// `Unauthorized` (401/402/403) moves on immediately; `RateLimited` and
/// `Timeout` allow a single quick retry; other errors retry with backoff.
/// When every candidate fails and a fallback text is configured, the text is
/// returned instead of an error so a dead provider degrades rather than
/// crashes the simulation.
#[derive(Clone)]
pub struct CompletionClient {
    backend: Arc<dyn CompletionBackend>,
    retry: RetryConfig,
    fallbacks: Vec<LlmSelection>,
    fallback_text: Option<String>,
}

impl CompletionClient {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            backend,
            retry: RetryConfig::default(),
            fallbacks: Vec::new(),
            fallback_text: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<LlmSelection>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn with_fallback_text(mut self, text: Option<String>) -> Self {
        self.fallback_text = text;
        self
    }

    pub async fn call(
        &self,
        selection: &LlmSelection,
        system: &str,
        user: &str,
        temperature: f32,
        timeout: Duration,
    ) -> Result<String, LlmError> {
        let mut last_error = None;

        for candidate in std::iter::once(selection).chain(self.fallbacks.iter()) {
            match self
                .try_candidate(candidate, system, user, temperature, timeout)
                .await
            {
                Ok(text) => {
                    if candidate != selection {
                        debug!(candidate = %candidate, "completion served by fallback");
                    }
                    return Ok(text);
                }
                Err(err) => {
                    warn!(candidate = %candidate, error = %err, "completion candidate failed");
                    last_error = Some(err);
                }
            }
        }

        if let Some(text) = &self.fallback_text {
            warn!("all llm candidates failed; returning configured fallback text");
            return Ok(text.clone());
        }

        Err(last_error.unwrap_or_else(|| LlmError::Unavailable("no llm candidates".to_string())))
    }

    async fn try_candidate(
        &self,
        candidate: &LlmSelection,
        system: &str,
        user: &str,
        temperature: f32,
        timeout: Duration,
    ) -> Result<String, LlmError> {
        let request = CompletionRequest {
            selection: candidate.clone(),
            system: system.to_string(),
            user: user.to_string(),
            temperature,
            timeout,
        };

        let mut quick_retry_used = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(timeout, self.backend.complete(&request)).await
            {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout(timeout)),
            };

            let err = match outcome {
                Ok(text) => {
                    if attempt > 1 {
                        debug!(candidate = %candidate, attempt, "completion succeeded after retry");
                    }
                    return Ok(text);
                }
                Err(err) => err,
            };

            match &err {
                LlmError::Unauthorized(_) => return Err(err),
                LlmError::Timeout(_) | LlmError::RateLimited(_) => {
                    if quick_retry_used {
                        return Err(err);
                    }
                    quick_retry_used = true;
                    warn!(candidate = %candidate, error = %err, "quick retry");
                    tokio::time::sleep(self.retry.base_delay).await;
                }
                _ => {
                    if attempt >= self.retry.attempts {
                        return Err(err);
                    }
                    let delay = self.retry.delay_for(attempt);
                    warn!(candidate = %candidate, error = %err, delay_ms = delay.as_millis() as u64, "retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
