//! In-process scripted backend for tests.
//!
//! Replies are routed by substring match against the prompt, so a single
//! backend can serve every agent role in an end-to-end test without any
//! network mock.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{CompletionBackend, CompletionRequest};
use crate::error::LlmError;

#[derive(Debug, Default)]
pub struct ScriptedBackend {
    /// `(needle, reply)` pairs checked in order against user then system
    /// prompt.
    routes: Vec<(String, String)>,
    default_reply: String,
    delay: Option<Duration>,
    calls: AtomicUsize,
    /// Errors returned (in order) before any reply is served.
    failures: Mutex<VecDeque<LlmError>>,
    /// Every `(system, user)` prompt pair seen, in call order.
    requests: Mutex<Vec<(String, String)>>,
}

impl ScriptedBackend {
    pub fn default_reply(reply: impl Into<String>) -> Self {
        Self {
            default_reply: reply.into(),
            ..Self::default()
        }
    }

    pub fn with_route(mut self, needle: impl Into<String>, reply: impl Into<String>) -> Self {
        self.routes.push((needle.into(), reply.into()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_failure(&self, error: LlmError) {
        self.failures
            .lock()
            .expect("failure queue poisoned")
            .push_back(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().expect("request log poisoned").clone()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .expect("request log poisoned")
            .push((request.system.clone(), request.user.clone()));

        if let Some(error) = self
            .failures
            .lock()
            .expect("failure queue poisoned")
            .pop_front()
        {
            return Err(error);
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        for (needle, reply) in &self.routes {
            if request.user.contains(needle) || request.system.contains(needle) {
                return Ok(reply.clone());
            }
        }

        Ok(self.default_reply.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LlmSelection;

    fn request(user: &str) -> CompletionRequest {
        CompletionRequest {
            selection: LlmSelection::test(),
            system: "sys".to_string(),
            user: user.to_string(),
            temperature: 0.0,
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn routes_take_precedence_over_default() {
        let backend = ScriptedBackend::default_reply("default")
            .with_route("SCHEDULE FOR Elara", "Grak")
            .with_route("SCHEDULE FOR Grak", "Elara");

        let reply = backend
            .complete(&request("### SCHEDULE FOR Elara (CSV ONLY):"))
            .await
            .unwrap();
        assert_eq!(reply, "Grak");

        let reply = backend.complete(&request("something else")).await.unwrap();
        assert_eq!(reply, "default");
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn queued_failures_come_first() {
        let backend = ScriptedBackend::default_reply("ok");
        backend.push_failure(LlmError::Unavailable("down".to_string()));

        assert!(backend.complete(&request("x")).await.is_err());
        assert_eq!(backend.complete(&request("x")).await.unwrap(), "ok");
    }
}
