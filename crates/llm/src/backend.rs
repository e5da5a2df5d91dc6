//! Provider routing for completion calls.
//!
//! Three providers are spoken: `test` (deterministic, in-process),
//! `ollama` (local HTTP chat endpoint) and `openrouter` (hosted
//! OpenAI-compatible endpoint).

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::error::LlmError;
use crate::stable_hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Test,
    Ollama,
    OpenRouter,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderKind::Test => "test",
            ProviderKind::Ollama => "ollama",
            ProviderKind::OpenRouter => "openrouter",
        };
        f.write_str(name)
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "test" => Ok(ProviderKind::Test),
            "ollama" => Ok(ProviderKind::Ollama),
            "openrouter" => Ok(ProviderKind::OpenRouter),
            other => Err(format!("unknown llm provider: {other}")),
        }
    }
}

/// A concrete (provider, model) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmSelection {
    pub provider: ProviderKind,
    pub model: String,
}

impl LlmSelection {
    pub fn new(provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    pub fn test() -> Self {
        Self::new(ProviderKind::Test, "test")
    }

    pub fn parse(provider: &str, model: &str) -> Result<Self, String> {
        Ok(Self::new(provider.parse::<ProviderKind>()?, model))
    }
}

impl fmt::Display for LlmSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub selection: LlmSelection,
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub timeout: Duration,
}

/// One attempt against one provider.  Retries, fallbacks and the overall
/// timeout live in [`crate::CompletionClient`]; implementations only
/// translate a request into a reply or a classified error.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;
}

// ── HTTP backend ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn call_ollama(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let base_url = env::var("OLLAMA_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:11434".to_string());
        let endpoint = format!("{}/api/chat", base_url.trim_end_matches('/'));

        let payload = json!({
            "model": request.selection.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user},
            ],
            "stream": false,
            "options": {"temperature": request.temperature},
        });

        let response = self
            .client
            .post(&endpoint)
            .timeout(request.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|err| classify_transport(err, request.timeout))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| LlmError::BadResponse(format!("ollama body: {err}")))?;

        if !status.is_success() {
            return Err(classify_status(status, &body.to_string()));
        }

        body.get("message")
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| LlmError::BadResponse(format!("ollama reply missing content: {body}")))
    }

    async fn call_openrouter(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let api_key = env::var("OPENROUTER_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| LlmError::Unauthorized("OPENROUTER_API_KEY not set".to_string()))?;

        let payload = json!({
            "model": request.selection.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user},
            ],
            "temperature": request.temperature,
        });

        let response = self
            .client
            .post("https://openrouter.ai/api/v1/chat/completions")
            .bearer_auth(api_key)
            .header("HTTP-Referer", "https://folksim.local")
            .header("X-Title", "Folksim")
            .timeout(request.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|err| classify_transport(err, request.timeout))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| LlmError::BadResponse(format!("openrouter body: {err}")))?;

        if !status.is_success() {
            return Err(classify_status(status, &body.to_string()));
        }

        body.get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| {
                LlmError::BadResponse(format!("openrouter reply missing content: {body}"))
            })
    }
}

impl Default for HttpBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionBackend for HttpBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        match request.selection.provider {
            ProviderKind::Test => Ok(test_reply(request)),
            ProviderKind::Ollama => self.call_ollama(request).await,
            ProviderKind::OpenRouter => self.call_openrouter(request).await,
        }
    }
}

fn classify_transport(err: reqwest::Error, timeout: Duration) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout(timeout)
    } else {
        LlmError::Unavailable(err.to_string())
    }
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> LlmError {
    match status.as_u16() {
        401 | 402 | 403 => LlmError::Unauthorized(format!("{status}: {body}")),
        429 => LlmError::RateLimited(format!("{status}: {body}")),
        _ => LlmError::Unavailable(format!("{status}: {body}")),
    }
}

// ── Test provider ────────────────────────────────────────────────────────────

const TEST_LINES: &[&str] = &[
    "The roads have been busy this season.",
    "Aye, there is much to do before nightfall.",
    "I heard curious news from the market today.",
    "Mind the weather turning, friend.",
    "Trade has been kind to us lately.",
];

/// Deterministic offline reply.  Honors an explicit wrap-up instruction so
/// full simulations terminate their dialogues; returns an empty object for
/// prompts that demand JSON.
fn test_reply(request: &CompletionRequest) -> String {
    if request.user.contains("GOODBYE") || request.user.contains("Say goodbye") {
        return "It was good talking with you. Goodbye!".to_string();
    }
    if request.user.contains("JSON") {
        return "{}".to_string();
    }
    let seed = stable_hash(&format!("{}\n{}", request.system, request.user));
    TEST_LINES[(seed as usize) % TEST_LINES.len()].to_string()
}
