//! LLM provider transport and the structured-output wrapper.
//!
//! The provider is an opaque completion capability behind a trait; the
//! production implementation speaks an OpenAI-compatible chat-completions
//! API. `StructuredLlm` layers retries on top: transport faults back off
//! exponentially with jitter, schema violations re-prompt with the
//! validation error, and token usage aggregates across all attempts.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::llm::schema::PhaseOutput;
use crate::models::Config;

#[derive(Debug, Clone)]
pub struct LlmOptions {
    pub web_search: bool,
    pub temperature: f64,
    pub max_retries: u32,
    pub max_tokens: u32,
}

impl Default for LlmOptions {
    fn default() -> Self {
        Self {
            web_search: false,
            temperature: 0.3,
            max_retries: 3,
            max_tokens: 2048,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: String,
    pub user: String,
    pub schema_name: &'static str,
    pub schema: Value,
    pub options: LlmOptions,
}

/// Raw provider response before schema validation.
#[derive(Debug, Clone)]
pub struct LlmRaw {
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub sources_count: u32,
}

#[derive(Debug, Clone)]
pub enum LlmError {
    /// Network fault or provider 5xx/429.
    Transport {
        status: Option<u16>,
        message: String,
    },
    /// Output did not conform to the declared schema after all retries.
    SchemaViolation(String),
    Timeout,
}

impl LlmError {
    pub fn transport(message: impl Into<String>) -> Self {
        LlmError::Transport {
            status: None,
            message: message.into(),
        }
    }

    /// Network faults, 429 and 5xx are worth retrying; other statuses are
    /// not going to change on resend.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Transport { status, .. } => {
                matches!(status, None | Some(429) | Some(500..=599))
            }
            _ => false,
        }
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Transport {
                status: Some(code),
                message,
            } => write!(f, "llm transport error ({code}): {message}"),
            LlmError::Transport {
                status: None,
                message,
            } => write!(f, "llm transport error: {message}"),
            LlmError::SchemaViolation(msg) => write!(f, "llm schema violation: {msg}"),
            LlmError::Timeout => write!(f, "llm timeout"),
        }
    }
}

impl std::error::Error for LlmError {}

/// The opaque completion capability.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, req: &LlmRequest) -> Result<LlmRaw, LlmError>;
}

// ---------------------------------------------------------------------------
// HTTP provider (OpenAI-compatible chat completions)
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HttpLlmClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl HttpLlmClient {
    pub fn new(http: reqwest::Client, config: &Config) -> Self {
        Self {
            http,
            api_key: config.llm_api_key.clone(),
            base_url: config.llm_base_url.trim_end_matches('/').to_string(),
            model: config.llm_model.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_tokens: u32,
    response_format: Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageOut>,
}

#[derive(Debug, Deserialize)]
struct ChatMessageOut {
    #[serde(default)]
    content: String,
    #[serde(default)]
    annotations: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

#[async_trait]
impl LlmProvider for HttpLlmClient {
    async fn complete(&self, req: &LlmRequest) -> Result<LlmRaw, LlmError> {
        // Web search rides on the provider's online-model variant.
        let model = if req.options.web_search {
            format!("{}:online", self.model)
        } else {
            self.model.clone()
        };

        let body = ChatCompletionRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: req.system.clone(),
                },
                ChatMessage {
                    role: "user",
                    content: req.user.clone(),
                },
            ],
            temperature: req.options.temperature,
            max_tokens: req.options.max_tokens,
            response_format: serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": req.schema_name,
                    "strict": true,
                    "schema": req.schema,
                }
            }),
        };

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::transport(e.to_string())
                }
            })?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = text.chars().take(800).collect();
            return Err(LlmError::Transport {
                status: Some(status.as_u16()),
                message: snippet,
            });
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&text)
            .map_err(|e| LlmError::transport(format!("provider json parse: {e}")))?;
        let message = parsed.choices.into_iter().next().and_then(|c| c.message);
        let (content, sources_count) = match message {
            Some(m) => (m.content, m.annotations.len() as u32),
            None => (String::new(), 0),
        };

        Ok(LlmRaw {
            content,
            prompt_tokens: parsed.usage.as_ref().and_then(|u| u.prompt_tokens).unwrap_or(0),
            completion_tokens: parsed
                .usage
                .as_ref()
                .and_then(|u| u.completion_tokens)
                .unwrap_or(0),
            sources_count,
        })
    }
}

// ---------------------------------------------------------------------------
// Structured wrapper
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StructuredResult<T> {
    pub value: T,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub sources_count: u32,
}

impl<T> StructuredResult<T> {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Retry/validation layer every worker goes through. Workers stay agnostic
/// of parsing and backoff; they hand in prompts and get typed records.
#[derive(Clone)]
pub struct StructuredLlm {
    provider: Arc<dyn LlmProvider>,
    base_backoff: Duration,
    attempt_timeout: Duration,
}

impl StructuredLlm {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            base_backoff: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timing(mut self, base_backoff: Duration, attempt_timeout: Duration) -> Self {
        self.base_backoff = base_backoff;
        self.attempt_timeout = attempt_timeout;
        self
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.base_backoff.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(8));
        let jitter = rand::thread_rng().gen_range(0..=exp / 2);
        Duration::from_millis(exp + jitter)
    }

    pub async fn generate<T: PhaseOutput>(
        &self,
        system: &str,
        user: &str,
        options: LlmOptions,
    ) -> Result<StructuredResult<T>, LlmError> {
        let mut prompt_tokens = 0u64;
        let mut completion_tokens = 0u64;
        let mut sources_count = 0u32;
        let mut transport_attempts = 0u32;
        let mut schema_attempts = 0u32;
        let mut user_payload = user.to_string();

        loop {
            let req = LlmRequest {
                system: system.to_string(),
                user: user_payload.clone(),
                schema_name: T::schema_name(),
                schema: T::json_schema(),
                options: options.clone(),
            };

            let outcome = tokio::time::timeout(self.attempt_timeout, self.provider.complete(&req))
                .await
                .map_err(|_| LlmError::Timeout)?;

            let raw = match outcome {
                Ok(raw) => raw,
                Err(e) if e.is_retryable() && transport_attempts < options.max_retries => {
                    transport_attempts += 1;
                    metrics::increment_counter!("llm_transport_retries_total");
                    let delay = self.backoff_delay(transport_attempts - 1);
                    warn!(
                        schema = T::schema_name(),
                        attempt = transport_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "LLM transport fault, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            prompt_tokens += raw.prompt_tokens;
            completion_tokens += raw.completion_tokens;
            sources_count += raw.sources_count;

            match T::from_raw(&raw.content) {
                Ok(value) => {
                    metrics::counter!(
                        "llm_tokens_total",
                        raw.prompt_tokens + raw.completion_tokens
                    );
                    return Ok(StructuredResult {
                        value,
                        prompt_tokens,
                        completion_tokens,
                        sources_count,
                    });
                }
                Err(msg) if schema_attempts < options.max_retries => {
                    schema_attempts += 1;
                    metrics::increment_counter!("llm_schema_retries_total");
                    debug!(
                        schema = T::schema_name(),
                        attempt = schema_attempts,
                        error = %msg,
                        "LLM output failed validation, re-prompting"
                    );
                    user_payload = format!(
                        "{user}\n\nYour previous response failed validation: {msg}\n\
                         Respond again with ONLY a JSON object matching the {} schema.",
                        T::schema_name()
                    );
                }
                Err(msg) => return Err(LlmError::SchemaViolation(msg)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::schema::ResearchOutput;
    use parking_lot::Mutex;

    /// Provider that plays back a scripted list of responses.
    struct ScriptedProvider {
        script: Mutex<Vec<Result<LlmRaw, LlmError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<LlmRaw, LlmError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn complete(&self, req: &LlmRequest) -> Result<LlmRaw, LlmError> {
            self.calls.lock().push(req.user.clone());
            let mut script = self.script.lock();
            if script.is_empty() {
                return Err(LlmError::transport("script exhausted"));
            }
            script.remove(0)
        }
    }

    fn raw(content: &str, prompt: u64, completion: u64) -> LlmRaw {
        LlmRaw {
            content: content.to_string(),
            prompt_tokens: prompt,
            completion_tokens: completion,
            sources_count: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn schema_retry_appends_validation_error() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(raw("not json at all", 10, 5)),
            Ok(raw(r#"{"summary": "ok"}"#, 10, 5)),
        ]));
        let llm = StructuredLlm::new(provider.clone());

        let result = llm
            .generate::<ResearchOutput>("sys", "user payload", LlmOptions::default())
            .await
            .unwrap();

        assert_eq!(result.value.summary, "ok");
        // Tokens aggregate across both attempts.
        assert_eq!(result.total_tokens(), 30);

        let calls = provider.calls.lock();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].contains("failed validation"));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_faults_back_off_then_succeed() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(LlmError::transport("connection reset")),
            Err(LlmError::Transport {
                status: Some(503),
                message: "overloaded".to_string(),
            }),
            Ok(raw(r#"{"summary": "recovered"}"#, 7, 3)),
        ]));
        let llm = StructuredLlm::new(provider);

        let result = llm
            .generate::<ResearchOutput>("sys", "u", LlmOptions::default())
            .await
            .unwrap();
        assert_eq!(result.value.summary, "recovered");
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_status_surfaces_immediately() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(LlmError::Transport {
            status: Some(401),
            message: "bad key".to_string(),
        })]));
        let llm = StructuredLlm::new(provider);

        let err = llm
            .generate::<ResearchOutput>("sys", "u", LlmOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Transport { status: Some(401), .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn schema_violation_after_exhaustion() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(raw("garbage", 1, 1)),
            Ok(raw("garbage", 1, 1)),
            Ok(raw("garbage", 1, 1)),
            Ok(raw("garbage", 1, 1)),
        ]));
        let llm = StructuredLlm::new(provider);

        let err = llm
            .generate::<ResearchOutput>(
                "sys",
                "u",
                LlmOptions {
                    max_retries: 3,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::SchemaViolation(_)));
    }
}
