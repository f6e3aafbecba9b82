use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prospector_contracts::{
    schema_body, ConversationTurn, ExtractionPayload, ExtractionResult, EXTRACTION_RESULT_SCHEMA,
};
use prospector_kernel::{settle_extraction, system_instructions};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("text generation transport failed: {0}")]
    Transport(String),
    #[error("text generation returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("text generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("text generation broke the result contract: {0}")]
    Contract(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

/// One call to the text-generation service.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub history: Vec<PromptMessage>,
    pub message: String,
}

impl GenerationRequest {
    pub fn messages(&self) -> Vec<PromptMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(PromptMessage {
            role: "system".to_string(),
            content: self.system.clone(),
        });
        messages.extend(self.history.iter().cloned());
        messages.push(PromptMessage {
            role: "user".to_string(),
            content: self.message.clone(),
        });
        messages
    }
}

/// Produces the raw text of a structured completion.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, EngineError>;
}

/// Client for an OpenAI-compatible chat-completions endpoint in JSON-object mode.
pub struct OpenAiGenerator {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: f64,
    retry_max_attempts: usize,
    retry_backoff: Duration,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

impl OpenAiGenerator {
    pub fn new(cfg: &prospector_config::Engine) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        let api_key = cfg
            .api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|v| !v.trim().is_empty());
        if api_key.is_none() {
            warn!(
                api_key_env = cfg.api_key_env.as_deref().unwrap_or(""),
                "no API key configured for text generation; requests are sent unauthenticated"
            );
        }
        Ok(Self {
            client,
            endpoint: cfg.endpoint.clone(),
            model: cfg.model.clone(),
            api_key,
            temperature: cfg.temperature,
            retry_max_attempts: cfg.retry_max_attempts.max(1),
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
        })
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, EngineError> {
        let body = json!({
            "model": self.model,
            "messages": request.messages(),
            "response_format": {"type": "json_object"},
            "temperature": self.temperature,
        });

        let mut last_failure = EngineError::Transport("no attempt made".to_string());
        for attempt in 0..self.retry_max_attempts {
            if attempt > 0 && self.retry_backoff > Duration::ZERO {
                sleep(self.retry_backoff).await;
            }

            let mut builder = self.client.post(&self.endpoint).json(&body);
            if let Some(key) = &self.api_key {
                builder = builder.bearer_auth(key);
            }
            let response = match builder.send().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(attempt, error = %e, "text generation request failed");
                    last_failure = EngineError::Transport(e.to_string());
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                last_failure = EngineError::Http {
                    status: status.as_u16(),
                    body: text.chars().take(500).collect(),
                };
                if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    warn!(attempt, status = status.as_u16(), "text generation retryable status");
                    continue;
                }
                return Err(last_failure);
            }

            let completion: ChatCompletion = response
                .json()
                .await
                .map_err(|e| EngineError::Contract(format!("completion envelope: {e}")))?;
            return completion
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| {
                    EngineError::Contract("completion carried no message content".to_string())
                });
        }
        Err(last_failure)
    }
}

/// Turns history plus one new message into a settled [`ExtractionResult`].
pub struct ExtractionEngine {
    generator: Arc<dyn TextGenerator>,
    validator: jsonschema::Validator,
}

impl ExtractionEngine {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Result<Self, EngineError> {
        let body = schema_body(EXTRACTION_RESULT_SCHEMA).ok_or_else(|| {
            EngineError::Contract(format!("{EXTRACTION_RESULT_SCHEMA} is not embedded"))
        })?;
        let schema: Value =
            serde_json::from_str(body).map_err(|e| EngineError::Contract(e.to_string()))?;
        let validator =
            jsonschema::validator_for(&schema).map_err(|e| EngineError::Contract(e.to_string()))?;
        Ok(Self {
            generator,
            validator,
        })
    }

    pub async fn extract(
        &self,
        history: &[ConversationTurn],
        message: &str,
    ) -> Result<ExtractionResult, EngineError> {
        let request = GenerationRequest {
            system: system_instructions(),
            history: history
                .iter()
                .map(|turn| PromptMessage {
                    role: turn.role.as_str().to_string(),
                    content: turn.content.clone(),
                })
                .collect(),
            message: message.to_string(),
        };
        let text = self.generator.generate(&request).await?;
        debug!(chars = text.len(), "text generation returned");

        let payload = self.parse_payload(&text)?;
        settle_extraction(payload, history.is_empty())
            .map_err(|violation| EngineError::Contract(violation.to_string()))
    }

    fn parse_payload(&self, text: &str) -> Result<ExtractionPayload, EngineError> {
        let value: Value = serde_json::from_str(text.trim())
            .map_err(|e| EngineError::Contract(format!("response is not JSON: {e}")))?;
        if let Err(first) = self.validator.validate(&value) {
            return Err(EngineError::Contract(first.to_string()));
        }
        serde_json::from_value(value).map_err(|e| EngineError::Contract(e.to_string()))
    }
}
