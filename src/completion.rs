//! Schema-constrained completion service.
//!
//! The tagger hands a system prompt, a user context document, and a JSON
//! Schema to a [`CompletionService`] and gets back raw JSON text plus token
//! usage. Parsing and validation happen in the tagger, not here, so a fake
//! service in tests exercises the same validation path as the real one.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::config::CompletionConfig;
use crate::error::ServiceError;
use crate::models::TokenUsage;

/// How strictly the service must follow the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Structured outputs: the service enforces the schema.
    Strict,
    /// Any JSON object; the schema is only described in the prompt.
    JsonObject,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub system: &'a str,
    pub user: &'a str,
    pub schema_name: &'a str,
    pub schema: &'a Value,
    pub mode: OutputMode,
}

#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub content: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    fn model_name(&self) -> &str;
    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<Completion, ServiceError>;
}

/// Used when `completion.provider = "disabled"`.
pub struct DisabledCompletion;

#[async_trait]
impl CompletionService for DisabledCompletion {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn complete(&self, _request: &CompletionRequest<'_>) -> Result<Completion, ServiceError> {
        Err(ServiceError::MissingCredential(
            "completion provider is disabled".to_string(),
        ))
    }
}

/// OpenAI chat completions with `response_format` structured output.
pub struct OpenAICompletion {
    model: String,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAICompletion {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => bail!("OPENAI_API_KEY environment variable not set"),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model: config.model.clone(),
            url: config.url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }
}

fn response_format(request: &CompletionRequest<'_>) -> Value {
    match request.mode {
        OutputMode::Strict => serde_json::json!({
            "type": "json_schema",
            "json_schema": {
                "name": request.schema_name,
                "strict": true,
                "schema": request.schema,
            }
        }),
        OutputMode::JsonObject => serde_json::json!({ "type": "json_object" }),
    }
}

#[async_trait]
impl CompletionService for OpenAICompletion {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<Completion, ServiceError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
            "response_format": response_format(request),
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ServiceError::from_status(status.as_u16(), body_text));
        }

        let json: Value = response.json().await?;
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &Value) -> Result<Completion, ServiceError> {
    let choice = json
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| ServiceError::Schema("missing choices".to_string()))?;
    let message = choice
        .get("message")
        .ok_or_else(|| ServiceError::Schema("missing message".to_string()))?;

    if let Some(refusal) = message.get("refusal").and_then(|r| r.as_str()) {
        return Err(ServiceError::Refusal(refusal.to_string()));
    }
    if choice.get("finish_reason").and_then(|f| f.as_str()) == Some("length") {
        return Err(ServiceError::Schema("output truncated at token limit".to_string()));
    }

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| ServiceError::Schema("missing message content".to_string()))?;

    let usage = json.get("usage");
    let tokens = |key: &str| {
        usage
            .and_then(|u| u.get(key))
            .and_then(|t| t.as_u64())
            .unwrap_or(0)
    };

    Ok(Completion {
        content: content.to_string(),
        usage: TokenUsage {
            prompt_tokens: tokens("prompt_tokens"),
            completion_tokens: tokens("completion_tokens"),
        },
    })
}

pub fn create_completion(config: &CompletionConfig) -> Result<Box<dyn CompletionService>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledCompletion)),
        "openai" => Ok(Box::new(OpenAICompletion::new(config)?)),
        other => bail!("Unknown completion provider: {}", other),
    }
}

/// Dollar cost of `usage` at the configured per-million-token prices.
pub fn cost_usd(config: &CompletionConfig, usage: TokenUsage) -> f64 {
    (usage.prompt_tokens as f64 * config.input_cost_per_mtok
        + usage.completion_tokens as f64 * config.output_cost_per_mtok)
        / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_content_and_usage() {
        let body = json!({
            "choices": [{
                "message": {"role": "assistant", "content": "{\"a\":1}", "refusal": null},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 100, "completion_tokens": 20}
        });
        let c = parse_chat_response(&body).unwrap();
        assert_eq!(c.content, "{\"a\":1}");
        assert_eq!(c.usage.total(), 120);
    }

    #[test]
    fn refusal_is_classified() {
        let body = json!({
            "choices": [{"message": {"content": null, "refusal": "I can't help"}}]
        });
        assert!(matches!(
            parse_chat_response(&body),
            Err(ServiceError::Refusal(_))
        ));
    }

    #[test]
    fn truncated_output_is_schema_error() {
        let body = json!({
            "choices": [{"message": {"content": "{\"a\":"}, "finish_reason": "length"}]
        });
        assert!(matches!(
            parse_chat_response(&body),
            Err(ServiceError::Schema(_))
        ));
    }

    #[test]
    fn strict_mode_sends_schema() {
        let schema = json!({"type": "object"});
        let req = CompletionRequest {
            system: "s",
            user: "u",
            schema_name: "closeness",
            schema: &schema,
            mode: OutputMode::Strict,
        };
        let rf = response_format(&req);
        assert_eq!(rf["json_schema"]["strict"], true);
        assert_eq!(rf["json_schema"]["name"], "closeness");

        let lax = CompletionRequest {
            mode: OutputMode::JsonObject,
            ..req
        };
        assert_eq!(response_format(&lax), json!({"type": "json_object"}));
    }

    #[test]
    fn cost_uses_both_prices() {
        let config = CompletionConfig::default();
        let usage = TokenUsage {
            prompt_tokens: 1_000_000,
            completion_tokens: 1_000_000,
        };
        let cost = cost_usd(&config, usage);
        assert!((cost - (config.input_cost_per_mtok + config.output_cost_per_mtok)).abs() < 1e-9);
    }
}
