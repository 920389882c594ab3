//! Language-model boundary.
//!
//! [`GenerationClient::generate`] turns a [`PromptPayload`] into a
//! [`QueryResult`] with exactly one call to a [`LanguageModel`]. It never
//! retries and never substitutes a default answer for a failure.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::GenerationConfig;
use crate::error::{RagError, Result};
use crate::models::{QueryResult, SourceDocument};
use crate::provider::{self, generation_error, generation_failure};
use crate::retrieval::PromptPayload;

pub const MIN_TEMPERATURE: f32 = 0.0;
pub const MAX_TEMPERATURE: f32 = 2.0;

/// One chat completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;
    /// Return the completion text for `request`.
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

pub fn validate_temperature(temperature: f32) -> Result<()> {
    if !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&temperature) {
        return Err(RagError::invalid(
            "temperature",
            format!(
                "{} is outside [{:.1}, {:.1}]",
                temperature, MIN_TEMPERATURE, MAX_TEMPERATURE
            ),
        ));
    }
    Ok(())
}

/// Bind the configured chat model to a caller-supplied key.
pub fn create_language_model(
    config: &GenerationConfig,
    api_key: Option<&str>,
) -> Result<Arc<dyn LanguageModel>> {
    let key = provider::check_key(api_key, &config.key_prefix)?;
    Ok(Arc::new(OpenAiChatModel::new(config, key)?))
}

/// Chat model behind an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiChatModel {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
}

impl OpenAiChatModel {
    pub fn new(config: &GenerationConfig, api_key: String) -> Result<Self> {
        Ok(Self {
            client: provider::build_client(config.timeout_secs)?,
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    fn request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
            "temperature": request.temperature,
            "stream": false,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        body
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        debug!(url = %self.url, model = %self.model, temperature = request.temperature, "requesting completion");

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| provider::map_transport_error(e, self.timeout_secs, generation_failure))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| provider::map_transport_error(e, self.timeout_secs, generation_failure))?;

        if !status.is_success() {
            return Err(provider::map_http_error(status, &text, generation_failure));
        }

        let json: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| generation_error(format!("invalid JSON response: {}", e)))?;
        parse_chat_response(&json)
    }
}

/// Extract `choices[0].message.content`.
fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| generation_error("invalid response: missing choices[0].message.content".to_string()))
}

pub struct GenerationClient {
    model: Arc<dyn LanguageModel>,
    max_tokens: Option<u32>,
}

impl GenerationClient {
    pub fn new(model: Arc<dyn LanguageModel>, max_tokens: Option<u32>) -> Self {
        Self { model, max_tokens }
    }

    /// Generate an answer for `payload`. The cited segments are returned as
    /// the result's sources whether or not the model used them.
    pub async fn generate(&self, payload: &PromptPayload, temperature: f32) -> Result<QueryResult> {
        validate_temperature(temperature)?;

        let request = CompletionRequest {
            system: payload.system.clone(),
            user: payload.user.clone(),
            temperature,
            max_tokens: self.max_tokens,
        };
        let answer = self.model.complete(&request).await?;
        let answer = answer.trim();
        if answer.is_empty() {
            return Err(generation_error(format!(
                "model '{}' returned an empty completion",
                self.model.model_name()
            )));
        }

        Ok(QueryResult {
            result: answer.to_string(),
            source_documents: payload.cited.iter().map(SourceDocument::from).collect(),
        })
    }
}
