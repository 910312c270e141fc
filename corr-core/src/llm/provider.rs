//! LLM provider implementations: Anthropic and a deterministic mock for tests.
#![allow(clippy::cast_precision_loss)]

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProviderError;

/// Token usage from one LLM call, used by the budget ledger to compute
/// the call's realized cost.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// An LLM backend capable of a single free-form text completion.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    fn model_id(&self) -> &str;

    async fn call(&self, prompt: &str, temperature: f64) -> Result<(String, TokenUsage), ProviderError>;
}

#[async_trait::async_trait]
impl LlmProvider for Box<dyn LlmProvider> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn model_id(&self) -> &str {
        (**self).model_id()
    }

    async fn call(&self, prompt: &str, temperature: f64) -> Result<(String, TokenUsage), ProviderError> {
        (**self).call(prompt, temperature).await
    }
}

/// Placeholder used when no LLM credentials are configured: every call
/// fails fast with an auth error, so promoted pairs fall back to their
/// rule-based scores and the run completes as degraded.
#[derive(Debug, Default)]
pub struct DisabledLlmProvider;

#[async_trait::async_trait]
impl LlmProvider for DisabledLlmProvider {
    fn name(&self) -> &str {
        "disabled"
    }

    fn model_id(&self) -> &str {
        "disabled"
    }

    async fn call(&self, _prompt: &str, _temperature: f64) -> Result<(String, TokenUsage), ProviderError> {
        Err(ProviderError::AuthFailed {
            provider: "llm".to_string(),
            detail: "no API key configured".to_string(),
        })
    }
}

#[derive(Debug)]
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            base_url: "https://api.anthropic.com".to_string(),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f64,
    messages: Vec<AnthropicMessage>,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContent {
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn call(&self, prompt: &str, temperature: f64) -> Result<(String, TokenUsage), ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: 1024,
            temperature,
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        debug!(model = %self.model, "calling Anthropic API");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network {
                provider: "anthropic".to_string(),
                detail: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(if status.as_u16() == 401 {
                ProviderError::AuthFailed {
                    provider: "anthropic".to_string(),
                    detail: text,
                }
            } else {
                ProviderError::InvalidRequest {
                    provider: "anthropic".to_string(),
                    detail: format!("{status}: {text}"),
                }
            });
        }

        let parsed: AnthropicResponse = resp.json().await.map_err(|e| ProviderError::Malformed {
            provider: "anthropic".to_string(),
            detail: e.to_string(),
        })?;

        let text = parsed
            .content
            .into_iter()
            .next()
            .map(|c| c.text)
            .unwrap_or_default();
        let usage = TokenUsage {
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        };
        Ok((text, usage))
    }
}

/// Deterministic provider for tests: returns a fixed verdict regardless of
/// prompt content.
#[derive(Debug)]
pub struct MockLlmProvider {
    pub response: String,
    pub usage: TokenUsage,
}

impl MockLlmProvider {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 20,
            },
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockLlmProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model_id(&self) -> &str {
        "mock-1"
    }

    async fn call(&self, _prompt: &str, _temperature: f64) -> Result<(String, TokenUsage), ProviderError> {
        Ok((self.response.clone(), self.usage.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_provider_returns_fixed_response() {
        let provider = MockLlmProvider::new("hello");
        let (text, usage) = provider.call("anything", 0.0).await.unwrap();
        assert_eq!(text, "hello");
        assert_eq!(usage.input_tokens, 100);
    }
}
