//! Provider adapter contract.
//!
//! # WHY: One capability-tagged interface per backend
//!
//! The orchestrator never special-cases a provider. Every backend (HTTP APIs, local servers,
//! the test double) implements [`ProviderAdapter`], and the factory picks the concrete type
//! from the catalog entry. This keeps:
//! - **Testing** deterministic: `MockAdapter` stands in for network calls
//! - **Fallback** uniform: any adapter can replace another after a failed attempt
//! - **Streaming** uniform: adapters without incremental delivery are emulated by the
//!   streaming coordinator, not by the caller

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{GenError, Result};

/// Options for a single generate/stream call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Model override; the adapter's bound model is used when `None`.
    pub model: Option<String>,

    /// Sampling temperature.
    pub temperature: Option<f32>,

    /// Maximum number of output tokens.
    pub max_tokens: Option<usize>,

    /// System instruction placed before the prompt.
    pub system_prompt: Option<String>,

    /// Per-call deadline; overrides the adapter default.
    #[serde(skip)]
    pub timeout: Option<Duration>,

    /// Provider-specific fields merged verbatim into the request body.
    #[serde(default)]
    pub passthrough: HashMap<String, JsonValue>,
}

impl GenerateOptions {
    /// Options with a specific temperature.
    pub fn with_temperature(temperature: f32) -> Self {
        Self {
            temperature: Some(temperature),
            ..Default::default()
        }
    }

    /// Set the output token limit.
    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the system instruction.
    pub fn system(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Set the per-call deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a provider-specific body field.
    pub fn passthrough(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.passthrough.insert(key.into(), value);
        self
    }

    /// Resolve the model for this call.
    pub fn model_or<'a>(&'a self, bound: &'a str) -> &'a str {
        self.model.as_deref().unwrap_or(bound)
    }
}

/// Response from a non-streaming generate call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    /// The generated text.
    pub content: String,

    /// Model that produced the text.
    pub model: String,

    /// Number of tokens in the prompt.
    pub prompt_tokens: usize,

    /// Number of tokens in the completion.
    pub completion_tokens: usize,

    /// Finish reason (e.g., "stop", "length").
    pub finish_reason: Option<String>,

    /// True when the text was delivered as one terminal chunk by stream emulation.
    #[serde(default)]
    pub emulated_stream: bool,

    /// Additional metadata from the provider.
    #[serde(default)]
    pub metadata: HashMap<String, JsonValue>,
}

impl GenerateResponse {
    /// Create a new response.
    pub fn new(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            prompt_tokens: 0,
            completion_tokens: 0,
            finish_reason: None,
            emulated_stream: false,
            metadata: HashMap::new(),
        }
    }

    /// Set token usage.
    pub fn with_usage(mut self, prompt: usize, completion: usize) -> Self {
        self.prompt_tokens = prompt;
        self.completion_tokens = completion;
        self
    }

    /// Set finish reason.
    pub fn with_finish_reason(mut self, reason: impl Into<String>) -> Self {
        self.finish_reason = Some(reason.into());
        self
    }

    /// Add metadata to the response.
    pub fn with_metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Total tokens used.
    pub fn total_tokens(&self) -> usize {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Uniform client for one model-serving backend.
///
/// An adapter is bound to one provider descriptor, one credential and one default model.
/// It is created by [`crate::factory::AdapterFactory`] and owned by the registry.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider id this adapter is bound to.
    fn provider_id(&self) -> &str;

    /// Model used when no override is given.
    fn model(&self) -> &str;

    /// Maximum context window of the bound model.
    fn max_context_length(&self) -> usize;

    /// Generate a full completion. One outbound call per invocation.
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<GenerateResponse>;

    /// Generate incrementally.
    ///
    /// The returned stream is lazy, finite and cannot be restarted; dropping it releases
    /// the underlying connection.
    async fn stream(
        &self,
        _prompt: &str,
        _options: &GenerateOptions,
    ) -> Result<BoxStream<'static, Result<String>>> {
        Err(GenError::NotSupported(format!(
            "{} has no native streaming",
            self.provider_id()
        )))
    }

    /// Whether [`ProviderAdapter::stream`] delivers incrementally.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Whether the bound model accepts image input.
    fn supports_vision(&self) -> bool {
        false
    }

    /// Whether the bound model supports function/tool calling.
    fn supports_function_calling(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_response_builder() {
        let response = GenerateResponse::new("fn main() {}", "gpt-4o")
            .with_usage(10, 5)
            .with_finish_reason("stop");

        assert_eq!(response.content, "fn main() {}");
        assert_eq!(response.total_tokens(), 15);
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
        assert!(!response.emulated_stream);
    }

    #[test]
    fn test_options_builder() {
        let options = GenerateOptions::with_temperature(0.2)
            .max_tokens(512)
            .system("You write Rust.")
            .passthrough("top_k", serde_json::json!(40));

        assert_eq!(options.temperature, Some(0.2));
        assert_eq!(options.max_tokens, Some(512));
        assert_eq!(options.system_prompt.as_deref(), Some("You write Rust."));
        assert_eq!(options.passthrough["top_k"], serde_json::json!(40));
    }

    #[test]
    fn test_model_override() {
        let mut options = GenerateOptions::default();
        assert_eq!(options.model_or("bound"), "bound");
        options.model = Some("override".to_string());
        assert_eq!(options.model_or("bound"), "override");
    }

    #[test]
    fn test_options_timeout_not_serialized() {
        let options = GenerateOptions::default().timeout(Duration::from_secs(3));
        let json = serde_json::to_value(&options).unwrap();
        assert!(json.get("timeout").is_none());
    }
}
