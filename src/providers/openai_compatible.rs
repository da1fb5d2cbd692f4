//! Adapter for any API that follows the OpenAI chat-completions format.
//!
//! Covers OpenAI itself plus Groq, DeepSeek, Mistral, OpenRouter, xAI, local Ollama
//! (`/v1` endpoint) and runtime-registered custom endpoints.
//!
//! # Configuration Example
//!
//! ```toml
//! [[providers]]
//! id = "groq"
//! name = "Groq"
//! kind = "openai_compatible"
//! api_key_env = "GROQ_API_KEY"
//! base_url = "https://api.groq.com/openai/v1"
//!
//! [providers.headers]
//! Accept-Language = "en-US,en"
//! ```

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::header::{self, HeaderMap};
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::http::{build_client, map_sse_error, secret_header, send_json};
use crate::credentials::redact;
use crate::error::{GenError, Result};
use crate::model_config::{ModelDescriptor, ProviderDescriptor};
use crate::traits::{GenerateOptions, GenerateResponse, ProviderAdapter};

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(flatten)]
    passthrough: &'a HashMap<String, JsonValue>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: usize,
    completion_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

// ============================================================================
// Adapter
// ============================================================================

/// Adapter for OpenAI-compatible chat-completions endpoints.
#[derive(Debug)]
pub struct OpenAICompatibleAdapter {
    client: Client,
    provider_id: String,
    model: String,
    base_url: String,
    context_length: usize,
    streaming: bool,
    vision: bool,
    function_calling: bool,
    timeout: Duration,
}

impl OpenAICompatibleAdapter {
    /// Bind an adapter to `descriptor`, `model_id` and an optional credential.
    pub fn new(
        descriptor: &ProviderDescriptor,
        model_id: &str,
        api_key: Option<&str>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = descriptor.resolved_base_url().ok_or_else(|| {
            GenError::Config(format!(
                "Provider '{}' requires 'base_url' or 'base_url_env' to be set",
                descriptor.id
            ))
        })?;

        let mut auth = HeaderMap::new();
        if let Some(key) = api_key {
            auth.insert(
                header::AUTHORIZATION,
                secret_header(&format!("Bearer {}", key))?,
            );
            debug!(provider = %descriptor.id, key = %redact(key), "Using API key");
        }
        let client = build_client(&descriptor.headers, auth, timeout)?;

        let card = descriptor.model(model_id);
        debug!(
            provider = %descriptor.id,
            model = model_id,
            base_url = %base_url,
            "Created OpenAI-compatible adapter"
        );

        Ok(Self {
            client,
            provider_id: descriptor.id.clone(),
            model: model_id.to_string(),
            base_url,
            context_length: card.map(|m| m.context_window).unwrap_or(128_000),
            streaming: descriptor.features.streaming
                && card.map(|m| m.capabilities.streaming).unwrap_or(true),
            vision: capability(descriptor.features.vision, card, |m| m.capabilities.vision),
            function_calling: capability(descriptor.features.function_calling, card, |m| {
                m.capabilities.function_calling
            }),
            timeout,
        })
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn request<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a GenerateOptions,
        stream: bool,
    ) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &options.system_prompt {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });

        ChatRequest {
            model: options.model_or(&self.model),
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stream: stream.then_some(true),
            passthrough: &options.passthrough,
        }
    }
}

/// Provider-level flag narrowed by the model card when one exists.
pub(crate) fn capability(
    provider_flag: bool,
    card: Option<&ModelDescriptor>,
    model_flag: impl Fn(&ModelDescriptor) -> bool,
) -> bool {
    match card {
        Some(model) => provider_flag && model_flag(model),
        None => provider_flag,
    }
}

#[async_trait]
impl ProviderAdapter for OpenAICompatibleAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn max_context_length(&self) -> usize {
        self.context_length
    }

    #[instrument(skip(self, prompt, options), fields(provider = %self.provider_id, model = %self.model))]
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<GenerateResponse> {
        let request = self.request(prompt, options, false);
        let timeout = options.timeout.unwrap_or(self.timeout);

        let response: ChatResponse = send_json(
            &self.provider_id,
            self.client.post(self.chat_completions_url()).json(&request),
            timeout,
        )
        .await?;

        let choice = response.choices.into_iter().next().ok_or_else(|| {
            GenError::ResponseParseError(format!("{}: response has no choices", self.provider_id))
        })?;

        let mut result = GenerateResponse::new(
            choice.message.content.unwrap_or_default(),
            response.model.unwrap_or_else(|| request.model.to_string()),
        );
        if let Some(usage) = response.usage {
            result = result.with_usage(usage.prompt_tokens, usage.completion_tokens);
        }
        if let Some(reason) = choice.finish_reason {
            result = result.with_finish_reason(reason);
        }
        Ok(result)
    }

    #[instrument(skip(self, prompt, options), fields(provider = %self.provider_id, model = %self.model))]
    async fn stream(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<BoxStream<'static, Result<String>>> {
        if !self.streaming {
            return Err(GenError::NotSupported(format!(
                "{} model {} does not stream",
                self.provider_id, self.model
            )));
        }

        let request = self.request(prompt, options, true);
        let timeout = options.timeout.unwrap_or(self.timeout);
        let req_builder = self
            .client
            .post(self.chat_completions_url())
            .timeout(timeout)
            .json(&request);

        let provider = self.provider_id.clone();
        let event_source = EventSource::new(req_builder).map_err(|e| {
            warn!(provider = %provider, "Failed to create event source: {}", e);
            GenError::request_failed(None, format!("{}: stream failed: {}", provider, e))
        })?;

        let stream = stream::unfold(
            (event_source, provider),
            |(mut es, provider)| async move {
                match es.next().await {
                    Some(Ok(Event::Open)) => Some((Ok(String::new()), (es, provider))),
                    Some(Ok(Event::Message(msg))) => {
                        if msg.data == "[DONE]" {
                            es.close();
                            return None;
                        }
                        let item = match serde_json::from_str::<ChatStreamChunk>(&msg.data) {
                            Ok(chunk) => Ok(chunk
                                .choices
                                .into_iter()
                                .next()
                                .and_then(|c| c.delta)
                                .and_then(|d| d.content)
                                .unwrap_or_default()),
                            Err(e) => {
                                warn!(provider = %provider, "Failed to parse stream chunk: {}", e);
                                Err(GenError::ResponseParseError(format!(
                                    "{}: stream chunk: {}",
                                    provider, e
                                )))
                            }
                        };
                        Some((item, (es, provider)))
                    }
                    Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => None,
                    Some(Err(e)) => {
                        es.close();
                        let err = map_sse_error(&provider, e);
                        Some((Err(err), (es, provider)))
                    }
                }
            },
        );

        Ok(stream.boxed())
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    fn supports_vision(&self) -> bool {
        self.vision
    }

    fn supports_function_calling(&self) -> bool {
        self.function_calling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_config::{AuthRequirement, CodeforgeConfig};

    fn openai() -> ProviderDescriptor {
        CodeforgeConfig::builtin_defaults()
            .get_provider("openai")
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_chat_completions_url() {
        let mut descriptor = openai();
        descriptor.base_url = Some("https://api.example.com/v1/".to_string());
        descriptor.base_url_env = None;
        let adapter =
            OpenAICompatibleAdapter::new(&descriptor, "gpt-4o", Some("sk-1"), Duration::from_secs(5))
                .unwrap();
        assert_eq!(
            adapter.chat_completions_url(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_missing_base_url() {
        let descriptor = ProviderDescriptor {
            id: "nowhere".to_string(),
            auth: AuthRequirement::None,
            ..Default::default()
        };
        let result = OpenAICompatibleAdapter::new(&descriptor, "m", None, Duration::from_secs(5));
        assert!(matches!(result, Err(GenError::Config(_))));
    }

    #[test]
    fn test_capabilities_follow_model_card() {
        let descriptor = openai();
        let adapter =
            OpenAICompatibleAdapter::new(&descriptor, "gpt-4o", Some("sk-1"), Duration::from_secs(5))
                .unwrap();
        assert!(adapter.supports_streaming());
        assert!(adapter.supports_vision());
        assert!(adapter.supports_function_calling());
        assert_eq!(adapter.max_context_length(), 128_000);
    }

    #[test]
    fn test_toml_provider_streams_without_feature_tables() {
        let config = CodeforgeConfig::from_toml(
            r#"
[[providers]]
id = "edge"
name = "Edge"
kind = "openai_compatible"
auth = "none"
base_url = "http://127.0.0.1:8080/v1"

[[providers.models]]
id = "tiny"
name = "Tiny"
"#,
        )
        .unwrap();
        let descriptor = config.get_provider("edge").unwrap();
        let adapter =
            OpenAICompatibleAdapter::new(descriptor, "tiny", None, Duration::from_secs(5)).unwrap();
        assert!(adapter.supports_streaming());
        assert!(!adapter.supports_vision());
    }

    #[test]
    fn test_request_body_merges_passthrough() {
        let descriptor = openai();
        let adapter = OpenAICompatibleAdapter::new(
            &descriptor,
            "gpt-4o-mini",
            Some("sk-1"),
            Duration::from_secs(5),
        )
        .unwrap();
        let options = GenerateOptions::with_temperature(0.1)
            .system("be terse")
            .passthrough("seed", serde_json::json!(7));

        let body = serde_json::to_value(adapter.request("hi", &options, false)).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["seed"], 7);
        assert!(body.get("stream").is_none());
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_response_parsing() {
        let json = r#"{
            "model": "gpt-4o",
            "choices": [{"message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        }"#;
        let response: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.choices[0].message.content.as_deref(), Some("hello"));
        assert_eq!(response.usage.unwrap().completion_tokens, 1);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_request_failed() {
        let mut descriptor = openai();
        descriptor.base_url = Some("http://127.0.0.1:1".to_string());
        descriptor.base_url_env = None;
        let adapter =
            OpenAICompatibleAdapter::new(&descriptor, "gpt-4o", Some("sk-1"), Duration::from_secs(2))
                .unwrap();

        let err = adapter
            .generate("ping", &GenerateOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_recoverable(), "unexpected error: {err:?}");
    }
}
