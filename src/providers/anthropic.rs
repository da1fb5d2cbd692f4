//! Anthropic Messages API adapter.
//!
//! Sends `x-api-key` and `anthropic-version` headers to `{base}/v1/messages`. The system
//! instruction goes in the top-level `system` field rather than the message list.
//! Streaming uses server-sent events; only `content_block_delta` events with a
//! `text_delta` payload carry text.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::http::{build_client, map_sse_error, secret_header, send_json};
use super::openai_compatible::capability;
use crate::error::{GenError, Result};
use crate::model_config::ProviderDescriptor;
use crate::traits::{GenerateOptions, GenerateResponse, ProviderAdapter};

const API_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: usize = 4096;

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    messages: Vec<Message<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(flatten)]
    passthrough: &'a HashMap<String, JsonValue>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    model: String,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: usize,
    output_tokens: usize,
}

/// SSE event for streaming responses.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: DeltaBlock },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "error")]
    Error { error: StreamError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct DeltaBlock {
    #[serde(rename = "type")]
    delta_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
}

/// Anthropic (Claude) adapter.
#[derive(Debug)]
pub struct AnthropicAdapter {
    client: Client,
    provider_id: String,
    model: String,
    base_url: String,
    context_length: usize,
    vision: bool,
    function_calling: bool,
    timeout: Duration,
}

impl AnthropicAdapter {
    pub fn new(
        descriptor: &ProviderDescriptor,
        model_id: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let mut auth = HeaderMap::new();
        auth.insert("x-api-key", secret_header(api_key)?);
        auth.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        let client = build_client(&descriptor.headers, auth, timeout)?;

        let base_url = descriptor
            .resolved_base_url()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let card = descriptor.model(model_id);
        debug!(provider = %descriptor.id, model = model_id, "Created Anthropic adapter");

        Ok(Self {
            client,
            provider_id: descriptor.id.clone(),
            model: model_id.to_string(),
            base_url,
            context_length: card.map(|m| m.context_window).unwrap_or(200_000),
            vision: capability(descriptor.features.vision, card, |m| m.capabilities.vision),
            function_calling: capability(descriptor.features.function_calling, card, |m| {
                m.capabilities.function_calling
            }),
            timeout,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    fn request<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a GenerateOptions,
        stream: bool,
    ) -> MessagesRequest<'a> {
        MessagesRequest {
            model: options.model_or(&self.model),
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
            system: options.system_prompt.as_deref(),
            stream: stream.then_some(true),
            temperature: options.temperature,
            passthrough: &options.passthrough,
        }
    }

    fn parse_response(response: MessagesResponse) -> GenerateResponse {
        let content: String = response
            .content
            .into_iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text)
            .collect();

        let mut result = GenerateResponse::new(content, response.model);
        if let Some(usage) = response.usage {
            result = result.with_usage(usage.input_tokens, usage.output_tokens);
        }
        if let Some(reason) = response.stop_reason {
            result = result.with_finish_reason(reason);
        }
        result
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
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
        let response: MessagesResponse = send_json(
            &self.provider_id,
            self.client.post(self.endpoint()).json(&request),
            timeout,
        )
        .await?;
        Ok(Self::parse_response(response))
    }

    #[instrument(skip(self, prompt, options), fields(provider = %self.provider_id, model = %self.model))]
    async fn stream(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let request = self.request(prompt, options, true);
        let timeout = options.timeout.unwrap_or(self.timeout);
        let req_builder = self
            .client
            .post(self.endpoint())
            .timeout(timeout)
            .json(&request);

        let provider = self.provider_id.clone();
        let event_source = EventSource::new(req_builder).map_err(|e| {
            GenError::request_failed(None, format!("{}: stream failed: {}", provider, e))
        })?;

        let stream = stream::unfold(
            (event_source, provider),
            |(mut es, provider)| async move {
                match es.next().await {
                    Some(Ok(Event::Open)) => Some((Ok(String::new()), (es, provider))),
                    Some(Ok(Event::Message(msg))) => {
                        match serde_json::from_str::<StreamEvent>(&msg.data) {
                            Ok(StreamEvent::ContentBlockDelta { delta }) => {
                                let text = if delta.delta_type == "text_delta" {
                                    delta.text.unwrap_or_default()
                                } else {
                                    String::new()
                                };
                                Some((Ok(text), (es, provider)))
                            }
                            Ok(StreamEvent::MessageStop) => {
                                es.close();
                                None
                            }
                            Ok(StreamEvent::Error { error }) => {
                                warn!(provider = %provider, "Stream error: {}", error.message);
                                es.close();
                                let err = GenError::request_failed(
                                    None,
                                    format!("{}: {}", provider, error.message),
                                );
                                Some((Err(err), (es, provider)))
                            }
                            Ok(StreamEvent::Other) => Some((Ok(String::new()), (es, provider))),
                            Err(e) => {
                                let err = GenError::ResponseParseError(format!(
                                    "{}: stream event: {}",
                                    provider, e
                                ));
                                Some((Err(err), (es, provider)))
                            }
                        }
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
        true
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
    use crate::model_config::CodeforgeConfig;

    fn adapter() -> AnthropicAdapter {
        let mut descriptor = CodeforgeConfig::builtin_defaults()
            .get_provider("anthropic")
            .cloned()
            .unwrap();
        descriptor.base_url_env = None;
        AnthropicAdapter::new(
            &descriptor,
            "claude-3-5-haiku-20241022",
            "sk-ant-test",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(adapter().endpoint(), "https://api.anthropic.com/v1/messages");
    }

    #[test]
    fn test_request_puts_system_at_top_level() {
        let adapter = adapter();
        let options = GenerateOptions::default().system("review code");
        let body = serde_json::to_value(adapter.request("hi", &options, true)).unwrap();
        assert_eq!(body["system"], "review code");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_parse_response_joins_text_blocks() {
        let json = r#"{
            "id": "msg_1", "type": "message", "role": "assistant",
            "content": [{"type": "text", "text": "Hello "}, {"type": "text", "text": "world"}],
            "model": "claude-3-5-haiku-20241022",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 5, "output_tokens": 2}
        }"#;
        let response: MessagesResponse = serde_json::from_str(json).unwrap();
        let parsed = AnthropicAdapter::parse_response(response);
        assert_eq!(parsed.content, "Hello world");
        assert_eq!(parsed.total_tokens(), 7);
        assert_eq!(parsed.finish_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn test_stream_event_parsing() {
        let delta = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"fn"}}"#;
        match serde_json::from_str::<StreamEvent>(delta).unwrap() {
            StreamEvent::ContentBlockDelta { delta } => assert_eq!(delta.text.as_deref(), Some("fn")),
            other => panic!("unexpected event {:?}", other),
        }
        let ping = r#"{"type":"ping"}"#;
        assert!(matches!(
            serde_json::from_str::<StreamEvent>(ping).unwrap(),
            StreamEvent::Other
        ));
    }

    #[test]
    fn test_capabilities() {
        let adapter = adapter();
        assert!(adapter.supports_streaming());
        assert!(adapter.supports_vision());
        assert_eq!(adapter.max_context_length(), 200_000);
    }
}
