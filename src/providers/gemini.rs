//! Google Gemini adapter (`models/{model}:generateContent`).
//!
//! This adapter does not stream natively. [`crate::streaming::StreamingCoordinator`]
//! performs the full call and delivers one terminal fragment marked as emulated.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument};

use super::http::{build_client, secret_header, send_json};
use super::openai_compatible::capability;
use crate::error::{GenError, Result};
use crate::model_config::ProviderDescriptor;
use crate::traits::{GenerateOptions, GenerateResponse, ProviderAdapter};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    generation_config: GenerationConfig,
    #[serde(flatten)]
    passthrough: &'a HashMap<String, JsonValue>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: usize,
    #[serde(default)]
    candidates_token_count: usize,
}

/// Gemini `generateContent` adapter.
#[derive(Debug)]
pub struct GeminiAdapter {
    client: Client,
    provider_id: String,
    model: String,
    base_url: String,
    context_length: usize,
    vision: bool,
    function_calling: bool,
    timeout: Duration,
}

impl GeminiAdapter {
    pub fn new(
        descriptor: &ProviderDescriptor,
        model_id: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let mut auth = HeaderMap::new();
        auth.insert("x-goog-api-key", secret_header(api_key)?);
        let client = build_client(&descriptor.headers, auth, timeout)?;

        let card = descriptor.model(model_id);
        debug!(provider = %descriptor.id, model = model_id, "Created Gemini adapter");

        Ok(Self {
            client,
            provider_id: descriptor.id.clone(),
            model: model_id.to_string(),
            base_url: descriptor
                .resolved_base_url()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            context_length: card.map(|m| m.context_window).unwrap_or(1_048_576),
            vision: capability(descriptor.features.vision, card, |m| m.capabilities.vision),
            function_calling: capability(descriptor.features.function_calling, card, |m| {
                m.capabilities.function_calling
            }),
            timeout,
        })
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            model
        )
    }

    fn request<'a>(&self, prompt: &'a str, options: &'a GenerateOptions) -> GenerateContentRequest<'a> {
        GenerateContentRequest {
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part { text: prompt }],
            }],
            system_instruction: options.system_prompt.as_deref().map(|system| Content {
                role: None,
                parts: vec![Part { text: system }],
            }),
            generation_config: GenerationConfig {
                temperature: options.temperature,
                max_output_tokens: options.max_tokens,
            },
            passthrough: &options.passthrough,
        }
    }

    fn parse_response(
        &self,
        model: &str,
        response: GenerateContentResponse,
    ) -> Result<GenerateResponse> {
        let candidate = response.candidates.into_iter().next().ok_or_else(|| {
            GenError::ResponseParseError(format!("{}: response has no candidates", self.provider_id))
        })?;

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        let mut result =
            GenerateResponse::new(text, response.model_version.unwrap_or_else(|| model.to_string()));
        if let Some(usage) = response.usage_metadata {
            result = result.with_usage(usage.prompt_token_count, usage.candidates_token_count);
        }
        if let Some(reason) = candidate.finish_reason {
            result = result.with_finish_reason(reason.to_lowercase());
        }
        Ok(result)
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
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
        let model = options.model_or(&self.model);
        let request = self.request(prompt, options);
        let timeout = options.timeout.unwrap_or(self.timeout);

        let response: GenerateContentResponse = send_json(
            &self.provider_id,
            self.client.post(self.endpoint(model)).json(&request),
            timeout,
        )
        .await?;

        self.parse_response(model, response)
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

    fn adapter() -> GeminiAdapter {
        let descriptor = CodeforgeConfig::builtin_defaults()
            .get_provider("gemini")
            .cloned()
            .unwrap();
        GeminiAdapter::new(&descriptor, "gemini-2.0-flash", "AIza-test", Duration::from_secs(5))
            .unwrap()
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(
            adapter().endpoint("gemini-2.0-flash"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }

    #[test]
    fn test_no_native_streaming() {
        assert!(!adapter().supports_streaming());
    }

    #[tokio::test]
    async fn test_stream_is_not_supported() {
        let result = adapter().stream("hi", &GenerateOptions::default()).await;
        assert!(matches!(result, Err(GenError::NotSupported(_))));
    }

    #[test]
    fn test_request_shape() {
        let adapter = adapter();
        let options = GenerateOptions::with_temperature(0.3)
            .max_tokens(64)
            .system("be brief");
        let body = serde_json::to_value(adapter.request("hello", &options)).unwrap();
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 64);
    }

    #[test]
    fn test_parse_response() {
        let json = r#"{
            "candidates": [{"content": {"parts": [{"text": "a"}, {"text": "b"}], "role": "model"}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6}
        }"#;
        let adapter = adapter();
        let response: GenerateContentResponse = serde_json::from_str(json).unwrap();
        let parsed = adapter.parse_response("gemini-2.0-flash", response).unwrap();
        assert_eq!(parsed.content, "ab");
        assert_eq!(parsed.total_tokens(), 6);
        assert_eq!(parsed.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_parse_response_without_candidates() {
        let adapter = adapter();
        let response: GenerateContentResponse = serde_json::from_str("{}").unwrap();
        assert!(matches!(
            adapter.parse_response("m", response),
            Err(GenError::ResponseParseError(_))
        ));
    }
}
