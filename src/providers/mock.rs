//! Scripted test double behind the [`ProviderAdapter`] contract.
//!
//! A `MockAdapter` replays a queue of [`MockStep`]s: canned responses, upstream failures
//! or malformed payloads. When the queue is empty it answers with a default response.
//! Clones share all state, so a test can keep a handle after handing the adapter to the
//! registry and inspect call counts, recorded prompts and whether the last stream was
//! released.
//!
//! ```
//! use codeforge_llm::providers::MockAdapter;
//!
//! let mock = MockAdapter::new("mock", "mock-model")
//!     .with_failure(Some(503))
//!     .with_response("```rust\nfn main() {}\n```");
//! assert_eq!(mock.pending(), 2);
//! ```

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{GenError, Result};
use crate::traits::{GenerateOptions, GenerateResponse, ProviderAdapter};

/// One scripted outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum MockStep {
    /// Successful response with this text.
    Respond(String),
    /// Upstream failure with an optional HTTP status.
    Fail { status: Option<u16>, message: String },
    /// A 2xx body that cannot be decoded.
    Malformed,
}

#[derive(Debug)]
struct MockState {
    script: Mutex<VecDeque<MockStep>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
    stream_closed: AtomicBool,
    streams_opened: AtomicUsize,
}

/// Deterministic adapter for tests.
#[derive(Debug, Clone)]
pub struct MockAdapter {
    provider_id: String,
    model: String,
    context_length: usize,
    default_response: String,
    native_streaming: bool,
    vision: bool,
    function_calling: bool,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
    latency: Option<Duration>,
    state: Arc<MockState>,
}

impl MockAdapter {
    pub fn new(provider_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model: model.into(),
            context_length: 8192,
            default_response: "Mock response".to_string(),
            native_streaming: true,
            vision: false,
            function_calling: false,
            chunk_size: 16,
            chunk_delay: None,
            latency: None,
            state: Arc::new(MockState {
                script: Mutex::new(VecDeque::new()),
                prompts: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                stream_closed: AtomicBool::new(false),
                streams_opened: AtomicUsize::new(0),
            }),
        }
    }

    /// Same shared state, bound to another model.
    pub fn rebind(&self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self.clone()
        }
    }

    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.push(MockStep::Respond(text.into()));
        self
    }

    pub fn with_failure(self, status: Option<u16>) -> Self {
        self.push(MockStep::Fail {
            status,
            message: "scripted failure".to_string(),
        });
        self
    }

    pub fn with_malformed(self) -> Self {
        self.push(MockStep::Malformed);
        self
    }

    /// Response used once the script is exhausted.
    pub fn with_default_response(mut self, text: impl Into<String>) -> Self {
        self.default_response = text.into();
        self
    }

    /// Disable native streaming so the coordinator emulates it.
    pub fn without_streaming(mut self) -> Self {
        self.native_streaming = false;
        self
    }

    pub fn with_vision(mut self, vision: bool) -> Self {
        self.vision = vision;
        self
    }

    pub fn with_function_calling(mut self, enabled: bool) -> Self {
        self.function_calling = enabled;
        self
    }

    pub fn with_context_length(mut self, tokens: usize) -> Self {
        self.context_length = tokens;
        self
    }

    /// Characters per streamed chunk.
    pub fn with_chunk_size(mut self, chars: usize) -> Self {
        self.chunk_size = chars.max(1);
        self
    }

    /// Delay before each streamed chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Delay before `generate` answers.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Append a step to the shared script.
    pub fn push(&self, step: MockStep) {
        self.state.script.lock().push_back(step);
    }

    /// Number of generate/stream invocations so far.
    pub fn call_count(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Prompts received, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.state.prompts.lock().clone()
    }

    /// Scripted steps not yet consumed.
    pub fn pending(&self) -> usize {
        self.state.script.lock().len()
    }

    /// Whether the most recently opened stream has been released.
    pub fn stream_closed(&self) -> bool {
        self.state.stream_closed.load(Ordering::SeqCst)
    }

    /// Streams opened so far.
    pub fn streams_opened(&self) -> usize {
        self.state.streams_opened.load(Ordering::SeqCst)
    }

    fn next_step(&self, prompt: &str) -> MockStep {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        self.state.prompts.lock().push(prompt.to_string());
        self.state
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| MockStep::Respond(self.default_response.clone()))
    }

    fn resolve(&self, step: MockStep) -> Result<String> {
        match step {
            MockStep::Respond(text) => Ok(text),
            MockStep::Fail { status, message } => Err(GenError::request_failed(
                status,
                format!("{}: {}", self.provider_id, message),
            )),
            MockStep::Malformed => Err(GenError::ResponseParseError(format!(
                "{}: malformed payload",
                self.provider_id
            ))),
        }
    }
}

/// Flips the shared closed flag when the stream state is dropped.
struct CloseGuard(Arc<MockState>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.stream_closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn max_context_length(&self) -> usize {
        self.context_length
    }

    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<GenerateResponse> {
        let step = self.next_step(prompt);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let content = self.resolve(step)?;
        let completion = crate::tokenizer::estimate_tokens(&content);
        Ok(GenerateResponse::new(content, options.model_or(&self.model))
            .with_usage(crate::tokenizer::estimate_tokens(prompt), completion)
            .with_finish_reason("stop"))
    }

    async fn stream(
        &self,
        prompt: &str,
        _options: &GenerateOptions,
    ) -> Result<BoxStream<'static, Result<String>>> {
        if !self.native_streaming {
            return Err(GenError::NotSupported(format!(
                "{} streaming disabled",
                self.provider_id
            )));
        }

        let step = self.next_step(prompt);
        let text = self.resolve(step)?;
        let chars: Vec<char> = text.chars().collect();
        let chunks: VecDeque<String> = chars
            .chunks(self.chunk_size)
            .map(|c| c.iter().collect())
            .collect();

        self.state.stream_closed.store(false, Ordering::SeqCst);
        self.state.streams_opened.fetch_add(1, Ordering::SeqCst);
        let guard = CloseGuard(self.state.clone());
        let delay = self.chunk_delay;

        let stream = stream::unfold((chunks, guard), move |(mut chunks, guard)| async move {
            let chunk = chunks.pop_front()?;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Some((Ok(chunk), (chunks, guard)))
        });

        Ok(stream.boxed())
    }

    fn supports_streaming(&self) -> bool {
        self.native_streaming
    }

    fn supports_vision(&self) -> bool {
        self.vision
    }

    fn supports_function_calling(&self) -> bool {
        self.function_calling
    }
}
