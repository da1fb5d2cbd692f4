//! Concrete provider adapters.

mod http;

pub mod anthropic;
pub use anthropic::AnthropicAdapter;

pub mod gemini;
pub use gemini::GeminiAdapter;

pub mod mock;
pub use mock::{MockAdapter, MockStep};

pub mod openai_compatible;
pub use openai_compatible::OpenAICompatibleAdapter;
