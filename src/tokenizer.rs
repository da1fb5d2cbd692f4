//! Token counting used to fit prompt context into a model's window.

use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};

use crate::error::{GenError, Result};

/// Tokenizer for counting and trimming prompt text.
pub struct Tokenizer {
    encoder: CoreBPE,
    model: String,
}

impl Tokenizer {
    /// Create a tokenizer for a specific model.
    ///
    /// Falls back to cl100k_base for models without a known encoding.
    pub fn for_model(model: &str) -> Result<Self> {
        let encoder = match model {
            m if m.contains("gpt-4o") || m.contains("o1") || m.contains("o3") => o200k_base(),
            _ => cl100k_base(),
        }
        .map_err(|e| GenError::Config(format!("Failed to load tokenizer: {}", e)))?;

        Ok(Self {
            encoder,
            model: model.to_string(),
        })
    }

    /// Count the number of tokens in the text.
    pub fn count_tokens(&self, text: &str) -> usize {
        self.encoder.encode_with_special_tokens(text).len()
    }

    /// Truncate text to fit within a token limit.
    pub fn truncate(&self, text: &str, max_tokens: usize) -> String {
        let tokens = self.encoder.encode_with_special_tokens(text);
        if tokens.len() <= max_tokens {
            return text.to_string();
        }
        self.encoder
            .decode(tokens[..max_tokens].to_vec())
            .unwrap_or_default()
    }

    /// Get the model this tokenizer is configured for.
    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Rough token estimate (4 chars per token) used when no encoder is available.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}
