//! Adapter construction keyed on the provider descriptor.
//!
//! The orchestrator never picks a concrete adapter type. The registry hands a
//! [`ProviderDescriptor`] to [`AdapterFactory::create`], which selects the variant from
//! the descriptor's [`AdapterKind`]:
//!
//! | Kind | Adapter |
//! |------|---------|
//! | `openai_compatible` | [`OpenAICompatibleAdapter`] |
//! | `anthropic` | [`AnthropicAdapter`] |
//! | `gemini` | [`GeminiAdapter`] |
//! | `mock` | [`MockAdapter`] (prepared instance if one was supplied) |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{GenError, Result};
use crate::model_config::{AdapterKind, ProviderDescriptor};
use crate::providers::{AnthropicAdapter, GeminiAdapter, MockAdapter, OpenAICompatibleAdapter};
use crate::traits::ProviderAdapter;

/// Builds adapters for catalog entries.
#[derive(Debug, Clone, Default)]
pub struct AdapterFactory {
    timeout_override: Option<Duration>,
    prepared_mocks: HashMap<String, MockAdapter>,
}

impl AdapterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this timeout for every adapter instead of the descriptor's.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }

    /// Serve `mock` (and clones sharing its state) for `mock`-kind providers with its id.
    pub fn with_mock(mut self, mock: MockAdapter) -> Self {
        self.prepared_mocks
            .insert(mock.provider_id().to_string(), mock);
        self
    }

    /// Timeout applied to adapters for `descriptor`.
    pub fn timeout_for(&self, descriptor: &ProviderDescriptor) -> Duration {
        self.timeout_override
            .unwrap_or_else(|| Duration::from_secs(descriptor.timeout_seconds))
    }

    /// Create an adapter bound to `descriptor`, `model_id` and `credential`.
    ///
    /// # Errors
    ///
    /// - `ModelNotFound` if the descriptor lists models and `model_id` is not one of them
    /// - `CredentialMissing` if the provider requires a key and none was given
    /// - `Config` if the descriptor cannot produce a working client
    pub fn create(
        &self,
        descriptor: &ProviderDescriptor,
        model_id: &str,
        credential: Option<&str>,
        timeout: Duration,
    ) -> Result<Arc<dyn ProviderAdapter>> {
        if !descriptor.models.is_empty() && descriptor.model(model_id).is_none() {
            return Err(GenError::ModelNotFound {
                provider: descriptor.id.clone(),
                model: model_id.to_string(),
            });
        }
        if descriptor.requires_auth() && credential.is_none() {
            return Err(GenError::CredentialMissing(descriptor.id.clone()));
        }

        debug!(
            provider = %descriptor.id,
            model = model_id,
            kind = %descriptor.kind,
            "Creating adapter"
        );

        let key = credential.unwrap_or_default();
        let adapter: Arc<dyn ProviderAdapter> = match descriptor.kind {
            AdapterKind::OpenAICompatible => Arc::new(OpenAICompatibleAdapter::new(
                descriptor, model_id, credential, timeout,
            )?),
            AdapterKind::Anthropic => {
                Arc::new(AnthropicAdapter::new(descriptor, model_id, key, timeout)?)
            }
            AdapterKind::Gemini => Arc::new(GeminiAdapter::new(descriptor, model_id, key, timeout)?),
            AdapterKind::Mock => Arc::new(
                self.prepared_mocks
                    .get(&descriptor.id)
                    .map(|mock| mock.rebind(model_id))
                    .unwrap_or_else(|| MockAdapter::new(descriptor.id.clone(), model_id)),
            ),
        };
        Ok(adapter)
    }
}
