//! Credential lookup for provider registration.
//!
//! A credential source maps a provider id to a key. Absent keys and placeholder values
//! (copied `.env.example` leftovers such as `your-api-key-here`) both mean "not configured":
//! the registry skips that provider instead of building an adapter that fails on first use.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::model_config::ProviderDescriptor;

/// Provider id → credential lookup.
pub trait CredentialSource: Send + Sync {
    /// Raw credential for a provider, if any. Placeholder filtering happens in [`resolve`].
    fn credential(&self, provider: &ProviderDescriptor) -> Option<String>;
}

/// Whether a credential value is a placeholder rather than a real key.
pub fn is_placeholder(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lower = trimmed.to_lowercase();
    lower.starts_with("your")
        || (lower.starts_with('<') && lower.ends_with('>'))
        || (lower.starts_with("${") && lower.ends_with('}'))
        || lower == "changeme"
        || lower == "test-key"
        || lower.contains("xxx")
        || lower.contains("placeholder")
}

/// Look up a usable credential, discarding placeholders.
pub fn resolve(source: &dyn CredentialSource, provider: &ProviderDescriptor) -> Option<String> {
    source
        .credential(provider)
        .map(|value| value.trim().to_string())
        .filter(|value| !is_placeholder(value))
}

/// Credentials from process environment variables.
///
/// Reads the descriptor's `api_key_env`, else `<ID>_API_KEY`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentialSource;

impl CredentialSource for EnvCredentialSource {
    fn credential(&self, provider: &ProviderDescriptor) -> Option<String> {
        std::env::var(provider.credential_env()).ok()
    }
}

/// In-memory credentials, keyed by provider id.
#[derive(Debug, Default)]
pub struct StaticCredentialSource {
    keys: RwLock<HashMap<String, String>>,
}

impl StaticCredentialSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(self, provider_id: impl Into<String>, key: impl Into<String>) -> Self {
        self.set(provider_id, key);
        self
    }

    pub fn set(&self, provider_id: impl Into<String>, key: impl Into<String>) {
        self.keys.write().insert(provider_id.into(), key.into());
    }

    pub fn remove(&self, provider_id: &str) {
        self.keys.write().remove(provider_id);
    }
}

impl CredentialSource for StaticCredentialSource {
    fn credential(&self, provider: &ProviderDescriptor) -> Option<String> {
        self.keys.read().get(&provider.id).cloned()
    }
}

/// First-hit chain over several sources.
#[derive(Default)]
pub struct ChainedCredentialSource {
    sources: Vec<Box<dyn CredentialSource>>,
}

impl ChainedCredentialSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, source: impl CredentialSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }
}

impl CredentialSource for ChainedCredentialSource {
    fn credential(&self, provider: &ProviderDescriptor) -> Option<String> {
        self.sources.iter().find_map(|source| {
            source
                .credential(provider)
                .filter(|value| !is_placeholder(value))
        })
    }
}

/// Short, log-safe form of a key.
pub(crate) fn redact(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    format!("{}…", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn descriptor(id: &str) -> ProviderDescriptor {
        ProviderDescriptor {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_placeholder_patterns() {
        for value in [
            "",
            "   ",
            "your-api-key-here",
            "YOUR_KEY",
            "<api-key>",
            "${OPENAI_API_KEY}",
            "changeme",
            "sk-xxxxxxxx",
            "placeholder",
            "test-key",
        ] {
            assert!(is_placeholder(value), "{value:?} should be a placeholder");
        }
    }

    #[test]
    fn test_real_keys_are_not_placeholders() {
        for value in ["sk-proj-abc123", "AIzaSyD-example9", "gsk_live_42"] {
            assert!(!is_placeholder(value), "{value:?} should be accepted");
        }
    }

    #[test]
    fn test_static_source_resolve() {
        let source = StaticCredentialSource::new()
            .with("openai", "  sk-real  ")
            .with("anthropic", "your-key");

        assert_eq!(
            resolve(&source, &descriptor("openai")).as_deref(),
            Some("sk-real")
        );
        assert!(resolve(&source, &descriptor("anthropic")).is_none());
        assert!(resolve(&source, &descriptor("gemini")).is_none());

        source.remove("openai");
        assert!(resolve(&source, &descriptor("openai")).is_none());
    }

    #[test]
    #[serial]
    fn test_env_source_uses_default_variable() {
        std::env::set_var("CFTEST_PROVIDER_API_KEY", "sk-env");
        let found = EnvCredentialSource.credential(&descriptor("cftest-provider"));
        std::env::remove_var("CFTEST_PROVIDER_API_KEY");
        assert_eq!(found.as_deref(), Some("sk-env"));
    }

    #[test]
    #[serial]
    fn test_env_source_uses_descriptor_variable() {
        std::env::set_var("CFTEST_CUSTOM_KEY", "sk-custom");
        let provider = ProviderDescriptor {
            id: "whatever".to_string(),
            api_key_env: Some("CFTEST_CUSTOM_KEY".to_string()),
            ..Default::default()
        };
        let found = resolve(&EnvCredentialSource, &provider);
        std::env::remove_var("CFTEST_CUSTOM_KEY");
        assert_eq!(found.as_deref(), Some("sk-custom"));
    }

    #[test]
    fn test_chain_skips_placeholders() {
        let chain = ChainedCredentialSource::new()
            .push(StaticCredentialSource::new().with("openai", "changeme"))
            .push(StaticCredentialSource::new().with("openai", "sk-second"));
        assert_eq!(
            resolve(&chain, &descriptor("openai")).as_deref(),
            Some("sk-second")
        );
    }

    #[test]
    fn test_redact() {
        assert_eq!(redact("sk-abcdef"), "sk-a…");
    }
}
