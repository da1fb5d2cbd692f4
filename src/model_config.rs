//! Provider/model catalog and TOML configuration.
//!
//! # Overview
//!
//! The configuration file (`codeforge.toml`) defines:
//! - The provider catalog: one [`ProviderDescriptor`] per backend with its [`ModelDescriptor`]s
//! - The default active provider/model pair
//! - Scoring weights, pipeline budgets and review weights
//!
//! # Configuration File Location
//!
//! The config file is loaded from (in order of priority):
//! 1. `CODEFORGE_CONFIG` environment variable
//! 2. `./codeforge.toml` (current working directory)
//! 3. `~/.codeforge/codeforge.toml` (user config)
//! 4. Built-in default configuration
//!
//! # Example Configuration
//!
//! ```toml
//! [defaults]
//! provider = "openai"
//! model = "gpt-4o-mini"
//!
//! [[providers]]
//! id = "openai"
//! name = "OpenAI"
//! kind = "openai_compatible"
//! api_key_env = "OPENAI_API_KEY"
//! base_url = "https://api.openai.com/v1"
//!
//! [providers.features]
//! vision = true
//! function_calling = true
//! streaming = true
//!
//! [[providers.models]]
//! id = "gpt-4o"
//! name = "GPT-4o"
//! context_window = 128000
//! strengths = ["reasoning", "code"]
//! best_for = ["code generation", "vision"]
//!
//! [providers.models.pricing]
//! input_per_1k = 0.0025
//! output_per_1k = 0.01
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

use crate::error::GenError;
use crate::pipeline::PipelineConfig;
use crate::review::ReviewWeights;
use crate::scoring::ScoringWeights;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML configuration.
    #[error("Failed to parse TOML config: {0}")]
    ParseError(String),

    /// Invalid configuration (duplicate ids, dangling defaults, bad weights).
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for GenError {
    fn from(err: ConfigError) -> Self {
        GenError::Config(err.to_string())
    }
}

// ============================================================================
// Provider kinds and auth
// ============================================================================

/// Wire protocol family of a provider; selects the concrete adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// OpenAI chat-completions API and compatible servers.
    #[default]
    #[serde(rename = "openai_compatible", alias = "openai")]
    OpenAICompatible,
    /// Anthropic Messages API.
    Anthropic,
    /// Google Gemini generateContent API.
    Gemini,
    /// Scripted test double.
    Mock,
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterKind::OpenAICompatible => write!(f, "openai_compatible"),
            AdapterKind::Anthropic => write!(f, "anthropic"),
            AdapterKind::Gemini => write!(f, "gemini"),
            AdapterKind::Mock => write!(f, "mock"),
        }
    }
}

/// Whether a provider needs a credential before an adapter can be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthRequirement {
    /// An API key must be present.
    #[default]
    ApiKey,
    /// No credential (local servers).
    None,
}

/// Provider-level feature flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFeatures {
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub function_calling: bool,
    #[serde(default = "default_true")]
    pub streaming: bool,
}

impl Default for ProviderFeatures {
    fn default() -> Self {
        Self {
            vision: false,
            function_calling: false,
            streaming: true,
        }
    }
}

// ============================================================================
// Model Descriptor
// ============================================================================

/// Capability flags of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub function_calling: bool,
    #[serde(default = "default_true")]
    pub streaming: bool,
    #[serde(default)]
    pub json_mode: bool,
}

fn default_true() -> bool {
    true
}

/// Streaming on, everything else off. Also used when a model omits `capabilities`.
impl Default for ModelCapabilities {
    fn default() -> Self {
        Self {
            vision: false,
            function_calling: false,
            streaming: true,
            json_mode: false,
        }
    }
}

/// Price per 1000 tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelPricing {
    #[serde(default)]
    pub input_per_1k: f64,
    #[serde(default)]
    pub output_per_1k: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl ModelPricing {
    /// USD pricing.
    pub fn usd(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
            currency: default_currency(),
        }
    }
}

/// Catalog entry for one model. Immutable once its provider is registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Model identifier sent to the provider (e.g., "gpt-4o").
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Context window in tokens.
    #[serde(default)]
    pub context_window: usize,

    /// Maximum output tokens.
    #[serde(default)]
    pub max_output_tokens: usize,

    #[serde(default)]
    pub capabilities: ModelCapabilities,

    /// What the model is good at (e.g., "reasoning", "code").
    #[serde(default)]
    pub strengths: Vec<String>,

    /// Task families the model is recommended for.
    #[serde(default)]
    pub best_for: Vec<String>,

    #[serde(default)]
    pub pricing: Option<ModelPricing>,

    #[serde(default)]
    pub description: String,
}

impl Default for ModelDescriptor {
    fn default() -> Self {
        Self {
            id: "unknown".to_string(),
            name: "Unknown Model".to_string(),
            context_window: 0,
            max_output_tokens: 0,
            capabilities: ModelCapabilities::default(),
            strengths: Vec::new(),
            best_for: Vec::new(),
            pricing: None,
            description: String::new(),
        }
    }
}

impl ModelDescriptor {
    /// Whether the model is tagged for coding work.
    pub fn supports_coding(&self) -> bool {
        self.strengths
            .iter()
            .chain(self.best_for.iter())
            .any(|tag| {
                let tag = tag.to_lowercase();
                tag.contains("code") || tag.contains("coding")
            })
    }
}

// ============================================================================
// Provider Descriptor
// ============================================================================

/// Catalog entry for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /// Unique provider id (e.g., "openai").
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Adapter family.
    #[serde(default)]
    pub kind: AdapterKind,

    #[serde(default)]
    pub auth: AuthRequirement,

    /// Environment variable holding the API key. Defaults to `<ID>_API_KEY`.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Base endpoint.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Environment variable overriding the base endpoint.
    #[serde(default)]
    pub base_url_env: Option<String>,

    #[serde(default)]
    pub features: ProviderFeatures,

    /// Model used when a caller names only the provider.
    #[serde(default)]
    pub default_model: Option<String>,

    #[serde(default)]
    pub models: Vec<ModelDescriptor>,

    /// Extra HTTP headers sent with every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_timeout() -> u64 {
    120
}

impl Default for ProviderDescriptor {
    fn default() -> Self {
        Self {
            id: "unknown".to_string(),
            name: "Unknown Provider".to_string(),
            kind: AdapterKind::OpenAICompatible,
            auth: AuthRequirement::ApiKey,
            api_key_env: None,
            base_url: None,
            base_url_env: None,
            features: ProviderFeatures::default(),
            default_model: None,
            models: Vec::new(),
            headers: HashMap::new(),
            timeout_seconds: default_timeout(),
        }
    }
}

impl ProviderDescriptor {
    /// Look up a model by id.
    pub fn model(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.id == model_id)
    }

    /// The configured default model, else the first catalog model.
    pub fn default_model_id(&self) -> Option<&str> {
        self.default_model
            .as_deref()
            .or_else(|| self.models.first().map(|m| m.id.as_str()))
    }

    /// Whether an adapter can only be built with a credential.
    pub fn requires_auth(&self) -> bool {
        self.auth == AuthRequirement::ApiKey
    }

    /// Name of the environment variable that holds this provider's key.
    pub fn credential_env(&self) -> String {
        self.api_key_env.clone().unwrap_or_else(|| {
            format!("{}_API_KEY", self.id.to_uppercase().replace(['-', '.'], "_"))
        })
    }

    /// Base endpoint, honouring the environment override.
    pub fn resolved_base_url(&self) -> Option<String> {
        if let Some(env_var) = &self.base_url_env {
            if let Ok(url) = std::env::var(env_var) {
                if !url.trim().is_empty() {
                    return Some(url);
                }
            }
        }
        self.base_url.clone()
    }
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Default active provider/model pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
        }
    }
}

/// Root configuration structure for `codeforge.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CodeforgeConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub providers: Vec<ProviderDescriptor>,

    #[serde(default)]
    pub scoring: ScoringWeights,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub review: ReviewWeights,
}

impl CodeforgeConfig {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("CODEFORGE_CONFIG") {
            if Path::new(&path).exists() {
                return Self::from_file(&path);
            }
        }

        let local_path = Path::new("codeforge.toml");
        if local_path.exists() {
            return Self::from_file(local_path);
        }

        if let Some(home) = dirs::home_dir() {
            let user_path = home.join(".codeforge").join("codeforge.toml");
            if user_path.exists() {
                return Self::from_file(&user_path);
            }
        }

        Ok(Self::builtin_defaults())
    }

    /// Load configuration from a specific file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// A file without `[[providers]]` keeps the built-in catalog.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self =
            toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        if config.providers.is_empty() {
            config.providers = builtin_catalog();
        }
        Ok(config)
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Built-in configuration with the standard catalog.
    pub fn builtin_defaults() -> Self {
        Self {
            providers: builtin_catalog(),
            ..Default::default()
        }
    }

    /// Get a provider by id.
    pub fn get_provider(&self, id: &str) -> Option<&ProviderDescriptor> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Get a model by provider and model id.
    pub fn get_model(&self, provider: &str, model: &str) -> Option<&ModelDescriptor> {
        self.get_provider(provider).and_then(|p| p.model(model))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen_providers = HashSet::new();
        for provider in &self.providers {
            if !seen_providers.insert(provider.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate provider id: '{}'",
                    provider.id
                )));
            }

            let mut seen_models = HashSet::new();
            for model in &provider.models {
                if !seen_models.insert(model.id.as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "Duplicate model id '{}' in provider '{}'",
                        model.id, provider.id
                    )));
                }
            }
        }

        if self
            .get_model(&self.defaults.provider, &self.defaults.model)
            .is_none()
        {
            return Err(ConfigError::ValidationError(format!(
                "Default model '{}/{}' not found in catalog",
                self.defaults.provider, self.defaults.model
            )));
        }

        self.scoring
            .validate()
            .map_err(ConfigError::ValidationError)?;
        self.pipeline
            .validate()
            .map_err(ConfigError::ValidationError)?;
        self.review
            .validate()
            .map_err(ConfigError::ValidationError)?;
        Ok(())
    }
}

// ============================================================================
// Built-in catalog
// ============================================================================

fn tags(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

/// Standard provider catalog shipped with the crate.
pub fn builtin_catalog() -> Vec<ProviderDescriptor> {
    vec![
        ProviderDescriptor {
            id: "openai".to_string(),
            name: "OpenAI".to_string(),
            kind: AdapterKind::OpenAICompatible,
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            base_url: Some("https://api.openai.com/v1".to_string()),
            base_url_env: Some("OPENAI_API_BASE".to_string()),
            features: ProviderFeatures {
                vision: true,
                function_calling: true,
                streaming: true,
            },
            default_model: Some("gpt-4o-mini".to_string()),
            models: vec![
                ModelDescriptor {
                    id: "gpt-4o".to_string(),
                    name: "GPT-4o".to_string(),
                    context_window: 128_000,
                    max_output_tokens: 16_384,
                    capabilities: ModelCapabilities {
                        vision: true,
                        function_calling: true,
                        streaming: true,
                        json_mode: true,
                    },
                    strengths: tags(&["reasoning", "code", "multimodal"]),
                    best_for: tags(&["code generation", "complex components", "vision"]),
                    pricing: Some(ModelPricing::usd(0.0025, 0.01)),
                    description: "Flagship multimodal model".to_string(),
                },
                ModelDescriptor {
                    id: "gpt-4o-mini".to_string(),
                    name: "GPT-4o mini".to_string(),
                    context_window: 128_000,
                    max_output_tokens: 16_384,
                    capabilities: ModelCapabilities {
                        vision: true,
                        function_calling: true,
                        streaming: true,
                        json_mode: true,
                    },
                    strengths: tags(&["speed", "cost"]),
                    best_for: tags(&["simple components", "budget", "prototyping"]),
                    pricing: Some(ModelPricing::usd(0.00015, 0.0006)),
                    description: "Cost-effective general model".to_string(),
                },
            ],
            ..Default::default()
        },
        ProviderDescriptor {
            id: "anthropic".to_string(),
            name: "Anthropic".to_string(),
            kind: AdapterKind::Anthropic,
            api_key_env: Some("ANTHROPIC_API_KEY".to_string()),
            base_url: Some("https://api.anthropic.com".to_string()),
            base_url_env: Some("ANTHROPIC_API_BASE".to_string()),
            features: ProviderFeatures {
                vision: true,
                function_calling: true,
                streaming: true,
            },
            default_model: Some("claude-sonnet-4-5-20250929".to_string()),
            models: vec![
                ModelDescriptor {
                    id: "claude-sonnet-4-5-20250929".to_string(),
                    name: "Claude Sonnet 4.5".to_string(),
                    context_window: 200_000,
                    max_output_tokens: 8_192,
                    capabilities: ModelCapabilities {
                        vision: true,
                        function_calling: true,
                        streaming: true,
                        json_mode: false,
                    },
                    strengths: tags(&["coding", "reasoning", "long context"]),
                    best_for: tags(&["code generation", "refactoring", "code review"]),
                    pricing: Some(ModelPricing::usd(0.003, 0.015)),
                    description: "Strong coding model with a large context window".to_string(),
                },
                ModelDescriptor {
                    id: "claude-3-5-haiku-20241022".to_string(),
                    name: "Claude 3.5 Haiku".to_string(),
                    context_window: 200_000,
                    max_output_tokens: 8_192,
                    capabilities: ModelCapabilities {
                        vision: true,
                        function_calling: true,
                        streaming: true,
                        json_mode: false,
                    },
                    strengths: tags(&["speed"]),
                    best_for: tags(&["simple components", "budget"]),
                    pricing: Some(ModelPricing::usd(0.0008, 0.004)),
                    description: "Fast and cost-effective".to_string(),
                },
            ],
            ..Default::default()
        },
        ProviderDescriptor {
            id: "gemini".to_string(),
            name: "Google Gemini".to_string(),
            kind: AdapterKind::Gemini,
            api_key_env: Some("GEMINI_API_KEY".to_string()),
            base_url: Some("https://generativelanguage.googleapis.com/v1beta".to_string()),
            features: ProviderFeatures {
                vision: true,
                function_calling: true,
                streaming: false,
            },
            default_model: Some("gemini-2.0-flash".to_string()),
            models: vec![
                ModelDescriptor {
                    id: "gemini-2.0-flash".to_string(),
                    name: "Gemini 2.0 Flash".to_string(),
                    context_window: 1_048_576,
                    max_output_tokens: 8_192,
                    capabilities: ModelCapabilities {
                        vision: true,
                        function_calling: true,
                        streaming: false,
                        json_mode: true,
                    },
                    strengths: tags(&["long context", "speed"]),
                    best_for: tags(&["large context", "documentation"]),
                    pricing: Some(ModelPricing::usd(0.0001, 0.0004)),
                    description: "Very large context window".to_string(),
                },
                ModelDescriptor {
                    id: "gemini-1.5-pro".to_string(),
                    name: "Gemini 1.5 Pro".to_string(),
                    context_window: 2_097_152,
                    max_output_tokens: 8_192,
                    capabilities: ModelCapabilities {
                        vision: true,
                        function_calling: true,
                        streaming: false,
                        json_mode: true,
                    },
                    strengths: tags(&["long context", "reasoning"]),
                    best_for: tags(&["large context", "analysis"]),
                    pricing: Some(ModelPricing::usd(0.00125, 0.005)),
                    description: String::new(),
                },
            ],
            ..Default::default()
        },
        ProviderDescriptor {
            id: "mistral".to_string(),
            name: "Mistral AI".to_string(),
            kind: AdapterKind::OpenAICompatible,
            api_key_env: Some("MISTRAL_API_KEY".to_string()),
            base_url: Some("https://api.mistral.ai/v1".to_string()),
            features: ProviderFeatures {
                vision: false,
                function_calling: true,
                streaming: true,
            },
            default_model: Some("codestral-latest".to_string()),
            models: vec![ModelDescriptor {
                id: "codestral-latest".to_string(),
                name: "Codestral".to_string(),
                context_window: 256_000,
                max_output_tokens: 8_192,
                capabilities: ModelCapabilities {
                    vision: false,
                    function_calling: true,
                    streaming: true,
                    json_mode: true,
                },
                strengths: tags(&["code", "completion"]),
                best_for: tags(&["code generation", "autocomplete"]),
                pricing: Some(ModelPricing::usd(0.0003, 0.0009)),
                description: "Code-specialised model".to_string(),
            }],
            ..Default::default()
        },
        ProviderDescriptor {
            id: "deepseek".to_string(),
            name: "DeepSeek".to_string(),
            kind: AdapterKind::OpenAICompatible,
            api_key_env: Some("DEEPSEEK_API_KEY".to_string()),
            base_url: Some("https://api.deepseek.com/v1".to_string()),
            features: ProviderFeatures {
                vision: false,
                function_calling: true,
                streaming: true,
            },
            default_model: Some("deepseek-chat".to_string()),
            models: vec![ModelDescriptor {
                id: "deepseek-chat".to_string(),
                name: "DeepSeek V3".to_string(),
                context_window: 64_000,
                max_output_tokens: 8_192,
                capabilities: ModelCapabilities {
                    vision: false,
                    function_calling: true,
                    streaming: true,
                    json_mode: true,
                },
                strengths: tags(&["code", "cost"]),
                best_for: tags(&["code generation", "budget"]),
                pricing: Some(ModelPricing::usd(0.00027, 0.0011)),
                description: String::new(),
            }],
            ..Default::default()
        },
        ProviderDescriptor {
            id: "groq".to_string(),
            name: "Groq".to_string(),
            kind: AdapterKind::OpenAICompatible,
            api_key_env: Some("GROQ_API_KEY".to_string()),
            base_url: Some("https://api.groq.com/openai/v1".to_string()),
            features: ProviderFeatures {
                vision: false,
                function_calling: true,
                streaming: true,
            },
            default_model: Some("llama-3.3-70b-versatile".to_string()),
            models: vec![ModelDescriptor {
                id: "llama-3.3-70b-versatile".to_string(),
                name: "Llama 3.3 70B".to_string(),
                context_window: 128_000,
                max_output_tokens: 32_768,
                capabilities: ModelCapabilities {
                    vision: false,
                    function_calling: true,
                    streaming: true,
                    json_mode: true,
                },
                strengths: tags(&["speed"]),
                best_for: tags(&["prototyping", "chat"]),
                pricing: Some(ModelPricing::usd(0.00059, 0.00079)),
                description: "Low-latency inference".to_string(),
            }],
            ..Default::default()
        },
        ProviderDescriptor {
            id: "ollama".to_string(),
            name: "Ollama (Local)".to_string(),
            kind: AdapterKind::OpenAICompatible,
            auth: AuthRequirement::None,
            base_url: Some("http://localhost:11434/v1".to_string()),
            base_url_env: Some("OLLAMA_HOST".to_string()),
            features: ProviderFeatures {
                vision: false,
                function_calling: false,
                streaming: true,
            },
            default_model: Some("qwen2.5-coder".to_string()),
            models: vec![ModelDescriptor {
                id: "qwen2.5-coder".to_string(),
                name: "Qwen2.5 Coder".to_string(),
                context_window: 32_768,
                max_output_tokens: 8_192,
                capabilities: ModelCapabilities::default(),
                strengths: tags(&["code", "local"]),
                best_for: tags(&["offline", "code generation"]),
                pricing: None,
                description: "Local coding model".to_string(),
            }],
            ..Default::default()
        },
    ]
}
