//! Codeforge LLM - multi-provider generation orchestration
//!
//! This crate turns a natural-language request into a reviewed, scored and persisted
//! artifact, using whichever configured model backend fits the task.
//!
//! - Provider adapters behind one capability-tagged trait
//! - A registry that discovers credentials and tracks the active provider/model pair
//! - A model catalog with a deterministic use-case scoring function
//! - Cancellable streaming with emulation for backends without incremental delivery
//! - A staged generation pipeline with bounded fallback, regeneration and persist retries
//! - Rule-based and provider-delegated quality review
//!
//! # Providers
//!
//! | Kind | Backends | Streaming |
//! |------|----------|-----------|
//! | OpenAI-compatible | OpenAI, Groq, DeepSeek, Mistral, Ollama, custom endpoints | native |
//! | Anthropic | Claude | native |
//! | Gemini | Google AI | emulated |
//! | Mock | tests | native or emulated |
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use codeforge_llm::{
//!     AdapterFactory, CodeforgeConfig, EnvCredentialSource, GenerationRequest, Orchestrator,
//!     ProviderRegistry,
//! };
//!
//! let config = CodeforgeConfig::load()?;
//! let registry = ProviderRegistry::from_config(&config, Arc::new(EnvCredentialSource), AdapterFactory::new());
//! registry.initialize();
//!
//! let orchestrator = Orchestrator::from_config(&config, Arc::new(registry))?;
//! let outcome = orchestrator.generate(GenerationRequest::new("A debounced search box").framework("react")).await?;
//! println!("{}", outcome.artifact.body);
//! ```
//!
//! # See Also
//!
//! - [`crate::traits`] for the adapter contract
//! - [`crate::pipeline`] for the stage machine
//! - [`crate::scoring`] for model ranking

pub mod credentials;
pub mod error;
pub mod factory;
pub mod model_config;
pub mod pipeline;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod review;
pub mod scoring;
pub mod streaming;
pub mod tokenizer;
pub mod traits;

pub use credentials::{
    is_placeholder, ChainedCredentialSource, CredentialSource, EnvCredentialSource,
    StaticCredentialSource,
};
pub use error::{GenError, PipelineStage, Result, RetryStrategy};
pub use factory::AdapterFactory;
pub use model_config::{
    AdapterKind, AuthRequirement, CodeforgeConfig, ConfigError, DefaultsConfig,
    ModelCapabilities, ModelDescriptor, ModelPricing, ProviderDescriptor, ProviderFeatures,
};
pub use pipeline::{
    ArtifactMetadata, ArtifactStore, DocumentationSource, GeneratedArtifact, GenerationContext,
    GenerationOutcome, GenerationRequest, Orchestrator, OrchestratorBuilder, PipelineConfig,
    PipelineEvent, SimilaritySearch, StreamEvent, StreamSummary,
};
pub use providers::anthropic::AnthropicAdapter;
pub use providers::gemini::GeminiAdapter;
pub use providers::mock::{MockAdapter, MockStep};
pub use providers::openai_compatible::OpenAICompatibleAdapter;
pub use registry::{ActiveSelection, InitReport, ProviderInfo, ProviderRegistry};
pub use retry::{RetryExecutor, RetryPolicy};
pub use review::{
    ProviderReviewer, ReviewIssue, ReviewResult, ReviewWeights, Reviewer, RuleBasedReviewer,
    Severity,
};
pub use scoring::{ScoredModel, ScoringEngine, ScoringWeights};
pub use streaming::{CancelToken, FragmentStream, StreamFragment, StreamingCoordinator};
pub use tokenizer::Tokenizer;
pub use traits::{GenerateOptions, GenerateResponse, ProviderAdapter};
