//! Error taxonomy for provider calls and pipeline stages.
//!
//! # Error Handling Philosophy
//!
//! Errors are split by how the orchestrator reacts to them:
//! 1. **Absorbed**: context/retrieval/documentation failures never surface; the stage degrades.
//! 2. **Retryable**: `RequestFailed`, `Timeout` and `ResponseParseError` move generation to the
//!    next candidate adapter.
//! 3. **Surfaced**: exhausted budgets come back as [`GenError::StageFailed`] naming the stage.
//!
//! # Common Errors and Solutions
//!
//! | Error | Cause | Solution |
//! |-------|-------|----------|
//! | `CredentialMissing` | No usable key for the provider | Set `<PROVIDER>_API_KEY` |
//! | `ProviderNotFound` | Unknown or deregistered provider id | Check `list_providers()` |
//! | `ModelNotFound` | Model not in the provider's catalog entry | Check `list_models(id)` |
//! | `RequestFailed` | Network failure or non-2xx upstream status | Retried / next candidate |
//! | `PersistFailed` | Storage collaborator kept failing | Artifact is still returned |

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for generation operations.
pub type Result<T> = std::result::Result<T, GenError>;

// ============================================================================
// Retry Strategy
// ============================================================================

/// How a failed operation may be retried.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// Retry with exponential backoff (for transient errors).
    ExponentialBackoff {
        /// Initial delay before first retry.
        base_delay: Duration,
        /// Maximum delay between retries.
        max_delay: Duration,
        /// Maximum number of attempts, the first one included.
        max_attempts: u32,
    },

    /// The same adapter will not succeed, but another provider may.
    SwitchProvider,

    /// Do not retry at all (permanent error).
    NoRetry,
}

impl RetryStrategy {
    /// Standard exponential backoff for network errors.
    pub fn network_backoff() -> Self {
        Self::ExponentialBackoff {
            base_delay: Duration::from_millis(125),
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
        }
    }

    /// Backoff for upstream 5xx responses.
    pub fn server_backoff() -> Self {
        Self::ExponentialBackoff {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 3,
        }
    }

    /// Check if this strategy allows retrying somewhere.
    pub fn should_retry(&self) -> bool {
        !matches!(self, Self::NoRetry)
    }
}

// ============================================================================
// Pipeline stage names (used in StageFailed)
// ============================================================================

/// Stages of the generation pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Idle,
    ContextBuilding,
    Retrieving,
    PromptAssembly,
    Generating,
    Extracting,
    Reviewing,
    RegenerationLoop,
    Optimizing,
    Persisting,
    Done,
    Failed,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStage::Idle => "idle",
            PipelineStage::ContextBuilding => "context_building",
            PipelineStage::Retrieving => "retrieving",
            PipelineStage::PromptAssembly => "prompt_assembly",
            PipelineStage::Generating => "generating",
            PipelineStage::Extracting => "extracting",
            PipelineStage::Reviewing => "reviewing",
            PipelineStage::RegenerationLoop => "regeneration_loop",
            PipelineStage::Optimizing => "optimizing",
            PipelineStage::Persisting => "persisting",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors produced by adapters, the registry and the pipeline.
#[derive(Debug, Error)]
pub enum GenError {
    /// No usable credential for a provider that requires one.
    #[error("Credential missing for provider: {0}")]
    CredentialMissing(String),

    /// Provider id is unknown to the registry.
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    /// Model id is unknown for the given provider.
    #[error("Model not found: {model} (provider {provider})")]
    ModelNotFound { provider: String, model: String },

    /// Outbound call failed (network error or non-success status).
    #[error("Request failed{}: {message}", fmt_status(.status))]
    RequestFailed {
        status: Option<u16>,
        message: String,
    },

    /// Outbound call exceeded its deadline.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Upstream payload could not be decoded.
    #[error("Response parse error: {0}")]
    ResponseParseError(String),

    /// Storage collaborator failed after all attempts.
    #[error("Persist failed after {attempts} attempts: {message}")]
    PersistFailed { attempts: u32, message: String },

    /// Capability not offered by this adapter.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Registry mutation rejected.
    #[error("Registration error: {0}")]
    Registration(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// A pipeline stage exhausted its budget.
    #[error("Stage {stage} failed: {source}")]
    StageFailed {
        stage: PipelineStage,
        #[source]
        source: Box<GenError>,
    },
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({})", s)).unwrap_or_default()
}

impl GenError {
    /// Shorthand for a failed request with an upstream status.
    pub fn request_failed(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::RequestFailed {
            status,
            message: message.into(),
        }
    }

    /// Wrap this error as the cause of a failed stage.
    pub fn at_stage(self, stage: PipelineStage) -> Self {
        match self {
            already @ GenError::StageFailed { .. } => already,
            other => GenError::StageFailed {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Upstream HTTP status, if the error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RequestFailed { status, .. } => *status,
            Self::StageFailed { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Get the appropriate retry strategy for this error.
    ///
    /// # Example
    ///
    /// ```
    /// use codeforge_llm::{GenError, RetryStrategy};
    ///
    /// let error = GenError::request_failed(Some(503), "unavailable");
    /// assert!(error.retry_strategy().should_retry());
    /// ```
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            Self::RequestFailed { status: None, .. } | Self::Timeout(_) => {
                RetryStrategy::network_backoff()
            }
            Self::RequestFailed {
                status: Some(code), ..
            } if *code == 429 || *code >= 500 => RetryStrategy::server_backoff(),

            // Bad key or a rejected body will not improve on the same adapter.
            Self::RequestFailed { .. } | Self::ResponseParseError(_) => {
                RetryStrategy::SwitchProvider
            }

            Self::StageFailed { source, .. } => source.retry_strategy(),

            Self::CredentialMissing(_)
            | Self::ProviderNotFound(_)
            | Self::ModelNotFound { .. }
            | Self::PersistFailed { .. }
            | Self::NotSupported(_)
            | Self::Registration(_)
            | Self::Config(_)
            | Self::Cancelled => RetryStrategy::NoRetry,
        }
    }

    /// Whether the orchestrator may try again (same or another adapter).
    pub fn is_recoverable(&self) -> bool {
        self.retry_strategy().should_retry()
    }
}

impl From<reqwest::Error> for GenError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GenError::ResponseParseError(err.to_string())
        } else {
            let status = err.status().map(|s| s.as_u16());
            let message = if err.is_connect() {
                format!("Connection failed: {}", err)
            } else {
                err.to_string()
            };
            GenError::RequestFailed { status, message }
        }
    }
}

impl From<serde_json::Error> for GenError {
    fn from(err: serde_json::Error) -> Self {
        GenError::ResponseParseError(err.to_string())
    }
}
