//! Generation pipeline orchestrator.
//!
//! # Stages
//!
//! ```text
//! Idle → ContextBuilding → Retrieving → PromptAssembly → Generating → Extracting
//!      → Reviewing → (RegenerationLoop → Generating …) → Optimizing → Persisting → Done
//! ```
//!
//! `Failed` is reachable from any stage; the returned error is a
//! [`GenError::StageFailed`] naming the stage and the cause.
//!
//! - Context and retrieval failures are absorbed (empty context).
//! - Generation walks the candidate list (active pair, then scored fallbacks) under the
//!   injected [`RetryPolicy`].
//! - A review below the acceptance threshold re-enters generation with an amended prompt
//!   while the regeneration budget lasts. The best-scoring attempt is kept.
//! - Persistence is retried with backoff; a final failure is reported in
//!   [`GenerationOutcome::persist_error`] while the artifact is still returned.
//!
//! Each request owns its context and artifact. The registry is the only shared state and
//! is never mutated by a run.

mod collaborators;
mod context;
mod events;
mod extract;
mod optimize;
mod prompt;

pub use collaborators::{
    ArtifactStore, DocSnippet, DocumentationSource, InMemoryArtifactStore, InMemorySimilarity,
    NoDocumentation, NoSimilarity, SimilarArtifact, SimilaritySearch, StaticDocumentation,
};
pub use context::GenerationContext;
pub use events::{PipelineEvent, StreamEvent};
pub use extract::{detect_dependencies, detect_tags, extract, Extraction};
pub use optimize::{optimize, Optimized};
pub use prompt::{PromptBuilder, TEMPLATE_VERSION};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{GenError, PipelineStage, Result};
use crate::model_config::{CodeforgeConfig, ModelDescriptor, ProviderDescriptor};
use crate::registry::{ProviderInfo, ProviderRegistry};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::review::{ReviewResult, Reviewer, RuleBasedReviewer};
use crate::scoring::{ScoredModel, ScoringEngine};
use crate::streaming::{CancelToken, StreamingCoordinator};
use crate::traits::GenerateOptions;
use context::{ContextBuilder, ContextLimits};
use events::ProgressReporter;

// ============================================================================
// Configuration
// ============================================================================

/// `[pipeline]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Review score (0-100) below which an attempt is regenerated.
    pub acceptance_threshold: f64,
    /// Extra generation rounds after a below-threshold review.
    pub regeneration_budget: u32,
    /// Candidates tried after the active pair fails.
    pub fallback_candidates: usize,
    /// Attempts on the same adapter for transient errors.
    pub same_adapter_attempts: u32,
    pub persist_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Deadline for template lookup and for the retrieval fan-out.
    pub retrieval_timeout_ms: u64,
    pub max_similar: usize,
    pub max_patterns: usize,
    /// Per-call adapter deadline; the adapter's own timeout applies when unset.
    pub request_timeout_secs: Option<u64>,
    /// Prompt token budget, further capped by the model's context window.
    pub context_token_budget: usize,
    pub max_output_tokens: usize,
    pub temperature: f32,
    pub template_version: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 70.0,
            regeneration_budget: 1,
            fallback_candidates: 2,
            same_adapter_attempts: 1,
            persist_attempts: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 5_000,
            retrieval_timeout_ms: 2_000,
            max_similar: 5,
            max_patterns: 3,
            request_timeout_secs: None,
            context_token_budget: 6_000,
            max_output_tokens: 4_096,
            temperature: 0.2,
            template_version: TEMPLATE_VERSION.to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(0.0..=100.0).contains(&self.acceptance_threshold) {
            return Err(format!(
                "pipeline.acceptance_threshold must be within [0, 100], got {}",
                self.acceptance_threshold
            ));
        }
        if self.persist_attempts == 0 {
            return Err("pipeline.persist_attempts must be at least 1".to_string());
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err("pipeline.backoff_base_ms exceeds backoff_max_ms".to_string());
        }
        if self.max_output_tokens == 0 {
            return Err("pipeline.max_output_tokens must be positive".to_string());
        }
        if self.request_timeout_secs == Some(0) {
            return Err("pipeline.request_timeout_secs must be positive".to_string());
        }
        if self.template_version.trim().is_empty() {
            return Err("pipeline.template_version must not be empty".to_string());
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    fn context_limits(&self) -> ContextLimits {
        ContextLimits {
            timeout: Duration::from_millis(self.retrieval_timeout_ms),
            max_similar: self.max_similar,
            max_patterns: self.max_patterns,
        }
    }
}

// ============================================================================
// Request and artifact
// ============================================================================

/// What the caller wants generated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub task: String,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Ids of earlier artifacts or documents this request builds on.
    #[serde(default)]
    pub context_refs: Vec<String>,
    /// Project metadata forwarded into the context.
    #[serde(default)]
    pub project: BTreeMap<String, String>,
}

impl GenerationRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Default::default()
        }
    }

    pub fn framework(mut self, framework: impl Into<String>) -> Self {
        self.framework = Some(framework.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn requirement(mut self, requirement: impl Into<String>) -> Self {
        self.requirements.push(requirement.into());
        self
    }

    pub fn context_ref(mut self, id: impl Into<String>) -> Self {
        self.context_refs.push(id.into());
        self
    }

    pub fn project_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.project.insert(key.into(), value.into());
        self
    }

    /// Text used to rank fallback models.
    fn use_case(&self) -> String {
        let mut text = self.task.clone();
        for hint in [&self.framework, &self.category].into_iter().flatten() {
            text.push(' ');
            text.push_str(hint);
        }
        text
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub request_id: Uuid,
    /// Adapter that produced the kept attempt.
    pub provider_id: String,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub context_refs: Vec<String>,
    pub optimizations: Vec<String>,
    pub template_version: String,
    /// Still below the acceptance threshold after the regeneration budget.
    pub below_threshold: bool,
    pub regenerations: u32,
    /// No fenced block was found; the whole response is the body.
    pub extraction_fallback: bool,
    pub emulated_stream: bool,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

impl Default for ArtifactMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            request_id: Uuid::nil(),
            provider_id: String::new(),
            model_id: String::new(),
            created_at: now,
            completed_at: now,
            context_refs: Vec::new(),
            optimizations: Vec::new(),
            template_version: TEMPLATE_VERSION.to_string(),
            below_threshold: false,
            regenerations: 0,
            extraction_fallback: false,
            emulated_stream: false,
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }
}

/// Output of a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    /// Storage id, set once persisted.
    pub id: Option<String>,
    pub body: String,
    pub tags: Vec<String>,
    pub dependencies: Vec<String>,
    pub quality_score: Option<f64>,
    pub metadata: ArtifactMetadata,
}

/// Artifact plus everything learned while producing it.
#[derive(Debug)]
pub struct GenerationOutcome {
    pub artifact: GeneratedArtifact,
    pub review: ReviewResult,
    /// Set when storage failed after all attempts; the artifact is still valid.
    pub persist_error: Option<GenError>,
    /// Adapter calls made, fallbacks and regenerations included.
    pub attempts: u32,
}

impl GenerationOutcome {
    pub fn is_persisted(&self) -> bool {
        self.artifact.id.is_some()
    }

    pub fn is_below_threshold(&self) -> bool {
        self.artifact.metadata.below_threshold
    }
}

/// Result of [`Orchestrator::generate_stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub request_id: Uuid,
    pub cancelled: bool,
    /// Fragment callbacks made.
    pub delivered: usize,
}

// ============================================================================
// Orchestrator
// ============================================================================

type Candidate = (String, String);

/// One generation round after extraction and review.
struct Attempt {
    provider_id: String,
    model_id: String,
    extraction: Extraction,
    review: ReviewResult,
    prompt_tokens: usize,
    completion_tokens: usize,
    calls: u32,
}

impl Attempt {
    fn score(&self) -> f64 {
        self.review.overall_score.unwrap_or(f64::NEG_INFINITY)
    }
}

/// Per-request values shared by the buffered and streaming paths.
struct Prepared {
    context: GenerationContext,
    builder: PromptBuilder,
    prompt: String,
    candidates: Vec<Candidate>,
}

async fn bounded<T>(call: impl Future<Output = Result<T>>, timeout: Option<Duration>) -> Result<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| GenError::Timeout(limit))?,
        None => call.await,
    }
}

/// Drives requests through the pipeline.
pub struct Orchestrator {
    registry: Arc<ProviderRegistry>,
    scoring: Arc<ScoringEngine>,
    similarity: Arc<dyn SimilaritySearch>,
    documentation: Arc<dyn DocumentationSource>,
    store: Arc<dyn ArtifactStore>,
    reviewer: Arc<dyn Reviewer>,
    config: PipelineConfig,
    retry: RetryPolicy,
    streaming: StreamingCoordinator,
    events: Option<UnboundedSender<PipelineEvent>>,
}

impl Orchestrator {
    pub fn builder(registry: Arc<ProviderRegistry>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(registry)
    }

    /// Orchestrator wired from a loaded config, with default collaborators.
    pub fn from_config(config: &CodeforgeConfig, registry: Arc<ProviderRegistry>) -> Result<Self> {
        OrchestratorBuilder::new(registry)
            .scoring(ScoringEngine::new(config.scoring.clone()))
            .reviewer(Arc::new(RuleBasedReviewer::new(config.review.clone())))
            .config(config.pipeline.clone())
            .build()
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn options(&self) -> GenerateOptions {
        GenerateOptions {
            temperature: Some(self.config.temperature),
            max_tokens: Some(self.config.max_output_tokens),
            timeout: self.config.request_timeout(),
            ..Default::default()
        }
    }

    /// Active pair first, then the best-scoring available alternatives.
    fn candidates(&self, use_case: &str) -> Result<Vec<Candidate>> {
        let active = self.registry.active().ok_or_else(|| {
            GenError::ProviderNotFound("no active provider selected".to_string())
        })?;
        let available = self.registry.available_catalog();
        let fallbacks = self.scoring.fallback_candidates(
            &available,
            (active.provider_id.as_str(), active.model_id.as_str()),
            use_case,
            self.retry.max_fallback_candidates,
        );

        let mut candidates = vec![(active.provider_id, active.model_id)];
        candidates.extend(fallbacks.into_iter().map(|m| (m.provider_id, m.model_id)));
        Ok(candidates)
    }

    fn prompt_builder(&self, (provider_id, model_id): &Candidate) -> PromptBuilder {
        let window = self
            .registry
            .model(provider_id, model_id)
            .map(|m| m.context_window)
            .unwrap_or(0);
        let budget = if window > 0 {
            self.config
                .context_token_budget
                .min(window.saturating_sub(self.config.max_output_tokens))
        } else {
            self.config.context_token_budget
        };
        PromptBuilder::for_model(model_id, budget)
            .with_template_version(self.config.template_version.clone())
    }

    async fn prepare(
        &self,
        request: &GenerationRequest,
        progress: &ProgressReporter,
    ) -> Result<Prepared> {
        if request.task.trim().is_empty() {
            return Err(GenError::Config("generation request has an empty task".to_string())
                .at_stage(PipelineStage::Idle));
        }
        let candidates = self
            .candidates(&request.use_case())
            .map_err(|e| e.at_stage(PipelineStage::Idle))?;

        let contexts = ContextBuilder {
            similarity: self.similarity.clone(),
            documentation: self.documentation.clone(),
            store: self.store.clone(),
            limits: self.config.context_limits(),
        };
        progress.emit(PipelineStage::ContextBuilding, "Building context");
        let mut context = contexts.base(request).await;
        progress.emit(PipelineStage::Retrieving, "Retrieving similar artifacts and docs");
        contexts.retrieve(request, &mut context).await;

        progress.emit(PipelineStage::PromptAssembly, "Assembling prompt");
        let builder = self.prompt_builder(&candidates[0]);
        let prompt = builder.build(request, &context);

        Ok(Prepared {
            context,
            builder,
            prompt,
            candidates,
        })
    }

    /// Generate, extract and review once, walking the candidate list on failure.
    async fn attempt(
        &self,
        prompt: &str,
        candidates: &[Candidate],
        context: &GenerationContext,
        progress: &ProgressReporter,
    ) -> Result<Attempt> {
        let options = self.options();
        let timeout = self.config.request_timeout();
        progress.emit(PipelineStage::Generating, "Calling model");

        let success = self
            .retry
            .run_candidates(candidates, |(provider_id, model_id), index| {
                let adapter = self.registry.adapter(provider_id, model_id);
                let options = &options;
                async move {
                    let adapter = adapter?;
                    if index > 0 {
                        info!(
                            provider = adapter.provider_id(),
                            model = adapter.model(),
                            "Falling back to alternate candidate"
                        );
                    }
                    let response = bounded(adapter.generate(prompt, options), timeout).await?;
                    if response.content.trim().is_empty() {
                        return Err(GenError::ResponseParseError(format!(
                            "{} returned an empty response",
                            adapter.provider_id()
                        )));
                    }
                    Ok((
                        adapter.provider_id().to_string(),
                        adapter.model().to_string(),
                        response,
                    ))
                }
            })
            .await?;
        let (provider_id, model_id, response) = success.value;

        progress.emit(PipelineStage::Extracting, "Extracting artifact");
        let extraction = extract(&response.content);

        progress.emit(PipelineStage::Reviewing, "Reviewing artifact");
        let review = self.reviewer.review(&extraction.body, context).await;

        Ok(Attempt {
            provider_id,
            model_id,
            extraction,
            review,
            prompt_tokens: response.prompt_tokens,
            completion_tokens: response.completion_tokens,
            calls: success.attempts,
        })
    }

    /// Regenerate while the latest review is below threshold and budget remains.
    async fn regenerate(
        &self,
        first: Attempt,
        prepared: &Prepared,
        progress: &ProgressReporter,
    ) -> (Attempt, u32, u32) {
        let threshold = self.config.acceptance_threshold;
        let mut calls = first.calls;
        let mut regenerations = 0;
        let mut latest = first.review.clone();
        let mut best = first;

        while regenerations < self.config.regeneration_budget && latest.is_below(threshold) {
            regenerations += 1;
            progress.emit(
                PipelineStage::RegenerationLoop,
                format!(
                    "Score {:.1} below {:.1}, regenerating ({}/{})",
                    latest.overall_score.unwrap_or_default(),
                    threshold,
                    regenerations,
                    self.config.regeneration_budget
                ),
            );

            let amended = prepared.builder.amend(&prepared.prompt, &latest);
            match self
                .attempt(&amended, &prepared.candidates, &prepared.context, progress)
                .await
            {
                Ok(next) => {
                    calls += next.calls;
                    latest = next.review.clone();
                    if next.score() > best.score() {
                        best = next;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Regeneration failed, keeping best attempt");
                    break;
                }
            }
        }

        (best, calls, regenerations)
    }

    /// Optimize, persist and package the kept attempt.
    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        request: &GenerationRequest,
        prepared: &Prepared,
        best: Attempt,
        calls: u32,
        regenerations: u32,
        created_at: DateTime<Utc>,
        emulated_stream: bool,
        progress: &ProgressReporter,
    ) -> GenerationOutcome {
        let below_threshold = best.review.is_below(self.config.acceptance_threshold);
        if below_threshold {
            warn!(
                score = best.review.overall_score.unwrap_or_default(),
                threshold = self.config.acceptance_threshold,
                "Returning best attempt below the acceptance threshold"
            );
        }

        progress.emit(PipelineStage::Optimizing, "Optimizing artifact");
        let optimized = optimize(&best.extraction.body);

        let mut artifact = GeneratedArtifact {
            id: None,
            body: optimized.body,
            tags: detect_tags(&best.extraction, request),
            dependencies: detect_dependencies(&best.extraction.body),
            quality_score: best.review.overall_score,
            metadata: ArtifactMetadata {
                request_id: progress.request_id(),
                provider_id: best.provider_id,
                model_id: best.model_id,
                created_at,
                completed_at: Utc::now(),
                context_refs: prepared.context.references(request),
                optimizations: optimized.applied,
                template_version: prepared.builder.template_version().to_string(),
                below_threshold,
                regenerations,
                extraction_fallback: best.extraction.fallback,
                emulated_stream,
                prompt_tokens: best.prompt_tokens,
                completion_tokens: best.completion_tokens,
            },
        };

        progress.emit(PipelineStage::Persisting, "Persisting artifact");
        let store = &self.store;
        let snapshot = &artifact;
        let (stored, tries) = RetryExecutor::new()
            .execute_always(
                self.retry.base_delay,
                self.retry.max_delay,
                self.retry.persist_attempts,
                || store.store(snapshot),
            )
            .await;

        let persist_error = match stored {
            Ok(id) => {
                artifact.id = Some(id);
                None
            }
            Err(e) => {
                warn!(attempts = tries, error = %e, "Artifact could not be persisted");
                Some(GenError::PersistFailed {
                    attempts: tries,
                    message: e.to_string(),
                })
            }
        };

        progress.emit(PipelineStage::Done, "Done");
        GenerationOutcome {
            artifact,
            review: best.review,
            persist_error,
            attempts: calls,
        }
    }

    /// Run the full pipeline for `request`.
    ///
    /// Returns an artifact (possibly below threshold, possibly unpersisted) or a
    /// [`GenError::StageFailed`] naming the stage that exhausted its budget.
    #[instrument(skip(self, request), fields(task_len = request.task.len()))]
    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutcome> {
        let progress = ProgressReporter::new(self.events.clone());
        let result = self.run(&request, &progress).await;
        if let Err(e) = &result {
            progress.emit(PipelineStage::Failed, e.to_string());
        }
        result
    }

    async fn run(
        &self,
        request: &GenerationRequest,
        progress: &ProgressReporter,
    ) -> Result<GenerationOutcome> {
        let created_at = Utc::now();
        let prepared = self.prepare(request, progress).await?;

        let first = self
            .attempt(&prepared.prompt, &prepared.candidates, &prepared.context, progress)
            .await
            .map_err(|e| e.at_stage(PipelineStage::Generating))?;
        let (best, calls, regenerations) = self.regenerate(first, &prepared, progress).await;

        Ok(self
            .finish(
                request,
                &prepared,
                best,
                calls,
                regenerations,
                created_at,
                false,
                progress,
            )
            .await)
    }

    /// Stream generation for `request`, reporting each fragment to `on_chunk`.
    ///
    /// `on_chunk` receives a [`StreamEvent::Fragment`] per non-empty fragment and then
    /// exactly one [`StreamEvent::End`] with the finished outcome. Cancelling `token`
    /// stops delivery at once, releases the provider stream and skips review and
    /// persistence; the summary then has `cancelled = true` and no `End` is sent.
    #[instrument(skip(self, request, token, on_chunk), fields(task_len = request.task.len()))]
    pub async fn generate_stream<F>(
        &self,
        request: GenerationRequest,
        token: &CancelToken,
        mut on_chunk: F,
    ) -> Result<StreamSummary>
    where
        F: FnMut(StreamEvent) + Send,
    {
        let progress = ProgressReporter::new(self.events.clone());
        let cancelled = |delivered| {
            progress.emit(PipelineStage::Failed, "Cancelled by caller");
            Ok(StreamSummary {
                request_id: progress.request_id(),
                cancelled: true,
                delivered,
            })
        };

        let created_at = Utc::now();
        let prepared = self.prepare(&request, &progress).await?;
        if token.is_cancelled() {
            return cancelled(0);
        }

        progress.emit(PipelineStage::Generating, "Opening stream");
        let options = self.options();
        let streaming = self.streaming;
        let prompt = prepared.prompt.as_str();
        let opened = self
            .retry
            .run_candidates(&prepared.candidates, |(provider_id, model_id), _| {
                let adapter = self.registry.adapter(provider_id, model_id);
                let options = &options;
                async move { streaming.open(adapter?, prompt, options, token).await }
            })
            .await;
        let success = match opened {
            Ok(success) => success,
            Err(GenError::Cancelled) => return cancelled(0),
            Err(e) => {
                progress.emit(PipelineStage::Failed, e.to_string());
                return Err(e.at_stage(PipelineStage::Generating));
            }
        };
        let (provider_id, model_id) = prepared.candidates[success.candidate_index].clone();
        let mut stream = success.value;

        let mut text = String::new();
        let mut delivered = 0;
        let mut emulated = false;
        while let Some(item) = stream.next().await {
            let fragment = match item {
                Ok(fragment) => fragment,
                Err(e) => {
                    progress.emit(PipelineStage::Failed, e.to_string());
                    return Err(e.at_stage(PipelineStage::Generating));
                }
            };
            emulated |= fragment.emulated;
            if fragment.text.is_empty() {
                continue;
            }
            text.push_str(&fragment.text);
            delivered += 1;
            on_chunk(StreamEvent::Fragment(fragment));
        }
        let was_cancelled = stream.was_cancelled() || token.is_cancelled();
        let usage = stream
            .emulated_response()
            .map(|r| (r.emulated_stream, r.prompt_tokens, r.completion_tokens));
        drop(stream);
        if was_cancelled {
            return cancelled(delivered);
        }

        if text.trim().is_empty() {
            let e = GenError::ResponseParseError(format!("{} streamed no content", provider_id))
                .at_stage(PipelineStage::Extracting);
            progress.emit(PipelineStage::Failed, e.to_string());
            return Err(e);
        }

        progress.emit(PipelineStage::Extracting, "Extracting artifact");
        let extraction = extract(&text);
        progress.emit(PipelineStage::Reviewing, "Reviewing artifact");
        let review = self.reviewer.review(&extraction.body, &prepared.context).await;

        let attempt = Attempt {
            provider_id,
            model_id,
            extraction,
            review,
            prompt_tokens: match usage {
                Some((_, prompt_tokens, _)) if prompt_tokens > 0 => prompt_tokens,
                _ => crate::tokenizer::estimate_tokens(&prepared.prompt),
            },
            completion_tokens: match usage {
                Some((_, _, completion_tokens)) if completion_tokens > 0 => completion_tokens,
                _ => crate::tokenizer::estimate_tokens(&text),
            },
            calls: success.attempts,
        };
        let emulated = emulated || usage.is_some_and(|(flag, _, _)| flag);
        let outcome = self
            .finish(
                &request,
                &prepared,
                attempt,
                success.attempts,
                0,
                created_at,
                emulated,
                &progress,
            )
            .await;
        on_chunk(StreamEvent::End(Box::new(outcome)));

        Ok(StreamSummary {
            request_id: progress.request_id(),
            cancelled: false,
            delivered,
        })
    }

    // ------------------------------------------------------------------------
    // Registry and catalog operations
    // ------------------------------------------------------------------------

    pub fn list_providers(&self) -> Vec<ProviderInfo> {
        self.registry.list_providers()
    }

    pub fn list_models(&self, provider_id: &str) -> Result<Vec<ModelDescriptor>> {
        self.registry.list_models(provider_id)
    }

    /// Catalog models scoring above the cutoff for `use_case`, best first.
    pub fn recommend(&self, use_case: &str, top_n: Option<usize>) -> Vec<ScoredModel> {
        self.scoring
            .recommend(&self.registry.catalog(), use_case, top_n)
    }

    pub fn set_provider(&self, provider_id: &str, model_id: &str) -> Result<()> {
        self.registry.set_provider(provider_id, model_id)
    }

    pub fn register_provider(&self, descriptor: ProviderDescriptor) -> Result<String> {
        self.registry.register_provider(descriptor)
    }

    pub fn deregister_provider(&self, provider_id: &str) -> bool {
        self.registry.deregister_provider(provider_id)
    }

    pub async fn test_connection(&self, provider_id: &str) -> bool {
        self.registry.test_connection(provider_id).await
    }

    pub async fn test_all_providers(&self) -> BTreeMap<String, bool> {
        self.registry.test_all_providers().await
    }
}

/// Builder for [`Orchestrator`]. Unset collaborators default to empty/in-memory ones.
pub struct OrchestratorBuilder {
    registry: Arc<ProviderRegistry>,
    scoring: Option<ScoringEngine>,
    similarity: Option<Arc<dyn SimilaritySearch>>,
    documentation: Option<Arc<dyn DocumentationSource>>,
    store: Option<Arc<dyn ArtifactStore>>,
    reviewer: Option<Arc<dyn Reviewer>>,
    config: PipelineConfig,
    retry: Option<RetryPolicy>,
    events: Option<UnboundedSender<PipelineEvent>>,
}

impl OrchestratorBuilder {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            scoring: None,
            similarity: None,
            documentation: None,
            store: None,
            reviewer: None,
            config: PipelineConfig::default(),
            retry: None,
            events: None,
        }
    }

    pub fn scoring(mut self, engine: ScoringEngine) -> Self {
        self.scoring = Some(engine);
        self
    }

    pub fn similarity(mut self, search: Arc<dyn SimilaritySearch>) -> Self {
        self.similarity = Some(search);
        self
    }

    pub fn documentation(mut self, source: Arc<dyn DocumentationSource>) -> Self {
        self.documentation = Some(source);
        self
    }

    pub fn store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn reviewer(mut self, reviewer: Arc<dyn Reviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the policy derived from the pipeline config.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn events(mut self, sink: UnboundedSender<PipelineEvent>) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate().map_err(GenError::Config)?;
        let retry = self
            .retry
            .unwrap_or_else(|| RetryPolicy::from_config(&self.config));

        Ok(Orchestrator {
            registry: self.registry,
            scoring: Arc::new(self.scoring.unwrap_or_default()),
            similarity: self.similarity.unwrap_or_else(|| Arc::new(NoSimilarity)),
            documentation: self
                .documentation
                .unwrap_or_else(|| Arc::new(NoDocumentation)),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryArtifactStore::new())),
            reviewer: self
                .reviewer
                .unwrap_or_else(|| Arc::new(RuleBasedReviewer::default())),
            config: self.config,
            retry,
            streaming: StreamingCoordinator::new(),
            events: self.events,
        })
    }
}
