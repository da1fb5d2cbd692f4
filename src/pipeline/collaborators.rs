//! External collaborators the pipeline calls: similarity search, documentation and storage.
//!
//! The pipeline only sees the traits. The in-memory implementations here back tests and
//! embedders that have no real index or store.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use super::{GeneratedArtifact, GenerationRequest};
use crate::error::{GenError, Result};

/// A previously generated artifact ranked against a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarArtifact {
    pub id: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Body excerpt used as prompt context.
    #[serde(default)]
    pub snippet: Option<String>,
}

/// Documentation text for a framework/component pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocSnippet {
    pub source: String,
    pub text: String,
}

#[async_trait]
pub trait SimilaritySearch: Send + Sync {
    /// Ranked matches, best first.
    async fn find_similar(
        &self,
        request: &GenerationRequest,
        limit: usize,
    ) -> Result<Vec<SimilarArtifact>>;
}

#[async_trait]
pub trait DocumentationSource: Send + Sync {
    async fn fetch(&self, framework: &str, component_type: &str) -> Result<Option<String>>;
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist a snapshot and return its id.
    async fn store(&self, artifact: &GeneratedArtifact) -> Result<String>;

    /// Code-pattern snippets for a category/framework.
    async fn fetch_templates(
        &self,
        category: Option<&str>,
        framework: Option<&str>,
    ) -> Result<Vec<String>>;
}

/// Search that never finds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSimilarity;

#[async_trait]
impl SimilaritySearch for NoSimilarity {
    async fn find_similar(&self, _: &GenerationRequest, _: usize) -> Result<Vec<SimilarArtifact>> {
        Ok(Vec::new())
    }
}

/// Documentation source with no entries.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDocumentation;

#[async_trait]
impl DocumentationSource for NoDocumentation {
    async fn fetch(&self, _: &str, _: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Similarity search over a fixed corpus, ranked by word overlap with the task.
#[derive(Debug, Default)]
pub struct InMemorySimilarity {
    entries: RwLock<Vec<(String, String)>>,
}

impl InMemorySimilarity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, body: impl Into<String>) {
        self.entries.write().push((id.into(), body.into()));
    }
}

fn word_set(text: &str) -> std::collections::HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl SimilaritySearch for InMemorySimilarity {
    async fn find_similar(
        &self,
        request: &GenerationRequest,
        limit: usize,
    ) -> Result<Vec<SimilarArtifact>> {
        let query = word_set(&request.task);
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<SimilarArtifact> = self
            .entries
            .read()
            .iter()
            .filter_map(|(id, body)| {
                let words = word_set(body);
                let overlap = query.intersection(&words).count();
                (overlap > 0).then(|| SimilarArtifact {
                    id: id.clone(),
                    score: overlap as f64 / query.len() as f64,
                    metadata: HashMap::new(),
                    snippet: Some(body.clone()),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Documentation keyed by `(framework, component_type)`, case-insensitive.
#[derive(Debug, Default)]
pub struct StaticDocumentation {
    docs: HashMap<(String, String), String>,
}

impl StaticDocumentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        framework: &str,
        component_type: &str,
        text: impl Into<String>,
    ) -> Self {
        self.docs.insert(
            (framework.to_lowercase(), component_type.to_lowercase()),
            text.into(),
        );
        self
    }
}

#[async_trait]
impl DocumentationSource for StaticDocumentation {
    async fn fetch(&self, framework: &str, component_type: &str) -> Result<Option<String>> {
        Ok(self
            .docs
            .get(&(framework.to_lowercase(), component_type.to_lowercase()))
            .cloned())
    }
}

/// Store that keeps snapshots in memory.
///
/// `failing_first(n)` makes the first `n` store calls fail, for exercising persist retries.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    artifacts: RwLock<Vec<(String, GeneratedArtifact)>>,
    templates: HashMap<String, Vec<String>>,
    failures_left: AtomicU32,
    store_calls: AtomicU32,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(self, failures: u32) -> Self {
        self.failures_left.store(failures, Ordering::SeqCst);
        self
    }

    /// Templates returned for `category` (or for any category when registered under `*`).
    pub fn with_templates(mut self, category: &str, templates: Vec<String>) -> Self {
        self.templates.insert(category.to_lowercase(), templates);
        self
    }

    pub fn len(&self) -> usize {
        self.artifacts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<GeneratedArtifact> {
        self.artifacts
            .read()
            .iter()
            .find(|(stored, _)| stored == id)
            .map(|(_, artifact)| artifact.clone())
    }

    pub fn store_calls(&self) -> u32 {
        self.store_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn store(&self, artifact: &GeneratedArtifact) -> Result<String> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(GenError::request_failed(None, "artifact store unavailable"));
        }

        let id = format!("artifact-{}", uuid::Uuid::new_v4().simple());
        self.artifacts.write().push((id.clone(), artifact.clone()));
        Ok(id)
    }

    async fn fetch_templates(
        &self,
        category: Option<&str>,
        _framework: Option<&str>,
    ) -> Result<Vec<String>> {
        let key = category.map(str::to_lowercase);
        Ok(key
            .and_then(|k| self.templates.get(&k))
            .or_else(|| self.templates.get("*"))
            .cloned()
            .unwrap_or_default())
    }
}
