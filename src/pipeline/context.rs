//! Context building and retrieval.
//!
//! Every collaborator failure here is absorbed: an error or a timeout leaves the affected
//! part of the context empty and the run continues.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::collaborators::{
    ArtifactStore, DocSnippet, DocumentationSource, SimilarArtifact, SimilaritySearch,
};
use super::GenerationRequest;

/// Read-only bundle handed to prompt assembly and review. Rebuilt per request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationContext {
    pub similar: Vec<SimilarArtifact>,
    pub documentation: Vec<DocSnippet>,
    pub patterns: Vec<String>,
    pub project: HashMap<String, String>,
}

impl GenerationContext {
    pub fn is_empty(&self) -> bool {
        self.similar.is_empty()
            && self.documentation.is_empty()
            && self.patterns.is_empty()
            && self.project.is_empty()
    }

    /// Ids of the request references and similar artifacts that fed this context.
    pub fn references(&self, request: &GenerationRequest) -> Vec<String> {
        let mut refs = request.context_refs.clone();
        for similar in &self.similar {
            if !refs.contains(&similar.id) {
                refs.push(similar.id.clone());
            }
        }
        refs
    }
}

/// Limits applied while building context.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ContextLimits {
    pub timeout: Duration,
    pub max_similar: usize,
    pub max_patterns: usize,
}

pub(crate) struct ContextBuilder {
    pub similarity: Arc<dyn SimilaritySearch>,
    pub documentation: Arc<dyn DocumentationSource>,
    pub store: Arc<dyn ArtifactStore>,
    pub limits: ContextLimits,
}

impl ContextBuilder {
    /// Project metadata and code patterns.
    pub(crate) async fn base(&self, request: &GenerationRequest) -> GenerationContext {
        let mut context = GenerationContext {
            project: request
                .project
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ..Default::default()
        };
        if let Some(framework) = &request.framework {
            context
                .project
                .entry("framework".to_string())
                .or_insert_with(|| framework.clone());
        }

        let templates = tokio::time::timeout(
            self.limits.timeout,
            self.store
                .fetch_templates(request.category.as_deref(), request.framework.as_deref()),
        )
        .await;
        match templates {
            Ok(Ok(mut patterns)) => {
                patterns.truncate(self.limits.max_patterns);
                context.patterns = patterns;
            }
            Ok(Err(e)) => warn!(error = %e, "Template lookup failed, continuing without patterns"),
            Err(_) => warn!("Template lookup timed out, continuing without patterns"),
        }
        context
    }

    /// Similar artifacts and documentation, fetched concurrently.
    ///
    /// Each branch has its own deadline: a stalled branch leaves only its part of the
    /// context empty and keeps whatever the other branch returned.
    pub(crate) async fn retrieve(&self, request: &GenerationRequest, context: &mut GenerationContext) {
        let limit = self.limits.timeout;

        let similar = async {
            match tokio::time::timeout(
                limit,
                self.similarity.find_similar(request, self.limits.max_similar),
            )
            .await
            {
                Ok(Ok(mut hits)) => {
                    hits.truncate(self.limits.max_similar);
                    hits
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Similarity search failed");
                    Vec::new()
                }
                Err(_) => {
                    warn!(timeout_ms = limit.as_millis() as u64, "Similarity search timed out");
                    Vec::new()
                }
            }
        };

        let docs = async {
            let Some(framework) = request.framework.as_deref() else {
                return Vec::new();
            };
            let component = request.category.as_deref().unwrap_or("general");
            match tokio::time::timeout(limit, self.documentation.fetch(framework, component)).await
            {
                Ok(Ok(Some(text))) if !text.trim().is_empty() => vec![DocSnippet {
                    source: format!("{}/{}", framework, component),
                    text,
                }],
                Ok(Ok(_)) => Vec::new(),
                Ok(Err(e)) => {
                    warn!(error = %e, "Documentation fetch failed");
                    Vec::new()
                }
                Err(_) => {
                    warn!(timeout_ms = limit.as_millis() as u64, "Documentation fetch timed out");
                    Vec::new()
                }
            }
        };

        let (similar, documentation) = tokio::join!(similar, docs);
        debug!(
            similar = similar.len(),
            docs = documentation.len(),
            "Retrieval finished"
        );
        context.similar = similar;
        context.documentation = documentation;
    }
}
