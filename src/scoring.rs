//! Use-case scoring over the model catalog.
//!
//! `score(model, use_case)` is a deterministic additive function clamped to `[0, 1]`:
//!
//! | Signal | Bonus |
//! |--------|-------|
//! | each matching best-for tag | `best_for` (capped at `best_for_cap`) |
//! | each matching strength tag | `strength` (capped at `strength_cap`) |
//! | mentions "vision", model has vision | `vision` |
//! | mentions "code", model is tagged for coding | `code` |
//! | mentions "function", model calls functions | `function` |
//! | mentions "large"/"context" | up to `context_max`, proportional to the window |
//! | mentions "budget"/"cheap" | up to `budget_max`, inverse to input price |
//!
//! The weights are configurable defaults under `[scoring]`.

use serde::{Deserialize, Serialize};

use crate::model_config::{ModelDescriptor, ProviderDescriptor};

/// Weights and thresholds for [`ScoringEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub best_for: f64,
    pub best_for_cap: f64,
    pub strength: f64,
    pub strength_cap: f64,
    pub vision: f64,
    pub code: f64,
    pub function: f64,
    pub context_max: f64,
    /// Window size (tokens) that earns the full context bonus.
    pub context_reference: usize,
    pub budget_max: f64,
    /// Input price per 1k tokens at or above which the budget bonus is zero.
    pub budget_reference_price: f64,
    /// `recommend` keeps entries scoring strictly above this.
    pub recommend_cutoff: f64,
    pub default_top_n: usize,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            best_for: 0.3,
            best_for_cap: 0.6,
            strength: 0.2,
            strength_cap: 0.4,
            vision: 0.3,
            code: 0.3,
            function: 0.2,
            context_max: 0.3,
            context_reference: 200_000,
            budget_max: 0.3,
            budget_reference_price: 0.01,
            recommend_cutoff: 0.7,
            default_top_n: 5,
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> Result<(), String> {
        let unit = [
            ("best_for", self.best_for),
            ("best_for_cap", self.best_for_cap),
            ("strength", self.strength),
            ("strength_cap", self.strength_cap),
            ("vision", self.vision),
            ("code", self.code),
            ("function", self.function),
            ("context_max", self.context_max),
            ("budget_max", self.budget_max),
            ("recommend_cutoff", self.recommend_cutoff),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("scoring.{} must be within [0, 1], got {}", name, value));
            }
        }
        if self.context_reference == 0 {
            return Err("scoring.context_reference must be positive".to_string());
        }
        if self.budget_reference_price <= 0.0 {
            return Err("scoring.budget_reference_price must be positive".to_string());
        }
        Ok(())
    }
}

/// A model with its use-case score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredModel {
    pub provider_id: String,
    pub model_id: String,
    pub score: f64,
}

/// Deterministic use-case scorer.
#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    weights: ScoringWeights,
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
}

/// Case-insensitive overlap between a tag and the use-case text.
fn tag_matches(tag: &str, text: &str) -> bool {
    let tag = tag.trim().to_lowercase();
    if tag.is_empty() {
        return false;
    }
    text.contains(&tag) || words(text).any(|word| tag.contains(word))
}

fn mentions(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

impl ScoringEngine {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Score `model` for `use_case`. Always within `[0, 1]`.
    pub fn score(&self, model: &ModelDescriptor, use_case: &str) -> f64 {
        let w = &self.weights;
        let text = use_case.to_lowercase();
        let mut score = 0.0;

        let best_for = model.best_for.iter().filter(|t| tag_matches(t, &text)).count();
        score += (best_for as f64 * w.best_for).min(w.best_for_cap);

        let strengths = model.strengths.iter().filter(|t| tag_matches(t, &text)).count();
        score += (strengths as f64 * w.strength).min(w.strength_cap);

        if mentions(&text, &["vision"]) && model.capabilities.vision {
            score += w.vision;
        }
        if mentions(&text, &["code", "coding"]) && model.supports_coding() {
            score += w.code;
        }
        if mentions(&text, &["function"]) && model.capabilities.function_calling {
            score += w.function;
        }
        if mentions(&text, &["large", "context"]) {
            let ratio = model.context_window as f64 / w.context_reference.max(1) as f64;
            score += w.context_max * ratio.min(1.0);
        }
        if mentions(&text, &["budget", "cheap"]) {
            score += match &model.pricing {
                Some(pricing) if w.budget_reference_price > 0.0 => {
                    let ratio = (pricing.input_per_1k / w.budget_reference_price).max(0.0);
                    w.budget_max * (1.0 - ratio.min(1.0))
                }
                Some(_) => 0.0,
                None => w.budget_max,
            };
        }

        if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Score every catalog model, highest first; ties keep catalog order.
    pub fn rank<'a>(
        &self,
        catalog: impl IntoIterator<Item = &'a ProviderDescriptor>,
        use_case: &str,
    ) -> Vec<ScoredModel> {
        let mut scored: Vec<ScoredModel> = catalog
            .into_iter()
            .flat_map(|provider| {
                provider.models.iter().map(move |model| ScoredModel {
                    provider_id: provider.id.clone(),
                    model_id: model.id.clone(),
                    score: self.score(model, use_case),
                })
            })
            .collect();
        // Stable sort keeps catalog order for equal scores.
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored
    }

    /// Entries scoring above the cutoff, highest first, at most `top_n`.
    pub fn recommend<'a>(
        &self,
        catalog: impl IntoIterator<Item = &'a ProviderDescriptor>,
        use_case: &str,
        top_n: Option<usize>,
    ) -> Vec<ScoredModel> {
        let limit = top_n.unwrap_or(self.weights.default_top_n);
        self.rank(catalog, use_case)
            .into_iter()
            .filter(|m| m.score > self.weights.recommend_cutoff)
            .take(limit)
            .collect()
    }

    /// Ranked alternatives for fallback, excluding the pair that already failed.
    ///
    /// No cutoff applies: any available model is better than failing the request.
    pub fn fallback_candidates<'a>(
        &self,
        catalog: impl IntoIterator<Item = &'a ProviderDescriptor>,
        exclude: (&str, &str),
        use_case: &str,
        n: usize,
    ) -> Vec<ScoredModel> {
        self.rank(catalog, use_case)
            .into_iter()
            .filter(|m| !(m.provider_id == exclude.0 && m.model_id == exclude.1))
            .take(n)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_config::{CodeforgeConfig, ModelCapabilities, ModelPricing};

    fn model(best_for: &[&str], strengths: &[&str]) -> ModelDescriptor {
        ModelDescriptor {
            id: "m".to_string(),
            name: "M".to_string(),
            best_for: best_for.iter().map(|s| s.to_string()).collect(),
            strengths: strengths.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_use_case_in_range() {
        let engine = ScoringEngine::default();
        for provider in CodeforgeConfig::builtin_defaults().providers {
            for m in &provider.models {
                let score = engine.score(m, "");
                assert!((0.0..=1.0).contains(&score), "{} scored {}", m.id, score);
            }
        }
    }

    #[test]
    fn test_best_for_bonus_is_capped() {
        let engine = ScoringEngine::default();
        let m = model(&["react", "forms", "tables"], &[]);
        let score = engine.score(&m, "react forms tables");
        assert!((score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_word_inside_tag_matches() {
        assert!(tag_matches("code generation", "generation of a parser"));
        assert!(tag_matches("vision", "needs vision support"));
        assert!(!tag_matches("vision", "a to do app"));
        assert!(!tag_matches("", "anything"));
    }

    #[test]
    fn test_capability_bonuses() {
        let engine = ScoringEngine::default();
        let m = ModelDescriptor {
            capabilities: ModelCapabilities {
                vision: true,
                function_calling: true,
                streaming: true,
                json_mode: false,
            },
            ..Default::default()
        };
        assert!((engine.score(&m, "vision") - 0.3).abs() < 1e-9);
        assert!((engine.score(&m, "function") - 0.2).abs() < 1e-9);
        assert_eq!(engine.score(&m, "code"), 0.0);
    }

    #[test]
    fn test_budget_bonus() {
        let engine = ScoringEngine::default();
        let free = ModelDescriptor::default();
        let cheap = ModelDescriptor {
            pricing: Some(ModelPricing::usd(0.0025, 0.01)),
            ..Default::default()
        };
        let pricey = ModelDescriptor {
            pricing: Some(ModelPricing::usd(0.05, 0.1)),
            ..Default::default()
        };
        assert!((engine.score(&free, "cheap") - 0.3).abs() < 1e-9);
        assert!((engine.score(&cheap, "budget") - 0.225).abs() < 1e-9);
        assert_eq!(engine.score(&pricey, "budget"), 0.0);
    }

    #[test]
    fn test_context_bonus_proportional() {
        let engine = ScoringEngine::default();
        let half = ModelDescriptor {
            context_window: 100_000,
            ..Default::default()
        };
        let huge = ModelDescriptor {
            context_window: 2_000_000,
            ..Default::default()
        };
        assert!((engine.score(&half, "large context") - 0.15).abs() < 1e-9);
        assert!((engine.score(&huge, "large context") - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_recommend_properties() {
        let engine = ScoringEngine::default();
        let catalog = CodeforgeConfig::builtin_defaults().providers;
        for use_case in [
            "code generation for a react component",
            "cheap budget prototyping",
            "large context documentation analysis",
            "vision",
            "",
        ] {
            for top_n in [1usize, 2, 5] {
                let recs = engine.recommend(&catalog, use_case, Some(top_n));
                assert!(recs.len() <= top_n);
                assert!(recs.iter().all(|r| r.score > 0.7));
                assert!(recs.windows(2).all(|w| w[0].score >= w[1].score));
            }
        }
    }

    #[test]
    fn test_recommend_coding_prefers_code_models() {
        let engine = ScoringEngine::default();
        let catalog = CodeforgeConfig::builtin_defaults().providers;
        let recs = engine.recommend(&catalog, "code generation", None);
        assert!(!recs.is_empty());
        assert!(recs.iter().all(|r| r.model_id != "llama-3.3-70b-versatile"));
    }

    #[test]
    fn test_ties_keep_catalog_order() {
        let engine = ScoringEngine::default();
        let catalog = CodeforgeConfig::builtin_defaults().providers;
        let ranked = engine.rank(&catalog, "");
        let expected: Vec<_> = catalog
            .iter()
            .flat_map(|p| p.models.iter().map(|m| m.id.clone()))
            .collect();
        let actual: Vec<_> = ranked.into_iter().map(|m| m.model_id).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_fallback_excludes_failed_pair() {
        let engine = ScoringEngine::default();
        let catalog = CodeforgeConfig::builtin_defaults().providers;
        let candidates = engine.fallback_candidates(&catalog, ("openai", "gpt-4o"), "code", 3);
        assert_eq!(candidates.len(), 3);
        assert!(candidates
            .iter()
            .all(|c| !(c.provider_id == "openai" && c.model_id == "gpt-4o")));
    }

    #[test]
    fn test_weights_validation() {
        assert!(ScoringWeights::default().validate().is_ok());
        let bad = ScoringWeights {
            vision: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
