//! Quality review of generated artifacts.
//!
//! Two reviewers share the [`Reviewer`] trait:
//! - [`RuleBasedReviewer`]: deterministic static checks. Every rule deducts from one metric
//!   (maintainability, reliability, security, performance); metrics start at 100.
//! - [`ProviderReviewer`]: delegates to an adapter and parses a JSON verdict. Any provider or
//!   parse failure yields [`ReviewResult::unscored`] instead of an error.
//!
//! The overall score is always derived from the metric scores with [`ReviewWeights`]
//! (an unweighted mean by default), never taken from the reviewer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::pipeline::GenerationContext;
use crate::traits::{GenerateOptions, ProviderAdapter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Maintainability,
    Reliability,
    Security,
    Performance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub severity: Severity,
    pub metric: Metric,
    /// Stable rule identifier (e.g. `no-eval`).
    #[serde(default)]
    pub rule: String,
    pub description: String,
    #[serde(default)]
    pub fix: Option<String>,
    /// Occurrences found.
    #[serde(default = "one")]
    pub occurrences: usize,
}

fn one() -> usize {
    1
}

/// Metric scores in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricScores {
    pub maintainability: f64,
    pub reliability: f64,
    pub security: f64,
    pub performance: f64,
}

impl Default for MetricScores {
    fn default() -> Self {
        Self {
            maintainability: 100.0,
            reliability: 100.0,
            security: 100.0,
            performance: 100.0,
        }
    }
}

impl MetricScores {
    fn deduct(&mut self, metric: Metric, amount: f64) {
        let slot = match metric {
            Metric::Maintainability => &mut self.maintainability,
            Metric::Reliability => &mut self.reliability,
            Metric::Security => &mut self.security,
            Metric::Performance => &mut self.performance,
        };
        *slot = (*slot - amount).max(0.0);
    }

    fn clamped(self) -> Self {
        let c = |v: f64| if v.is_finite() { v.clamp(0.0, 100.0) } else { 0.0 };
        Self {
            maintainability: c(self.maintainability),
            reliability: c(self.reliability),
            security: c(self.security),
            performance: c(self.performance),
        }
    }
}

/// Metric weights for the overall score (`[review]` config section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewWeights {
    pub maintainability: f64,
    pub reliability: f64,
    pub security: f64,
    pub performance: f64,
}

impl Default for ReviewWeights {
    fn default() -> Self {
        Self {
            maintainability: 0.25,
            reliability: 0.25,
            security: 0.25,
            performance: 0.25,
        }
    }
}

impl ReviewWeights {
    /// Weighted mean of the metrics.
    pub fn overall(&self, metrics: &MetricScores) -> f64 {
        let total = self.maintainability + self.reliability + self.security + self.performance;
        if total <= 0.0 {
            return (metrics.maintainability
                + metrics.reliability
                + metrics.security
                + metrics.performance)
                / 4.0;
        }
        (metrics.maintainability * self.maintainability
            + metrics.reliability * self.reliability
            + metrics.security * self.security
            + metrics.performance * self.performance)
            / total
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("maintainability", self.maintainability),
            ("reliability", self.reliability),
            ("security", self.security),
            ("performance", self.performance),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("review.{} must be within [0, 1], got {}", name, value));
            }
        }
        if self.maintainability + self.reliability + self.security + self.performance <= 0.0 {
            return Err("review weights must not all be zero".to_string());
        }
        Ok(())
    }
}

/// Review of one artifact version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub issues: Vec<ReviewIssue>,
    pub positives: Vec<String>,
    /// `None` when the review could not be scored.
    pub metrics: Option<MetricScores>,
    pub overall_score: Option<f64>,
    /// Which reviewer produced this result.
    pub reviewer: String,
    /// Why the review is unscored, if it is.
    #[serde(default)]
    pub note: Option<String>,
}

impl ReviewResult {
    /// Scored result; the overall score is derived from `metrics`.
    pub fn scored(
        reviewer: impl Into<String>,
        issues: Vec<ReviewIssue>,
        positives: Vec<String>,
        metrics: MetricScores,
        weights: &ReviewWeights,
    ) -> Self {
        let metrics = metrics.clamped();
        Self {
            issues,
            positives,
            overall_score: Some(weights.overall(&metrics)),
            metrics: Some(metrics),
            reviewer: reviewer.into(),
            note: None,
        }
    }

    /// Result for a review that could not be performed.
    pub fn unscored(reviewer: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            issues: Vec::new(),
            positives: Vec::new(),
            metrics: None,
            overall_score: None,
            reviewer: reviewer.into(),
            note: Some(note.into()),
        }
    }

    pub fn is_scored(&self) -> bool {
        self.overall_score.is_some()
    }

    /// Scored and under `threshold`. Unscored results never count as below.
    pub fn is_below(&self, threshold: f64) -> bool {
        self.overall_score.is_some_and(|score| score < threshold)
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.issues.iter().map(|i| i.severity).max()
    }
}

/// Scores an artifact body.
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, body: &str, context: &GenerationContext) -> ReviewResult;
}

// ============================================================================
// Rule-based reviewer
// ============================================================================

struct Finding {
    rule: &'static str,
    severity: Severity,
    metric: Metric,
    description: &'static str,
    fix: &'static str,
    /// Deduction per occurrence.
    penalty: f64,
    /// Occurrences beyond this are not penalised further.
    max_hits: usize,
    occurrences: usize,
}

const LONG_LINE: usize = 120;
const LONG_BODY_LINES: usize = 300;

/// Deterministic static-pattern reviewer.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedReviewer {
    weights: ReviewWeights,
}

impl RuleBasedReviewer {
    pub fn new(weights: ReviewWeights) -> Self {
        Self { weights }
    }

    /// Synchronous core of the review.
    pub fn analyze(&self, body: &str) -> ReviewResult {
        let findings = findings(body);
        let mut metrics = MetricScores::default();
        let mut issues = Vec::with_capacity(findings.len());

        for f in findings {
            metrics.deduct(f.metric, f.penalty * f.occurrences.min(f.max_hits) as f64);
            issues.push(ReviewIssue {
                severity: f.severity,
                metric: f.metric,
                rule: f.rule.to_string(),
                description: f.description.to_string(),
                fix: Some(f.fix.to_string()),
                occurrences: f.occurrences,
            });
        }
        issues.sort_by(|a, b| b.severity.cmp(&a.severity));

        ReviewResult::scored("rules", issues, positives(body), metrics, &self.weights)
    }
}

#[async_trait]
impl Reviewer for RuleBasedReviewer {
    async fn review(&self, body: &str, _context: &GenerationContext) -> ReviewResult {
        self.analyze(body)
    }
}

fn count(body: &str, needle: &str) -> usize {
    body.matches(needle).count()
}

/// Lines assigning a quoted literal of 8+ chars to a secret-looking name.
fn hardcoded_secrets(body: &str) -> usize {
    const NAMES: [&str; 6] = ["api_key", "apikey", "secret", "password", "token", "private_key"];
    body.lines()
        .filter(|line| {
            let lower = line.to_lowercase().replace(['-', ' '], "");
            let Some(name_at) = NAMES.iter().filter_map(|n| lower.find(n)).min() else {
                return false;
            };
            let rest = &lower[name_at..];
            let Some(assign_at) = rest.find(['=', ':']) else {
                return false;
            };
            let value = rest[assign_at + 1..].trim_start_matches(['=', '>', ' ']);
            let Some(quote) = value.chars().next().filter(|c| matches!(c, '"' | '\'' | '`'))
            else {
                return false;
            };
            value[1..]
                .find(quote)
                .is_some_and(|literal_len| literal_len >= 8)
        })
        .count()
}

fn empty_catches(body: &str) -> usize {
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    let mut hits = 0;
    let mut rest = compact.as_str();
    while let Some(pos) = rest.find("catch") {
        let after = &rest[pos + 5..];
        let after = if after.starts_with('(') {
            after.find(')').map(|end| &after[end + 1..]).unwrap_or(after)
        } else {
            after
        };
        if after.starts_with("{}") {
            hits += 1;
        }
        rest = &rest[pos + 5..];
    }
    hits
}

fn findings(body: &str) -> Vec<Finding> {
    let mut out = Vec::new();
    let mut add = |rule,
                   severity,
                   metric,
                   description,
                   fix,
                   penalty,
                   max_hits,
                   occurrences: usize| {
        if occurrences > 0 {
            out.push(Finding {
                rule,
                severity,
                metric,
                description,
                fix,
                penalty,
                max_hits,
                occurrences,
            });
        }
    };

    add(
        "no-eval",
        Severity::Critical,
        Metric::Security,
        "Use of eval() executes arbitrary code",
        "Parse the input explicitly instead of evaluating it",
        40.0,
        1,
        count(body, "eval("),
    );
    add(
        "no-hardcoded-secret",
        Severity::Critical,
        Metric::Security,
        "Credential literal embedded in source",
        "Read secrets from configuration or the environment",
        40.0,
        1,
        hardcoded_secrets(body),
    );
    add(
        "no-inner-html",
        Severity::High,
        Metric::Security,
        "Raw HTML assignment enables script injection",
        "Use textContent or a sanitizer",
        20.0,
        2,
        count(body, "innerHTML") + count(body, "dangerouslySetInnerHTML"),
    );
    add(
        "no-function-constructor",
        Severity::High,
        Metric::Security,
        "new Function() compiles code at runtime",
        "Replace with a regular function",
        25.0,
        1,
        count(body, "new Function("),
    );
    add(
        "no-unwrap",
        Severity::Medium,
        Metric::Reliability,
        "unwrap() panics on error values",
        "Propagate the error with ? or handle it",
        5.0,
        4,
        count(body, ".unwrap()"),
    );
    add(
        "no-empty-catch",
        Severity::Medium,
        Metric::Reliability,
        "Empty catch block swallows errors",
        "Log or rethrow the error",
        15.0,
        2,
        empty_catches(body),
    );
    let unguarded_fetch = body.contains("fetch(")
        && !body.contains("try")
        && !body.contains(".catch(");
    add(
        "unhandled-fetch",
        Severity::Medium,
        Metric::Reliability,
        "Network call without error handling",
        "Wrap the request in try/catch or attach .catch()",
        10.0,
        1,
        usize::from(unguarded_fetch),
    );
    add(
        "no-console-log",
        Severity::Low,
        Metric::Maintainability,
        "Debug logging left in code",
        "Remove or route through a logger",
        3.0,
        5,
        count(body, "console.log("),
    );
    add(
        "todo-marker",
        Severity::Info,
        Metric::Maintainability,
        "Unfinished work marker",
        "Resolve or track the TODO",
        2.0,
        5,
        count(body, "TODO") + count(body, "FIXME"),
    );
    add(
        "long-line",
        Severity::Low,
        Metric::Maintainability,
        "Line longer than 120 characters",
        "Break the line up",
        1.0,
        10,
        body.lines().filter(|l| l.chars().count() > LONG_LINE).count(),
    );
    add(
        "long-body",
        Severity::Medium,
        Metric::Maintainability,
        "Artifact is very long",
        "Split into smaller units",
        10.0,
        1,
        usize::from(body.lines().count() > LONG_BODY_LINES),
    );
    add(
        "deep-clone-json",
        Severity::Low,
        Metric::Performance,
        "JSON round trip used for cloning",
        "Use structuredClone or a targeted copy",
        10.0,
        1,
        count(body, "JSON.parse(JSON.stringify("),
    );
    let leaked_intervals = count(body, "setInterval(").saturating_sub(count(body, "clearInterval("));
    add(
        "interval-leak",
        Severity::Medium,
        Metric::Performance,
        "Interval is never cleared",
        "Clear the interval on teardown",
        15.0,
        2,
        leaked_intervals,
    );
    add(
        "sync-io",
        Severity::Low,
        Metric::Performance,
        "Blocking file I/O",
        "Use the async variant",
        10.0,
        1,
        count(body, "readFileSync(") + count(body, "writeFileSync("),
    );

    out
}

fn positives(body: &str) -> Vec<String> {
    let mut out = Vec::new();
    let typed = [": string", ": number", ": boolean", "interface ", "-> ", ": &str", "type "]
        .iter()
        .any(|p| body.contains(p));
    if typed {
        out.push("Uses explicit types".to_string());
    }
    let handles_errors = ["try {", "try{", ".catch(", "Result<", "?;", "except "]
        .iter()
        .any(|p| body.contains(p));
    if handles_errors {
        out.push("Handles errors".to_string());
    }
    let commented = body
        .lines()
        .map(str::trim_start)
        .any(|l| l.starts_with("//") || l.starts_with("/*") || l.starts_with("# ") || l.starts_with("* "));
    if commented {
        out.push("Contains explanatory comments".to_string());
    }
    let tested = ["#[test]", "def test_"].iter().any(|p| body.contains(p))
        || ["describe(", "it(", "test("]
            .iter()
            .any(|call| calls_function(body, call));
    if tested {
        out.push("Includes tests".to_string());
    }
    out
}

/// True when `call` appears with no identifier character right before it,
/// so `it(` matches `it('adds')` but not `submit(`.
fn calls_function(body: &str, call: &str) -> bool {
    body.match_indices(call).any(|(at, _)| {
        body[..at]
            .chars()
            .next_back()
            .map_or(true, |c| !(c.is_alphanumeric() || c == '_' || c == '$' || c == '.'))
    })
}

// ============================================================================
// Provider-delegated reviewer
// ============================================================================

#[derive(Debug, Deserialize)]
struct Verdict {
    #[serde(default)]
    issues: Vec<ReviewIssue>,
    #[serde(default)]
    positives: Vec<String>,
    metrics: MetricScores,
}

/// Reviewer that asks a provider for a JSON verdict.
pub struct ProviderReviewer {
    adapter: Arc<dyn ProviderAdapter>,
    weights: ReviewWeights,
    options: GenerateOptions,
}

impl ProviderReviewer {
    pub fn new(adapter: Arc<dyn ProviderAdapter>, weights: ReviewWeights) -> Self {
        Self {
            adapter,
            weights,
            options: GenerateOptions::with_temperature(0.0).max_tokens(1024),
        }
    }

    fn prompt(body: &str, context: &GenerationContext) -> String {
        let mut prompt = String::from(
            "Review the following code. Respond with JSON only, shaped as:\n\
             {\"issues\":[{\"severity\":\"low|medium|high|critical\",\
             \"metric\":\"maintainability|reliability|security|performance\",\
             \"description\":\"...\",\"fix\":\"...\"}],\
             \"positives\":[\"...\"],\
             \"metrics\":{\"maintainability\":0-100,\"reliability\":0-100,\
             \"security\":0-100,\"performance\":0-100}}\n",
        );
        if let Some(framework) = context.project.get("framework") {
            prompt.push_str(&format!("Framework: {}\n", framework));
        }
        prompt.push_str("\nCode:\n");
        prompt.push_str(body);
        prompt
    }

    fn parse(&self, raw: &str) -> Option<Verdict> {
        let start = raw.find('{')?;
        let end = raw.rfind('}')?;
        if end < start {
            return None;
        }
        serde_json::from_str(&raw[start..=end])
            .map_err(|e| debug!(error = %e, "Review verdict did not parse"))
            .ok()
    }
}

#[async_trait]
impl Reviewer for ProviderReviewer {
    async fn review(&self, body: &str, context: &GenerationContext) -> ReviewResult {
        let reviewer = format!("{}/{}", self.adapter.provider_id(), self.adapter.model());
        let response = match self
            .adapter
            .generate(&Self::prompt(body, context), &self.options)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(reviewer = %reviewer, error = %e, "Delegated review failed");
                return ReviewResult::unscored(reviewer, format!("review call failed: {}", e));
            }
        };

        match self.parse(&response.content) {
            Some(verdict) => ReviewResult::scored(
                reviewer,
                verdict.issues,
                verdict.positives,
                verdict.metrics,
                &self.weights,
            ),
            None => ReviewResult::unscored(reviewer, "review verdict was not valid JSON"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockAdapter;

    fn review(body: &str) -> ReviewResult {
        RuleBasedReviewer::default().analyze(body)
    }

    #[test]
    fn test_clean_code_scores_full() {
        let result = review("export function add(a: number, b: number): number {\n  return a + b;\n}\n");
        assert!(result.issues.is_empty());
        assert_eq!(result.overall_score, Some(100.0));
        assert!(result.positives.contains(&"Uses explicit types".to_string()));
    }

    #[test]
    fn test_eval_is_critical_security() {
        let result = review("const x = eval(userInput);");
        assert_eq!(result.highest_severity(), Some(Severity::Critical));
        assert_eq!(result.metrics.unwrap().security, 60.0);
        assert_eq!(result.overall_score, Some(90.0));
    }

    #[test]
    fn test_hardcoded_secret_detected() {
        assert_eq!(hardcoded_secrets(r#"const API_KEY = "sk-live-1234567890";"#), 1);
        assert_eq!(hardcoded_secrets(r#"password: 'hunter2hunter2'"#), 1);
        assert_eq!(hardcoded_secrets("const token = process.env.TOKEN;"), 0);
        assert_eq!(hardcoded_secrets(r#"let secret = "short";"#), 0);
    }

    #[test]
    fn test_empty_catch_detected() {
        assert_eq!(empty_catches("try { run() } catch (e) {}"), 1);
        assert_eq!(empty_catches("try { run() } catch {\n}"), 1);
        assert_eq!(empty_catches("try { run() } catch (e) { log(e) }"), 0);
    }

    #[test]
    fn test_deductions_are_capped_and_floored() {
        let body = "x.unwrap();\n".repeat(50);
        let result = review(&body);
        assert_eq!(result.metrics.unwrap().reliability, 80.0);
        assert_eq!(result.issues[0].occurrences, 50);

        let body = "eval(a); const password = \"abcdefghijk\"; new Function(x); el.innerHTML = y; el.innerHTML = z;";
        let result = review(body);
        assert_eq!(result.metrics.unwrap().security, 0.0);
    }

    #[test]
    fn test_issues_sorted_by_severity() {
        let result = review("// TODO: later\nconsole.log(x);\nconst y = eval(z);");
        let severities: Vec<Severity> = result.issues.iter().map(|i| i.severity).collect();
        let mut sorted = severities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(severities, sorted);
    }

    #[test]
    fn test_overall_is_deterministic_mean() {
        let metrics = MetricScores {
            maintainability: 80.0,
            reliability: 60.0,
            security: 100.0,
            performance: 40.0,
        };
        assert_eq!(ReviewWeights::default().overall(&metrics), 70.0);
        let security_only = ReviewWeights {
            maintainability: 0.0,
            reliability: 0.0,
            security: 1.0,
            performance: 0.0,
        };
        assert_eq!(security_only.overall(&metrics), 100.0);
    }

    #[test]
    fn test_unscored_is_never_below() {
        let result = ReviewResult::unscored("x", "failed");
        assert!(!result.is_scored());
        assert!(!result.is_below(70.0));
    }

    #[test]
    fn test_test_detection_needs_word_boundary() {
        let calls = "form.submit();\nawait wait(10);\nbus.emit('x');\nconst v = latest();\n";
        assert!(!review(calls).positives.iter().any(|p| p == "Includes tests"));

        let spec = "describe('add', () => {\n  it('sums', () => expect(add(1, 2)).toBe(3));\n});\n";
        assert!(review(spec).positives.iter().any(|p| p == "Includes tests"));
        assert!(review("it('works', () => {});").positives.iter().any(|p| p == "Includes tests"));
    }

    #[test]
    fn test_weights_validation() {
        assert!(ReviewWeights::default().validate().is_ok());
        let zero = ReviewWeights {
            maintainability: 0.0,
            reliability: 0.0,
            security: 0.0,
            performance: 0.0,
        };
        assert!(zero.validate().is_err());
    }

    #[tokio::test]
    async fn test_provider_reviewer_parses_verdict() {
        let verdict = r#"Here you go:
{"issues":[{"severity":"high","metric":"security","description":"XSS"}],
 "positives":["small"],
 "metrics":{"maintainability":90,"reliability":80,"security":50,"performance":100}}"#;
        let mock = MockAdapter::new("judge", "j1").with_response(verdict);
        let reviewer = ProviderReviewer::new(Arc::new(mock), ReviewWeights::default());

        let result = reviewer.review("code", &GenerationContext::default()).await;
        assert_eq!(result.overall_score, Some(80.0));
        assert_eq!(result.issues[0].severity, Severity::High);
        assert_eq!(result.reviewer, "judge/j1");
    }

    #[tokio::test]
    async fn test_provider_reviewer_degrades_to_unscored() {
        let mock = MockAdapter::new("judge", "j1")
            .with_failure(Some(500))
            .with_response("not json at all");
        let reviewer = ProviderReviewer::new(Arc::new(mock), ReviewWeights::default());
        let context = GenerationContext::default();

        let failed = reviewer.review("code", &context).await;
        assert!(!failed.is_scored());
        let garbled = reviewer.review("code", &context).await;
        assert!(!garbled.is_scored());
        assert!(garbled.note.unwrap().contains("JSON"));
    }
}
