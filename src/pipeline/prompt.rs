//! Prompt assembly.
//!
//! Output depends only on the request, the context, the template version and the token
//! budget. Sections always appear in the same order; retrieved context is added in order
//! (patterns, similar artifacts, documentation) until the budget runs out, and the item that
//! crosses the budget is truncated.

use crate::review::ReviewResult;
use crate::tokenizer::{estimate_tokens, Tokenizer};

use super::{GenerationContext, GenerationRequest};

pub const TEMPLATE_VERSION: &str = "codeforge-v1";

const PREAMBLE: &str = "You are an expert software engineer. Produce complete, production-ready \
code for the task below. Return the code in fenced code blocks tagged with their language.";

const OUTPUT_RULES: &str = "## Output\n\
- Put all code in fenced code blocks.\n\
- Do not leave placeholders or unfinished sections.\n\
- Handle errors explicitly and keep secrets out of source.";

/// Tokens reserved for separators between context items.
const ITEM_OVERHEAD: usize = 4;

/// Builds generation prompts within a token budget.
pub struct PromptBuilder {
    template_version: String,
    token_budget: usize,
    tokenizer: Option<Tokenizer>,
}

impl PromptBuilder {
    /// Builder for `model` with `token_budget` tokens of prompt.
    ///
    /// Falls back to a character estimate if no encoder can be loaded.
    pub fn for_model(model: &str, token_budget: usize) -> Self {
        Self {
            template_version: TEMPLATE_VERSION.to_string(),
            token_budget,
            tokenizer: Tokenizer::for_model(model).ok(),
        }
    }

    /// Builder using the character estimate only.
    pub fn estimating(token_budget: usize) -> Self {
        Self {
            template_version: TEMPLATE_VERSION.to_string(),
            token_budget,
            tokenizer: None,
        }
    }

    pub fn with_template_version(mut self, version: impl Into<String>) -> Self {
        self.template_version = version.into();
        self
    }

    pub fn template_version(&self) -> &str {
        &self.template_version
    }

    fn count(&self, text: &str) -> usize {
        match &self.tokenizer {
            Some(t) => t.count_tokens(text),
            None => estimate_tokens(text),
        }
    }

    fn truncate(&self, text: &str, max_tokens: usize) -> String {
        match &self.tokenizer {
            Some(t) => t.truncate(text, max_tokens),
            None => text.chars().take(max_tokens * 4).collect(),
        }
    }

    fn fixed_sections(&self, request: &GenerationRequest, context: &GenerationContext) -> Vec<String> {
        let mut sections = vec![
            format!("<!-- template: {} -->\n{}", self.template_version, PREAMBLE),
            format!("## Task\n{}", request.task.trim()),
        ];

        let mut target = Vec::new();
        if let Some(framework) = &request.framework {
            target.push(format!("Framework: {}", framework));
        }
        if let Some(category) = &request.category {
            target.push(format!("Category: {}", category));
        }
        if !target.is_empty() {
            sections.push(format!("## Target\n{}", target.join("\n")));
        }

        if !request.requirements.is_empty() {
            let list: Vec<String> = request
                .requirements
                .iter()
                .map(|r| format!("- {}", r))
                .collect();
            sections.push(format!("## Requirements\n{}", list.join("\n")));
        }

        if !context.project.is_empty() {
            let mut entries: Vec<(&String, &String)> = context.project.iter().collect();
            entries.sort();
            let list: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| format!("- {}: {}", k, v))
                .collect();
            sections.push(format!("## Project\n{}", list.join("\n")));
        }

        sections
    }

    fn context_sections(&self, context: &GenerationContext, mut budget: usize) -> Vec<String> {
        let groups: [(&str, Vec<String>); 3] = [
            ("## Reference patterns", context.patterns.clone()),
            (
                "## Similar artifacts",
                context
                    .similar
                    .iter()
                    .filter_map(|s| {
                        s.snippet
                            .as_ref()
                            .map(|snippet| format!("[{}]\n{}", s.id, snippet))
                    })
                    .collect(),
            ),
            (
                "## Documentation",
                context
                    .documentation
                    .iter()
                    .map(|d| format!("[{}]\n{}", d.source, d.text))
                    .collect(),
            ),
        ];

        let mut sections = Vec::new();
        for (heading, items) in groups {
            let mut kept = Vec::new();
            for item in items {
                let heading_cost = if kept.is_empty() { self.count(heading) } else { 0 };
                let cost = self.count(&item) + ITEM_OVERHEAD + heading_cost;
                if cost <= budget {
                    budget -= cost;
                    kept.push(item);
                    continue;
                }
                let room = budget.saturating_sub(ITEM_OVERHEAD + heading_cost);
                if room > 0 {
                    kept.push(self.truncate(&item, room));
                }
                budget = 0;
                break;
            }
            if !kept.is_empty() {
                sections.push(format!("{}\n{}", heading, kept.join("\n\n")));
            }
            if budget == 0 {
                break;
            }
        }
        sections
    }

    /// Assemble the prompt for `request`.
    pub fn build(&self, request: &GenerationRequest, context: &GenerationContext) -> String {
        let mut sections = self.fixed_sections(request, context);
        let fixed_cost = self.count(&sections.join("\n\n")) + self.count(OUTPUT_RULES);
        let budget = self.token_budget.saturating_sub(fixed_cost);
        sections.extend(self.context_sections(context, budget));
        sections.push(OUTPUT_RULES.to_string());
        sections.join("\n\n")
    }

    /// Prompt for a regeneration attempt: the original prompt plus the previous attempt's
    /// issues, most severe first.
    pub fn amend(&self, base_prompt: &str, previous: &ReviewResult) -> String {
        let mut prompt = String::from(base_prompt);
        prompt.push_str("\n\n## Issues in the previous attempt\n");
        if previous.issues.is_empty() {
            prompt.push_str("- Overall quality was below the acceptance threshold.\n");
        }
        for issue in &previous.issues {
            prompt.push_str(&format!("- [{:?}] {}", issue.severity, issue.description));
            if let Some(fix) = &issue.fix {
                prompt.push_str(&format!(" (fix: {})", fix));
            }
            prompt.push('\n');
        }
        if let Some(score) = previous.overall_score {
            prompt.push_str(&format!("Previous score: {:.0}/100.\n", score));
        }
        prompt.push_str("Regenerate the complete code with these issues resolved.");
        prompt
    }
}
