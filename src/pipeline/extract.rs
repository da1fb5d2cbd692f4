//! Artifact extraction from raw model output.
//!
//! Fenced blocks (```` ``` ```` or `~~~`, optional info string) are concatenated in order of
//! appearance, separated by a blank line. A response without fences is used whole.
//! An unterminated fence runs to the end of the response.

use std::collections::BTreeSet;

use super::GenerationRequest;

/// Result of [`extract`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Extraction {
    pub body: String,
    /// Lowercased info-string languages, in order of first appearance.
    pub languages: Vec<String>,
    pub block_count: usize,
    /// No fenced block was found and the whole response was used.
    pub fallback: bool,
}

struct Fence {
    marker: char,
    len: usize,
}

fn opening_fence(line: &str) -> Option<(Fence, &str)> {
    let trimmed = line.trim_start();
    let marker = trimmed.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let len = trimmed.chars().take_while(|c| *c == marker).count();
    if len < 3 {
        return None;
    }
    let info = trimmed[len..].trim();
    // A backtick fence's info string cannot contain backticks.
    if marker == '`' && info.contains('`') {
        return None;
    }
    Some((Fence { marker, len }, info))
}

fn closes(fence: &Fence, line: &str) -> bool {
    let trimmed = line.trim();
    let len = trimmed.chars().take_while(|c| *c == fence.marker).count();
    len >= fence.len && len == trimmed.chars().count()
}

/// Extract the artifact body from `response`.
pub fn extract(response: &str) -> Extraction {
    let mut blocks: Vec<String> = Vec::new();
    let mut languages: Vec<String> = Vec::new();
    let mut open: Option<(Fence, Vec<&str>)> = None;

    for line in response.lines() {
        match open.take() {
            None => {
                if let Some((fence, info)) = opening_fence(line) {
                    if let Some(lang) = info.split_whitespace().next() {
                        let lang = lang.to_lowercase();
                        if !languages.contains(&lang) {
                            languages.push(lang);
                        }
                    }
                    open = Some((fence, Vec::new()));
                }
            }
            Some((fence, mut lines)) => {
                if closes(&fence, line) {
                    blocks.push(lines.join("\n"));
                } else {
                    lines.push(line);
                    open = Some((fence, lines));
                }
            }
        }
    }
    if let Some((_, lines)) = open {
        blocks.push(lines.join("\n"));
    }

    let blocks: Vec<String> = blocks
        .iter()
        .map(|b| b.trim())
        .filter(|b| !b.is_empty())
        .map(str::to_string)
        .collect();

    if blocks.is_empty() {
        return Extraction {
            body: response.trim().to_string(),
            languages,
            block_count: 0,
            fallback: true,
        };
    }

    Extraction {
        body: blocks.join("\n\n"),
        languages,
        block_count: blocks.len(),
        fallback: false,
    }
}

/// Tags for an artifact: fence languages plus the request's framework and category.
pub fn detect_tags(extraction: &Extraction, request: &GenerationRequest) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    let hints = [request.framework.as_deref(), request.category.as_deref()];
    for tag in extraction
        .languages
        .iter()
        .map(String::as_str)
        .chain(hints.into_iter().flatten())
    {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

const RUST_BUILTIN_ROOTS: [&str; 6] = ["std", "core", "alloc", "self", "crate", "super"];

fn quoted(text: &str) -> Option<&str> {
    let start = text.find(['\'', '"', '`'])?;
    let quote = text[start..].chars().next()?;
    let rest = &text[start + 1..];
    let end = rest.find(quote)?;
    Some(&rest[..end])
}

/// Package name for a JS module specifier; `None` for relative or absolute paths.
fn js_package(specifier: &str) -> Option<String> {
    if specifier.is_empty() || specifier.starts_with('.') || specifier.starts_with('/') {
        return None;
    }
    let mut parts = specifier.split('/');
    let first = parts.next()?;
    if first.starts_with('@') {
        let second = parts.next()?;
        Some(format!("{}/{}", first, second))
    } else {
        Some(first.to_string())
    }
}

fn python_root(module: &str) -> Option<String> {
    let root = module.trim().split('.').next()?.trim();
    let valid = !root.is_empty() && root.chars().all(|c| c.is_alphanumeric() || c == '_');
    valid.then(|| root.to_string())
}

fn rust_root(path: &str) -> Option<String> {
    let root = path
        .trim_start_matches("::")
        .split("::")
        .next()?
        .trim_matches(|c: char| c == '{' || c == ';' || c.is_whitespace());
    let valid = !root.is_empty()
        && root.chars().all(|c| c.is_alphanumeric() || c == '_')
        && !RUST_BUILTIN_ROOTS.contains(&root);
    valid.then(|| root.to_string())
}

/// External packages referenced by `body`, sorted and deduplicated.
pub fn detect_dependencies(body: &str) -> Vec<String> {
    let mut deps = BTreeSet::new();

    for raw in body.lines() {
        let line = raw.trim();
        let has_quote = line.contains(['\'', '"', '`']);

        if line.starts_with("import ") && has_quote {
            // import x from 'pkg' | import 'pkg'
            let specifier = match line.find(" from ") {
                Some(at) => quoted(&line[at..]),
                None => quoted(line),
            };
            deps.extend(specifier.and_then(js_package));
        } else if line.starts_with("import ") && !line.contains("::") {
            // import os, sys as system
            for module in line["import ".len()..].split(',') {
                let module = module.split(" as ").next().unwrap_or_default();
                deps.extend(python_root(module));
            }
        } else if line.starts_with("from ") && line.contains(" import ") {
            let module = &line["from ".len()..line.find(" import ").unwrap_or(line.len())];
            if !module.trim_start().starts_with('.') {
                deps.extend(python_root(module));
            }
        } else if let Some(path) = line
            .strip_prefix("use ")
            .or_else(|| line.strip_prefix("pub use "))
        {
            if path.contains("::") {
                deps.extend(rust_root(path));
            }
        } else if let Some(name) = line.strip_prefix("extern crate ") {
            deps.extend(rust_root(name.split_whitespace().next().unwrap_or_default()));
        }

        let mut rest = line;
        while let Some(at) = rest.find("require(") {
            let after = &rest[at + "require(".len()..];
            if let Some(specifier) = after.trim_start().strip_prefix(['\'', '"', '`']) {
                let end = specifier.find(['\'', '"', '`']).unwrap_or(specifier.len());
                deps.extend(js_package(&specifier[..end]));
            }
            rest = after;
        }
    }

    deps.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_block_is_trimmed() {
        let response = "Here is the code:\n```rust\n\n  fn main() {}\n\n```\nDone.";
        let extraction = extract(response);
        assert_eq!(extraction.body, "fn main() {}");
        assert_eq!(extraction.block_count, 1);
        assert_eq!(extraction.languages, vec!["rust"]);
        assert!(!extraction.fallback);
    }

    #[test]
    fn test_blocks_concatenated_in_order() {
        let response = "```ts\nconst a = 1;\n```\ntext\n~~~ts\nconst b = 2;\n~~~\nmore\n```css\n.c {}\n```";
        let extraction = extract(response);
        assert_eq!(extraction.body, "const a = 1;\n\nconst b = 2;\n\n.c {}");
        assert_eq!(extraction.block_count, 3);
        assert_eq!(extraction.languages, vec!["ts", "css"]);
    }

    #[test]
    fn test_no_fence_falls_back_to_whole_response() {
        let extraction = extract("  plain answer\n");
        assert_eq!(extraction.body, "plain answer");
        assert!(extraction.fallback);
    }

    #[test]
    fn test_unterminated_fence_runs_to_end() {
        let extraction = extract("```python\nprint('hi')\n");
        assert_eq!(extraction.body, "print('hi')");
        assert!(!extraction.fallback);
    }

    #[test]
    fn test_longer_fence_contains_shorter() {
        let response = "````md\n```js\nx()\n```\n````";
        assert_eq!(extract(response).body, "```js\nx()\n```");
    }

    #[test]
    fn test_tags_merge_languages_and_hints() {
        let extraction = extract("```TSX\n<div/>\n```");
        let request = GenerationRequest::new("card")
            .framework("React")
            .category("component");
        assert_eq!(
            detect_tags(&extraction, &request),
            vec!["tsx", "react", "component"]
        );
    }

    #[test]
    fn test_js_dependencies() {
        let body = r#"
import React, { useState } from 'react';
import styles from "./card.module.css";
import '@fontsource/inter/400.css';
const _ = require('lodash/fp');
const fs = require("fs"), path = require('path');
"#;
        assert_eq!(
            detect_dependencies(body),
            vec!["@fontsource/inter", "fs", "lodash", "path", "react"]
        );
    }

    #[test]
    fn test_python_dependencies() {
        let body = "import os, numpy as np\nfrom requests.adapters import HTTPAdapter\nfrom . import local\n";
        assert_eq!(detect_dependencies(body), vec!["numpy", "os", "requests"]);
    }

    #[test]
    fn test_rust_dependencies_skip_builtin_roots() {
        let body = "use std::fmt;\nuse serde::{Deserialize, Serialize};\nuse crate::x::Y;\npub use tokio::sync::mpsc;\nuse super::*;\nextern crate log;\n";
        assert_eq!(detect_dependencies(body), vec!["log", "serde", "tokio"]);
    }
}
