//! Deterministic normalizations applied to an artifact body before persistence.

pub const NORMALIZE_LINE_ENDINGS: &str = "normalize_line_endings";
pub const STRIP_TRAILING_WHITESPACE: &str = "strip_trailing_whitespace";
pub const COLLAPSE_BLANK_LINES: &str = "collapse_blank_lines";

/// Consecutive blank lines kept.
const MAX_BLANK_RUN: usize = 2;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Optimized {
    pub body: String,
    /// Names of the passes that changed the body, in order.
    pub applied: Vec<String>,
}

fn normalize_line_endings(body: &str) -> String {
    body.replace("\r\n", "\n").replace('\r', "\n")
}

fn strip_trailing_whitespace(body: &str) -> String {
    let mut out: String = body
        .split('\n')
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    if body.ends_with('\n') && !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn collapse_blank_lines(body: &str) -> String {
    let mut out = Vec::new();
    let mut blank_run = 0;
    for line in body.split('\n') {
        if line.is_empty() {
            blank_run += 1;
            if blank_run > MAX_BLANK_RUN {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push(line);
    }
    out.join("\n")
}

/// Run every pass in order and record which ones changed the body.
///
/// Passes only rewrite the interior of the body; its leading and trailing edges stay as
/// extracted.
pub fn optimize(body: &str) -> Optimized {
    let passes: [(&str, fn(&str) -> String); 3] = [
        (NORMALIZE_LINE_ENDINGS, normalize_line_endings),
        (STRIP_TRAILING_WHITESPACE, strip_trailing_whitespace),
        (COLLAPSE_BLANK_LINES, collapse_blank_lines),
    ];

    let mut current = body.to_string();
    let mut applied = Vec::new();
    for (name, pass) in passes {
        let next = pass(&current);
        if next != current {
            applied.push(name.to_string());
            current = next;
        }
    }

    Optimized {
        body: current,
        applied,
    }
}
