//! Context Compactor
//!
//! Converts a step's raw free-text output into a bounded `StepContext`
//! (summary, file manifest, key findings) so downstream steps are not
//! overwhelmed by upstream output. Budget overflow is an expected
//! condition, not an error: the compactor truncates findings first, then
//! the file manifest, and only then the summary.

use crate::workflow::types::StepContext;
use regex::Regex;
use std::sync::OnceLock;

/// Minimum viable summary length in characters. The summary is never cut
/// below this unless the whole budget is smaller.
const MIN_SUMMARY_CHARS: usize = 160;

/// Maximum number of key findings extracted
const MAX_FINDINGS: usize = 10;

/// Maximum length of one finding in characters
const MAX_FINDING_CHARS: usize = 160;

/// Maximum number of file paths extracted
const MAX_FILES: usize = 20;

/// Explicit machine-readable summary marker recognized in raw output
const SUMMARY_MARKER: &str = "SUMMARY:";

fn path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Path-like tokens: an optional directory prefix and a known source
        // or config extension. A closed extension list keeps prose like
        // "e.g." and version numbers out of the manifest.
        Regex::new(
            r"[A-Za-z0-9_\-./]*[A-Za-z0-9_\-]+\.(?:rs|py|js|ts|go|java|c|h|cpp|hpp|toml|json|yaml|yml|md|txt|sql|html|css|sh)\b",
        )
        .expect("path regex is valid")
    })
}

fn bullet_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:[-*\u{2022}]|\d+[.)])\s+(.+)$").expect("bullet regex is valid")
    })
}

/// Compacts raw step output into bounded step contexts
#[derive(Debug, Clone)]
pub struct ContextCompactor {
    /// Total forwarded-context budget in characters
    budget: usize,
}

impl ContextCompactor {
    /// Create a compactor with the given character budget
    pub fn new(budget: usize) -> Self {
        Self { budget }
    }

    /// The configured budget
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Compact raw output into a `StepContext` that never exceeds the
    /// budget.
    ///
    /// Empty input yields an empty-but-valid context. Input with no
    /// recognizable structure yields a truncated-prefix summary with no
    /// manifest and no findings.
    pub fn compact(&self, source_step: &str, raw: &str) -> StepContext {
        let raw = raw.trim();
        if raw.is_empty() {
            return StepContext::empty(source_step);
        }

        let summary_target = (self.budget / 2).max(MIN_SUMMARY_CHARS.min(self.budget));

        let mut context = StepContext {
            source_step: source_step.to_string(),
            summary: extract_summary(raw, summary_target),
            files: extract_files(raw),
            findings: extract_findings(raw),
        };

        self.enforce_budget(&mut context);
        context
    }

    /// Concatenate dependency contexts, in the order given, within the
    /// budget. Used for dependency-graph forwarding where a step has
    /// several direct dependencies.
    pub fn merge(&self, contexts: &[&StepContext]) -> String {
        let mut out = String::new();
        for context in contexts {
            if context.is_empty() {
                continue;
            }
            let rendered = context.render();
            let separator = if out.is_empty() { 0 } else { 2 };
            let remaining = self.budget.saturating_sub(out.len() + separator);
            if remaining == 0 {
                tracing::debug!(
                    "Dropping context of step {} from merged forwarding: budget exhausted",
                    context.source_step
                );
                break;
            }
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(truncate_at_boundary(&rendered, remaining));
        }
        out
    }

    /// Drop findings, then files, then cut the summary until the rendered
    /// size fits the budget. The summary keeps its minimum viable length
    /// unless the budget itself is smaller.
    fn enforce_budget(&self, context: &mut StepContext) {
        while context.serialized_len() > self.budget && !context.findings.is_empty() {
            context.findings.pop();
        }
        while context.serialized_len() > self.budget && !context.files.is_empty() {
            context.files.pop();
        }
        if context.serialized_len() > self.budget {
            // Findings and manifest are gone at this point; the rendered
            // form is the summary alone, so cutting to the budget keeps the
            // summary at or above its floor whenever the budget allows it
            context.summary = truncate_at_boundary(&context.summary, self.budget).to_string();
        }
    }
}

/// Extract the summary: an explicit marker if present, otherwise the
/// first sentences of the text, otherwise a plain prefix.
///
/// The sentence path takes a prefix of the original text rather than
/// re-joining sentence fragments, so re-compacting a summary can never
/// grow it.
fn extract_summary(raw: &str, target: usize) -> String {
    if let Some(marked) = extract_marked_summary(raw) {
        return truncate_at_boundary(marked, target).to_string();
    }

    let mut end = 0usize;
    for unit in raw.split_inclusive(['.', '!', '?', '\n']) {
        let candidate = end + unit.len();
        if end > 0 && candidate > target {
            break;
        }
        end = candidate;
        if end >= target {
            break;
        }
    }

    // The first sentence alone may blow the target; cut it down
    truncate_at_boundary(raw[..end].trim(), target).to_string()
}

/// Find a `SUMMARY:` marker line and return its content
fn extract_marked_summary(raw: &str) -> Option<&str> {
    for line in raw.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix(SUMMARY_MARKER) {
            let rest = rest.trim();
            if !rest.is_empty() {
                return Some(rest);
            }
        }
    }
    None
}

/// Extract path-like tokens, deduplicated in order of first mention
fn extract_files(raw: &str) -> Vec<String> {
    let mut files = Vec::new();
    for m in path_regex().find_iter(raw) {
        let path = m.as_str().trim_start_matches("./").to_string();
        if !files.contains(&path) {
            files.push(path);
            if files.len() >= MAX_FILES {
                break;
            }
        }
    }
    files
}

/// Extract bullet/numbered-list lines as key findings
///
/// Malformed or partial list markup degrades to fewer (or no) findings,
/// never to an error.
fn extract_findings(raw: &str) -> Vec<String> {
    let mut findings = Vec::new();
    for line in raw.lines() {
        if let Some(captures) = bullet_regex().captures(line) {
            let text = captures[1].trim();
            if text.is_empty() {
                continue;
            }
            findings.push(truncate_at_boundary(text, MAX_FINDING_CHARS).to_string());
            if findings.len() >= MAX_FINDINGS {
                break;
            }
        }
    }
    findings
}

/// Truncate to at most `max` bytes without splitting a UTF-8 character
fn truncate_at_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_yields_empty_context() {
        let compactor = ContextCompactor::new(2000);
        let context = compactor.compact("step_1", "");
        assert!(context.is_empty());
        assert_eq!(context.source_step, "step_1");

        let context = compactor.compact("step_1", "   \n\t  ");
        assert!(context.is_empty());
    }

    #[test]
    fn test_marker_summary_preferred() {
        let compactor = ContextCompactor::new(2000);
        let raw = "Lots of preamble text here.\nSUMMARY: Added validation to the login form.\nTrailing notes.";
        let context = compactor.compact("step_1", raw);
        assert_eq!(context.summary, "Added validation to the login form.");
    }

    #[test]
    fn test_first_sentences_fallback() {
        let compactor = ContextCompactor::new(2000);
        let raw = "Checked the handler. Found two issues. The rest of this text goes on at length about unrelated matters.";
        let context = compactor.compact("step_1", raw);
        assert!(context.summary.starts_with("Checked the handler."));
        assert!(context.summary.contains("Found two issues."));
    }

    #[test]
    fn test_unstructured_input_truncated_prefix() {
        let compactor = ContextCompactor::new(400);
        let raw = "x".repeat(5000);
        let context = compactor.compact("step_1", &raw);
        assert!(!context.summary.is_empty());
        assert!(context.files.is_empty());
        assert!(context.findings.is_empty());
        assert!(context.serialized_len() <= 400);
    }

    #[test]
    fn test_file_extraction_dedup_in_order() {
        let compactor = ContextCompactor::new(2000);
        let raw = "Edited src/login.rs and src/form.rs, then revisited src/login.rs. Also touched config.toml.";
        let context = compactor.compact("step_1", raw);
        assert_eq!(
            context.files,
            vec!["src/login.rs", "src/form.rs", "config.toml"]
        );
    }

    #[test]
    fn test_findings_from_bullets() {
        let compactor = ContextCompactor::new(2000);
        let raw = "Review results:\n- missing null check\n* unused import\n1. slow query in list view\n2) duplicate handler\n";
        let context = compactor.compact("step_1", raw);
        assert_eq!(
            context.findings,
            vec![
                "missing null check",
                "unused import",
                "slow query in list view",
                "duplicate handler"
            ]
        );
    }

    #[test]
    fn test_malformed_bullets_degrade_gracefully() {
        let compactor = ContextCompactor::new(2000);
        let raw = "-\n- \n-- not a bullet really\n*\n3.\n";
        let context = compactor.compact("step_1", raw);
        // Nothing usable extracted, and no panic
        assert!(context.findings.len() <= 1);
    }

    #[test]
    fn test_budget_truncates_findings_before_summary() {
        let compactor = ContextCompactor::new(300);
        let mut raw = String::from("SUMMARY: ");
        raw.push_str(&"important summary text. ".repeat(10));
        for i in 0..20 {
            raw.push_str(&format!("\n- finding number {} with some detail", i));
        }
        let context = compactor.compact("step_1", &raw);

        assert!(context.serialized_len() <= 300);
        // Summary survives at (or near) the minimum viable length
        assert!(context.summary.len() >= MIN_SUMMARY_CHARS.min(150));
        assert!(!context.summary.is_empty());
    }

    #[test]
    fn test_large_input_small_budget() {
        let compactor = ContextCompactor::new(2000);
        let mut raw = String::new();
        for i in 0..500 {
            raw.push_str(&format!(
                "Paragraph {} mentions src/module_{}.rs and has detail. ",
                i, i
            ));
            raw.push_str(&format!("- finding {}\n", i));
        }
        assert!(raw.len() > 50_000);
        let context = compactor.compact("step_1", &raw);
        assert!(context.serialized_len() <= 2000);
        assert!(!context.summary.is_empty());
    }

    #[test]
    fn test_idempotent_on_own_summary() {
        let compactor = ContextCompactor::new(2000);
        let raw = "Checked the handler. Found two issues. Fixed both of them cleanly.";
        let first = compactor.compact("step_1", raw);
        let second = compactor.compact("step_1", &first.summary);
        assert!(second.summary.len() <= first.summary.len());
        assert_eq!(second.summary, first.summary);
    }

    #[test]
    fn test_merge_respects_budget_and_order() {
        let compactor = ContextCompactor::new(100);
        let a = StepContext {
            source_step: "a".to_string(),
            summary: "A".repeat(60),
            files: vec![],
            findings: vec![],
        };
        let b = StepContext {
            source_step: "b".to_string(),
            summary: "B".repeat(60),
            files: vec![],
            findings: vec![],
        };
        let merged = compactor.merge(&[&a, &b]);
        assert!(merged.len() <= 100);
        assert!(merged.starts_with("AAAA"));
        // B is truncated into whatever room remains
        assert!(merged.contains('B'));
    }

    #[test]
    fn test_merge_skips_empty_contexts() {
        let compactor = ContextCompactor::new(500);
        let empty = StepContext::empty("a");
        let b = StepContext {
            source_step: "b".to_string(),
            summary: "real content".to_string(),
            files: vec![],
            findings: vec![],
        };
        let merged = compactor.merge(&[&empty, &b]);
        assert_eq!(merged, "real content");
    }

    #[test]
    fn test_truncate_at_boundary_multibyte() {
        let s = "héllo wörld";
        let cut = truncate_at_boundary(s, 2);
        assert_eq!(cut, "h");
        assert!(cut.len() <= 2);
    }
}
