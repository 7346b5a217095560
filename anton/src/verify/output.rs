//! Command-output filtering for verifier reports.
//!
//! Retry prompts should carry signal, not noise: error lines survive,
//! warning-only lines are stripped, and anything oversized keeps its head
//! and tail.

use std::sync::LazyLock;

use regex::Regex;

static ERROR_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|fail(ed|ure)?|panic(ked)?|fatal|exception|✗|not ok)\b")
        .expect("valid regex")
});
static WARNING_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bwarn(ing)?\b").expect("valid regex"));

/// Whether a line reports an error. Warning lines only qualify when an
/// error term survives with the word "warning" removed.
fn is_error_line(line: &str) -> bool {
    if !ERROR_LINE_RE.is_match(line) {
        return false;
    }
    if WARNING_LINE_RE.is_match(line) {
        let stripped = line.to_ascii_lowercase().replace("warning", "");
        return ERROR_LINE_RE.is_match(&stripped);
    }
    true
}

/// Keep error-ish lines, drop warning-only lines. When nothing matches,
/// fall back to the last `fallback_lines` lines so the report is never
/// empty.
#[must_use]
pub fn filter_errors_only(output: &str, fallback_lines: usize) -> String {
    let errors: Vec<&str> = output.lines().filter(|l| is_error_line(l)).collect();
    if !errors.is_empty() {
        return errors.join("\n");
    }
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(fallback_lines);
    lines[start..].join("\n")
}

/// Count error lines, used for the baseline-lint comparison.
#[must_use]
pub fn count_error_lines(output: &str) -> usize {
    output.lines().filter(|l| is_error_line(l)).count()
}

/// Truncate to `max_chars`, keeping head and tail around an elision
/// marker.
#[must_use]
pub fn truncate_middle(output: &str, max_chars: usize) -> String {
    if output.len() <= max_chars {
        return output.to_string();
    }
    let head_budget = max_chars / 2;
    let tail_budget = max_chars.saturating_sub(head_budget + 32);
    let head_end = floor_boundary(output, head_budget);
    let tail_start = ceil_boundary(output, output.len() - tail_budget);
    format!(
        "{}\n[... {} chars truncated ...]\n{}",
        &output[..head_end],
        output.len() - head_end - (output.len() - tail_start),
        &output[tail_start..]
    )
}

fn floor_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while !s.is_char_boundary(i) {
        i += 1;
    }
    i
}
