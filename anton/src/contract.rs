//! Parsing of agent-visible wire formats.
//!
//! Two formats come back from sessions: the `<anton-result>` block every
//! implementation answer must carry, and the bare JSON decision objects the
//! preflight stages demand. Parsing is tolerant where the agent tends to be
//! sloppy (code fences, surrounding prose) and strict where ambiguity would
//! be dangerous (unknown statuses are parse failures, never guesses).

use serde::Deserialize;
use serde_json::Value;

/// Status reported in an `<anton-result>` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AntonStatus {
    /// Task finished; run verification.
    Done,
    /// Attempted and failed; retriable.
    Failed,
    /// Cannot proceed; terminal for the task unless skipping is enabled.
    Blocked,
    /// Task should be split into the listed subtasks.
    Decompose,
}

impl AntonStatus {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "blocked" => Some(Self::Blocked),
            "decompose" => Some(Self::Decompose),
            _ => None,
        }
    }
}

/// Parsed `<anton-result>` block.
#[derive(Debug, Clone)]
pub struct AntonResult {
    /// Reported status.
    pub status: AntonStatus,
    /// Optional one-line reason.
    pub reason: Option<String>,
    /// Subtasks, populated only for [`AntonStatus::Decompose`].
    pub subtasks: Vec<String>,
}

/// Extract and parse the first `<anton-result>` block in `text`.
///
/// Returns `None` when no block is present or its status line is missing
/// or unrecognized.
#[must_use]
pub fn parse_anton_result(text: &str) -> Option<AntonResult> {
    let start = text.find("<anton-result>")?;
    let rest = &text[start + "<anton-result>".len()..];
    let end = rest.find("</anton-result>")?;
    let body = &rest[..end];

    let mut status = None;
    let mut reason = None;
    let mut subtasks = Vec::new();
    let mut in_subtasks = false;

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(value) = line.strip_prefix("status:") {
            status = AntonStatus::parse(value);
            in_subtasks = false;
        } else if let Some(value) = line.strip_prefix("reason:") {
            let value = value.trim();
            if !value.is_empty() {
                reason = Some(value.to_string());
            }
            in_subtasks = false;
        } else if line.eq_ignore_ascii_case("subtasks:") {
            in_subtasks = true;
        } else if in_subtasks && let Some(item) = line.strip_prefix("- ") {
            let item = item.trim();
            if !item.is_empty() {
                subtasks.push(item.to_string());
            }
        }
    }

    status.map(|status| AntonResult {
        status,
        reason,
        subtasks,
    })
}

/// Discovery-stage decision.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDecision {
    /// `"complete"` or `"incomplete"`.
    pub status: DiscoveryStatus,
    /// Plan file path when `incomplete`; may be empty when `complete`.
    #[serde(default)]
    pub filename: String,
}

/// Discovery status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryStatus {
    /// The task is already implemented.
    Complete,
    /// The task still needs work; a plan file was written.
    Incomplete,
}

/// Requirements-review decision.
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewDecision {
    /// Must be `"ready"`.
    pub status: ReviewStatus,
    /// The reviewed plan file.
    #[serde(default)]
    pub filename: String,
}

/// Review status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    /// The plan is ready for implementation.
    Ready,
}

/// Parse the discovery decision from a session reply.
#[must_use]
pub fn parse_discovery_decision(text: &str) -> Option<DiscoveryDecision> {
    extract_json_object(text).and_then(|v| serde_json::from_value(v).ok())
}

/// Parse the review decision from a session reply.
#[must_use]
pub fn parse_review_decision(text: &str) -> Option<ReviewDecision> {
    extract_json_object(text).and_then(|v| serde_json::from_value(v).ok())
}

/// Find a JSON object in agent output: the whole text, a fenced block, or
/// the first balanced `{...}` span.
#[must_use]
pub fn extract_json_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && value.is_object()
    {
        return Some(value);
    }

    for fence in ["```json", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let after = &trimmed[start + fence.len()..];
            if let Some(end) = after.find("```")
                && let Ok(value) = serde_json::from_str::<Value>(after[..end].trim())
                && value.is_object()
            {
                return Some(value);
            }
        }
    }

    balanced_object(trimmed).and_then(|span| serde_json::from_str(span).ok())
}

/// First balanced top-level `{...}` span, string-aware.
fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_done_block() {
        let text = "All set.\n<anton-result>\nstatus: done\n</anton-result>\n";
        let result = parse_anton_result(text).unwrap();
        assert_eq!(result.status, AntonStatus::Done);
        assert!(result.reason.is_none());
        assert!(result.subtasks.is_empty());
    }

    #[test]
    fn parses_failed_with_reason() {
        let text = "<anton-result>\nstatus: failed\nreason: tests would not pass\n</anton-result>";
        let result = parse_anton_result(text).unwrap();
        assert_eq!(result.status, AntonStatus::Failed);
        assert_eq!(result.reason.as_deref(), Some("tests would not pass"));
    }

    #[test]
    fn parses_decompose_subtasks() {
        let text = "\
<anton-result>
status: decompose
reason: too large for one pass
subtasks:
- extract the session trait
- port the retry loop
</anton-result>";
        let result = parse_anton_result(text).unwrap();
        assert_eq!(result.status, AntonStatus::Decompose);
        assert_eq!(
            result.subtasks,
            vec!["extract the session trait", "port the retry loop"]
        );
    }

    #[test]
    fn missing_block_or_status_is_none() {
        assert!(parse_anton_result("no block here").is_none());
        assert!(
            parse_anton_result("<anton-result>\nreason: but no status\n</anton-result>").is_none()
        );
        assert!(parse_anton_result("<anton-result>\nstatus: maybe\n</anton-result>").is_none());
    }

    #[test]
    fn only_the_first_block_is_read() {
        let text = "\
<anton-result>
status: done
</anton-result>
<anton-result>
status: failed
</anton-result>";
        assert_eq!(parse_anton_result(text).unwrap().status, AntonStatus::Done);
    }

    #[test]
    fn discovery_decision_parses_raw_json() {
        let decision =
            parse_discovery_decision(r#"{"status": "incomplete", "filename": "agents/tasks/t/plan.md"}"#)
                .unwrap();
        assert_eq!(decision.status, DiscoveryStatus::Incomplete);
        assert_eq!(decision.filename, "agents/tasks/t/plan.md");
    }

    #[test]
    fn discovery_decision_parses_fenced_json() {
        let text = "Here is my decision:\n```json\n{\"status\": \"complete\", \"filename\": \"\"}\n```";
        let decision = parse_discovery_decision(text).unwrap();
        assert_eq!(decision.status, DiscoveryStatus::Complete);
    }

    #[test]
    fn discovery_decision_parses_embedded_object() {
        let text = "I think {\"status\": \"incomplete\", \"filename\": \"plan.md\"} covers it";
        let decision = parse_discovery_decision(text).unwrap();
        assert_eq!(decision.filename, "plan.md");
    }

    #[test]
    fn invalid_status_fails_closed() {
        assert!(parse_discovery_decision(r#"{"status": "perhaps", "filename": "x"}"#).is_none());
        assert!(parse_review_decision(r#"{"status": "not ready"}"#).is_none());
    }

    #[test]
    fn balanced_object_is_string_aware() {
        let text = r#"prefix {"a": "braces } in string", "b": 2} suffix"#;
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["b"], 2);
    }
}
