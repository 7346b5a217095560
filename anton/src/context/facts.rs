//! Key-fact extraction from dropped messages.
//!
//! When compaction discards history, short decision/outcome snippets are
//! salvaged so the controller can archive them into the vault. Extraction
//! is regex-driven and capped; it is a best-effort net, not a summary.

use std::sync::LazyLock;

use regex::Regex;

use crate::message::ChatMessage;

/// Maximum number of facts returned per compaction.
pub const MAX_KEY_FACTS: usize = 10;

/// Maximum length of a single fact snippet.
const MAX_FACT_CHARS: usize = 160;

static FACT_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(?:decided|agreed|chose)\b[^.\n]{3,120}",
        r"(?i)\b(?:created|edited|deleted)\b\s+[\w~./-]+\.\w{1,8}",
        r"(?i)\b(?:fixed|resolved)\b[^.\n]{3,120}",
        r"(?i)\b(?:finished|implemented)\b[^.\n]{3,120}",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

/// Extract up to [`MAX_KEY_FACTS`] deduplicated snippets from dropped
/// messages, in encounter order.
#[must_use]
pub fn extract_key_facts(dropped: &[ChatMessage]) -> Vec<String> {
    let mut facts: Vec<String> = Vec::new();
    for message in dropped {
        for re in FACT_RES.iter() {
            for m in re.find_iter(&message.content) {
                if facts.len() >= MAX_KEY_FACTS {
                    return facts;
                }
                let snippet = clamp_chars(m.as_str().trim(), MAX_FACT_CHARS);
                let duplicate = facts
                    .iter()
                    .any(|f| f.eq_ignore_ascii_case(&snippet));
                if !duplicate {
                    facts.push(snippet);
                }
            }
        }
    }
    facts
}

fn clamp_chars(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
