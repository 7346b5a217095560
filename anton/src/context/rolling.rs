//! Rolling tool-result compression.
//!
//! A cheap pass run every turn, independent of full compaction: old,
//! oversized tool results are squeezed in place, repeated reads of the
//! same file collapse to the latest one, and reads made stale by a later
//! edit become stubs. Every rewritten message carries the
//! `[rolling-compressed]` sentinel, which makes the pass idempotent.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::loopdetect::hash::canonical_json;
use crate::message::{ChatMessage, MessageRole};

/// Sentinel appended to every rolling-compressed message.
pub const ROLLING_SENTINEL: &str = "[rolling-compressed]";

static INTERESTING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|fail(ed|ure)?|panic|warning|exception)\b|[\w~./-]+/[\w.-]+\.\w{1,8}")
        .expect("valid regex")
});
static PASSING_TEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(^\s*(test\s+\S+\s+\.\.\.\s+ok)\s*$)|(^\s*(ok|PASS|✓)\b)").expect("valid regex")
});
static FAILING_TEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(FAIL(ED)?|error|✗|panicked)\b|^\s*(test result:|\d+ pass)")
        .expect("valid regex")
});

/// Configuration for the rolling pass.
#[derive(Debug, Clone)]
pub struct RollingConfig {
    /// How many trailing messages are exempt from rewriting.
    pub fresh_count: usize,
    /// Size above which a tool result is compressed.
    pub max_chars: usize,
    /// Tool names whose results are eligible for compression.
    pub compress_tools: HashSet<String>,
    /// Tool names that read files (dedup + edit-stub passes).
    pub read_tools: HashSet<String>,
    /// Tool names that modify files (edit-stub pass).
    pub edit_tools: HashSet<String>,
}

impl Default for RollingConfig {
    fn default() -> Self {
        let to_set = |names: &[&str]| names.iter().map(ToString::to_string).collect();
        Self {
            fresh_count: 5,
            max_chars: 2000,
            compress_tools: to_set(&["read_file", "read_files", "exec"]),
            read_tools: to_set(&["read_file", "read_files"]),
            edit_tools: to_set(&["edit_file", "write_file", "apply_patch"]),
        }
    }
}

/// Apply the rolling passes in place. Returns the number of messages
/// rewritten.
pub fn rolling_compress(messages: &mut [ChatMessage], config: &RollingConfig) -> usize {
    let total = messages.len();
    let fresh_from = total.saturating_sub(config.fresh_count);

    // Resolve each tool result back to the call that produced it.
    let calls: HashMap<String, (String, Value)> = messages
        .iter()
        .flat_map(|m| m.tool_calls.iter())
        .map(|c| (c.id.clone(), (c.name.clone(), c.arguments.clone())))
        .collect();

    let mut rewritten = 0;
    rewritten += compress_pass(messages, fresh_from, &calls, config);
    rewritten += dedup_reads_pass(messages, fresh_from, &calls, config);
    rewritten += edit_stub_pass(messages, fresh_from, &calls, config);
    rewritten
}

fn tool_of<'a>(
    message: &ChatMessage,
    calls: &'a HashMap<String, (String, Value)>,
) -> Option<&'a (String, Value)> {
    message
        .tool_call_id
        .as_ref()
        .and_then(|id| calls.get(id))
}

fn compress_pass(
    messages: &mut [ChatMessage],
    fresh_from: usize,
    calls: &HashMap<String, (String, Value)>,
    config: &RollingConfig,
) -> usize {
    let mut rewritten = 0;
    for index in 0..fresh_from {
        let Some((name, _)) = tool_of(&messages[index], calls).cloned() else {
            continue;
        };
        let message = &mut messages[index];
        if message.role != MessageRole::Tool
            || !config.compress_tools.contains(&name)
            || message.content.contains(ROLLING_SENTINEL)
            || message.content.len() <= config.max_chars
        {
            continue;
        }
        message.content = if name == "exec" {
            compress_exec_result(&message.content, config.max_chars)
        } else {
            format!(
                "{}\n{ROLLING_SENTINEL}",
                compress_text(&message.content, config.max_chars)
            )
        };
        rewritten += 1;
    }
    rewritten
}

/// Collapse repeated reads of the same file to the latest one.
fn dedup_reads_pass(
    messages: &mut [ChatMessage],
    fresh_from: usize,
    calls: &HashMap<String, (String, Value)>,
    config: &RollingConfig,
) -> usize {
    // Latest read index per target, considering the whole history so an
    // old read is stubbed even when the superseding read is fresh.
    let mut latest: HashMap<String, usize> = HashMap::new();
    for (index, message) in messages.iter().enumerate() {
        if message.role != MessageRole::Tool {
            continue;
        }
        if let Some((name, args)) = tool_of(message, calls)
            && config.read_tools.contains(name)
        {
            latest.insert(read_target(args), index);
        }
    }

    let mut rewritten = 0;
    for index in 0..fresh_from {
        let Some((name, args)) = tool_of(&messages[index], calls).cloned() else {
            continue;
        };
        if messages[index].role != MessageRole::Tool || !config.read_tools.contains(&name) {
            continue;
        }
        let target = read_target(&args);
        if latest.get(&target) == Some(&index)
            || messages[index].content.starts_with(ROLLING_SENTINEL)
        {
            continue;
        }
        messages[index].content =
            format!("{ROLLING_SENTINEL} earlier read of {target} superseded by a later read");
        rewritten += 1;
    }
    rewritten
}

/// Stub reads of files that were edited afterwards.
fn edit_stub_pass(
    messages: &mut [ChatMessage],
    fresh_from: usize,
    calls: &HashMap<String, (String, Value)>,
    config: &RollingConfig,
) -> usize {
    // Last position at which each file was edited.
    let mut edited_at: HashMap<String, usize> = HashMap::new();
    for (index, message) in messages.iter().enumerate() {
        for call in &message.tool_calls {
            if config.edit_tools.contains(&call.name)
                && let Some(path) = call.arguments.get("path").and_then(Value::as_str)
            {
                edited_at.insert(path.to_string(), index);
            }
        }
    }
    if edited_at.is_empty() {
        return 0;
    }

    let mut rewritten = 0;
    for index in 0..fresh_from {
        let Some((name, args)) = tool_of(&messages[index], calls).cloned() else {
            continue;
        };
        if messages[index].role != MessageRole::Tool
            || !config.read_tools.contains(&name)
            || messages[index].content.starts_with(ROLLING_SENTINEL)
        {
            continue;
        }
        let target = read_target(&args);
        if edited_at.get(&target).is_some_and(|&edit| edit > index) {
            messages[index].content =
                format!("{ROLLING_SENTINEL} read of {target} superseded by a later edit");
            rewritten += 1;
        }
    }
    rewritten
}

fn read_target(args: &Value) -> String {
    args.get("path")
        .and_then(Value::as_str)
        .map_or_else(|| canonical_json(args), ToString::to_string)
}

/// Compress exec output JSON: keep `rc` and `err` intact, squeeze `out`.
fn compress_exec_result(content: &str, max_chars: usize) -> String {
    let Ok(mut value) = serde_json::from_str::<Value>(content) else {
        return format!("{}\n{ROLLING_SENTINEL}", compress_text(content, max_chars));
    };
    if let Some(out) = value.get("out").and_then(Value::as_str) {
        let squeezed = compress_test_output(out)
            .unwrap_or_else(|| compress_text(out, max_chars));
        if let Some(obj) = value.as_object_mut() {
            obj.insert("out".to_string(), Value::String(squeezed));
        }
    }
    format!(
        "{}\n{ROLLING_SENTINEL}",
        serde_json::to_string(&value).unwrap_or_else(|_| content.to_string())
    )
}

/// Head + tail + interesting middle lines, bounded by `max_chars`.
#[must_use]
pub fn compress_text(content: &str, max_chars: usize) -> String {
    if content.len() <= max_chars {
        return content.to_string();
    }
    let head_budget = max_chars * 3 / 5;
    let tail_budget = max_chars / 4;

    let head_end = char_floor(content, head_budget);
    let tail_start = char_ceil(content, content.len() - tail_budget);
    let head = &content[..head_end];
    let tail = &content[tail_start..];

    let middle = &content[head_end..tail_start];
    let mut interesting: Vec<&str> = middle
        .lines()
        .filter(|line| INTERESTING_RE.is_match(line))
        .collect();
    let interesting_budget = max_chars.saturating_sub(head.len() + tail.len());
    let mut kept = Vec::new();
    let mut used = 0;
    for line in interesting.drain(..) {
        if used + line.len() + 1 > interesting_budget {
            break;
        }
        used += line.len() + 1;
        kept.push(line);
    }

    let omitted = content.len() - head.len() - tail.len();
    if kept.is_empty() {
        format!("{head}\n[... {omitted} chars omitted ...]\n{tail}")
    } else {
        format!(
            "{head}\n[... {omitted} chars omitted; notable lines kept ...]\n{}\n{tail}",
            kept.join("\n")
        )
    }
}

/// Drop passing-test lines from a test run, keeping failures and the
/// summary. Returns `None` when the content does not look like test
/// output.
#[must_use]
pub fn compress_test_output(content: &str) -> Option<String> {
    let lines: Vec<&str> = content.lines().collect();
    let passing: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| PASSING_TEST_RE.is_match(l) && !FAILING_TEST_RE.is_match(l))
        .map(|(i, _)| i)
        .collect();
    if passing.len() < 3 {
        return None;
    }
    let passing_set: HashSet<usize> = passing.iter().copied().collect();
    let kept: Vec<&str> = lines
        .iter()
        .enumerate()
        .filter(|(i, _)| !passing_set.contains(i))
        .map(|(_, l)| *l)
        .collect();
    Some(format!(
        "[{} passing tests omitted]\n{}",
        passing.len(),
        kept.join("\n")
    ))
}

fn char_floor(s: &str, mut index: usize) -> usize {
    index = index.min(s.len());
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn char_ceil(s: &str, mut index: usize) -> usize {
    index = index.min(s.len());
    while !s.is_char_boundary(index) {
        index += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::message::ToolCall;

    fn read_exchange(id: &str, path: &str, content: String) -> [ChatMessage; 2] {
        [
            ChatMessage::assistant_with_tool_calls(
                "",
                vec![ToolCall::new(id, "read_file", json!({ "path": path }))],
            ),
            ChatMessage::tool(id, content),
        ]
    }

    fn padding(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| ChatMessage::assistant(format!("progress update number {i}")))
            .collect()
    }

    #[test]
    fn compresses_old_oversized_reads() {
        let mut messages = Vec::new();
        messages.extend(read_exchange("c1", "big.rs", "x".repeat(9000)));
        messages.extend(padding(6));
        let config = RollingConfig::default();

        let rewritten = rolling_compress(&mut messages, &config);
        assert_eq!(rewritten, 1);
        assert!(messages[1].content.len() < 9000);
        assert!(messages[1].content.contains(ROLLING_SENTINEL));
    }

    #[test]
    fn fresh_messages_are_left_alone() {
        let mut messages = Vec::new();
        messages.extend(padding(2));
        messages.extend(read_exchange("c1", "big.rs", "x".repeat(9000)));
        let config = RollingConfig::default();

        assert_eq!(rolling_compress(&mut messages, &config), 0);
        assert_eq!(messages[3].content.len(), 9000);
    }

    #[test]
    fn rolling_compression_is_idempotent() {
        let mut messages = Vec::new();
        messages.extend(read_exchange("c1", "big.rs", "x".repeat(9000)));
        messages.extend(read_exchange("c2", "other.rs", "y".repeat(9000)));
        messages.extend(padding(6));
        let config = RollingConfig::default();

        rolling_compress(&mut messages, &config);
        let snapshot = messages.clone();
        rolling_compress(&mut messages, &config);
        assert_eq!(messages, snapshot);
    }

    #[test]
    fn dedup_keeps_only_the_latest_read() {
        let mut messages = Vec::new();
        messages.extend(read_exchange("c1", "lib.rs", "version one".to_string()));
        messages.extend(read_exchange("c2", "lib.rs", "version two".to_string()));
        messages.extend(padding(6));
        let config = RollingConfig::default();

        rolling_compress(&mut messages, &config);
        assert!(messages[1].content.contains("superseded by a later read"));
        assert_eq!(messages[3].content, "version two");
    }

    #[test]
    fn edited_files_stub_their_earlier_reads() {
        let mut messages = Vec::new();
        messages.extend(read_exchange("c1", "lib.rs", "old content".to_string()));
        messages.push(ChatMessage::assistant_with_tool_calls(
            "",
            vec![ToolCall::new(
                "c2",
                "edit_file",
                json!({"path": "lib.rs", "patch": "..."}),
            )],
        ));
        messages.push(ChatMessage::tool("c2", "ok"));
        messages.extend(padding(6));
        let config = RollingConfig::default();

        rolling_compress(&mut messages, &config);
        assert!(messages[1].content.contains("superseded by a later edit"));
    }

    #[test]
    fn exec_results_keep_rc_and_err_fields() {
        let out = format!(
            "{}\nerror: something broke\n{}",
            "line of output\n".repeat(200),
            "more output\n".repeat(100)
        );
        let payload = json!({"rc": 1, "err": "boom", "out": out}).to_string();
        let mut messages = vec![
            ChatMessage::assistant_with_tool_calls(
                "",
                vec![ToolCall::new("c1", "exec", json!({"cmd": "make"}))],
            ),
            ChatMessage::tool("c1", payload),
        ];
        messages.extend(padding(6));
        let config = RollingConfig::default();

        rolling_compress(&mut messages, &config);
        let content = &messages[1].content;
        assert!(content.contains(ROLLING_SENTINEL));
        let json_part = content.lines().next().unwrap();
        let value: Value = serde_json::from_str(json_part).unwrap();
        assert_eq!(value["rc"], 1);
        assert_eq!(value["err"], "boom");
        assert!(value["out"].as_str().unwrap().len() < out.len());
        assert!(value["out"].as_str().unwrap().contains("something broke"));
    }

    #[test]
    fn test_output_compressor_keeps_failures() {
        let out = "\
test a ... ok
test b ... ok
test c ... ok
test d ... FAILED
test result: FAILED. 3 passed; 1 failed";
        let squeezed = compress_test_output(out).unwrap();
        assert!(squeezed.contains("[3 passing tests omitted]"));
        assert!(squeezed.contains("test d ... FAILED"));
        assert!(!squeezed.contains("test a"));
    }

    #[test]
    fn non_test_output_is_not_claimed() {
        assert!(compress_test_output("plain build log\nnothing else").is_none());
    }

    #[test]
    fn compress_text_keeps_head_tail_and_interesting_lines() {
        let content = format!(
            "HEAD-{}\nmiddle filler\nerror: kept line\nmore filler\nTAIL-{}",
            "h".repeat(3000),
            "t".repeat(200)
        );
        let squeezed = compress_text(&content, 1200);
        assert!(squeezed.len() < content.len());
        assert!(squeezed.starts_with("HEAD-"));
        assert!(squeezed.contains("TAIL-"));
        assert!(squeezed.contains("error: kept line"));
        assert!(squeezed.contains("omitted"));
    }
}
