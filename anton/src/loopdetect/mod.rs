//! Tool-loop detection.
//!
//! Agent runs can degenerate into repeating the same tool call: polling a
//! command that never changes, re-reading the same file, or ping-ponging
//! between two reads. The detector keeps a bounded window of hashed call
//! signatures plus outcome frequencies and classifies each incoming call
//! before it runs.
//!
//! Four detectors, individually toggleable:
//!
//! - **global circuit breaker**: a signature seen too many times anywhere
//!   in the window
//! - **known-poll no-progress**: poll-style tools returning identical
//!   results
//! - **ping-pong**: an A-B-A-B alternation of read-only calls with
//!   matching results
//! - **generic repeat**: a consecutive streak of identical signatures or
//!   outcomes
//!
//! Critical results surface to the run controller as a loop break on the
//! session boundary.

pub mod hash;

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use serde_json::Value;

use crate::loopdetect::hash::{hash_result_content, hash_tool_args, sha256_hex};

/// Default bound on the call-history ring buffer.
pub const DEFAULT_HISTORY_SIZE: usize = 30;

/// Severity of a loop check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoopLevel {
    /// No repetition of note.
    None,
    /// Repetition worth warning the agent about.
    Warning,
    /// Runaway repetition; the attempt must be interrupted.
    Critical,
}

/// Result of [`ToolLoopDetector::detect`].
#[derive(Debug, Clone)]
pub struct LoopCheck {
    /// Severity classification.
    pub level: LoopLevel,
    /// Which detector fired, when one did.
    pub detector: Option<&'static str>,
    /// Agent-facing description of the repetition.
    pub message: Option<String>,
    /// Repetition count that triggered the classification.
    pub count: u32,
}

impl LoopCheck {
    const fn none() -> Self {
        Self {
            level: LoopLevel::None,
            detector: None,
            message: None,
            count: 0,
        }
    }

    /// Whether the attempt must be interrupted.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.level == LoopLevel::Critical
    }
}

/// Per-tool threshold override.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolPolicy {
    /// Override for the warning threshold.
    pub warning_threshold: Option<u32>,
    /// Override for the critical threshold.
    pub critical_threshold: Option<u32>,
    /// Exempt the tool from detection entirely.
    pub exempt: bool,
}

/// Detector configuration.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Ring-buffer capacity for call records.
    pub history_size: usize,
    /// Consecutive repeats before a warning.
    pub warning_threshold: u32,
    /// Consecutive repeats before a critical break.
    pub critical_threshold: u32,
    /// Window-wide signature count before the circuit breaker trips.
    pub global_circuit_breaker_threshold: u32,
    /// Tools that poll external state; identical outcomes mean no progress.
    pub known_poll_tools: HashSet<String>,
    /// Tools with no side effects; eligible for ping-pong detection.
    pub read_only_tools: HashSet<String>,
    /// Per-tool threshold overrides.
    pub tool_policies: HashMap<String, ToolPolicy>,
    /// Toggle the global circuit breaker.
    pub enable_circuit_breaker: bool,
    /// Toggle known-poll no-progress detection.
    pub enable_known_poll: bool,
    /// Toggle ping-pong detection.
    pub enable_ping_pong: bool,
    /// Toggle the generic repeat detector.
    pub enable_generic: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        let known_poll = ["exec", "shell", "run_command"];
        let read_only = ["read_file", "read_files", "list_dir", "search", "grep"];
        Self {
            history_size: DEFAULT_HISTORY_SIZE,
            warning_threshold: 3,
            critical_threshold: 5,
            global_circuit_breaker_threshold: 10,
            known_poll_tools: known_poll.iter().map(ToString::to_string).collect(),
            read_only_tools: read_only.iter().map(ToString::to_string).collect(),
            tool_policies: HashMap::new(),
            enable_circuit_breaker: true,
            enable_known_poll: true,
            enable_ping_pong: true,
            enable_generic: true,
        }
    }
}

impl LoopConfig {
    /// Clamp thresholds into a usable ordering: `warning ≥ 2`,
    /// `critical ≥ warning + 2`, `circuit ≥ critical + 2`.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        self.warning_threshold = self.warning_threshold.max(2);
        self.critical_threshold = self.critical_threshold.max(self.warning_threshold + 2);
        self.global_circuit_breaker_threshold = self
            .global_circuit_breaker_threshold
            .max(self.critical_threshold + 2);
        self.history_size = self.history_size.max(4);
        self
    }

    fn thresholds_for(&self, tool: &str) -> (u32, u32) {
        let policy = self.tool_policies.get(tool);
        let warning = policy
            .and_then(|p| p.warning_threshold)
            .unwrap_or(self.warning_threshold)
            .max(2);
        let critical = policy
            .and_then(|p| p.critical_threshold)
            .unwrap_or(self.critical_threshold)
            .max(warning + 2);
        (warning, critical)
    }
}

/// One recorded tool call.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    /// Monotonic record id within this detector.
    pub id: u64,
    /// Tool name.
    pub tool: String,
    /// Hash of the canonicalized arguments.
    pub args_hash: String,
    /// `tool + "|" + args_hash`.
    pub signature: String,
    /// Tool-call id from the session, when known.
    pub tool_call_id: Option<String>,
    /// When the call was recorded.
    pub at: Instant,
    /// Hash of the outcome, set by [`ToolLoopDetector::record_outcome`].
    pub result_hash: Option<String>,
}

impl ToolCallRecord {
    fn outcome_key(&self) -> Option<String> {
        self.result_hash
            .as_ref()
            .map(|h| format!("{}|{h}", self.signature))
    }
}

/// Hashed-signature guard over a bounded call history.
#[derive(Debug)]
pub struct ToolLoopDetector {
    config: LoopConfig,
    history: VecDeque<ToolCallRecord>,
    by_signature: HashMap<String, u32>,
    by_outcome: HashMap<String, u32>,
    next_id: u64,
}

impl ToolLoopDetector {
    /// Create a detector with the given (sanitized) configuration.
    #[must_use]
    pub fn new(config: LoopConfig) -> Self {
        Self {
            config: config.sanitized(),
            history: VecDeque::new(),
            by_signature: HashMap::new(),
            by_outcome: HashMap::new(),
            next_id: 0,
        }
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Number of records currently in the window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Whether the window is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Record a tool call. Returns the record id for
    /// [`Self::record_outcome`]. Evicts the oldest record once the window
    /// exceeds its bound.
    pub fn record(&mut self, tool: &str, args: &Value, tool_call_id: Option<&str>) -> u64 {
        let args_hash = hash_tool_args(args);
        let signature = format!("{tool}|{args_hash}");
        let id = self.next_id;
        self.next_id += 1;

        *self.by_signature.entry(signature.clone()).or_insert(0) += 1;
        self.history.push_back(ToolCallRecord {
            id,
            tool: tool.to_string(),
            args_hash,
            signature,
            tool_call_id: tool_call_id.map(ToString::to_string),
            at: Instant::now(),
            result_hash: None,
        });

        while self.history.len() > self.config.history_size {
            if let Some(old) = self.history.pop_front() {
                decrement(&mut self.by_signature, &old.signature);
                if let Some(key) = old.outcome_key() {
                    decrement(&mut self.by_outcome, &key);
                }
            }
        }
        id
    }

    /// Attach the outcome of a previously recorded call.
    ///
    /// `Ok` content hashes as `"ok:" + sha256(content)`, errors as
    /// `"error:" + sha256(message)`; oversized content goes through the
    /// prefix/suffix digest.
    pub fn record_outcome(&mut self, id: u64, outcome: Result<&str, &str>) {
        let result_hash = match outcome {
            Ok(content) => format!("ok:{}", hash_result_content(content)),
            Err(message) => format!("error:{}", sha256_hex(message.as_bytes())),
        };
        if let Some(record) = self.history.iter_mut().rev().find(|r| r.id == id) {
            record.result_hash = Some(result_hash);
            if let Some(key) = record.outcome_key() {
                *self.by_outcome.entry(key).or_insert(0) += 1;
            }
        }
    }

    /// Classify an incoming call against the recorded window.
    #[must_use]
    pub fn detect(&self, tool: &str, args: &Value) -> LoopCheck {
        if self
            .config
            .tool_policies
            .get(tool)
            .is_some_and(|p| p.exempt)
        {
            return LoopCheck::none();
        }

        let signature = format!("{tool}|{}", hash_tool_args(args));
        let (warning, critical) = self.config.thresholds_for(tool);

        if self.config.enable_circuit_breaker {
            let seen = self.by_signature.get(&signature).copied().unwrap_or(0) + 1;
            if seen >= self.config.global_circuit_breaker_threshold {
                return LoopCheck {
                    level: LoopLevel::Critical,
                    detector: Some("circuit-breaker"),
                    message: Some(format!(
                        "'{tool}' has been called {seen} times with identical arguments; \
                         stopping the loop"
                    )),
                    count: seen,
                };
            }
        }

        if self.config.enable_known_poll
            && self.config.known_poll_tools.contains(tool)
            && let Some(check) = self.detect_known_poll(tool, &signature, critical)
        {
            return check;
        }

        if self.config.enable_ping_pong
            && let Some(check) = self.detect_ping_pong(&signature)
        {
            return check;
        }

        if self.config.enable_generic {
            return self.detect_generic(tool, &signature, warning, critical);
        }

        LoopCheck::none()
    }

    /// Poll-style tool repeating with identical outcomes: no progress.
    fn detect_known_poll(&self, tool: &str, signature: &str, critical: u32) -> Option<LoopCheck> {
        let last_outcome = self
            .history
            .iter()
            .rev()
            .find(|r| r.signature == signature && r.result_hash.is_some())?
            .outcome_key()?;

        let streak = self
            .history
            .iter()
            .rev()
            .take_while(|r| r.outcome_key().as_deref() == Some(last_outcome.as_str()))
            .count() as u32;
        let count = self.by_outcome.get(&last_outcome).copied().unwrap_or(0);
        let worst = streak.max(count);

        (worst + 1 >= critical).then(|| LoopCheck {
            level: LoopLevel::Critical,
            detector: Some("known-poll"),
            message: Some(format!(
                "'{tool}' keeps returning the same result ({worst} times); the state \
                 it is polling is not changing"
            )),
            count: worst + 1,
        })
    }

    /// A-B-A-B alternation of read-only calls whose paired results match.
    fn detect_ping_pong(&self, incoming: &str) -> Option<LoopCheck> {
        if self.history.len() < 4 {
            return None;
        }
        let tail: Vec<&ToolCallRecord> = self.history.iter().rev().take(4).collect();
        // tail[0] is the newest record; with the incoming call the pattern
        // reads B-A-B-A from the back.
        let (b1, a1, b2, a2) = (tail[0], tail[1], tail[2], tail[3]);
        if a1.signature != a2.signature || b1.signature != b2.signature {
            return None;
        }
        if a1.signature == b1.signature || a1.signature != incoming {
            return None;
        }
        if a1.result_hash.is_none() || a1.result_hash != a2.result_hash {
            return None;
        }
        if b1.result_hash.is_none() || b1.result_hash != b2.result_hash {
            return None;
        }
        let read_only = &self.config.read_only_tools;
        if !read_only.contains(&a1.tool) && !read_only.contains(&b1.tool) {
            return None;
        }
        Some(LoopCheck {
            level: LoopLevel::Warning,
            detector: Some("ping-pong"),
            message: Some(format!(
                "alternating between '{}' and '{}' with unchanged results",
                a1.tool, b1.tool
            )),
            count: 4,
        })
    }

    /// Consecutive streak of identical signatures or identical outcomes.
    fn detect_generic(&self, tool: &str, signature: &str, warning: u32, critical: u32) -> LoopCheck {
        let sig_streak = self
            .history
            .iter()
            .rev()
            .take_while(|r| r.signature == signature)
            .count() as u32
            + 1;

        let outcome_streak = self
            .history
            .back()
            .and_then(ToolCallRecord::outcome_key)
            .map_or(0, |key| {
                self.history
                    .iter()
                    .rev()
                    .take_while(|r| r.outcome_key().as_deref() == Some(key.as_str()))
                    .count() as u32
            });

        let count = sig_streak.max(outcome_streak);
        if count >= critical {
            LoopCheck {
                level: LoopLevel::Critical,
                detector: Some("repeat"),
                message: Some(format!(
                    "'{tool}' repeated {count} times in a row without progress"
                )),
                count,
            }
        } else if count >= warning {
            LoopCheck {
                level: LoopLevel::Warning,
                detector: Some("repeat"),
                message: Some(format!("'{tool}' repeated {count} times in a row")),
                count,
            }
        } else {
            LoopCheck::none()
        }
    }
}

fn decrement(map: &mut HashMap<String, u32>, key: &str) {
    if let Some(n) = map.get_mut(key) {
        *n -= 1;
        if *n == 0 {
            map.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detector() -> ToolLoopDetector {
        ToolLoopDetector::new(LoopConfig::default())
    }

    #[test]
    fn thresholds_are_sanitized() {
        let config = LoopConfig {
            warning_threshold: 0,
            critical_threshold: 1,
            global_circuit_breaker_threshold: 1,
            ..LoopConfig::default()
        }
        .sanitized();
        assert_eq!(config.warning_threshold, 2);
        assert_eq!(config.critical_threshold, 4);
        assert_eq!(config.global_circuit_breaker_threshold, 6);
    }

    #[test]
    fn clean_history_detects_nothing() {
        let mut det = detector();
        for i in 0..10 {
            det.record("read_file", &json!({"path": format!("f{i}.rs")}), None);
        }
        let check = det.detect("read_file", &json!({"path": "f11.rs"}));
        assert_eq!(check.level, LoopLevel::None);
    }

    #[test]
    fn generic_repeat_escalates_from_warning_to_critical() {
        let mut det = detector();
        let args = json!({"path": "same.rs"});
        det.record("read_file", &args, None);
        det.record("read_file", &args, None);
        let check = det.detect("read_file", &args);
        assert_eq!(check.level, LoopLevel::Warning);
        assert_eq!(check.count, 3);

        det.record("read_file", &args, None);
        det.record("read_file", &args, None);
        let check = det.detect("read_file", &args);
        assert_eq!(check.level, LoopLevel::Critical);
        assert_eq!(check.detector, Some("repeat"));
        assert_eq!(check.count, 5);
    }

    #[test]
    fn streak_resets_on_different_call() {
        let mut det = detector();
        let args = json!({"path": "same.rs"});
        det.record("read_file", &args, None);
        det.record("read_file", &args, None);
        det.record("exec", &json!({"cmd": "ls"}), None);
        let check = det.detect("read_file", &args);
        assert_eq!(check.level, LoopLevel::None);
    }

    #[test]
    fn circuit_breaker_counts_across_the_window() {
        let mut det = detector();
        let args = json!({"cmd": "npm test"});
        // Interleave so no consecutive streak forms.
        for i in 0..9 {
            det.record("exec", &args, None);
            det.record("read_file", &json!({"path": format!("f{i}.rs")}), None);
        }
        let check = det.detect("exec", &args);
        assert!(check.is_critical());
        assert_eq!(check.detector, Some("circuit-breaker"));
    }

    #[test]
    fn known_poll_trips_on_identical_outcomes() {
        let mut det = detector();
        let args = json!({"cmd": "git status"});
        for _ in 0..4 {
            let id = det.record("exec", &args, None);
            det.record_outcome(id, Ok("nothing to commit"));
        }
        let check = det.detect("exec", &args);
        assert!(check.is_critical());
        assert_eq!(check.detector, Some("known-poll"));
    }

    #[test]
    fn known_poll_stays_quiet_while_output_changes() {
        let mut det = detector();
        let args = json!({"cmd": "git status"});
        for i in 0..6 {
            let id = det.record("exec", &args, None);
            let out = format!("{i} files changed");
            det.record_outcome(id, Ok(out.as_str()));
        }
        let check = det.detect("exec", &args);
        // Changing outcomes are not a poll loop; the generic repeat
        // detector still owns raw signature streaks.
        assert_ne!(check.detector, Some("known-poll"));
    }

    #[test]
    fn ping_pong_needs_matching_result_pairs() {
        let mut det = detector();
        let a = json!({"path": "a.rs"});
        let b = json!({"path": "b.rs"});
        for _ in 0..2 {
            let id = det.record("read_file", &a, None);
            det.record_outcome(id, Ok("content a"));
            let id = det.record("read_file", &b, None);
            det.record_outcome(id, Ok("content b"));
        }
        let check = det.detect("read_file", &a);
        assert_eq!(check.level, LoopLevel::Warning);
        assert_eq!(check.detector, Some("ping-pong"));
    }

    #[test]
    fn ping_pong_ignores_non_read_only_pairs() {
        let mut det = detector();
        let a = json!({"cmd": "sleep 1"});
        let b = json!({"cmd": "sleep 2"});
        for _ in 0..2 {
            let id = det.record("write_file", &a, None);
            det.record_outcome(id, Ok("ok"));
            let id = det.record("write_file", &b, None);
            det.record_outcome(id, Ok("ok"));
        }
        let check = det.detect("write_file", &a);
        assert_ne!(check.detector, Some("ping-pong"));
    }

    #[test]
    fn eviction_keeps_frequency_maps_consistent() {
        let config = LoopConfig {
            history_size: 4,
            ..LoopConfig::default()
        };
        let mut det = ToolLoopDetector::new(config);
        let args = json!({"path": "x"});
        for _ in 0..20 {
            let id = det.record("read_file", &args, None);
            det.record_outcome(id, Ok("same"));
        }
        assert_eq!(det.len(), 4);
        let sig = hash::signature("read_file", &args);
        assert_eq!(det.by_signature.get(&sig).copied(), Some(4));
        assert_eq!(det.by_outcome.values().copied().max(), Some(4));
    }

    #[test]
    fn exempt_tool_is_never_flagged() {
        let mut policies = HashMap::new();
        policies.insert(
            "progress".to_string(),
            ToolPolicy {
                exempt: true,
                ..ToolPolicy::default()
            },
        );
        let mut det = ToolLoopDetector::new(LoopConfig {
            tool_policies: policies,
            ..LoopConfig::default()
        });
        let args = json!({});
        for _ in 0..20 {
            det.record("progress", &args, None);
        }
        assert_eq!(det.detect("progress", &args).level, LoopLevel::None);
    }

    #[test]
    fn per_tool_override_tightens_thresholds() {
        let mut policies = HashMap::new();
        policies.insert(
            "exec".to_string(),
            ToolPolicy {
                warning_threshold: Some(2),
                critical_threshold: Some(4),
                exempt: false,
            },
        );
        let mut det = ToolLoopDetector::new(LoopConfig {
            tool_policies: policies,
            ..LoopConfig::default()
        });
        let args = json!({"cmd": "make"});
        det.record("write_file", &args, None);
        det.record("exec", &args, None);
        let check = det.detect("exec", &args);
        assert_eq!(check.level, LoopLevel::Warning);
    }
}
