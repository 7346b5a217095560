//! Importance scoring and semantic chunking.
//!
//! Every message gets a deterministic 0–180 score: recency (0–50), role
//! weight (10–40), and regex-driven content bonuses and penalties. Chunks
//! partition the history at user messages; a chunk scores the average of
//! its members.

use std::sync::LazyLock;

use regex::Regex;

use crate::message::{ChatMessage, MessageRole};

/// Maximum attainable message score.
pub const MAX_SCORE: u32 = 180;

static ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|fail(ed|ure)?|panic|exception|fatal)\b").expect("valid regex")
});
static PLANNING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(plan|decided?|decision|agreed?|chose|approach|strategy)\b")
        .expect("valid regex")
});
static IMPORTANT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(important|must|requirement|invariant|warning|remember|note)\b")
        .expect("valid regex")
});
static FILE_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\w~./-]+/[\w.-]+\.\w{1,8}").expect("valid regex"));

/// Characters above which a message is considered bulk and penalized.
const BULK_CHARS: usize = 4000;
/// Characters below which a message is considered trivial and penalized.
const TRIVIAL_CHARS: usize = 20;

/// Score one message. `index` is its position in a history of `total`
/// messages; later messages score higher on recency.
#[must_use]
pub fn score_message(message: &ChatMessage, index: usize, total: usize) -> u32 {
    let recency = if total <= 1 {
        50
    } else {
        ((index as f64 / (total - 1) as f64) * 50.0).round() as u32
    };

    let role = match message.role {
        MessageRole::System => 40,
        MessageRole::User => 30,
        MessageRole::Assistant => 20,
        MessageRole::Tool => 10,
    };

    let mut score = (recency + role) as i64;
    let content = &message.content;

    if ERROR_RE.is_match(content) {
        score += 20;
    }
    if PLANNING_RE.is_match(content) {
        score += 15;
    }
    if IMPORTANT_RE.is_match(content) {
        score += 10;
    }
    if FILE_PATH_RE.is_match(content) {
        score += 15;
    }
    if content.contains("```") {
        score += 10;
    }
    if content.len() > BULK_CHARS {
        score -= 15;
    }
    if content.len() < TRIVIAL_CHARS && message.tool_calls.is_empty() {
        score -= 10;
    }

    score.clamp(0, i64::from(MAX_SCORE)) as u32
}

/// A contiguous slice of the history, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// First message index.
    pub start: usize,
    /// One past the last message index.
    pub end: usize,
    /// Average member score.
    pub score: u32,
}

impl Chunk {
    /// Number of messages in the chunk.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the chunk is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Partition the history into chunks, each starting at a user message.
/// Messages before the first user message form the leading chunk.
#[must_use]
pub fn chunk_messages(messages: &[ChatMessage]) -> Vec<Chunk> {
    if messages.is_empty() {
        return Vec::new();
    }
    let mut starts = vec![0];
    for (i, msg) in messages.iter().enumerate() {
        if i > 0 && msg.role == MessageRole::User {
            starts.push(i);
        }
    }
    let total = messages.len();
    let mut chunks = Vec::with_capacity(starts.len());
    for (c, &start) in starts.iter().enumerate() {
        let end = starts.get(c + 1).copied().unwrap_or(total);
        let sum: u64 = messages[start..end]
            .iter()
            .enumerate()
            .map(|(off, m)| u64::from(score_message(m, start + off, total)))
            .sum();
        let score = (sum / (end - start) as u64) as u32;
        chunks.push(Chunk { start, end, score });
    }
    chunks
}
