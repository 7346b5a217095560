//! Retry-context composition.
//!
//! Attempt N>1 carries a digest of the previous attempt: status,
//! verification summary, per-gate results, the L2 reason, and filtered
//! command output. When the prompt would blow the token budget the context
//! is trimmed progressively (output capped, output dropped, context
//! dropped) before the attempt is declared over budget.
//!
//! L2 "missing implementation" failures get special treatment: the named
//! files are called out prescriptively, and from the second consecutive L2
//! failure their current contents are inlined.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::controller::state::{AttemptRecord, TaskBookkeeping};

/// Character cap applied to command output at the first trim level.
const OUTPUT_CAP_CHARS: usize = 1000;

/// Files larger than this are never inlined.
const MAX_INLINE_FILE_BYTES: u64 = 15 * 1024;

static MISSING_IMPL_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bis missing\b",
        r"(?i)\bmissing (an? )?(implementation|method|function|field|route|handler)\b",
        r"(?i)\bnot implemented\b",
        r"(?i)\bno implementation\b",
        r"(?i)\bstub(bed)?\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

static FILE_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\w/.-]*[A-Za-z_][\w/.-]*\.[A-Za-z]\w{0,7}\b").expect("valid regex")
});

/// Progressive trimming levels for the retry block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTrim {
    /// Everything, output included.
    Full,
    /// Command output capped to [`OUTPUT_CAP_CHARS`].
    CapOutput,
    /// Command output dropped; summary kept.
    DropOutput,
    /// No retry context at all.
    Drop,
}

impl RetryTrim {
    /// The next, more aggressive level, if any.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Full => Some(Self::CapOutput),
            Self::CapOutput => Some(Self::DropOutput),
            Self::DropOutput => Some(Self::Drop),
            Self::Drop => None,
        }
    }
}

/// Whether an L2 reason matches the missing-implementation pattern set.
#[must_use]
pub fn is_missing_implementation(reason: &str) -> bool {
    MISSING_IMPL_RES.iter().any(|re| re.is_match(reason))
}

/// File paths named in an L2 reason, deduplicated in order.
#[must_use]
pub fn extract_file_paths(reason: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for m in FILE_PATH_RE.find_iter(reason) {
        let token = m.as_str().trim_matches('.');
        if !token.contains('/') && !token.contains('.') {
            continue;
        }
        if !paths.iter().any(|p| p == token) {
            paths.push(token.to_string());
        }
    }
    paths
}

/// Compose the retry block for the next attempt, or `None` at
/// [`RetryTrim::Drop`].
#[must_use]
pub fn compose_retry_context(
    last: &AttemptRecord,
    book: &TaskBookkeeping,
    project_dir: &Path,
    trim: RetryTrim,
) -> Option<String> {
    if trim == RetryTrim::Drop {
        return None;
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "Attempt {} ended with status `{}`.",
        last.attempt,
        last.status.as_str()
    );
    if let Some(error) = &last.error {
        let _ = writeln!(out, "Error: {error}");
    }

    if let Some(verification) = &last.verification {
        let _ = writeln!(out, "Verification: {}", verification.summary);
        let gate = |name: &str, v: Option<bool>| match v {
            Some(ok) => format!("{name}={}", if ok { "ok" } else { "FAIL" }),
            None => format!("{name}=skipped"),
        };
        let _ = writeln!(
            out,
            "Gates: {}, {}, {}, {}",
            gate("build", verification.build_ok),
            gate("test", verification.test_ok),
            gate("lint", verification.lint_ok),
            gate("review", verification.l2_ok),
        );
        if let Some(reason) = &verification.l2_reason {
            let _ = writeln!(out, "Review reason: {reason}");
        }

        if trim != RetryTrim::DropOutput && !verification.command_output.is_empty() {
            let output = if trim == RetryTrim::CapOutput {
                cap_chars(&verification.command_output, OUTPUT_CAP_CHARS)
            } else {
                verification.command_output.clone()
            };
            let _ = writeln!(out, "\nCommand output:\n{output}");
        }

        if verification.l2_ok == Some(false)
            && let Some(reason) = &verification.l2_reason
            && is_missing_implementation(reason)
        {
            append_missing_impl_guidance(&mut out, reason, book, project_dir);
        }
    }

    let _ = writeln!(
        out,
        "\nFix what failed above before anything else, then complete the task."
    );
    Some(out)
}

fn append_missing_impl_guidance(
    out: &mut String,
    reason: &str,
    book: &TaskBookkeeping,
    project_dir: &Path,
) {
    let paths = extract_file_paths(reason);
    if paths.is_empty() {
        return;
    }
    let _ = writeln!(
        out,
        "\nThe review found required code MISSING. You must actually implement it - \
         do not only adjust tests or comments. Files to change:"
    );
    for path in &paths {
        let _ = writeln!(out, "- {path}");
    }

    if book.l2_fail_count < 2 {
        return;
    }
    // Second consecutive L2 failure: show the agent what the files really
    // contain right now.
    for path in &paths {
        let full = project_dir.join(path);
        let Ok(meta) = std::fs::metadata(&full) else {
            debug!(path, "named file absent; not inlining");
            continue;
        };
        if !meta.is_file() || meta.len() > MAX_INLINE_FILE_BYTES {
            debug!(path, len = meta.len(), "named file too large; not inlining");
            continue;
        }
        if let Ok(content) = std::fs::read_to_string(&full) {
            let _ = writeln!(out, "\nCurrent contents of `{path}`:\n```\n{content}\n```");
        }
    }
}

fn cap_chars(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[output capped]", &s[..end])
}
