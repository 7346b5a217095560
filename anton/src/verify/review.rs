//! Level-2 AI review.
//!
//! After the deterministic gates pass, a separate no-tools session reads
//! the task and the working diff and returns `{pass, reason}`. Verdict
//! parsing tolerates raw JSON, fenced JSON, and plain prose; when the
//! answer stays ambiguous the verdict defaults to pass, because L1 has
//! already validated the change.

use tracing::{debug, warn};

use crate::contract::extract_json_object;
use crate::error::Result;
use crate::session::{AskHooks, AskOutcome, SessionConfig, SessionFactory};

/// Outcome of the AI review.
#[derive(Debug, Clone)]
pub struct ReviewVerdict {
    /// Whether the change passes review.
    pub pass: bool,
    /// Reviewer-provided reason, mostly for failures.
    pub reason: Option<String>,
}

/// Prompt handed to the review session.
#[must_use]
pub fn review_session_prompt(task_text: &str, diff: &str) -> String {
    format!(
        "You are reviewing a change produced for this task:\n\n{task_text}\n\n\
         Working diff:\n\n```diff\n{diff}\n```\n\n\
         Judge whether the diff actually implements the task. Missing pieces, stubbed \
         functions, or unrelated changes fail review.\n\
         Reply with JSON: {{\"pass\": true|false, \"reason\": \"<one line>\"}}."
    )
}

/// Parse a reviewer reply into a verdict.
#[must_use]
pub fn parse_review_verdict(text: &str) -> ReviewVerdict {
    if let Some(value) = extract_json_object(text) {
        let pass = value
            .get("pass")
            .or_else(|| value.get("passed"))
            .and_then(serde_json::Value::as_bool);
        if let Some(pass) = pass {
            let reason = value
                .get("reason")
                .and_then(serde_json::Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string);
            return ReviewVerdict { pass, reason };
        }
    }

    // Prose inference: an unambiguous fail wins, an unambiguous pass wins,
    // anything else passes by default.
    let lower = text.to_ascii_lowercase();
    let says_fail = lower.contains("fail") || lower.contains("reject");
    let says_pass =
        lower.contains("pass") || lower.contains("lgtm") || lower.contains("approved");
    if says_fail && !says_pass {
        return ReviewVerdict {
            pass: false,
            reason: Some(first_line(text)),
        };
    }
    debug!("ambiguous review reply, defaulting to pass");
    ReviewVerdict {
        pass: true,
        reason: None,
    }
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("review failed")
        .chars()
        .take(200)
        .collect()
}

/// Spawn the review session, ask once, and parse the verdict.
///
/// # Errors
///
/// Propagates session spawn/ask failures; the caller treats them as an
/// inconclusive review, not a gate failure.
pub async fn run_l2_review(
    factory: &dyn SessionFactory,
    max_iterations: usize,
    task_text: &str,
    diff: &str,
) -> Result<ReviewVerdict> {
    let config = SessionConfig::new("l2-review")
        .no_tools(true)
        .max_iterations(max_iterations);
    let mut session = factory.spawn(config).await?;
    let outcome = session
        .ask(&review_session_prompt(task_text, diff), AskHooks::default())
        .await;
    session.close().await;

    match outcome? {
        AskOutcome::Completed(reply) => Ok(parse_review_verdict(&reply.text)),
        AskOutcome::LoopBreak(event) => {
            warn!(detector = %event.detector, "review session hit a tool loop; passing by default");
            Ok(ReviewVerdict {
                pass: true,
                reason: None,
            })
        }
    }
}
