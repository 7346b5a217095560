//! Prompt templates and composition.
//!
//! The on-wire prompt texts the controller sends to agent sessions: the
//! Anton output contract injected into implementation system prompts, the
//! preflight discovery/review prompts, and the fixed recovery prompts. The
//! contract texts are stable wire format; change them and every deployed
//! agent misparses.

use std::fmt::Write as _;

/// Output contract appended to the system prompt of every implementation
/// session. The agent's final answer must contain exactly one
/// `<anton-result>` block.
pub const ANTON_RESULT_CONTRACT: &str = r"
## Result contract

Your final answer for the task MUST contain exactly one block of this form:

<anton-result>
status: done|failed|blocked|decompose
reason: <optional one line>
subtasks:
- <only when status=decompose>
</anton-result>

Rules:
- `done` only after the change is complete and the project still builds.
- `failed` when you attempted the task and could not finish; give the reason.
- `blocked` only for obstacles you cannot resolve from inside the repository.
- `decompose` when the task is too large; list 2-6 concrete subtasks.
";

/// Fixed continuation prompt after a tool-loop break.
pub const AUTO_CONTINUE_PROMPT: &str = "You were interrupted because you repeated the same \
     action without progress. Step back, use the information you already have, and take a \
     different approach. Continue the task now and finish with the required <anton-result> block.";

/// One extra turn demanding a bare JSON decision from preflight.
pub const FORCE_DECISION_PROMPT: &str = "Your previous reply was not the required JSON object. \
     Reply now with ONLY the JSON object described earlier - no prose, no code fences.";

/// One-shot repair prompt when the `<anton-result>` block is missing or
/// malformed.
pub const RESULT_REPAIR_PROMPT: &str = "Your previous answer is missing the required \
     <anton-result> block. Reply with ONLY that block, reflecting the actual outcome of the \
     work you just did. Do not do any further work.";

/// Instruct a rewrite when preflight claimed a plan file but made no tool
/// calls.
pub const PLAN_REWRITE_PROMPT: &str = "You named a plan file but never wrote it. Create the \
     file now with your actual plan, then reply with the same JSON object again.";

/// Discovery-stage prompt: is the task already implemented, and if not,
/// where is the plan?
#[must_use]
pub fn discovery_prompt(task_text: &str, plan_dir: &str) -> String {
    format!(
        "Investigate whether the following task is already implemented in this repository.\n\
         \n\
         Task: {task_text}\n\
         \n\
         If it is fully implemented, reply with JSON {{\"status\": \"complete\", \
         \"filename\": \"\"}}.\n\
         If it is not, write a short implementation plan to a new markdown file under \
         `{plan_dir}/` and reply with JSON {{\"status\": \"incomplete\", \"filename\": \
         \"<path to the plan file>\"}}.\n\
         \n\
         Reply with ONLY the JSON object."
    )
}

/// Requirements-review prompt over an existing plan file.
#[must_use]
pub fn review_prompt(task_text: &str, plan_path: &str) -> String {
    format!(
        "Review the implementation plan in `{plan_path}` against the task below. Tighten it \
         where it is vague, remove anything out of scope, and make sure every requirement is \
         covered.\n\
         \n\
         Task: {task_text}\n\
         \n\
         When the plan is ready, reply with JSON {{\"status\": \"ready\", \"filename\": \
         \"{plan_path}\"}}. Reply with ONLY the JSON object."
    )
}

/// Compose the implementation prompt for one attempt.
#[must_use]
pub fn implementation_prompt(
    task_text: &str,
    retry_context: Option<&str>,
    plan: Option<&str>,
    vault_snippets: &[String],
    iteration_cap: usize,
) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Implement the following task:\n\n{task_text}\n");

    if let Some(context) = retry_context {
        let _ = writeln!(prompt, "## Previous attempt\n\n{context}\n");
    }
    if let Some(plan) = plan {
        let _ = writeln!(prompt, "## Plan\n\n{plan}\n");
    }
    if !vault_snippets.is_empty() {
        let _ = writeln!(prompt, "## Project notes\n");
        for snippet in vault_snippets {
            let _ = writeln!(prompt, "- {snippet}");
        }
        let _ = writeln!(prompt);
    }
    let _ = writeln!(
        prompt,
        "You have at most {iteration_cap} tool iterations. Work directly in the repository, \
         verify your change builds, and finish with the <anton-result> block."
    );
    prompt
}
