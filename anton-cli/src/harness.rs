//! Agent harness adapter.
//!
//! The external agent harness is consumed as a subprocess speaking
//! newline-delimited JSON: one request object per `ask` on stdin, one
//! reply object per line on stdout. One subprocess per session; killing
//! the process is session close.

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

use anton::error::{Error, Result, SessionErrorKind};
use anton::session::{
    AgentSession, AskHooks, AskOutcome, AskReply, SessionConfig, SessionFactory,
};
use anton::usage::Usage;

/// Spawns one harness subprocess per session.
#[derive(Debug, Clone)]
pub struct HarnessFactory {
    command: String,
}

impl HarnessFactory {
    /// A factory running the given shell command per session.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl SessionFactory for HarnessFactory {
    async fn spawn(&self, config: SessionConfig) -> Result<Box<dyn AgentSession>> {
        debug!(label = %config.label, "spawning harness session");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::infra(format!("failed to spawn agent harness: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::infra("harness stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::infra("harness stdout unavailable"))?;

        Ok(Box::new(HarnessSession {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            config,
            usage: Usage::zero(),
            system_prompt: String::new(),
        }))
    }

    async fn ensure_runtime_ready(&self, _force_restart: bool) -> Result<()> {
        // Sessions are independent subprocesses; a fresh spawn is the
        // recovery.
        Ok(())
    }
}

#[derive(Serialize)]
struct HarnessRequest<'a> {
    prompt: &'a str,
    system_prompt_suffix: &'a str,
    max_iterations: usize,
    no_tools: bool,
}

#[derive(Deserialize)]
struct HarnessReply {
    #[serde(default)]
    text: String,
    #[serde(default)]
    turns: usize,
    #[serde(default)]
    tool_calls: usize,
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    error: Option<String>,
}

struct HarnessSession {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    config: SessionConfig,
    usage: Usage,
    system_prompt: String,
}

#[async_trait]
impl AgentSession for HarnessSession {
    async fn ask(&mut self, prompt: &str, hooks: AskHooks) -> Result<AskOutcome> {
        if hooks
            .signal
            .as_ref()
            .is_some_and(|s| s.load(std::sync::atomic::Ordering::SeqCst))
        {
            return Err(Error::session(SessionErrorKind::Aborted, "ask aborted"));
        }

        let request = HarnessRequest {
            prompt,
            system_prompt_suffix: &self.config.system_prompt_suffix,
            max_iterations: self.config.max_iterations,
            no_tools: self.config.no_tools,
        };
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::infra(format!("harness pipe closed: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| Error::infra(format!("harness pipe closed: {e}")))?;

        let mut reply_line = String::new();
        let read = self
            .stdout
            .read_line(&mut reply_line)
            .await
            .map_err(|e| Error::infra(format!("harness read failed: {e}")))?;
        if read == 0 {
            return Err(Error::infra("harness exited before replying"));
        }

        let reply: HarnessReply = serde_json::from_str(reply_line.trim())
            .map_err(|e| Error::session(SessionErrorKind::Other, format!("bad harness reply: {e}")))?;
        if let Some(error) = reply.error {
            return Err(Error::session(SessionErrorKind::Other, error));
        }

        self.usage += Usage::new(reply.prompt_tokens, reply.completion_tokens);
        Ok(AskOutcome::Completed(AskReply {
            text: reply.text,
            turns: reply.turns,
            tool_calls: reply.tool_calls,
        }))
    }

    fn cancel(&mut self) {
        let _ = self.child.start_kill();
    }

    async fn close(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }

    fn usage(&self) -> Usage {
        self.usage
    }

    fn get_system_prompt(&self) -> String {
        self.system_prompt.clone()
    }

    fn set_system_prompt(&mut self, text: String) {
        self.system_prompt = text;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_one_ask_through_a_shell_harness() {
        // An `sh` one-liner that answers every request with a fixed reply.
        let factory = HarnessFactory::new(
            r#"while read -r _line; do echo '{"text": "hi", "turns": 1, "prompt_tokens": 7, "completion_tokens": 3}'; done"#,
        );
        let mut session = factory
            .spawn(SessionConfig::new("test"))
            .await
            .unwrap();
        let outcome = session.ask("hello", AskHooks::default()).await.unwrap();
        let reply = outcome.reply().unwrap();
        assert_eq!(reply.text, "hi");
        assert_eq!(session.usage().total(), 10);
        session.close().await;
    }

    #[tokio::test]
    async fn harness_error_field_becomes_a_session_error() {
        let factory = HarnessFactory::new(
            r#"while read -r _line; do echo '{"error": "model is loading"}'; done"#,
        );
        let mut session = factory.spawn(SessionConfig::new("test")).await.unwrap();
        let err = session.ask("hello", AskHooks::default()).await.unwrap_err();
        assert!(err.is_infra());
        session.close().await;
    }

    #[tokio::test]
    async fn early_exit_is_an_infra_error() {
        let factory = HarnessFactory::new("true");
        let mut session = factory.spawn(SessionConfig::new("test")).await.unwrap();
        let err = session.ask("hello", AskHooks::default()).await.unwrap_err();
        assert!(err.is_infra());
        session.close().await;
    }
}
