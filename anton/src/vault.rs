//! Vault interface.
//!
//! The vault is the project's key/value note store. The controller treats
//! it as append-only: failure notes under the `agent failure` key and
//! key-fact archives from compaction. Search and retrieval feed optional
//! prompt snippets.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::ChatMessage;

/// Key under which the controller records failure notes.
pub const FAILURE_NOTE_KEY: &str = "agent failure";

/// The note store consumed by the controller.
#[async_trait]
pub trait Vault: Send + Sync {
    /// Insert or replace the note stored under `key`.
    async fn upsert_note(&self, key: &str, value: &str) -> Result<()>;

    /// Append a note under `key`.
    async fn note(&self, key: &str, value: &str) -> Result<()>;

    /// Return up to `k` note values matching `query`.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<String>>;

    /// Archive dropped tool messages. Returns how many were stored.
    async fn archive_tool_messages(&self, messages: &[ChatMessage]) -> Result<usize>;

    /// Most recent note value under `key`.
    async fn get_latest_by_key(&self, key: &str) -> Result<Option<String>>;
}

/// In-memory [`Vault`] used in tests and when no store is configured.
#[derive(Debug, Default)]
pub struct MemoryVault {
    inner: Mutex<MemoryVaultInner>,
}

#[derive(Debug, Default)]
struct MemoryVaultInner {
    rows: Vec<(String, String)>,
    upserts: HashMap<String, String>,
}

impl MemoryVault {
    /// Create an empty vault.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of appended rows (excluding upserts).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("vault lock").rows.len()
    }

    /// Whether no rows have been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Vault for MemoryVault {
    async fn upsert_note(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("vault lock");
        inner.upserts.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn note(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("vault lock");
        inner.rows.push((key.to_string(), value.to_string()));
        Ok(())
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<String>> {
        let inner = self.inner.lock().expect("vault lock");
        let needle = query.to_ascii_lowercase();
        Ok(inner
            .rows
            .iter()
            .rev()
            .filter(|(_, v)| v.to_ascii_lowercase().contains(&needle))
            .take(k)
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn archive_tool_messages(&self, messages: &[ChatMessage]) -> Result<usize> {
        let mut inner = self.inner.lock().expect("vault lock");
        let mut stored = 0;
        for message in messages {
            if message.content.is_empty() {
                continue;
            }
            inner
                .rows
                .push(("tool-archive".to_string(), message.content.clone()));
            stored += 1;
        }
        Ok(stored)
    }

    async fn get_latest_by_key(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().expect("vault lock");
        if let Some(v) = inner.upserts.get(key) {
            return Ok(Some(v.clone()));
        }
        Ok(inner
            .rows
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone()))
    }
}
