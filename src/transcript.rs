//! The live chat transcript shared with the host.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One entry of the transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub body: String,
    /// Marks a prewarm's throwaway turn. Never persisted, never rendered.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub transient: bool,
}

impl ChatMessage {
    pub fn user(body: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            body: body.into(),
            transient: false,
        }
    }

    pub fn assistant(body: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            body: body.into(),
            transient: false,
        }
    }

    /// The throwaway user turn a prewarm session injects.
    pub fn transient(body: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            body: body.into(),
            transient: true,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

/// The host's ordered, mutable message store.
#[async_trait]
pub trait Transcript: Send + Sync {
    /// Append in memory only. No render, no persistence.
    fn append(&self, message: ChatMessage);

    /// Scan from the end and remove the first entry matching `predicate`.
    fn remove_last_where(&self, predicate: &dyn Fn(&ChatMessage) -> bool) -> Option<ChatMessage>;

    fn messages(&self) -> Vec<ChatMessage>;

    fn len(&self) -> usize {
        self.messages().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the current in-memory state durable.
    async fn save(&self) -> Result<()>;
}

/// Remove the most recent transient entry, if any.
pub fn remove_transient(transcript: &dyn Transcript) -> Option<ChatMessage> {
    transcript.remove_last_where(&ChatMessage::is_transient)
}

/// In-memory transcript, optionally saved as pretty JSON to a file.
#[derive(Debug, Default)]
pub struct MemoryTranscript {
    messages: Mutex<Vec<ChatMessage>>,
    path: Option<PathBuf>,
    saves: AtomicUsize,
}

impl MemoryTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages: Mutex::new(messages),
            ..Self::default()
        }
    }

    /// Load from `path` if it exists; `save` writes back to the same file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let messages = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Vec::new()
        };
        Ok(Self {
            messages: Mutex::new(messages),
            path: Some(path),
            saves: AtomicUsize::new(0),
        })
    }

    /// Number of completed `save` calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ChatMessage>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transcript for MemoryTranscript {
    fn append(&self, message: ChatMessage) {
        self.lock().push(message);
    }

    fn remove_last_where(&self, predicate: &dyn Fn(&ChatMessage) -> bool) -> Option<ChatMessage> {
        let mut messages = self.lock();
        let idx = messages.iter().rposition(predicate)?;
        Some(messages.remove(idx))
    }

    fn messages(&self) -> Vec<ChatMessage> {
        self.lock().clone()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    async fn save(&self) -> Result<()> {
        if let Some(path) = &self.path {
            // Transient entries never reach durable storage.
            let durable: Vec<ChatMessage> =
                self.lock().iter().filter(|m| !m.is_transient()).cloned().collect();
            let json = serde_json::to_string_pretty(&durable)?;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
