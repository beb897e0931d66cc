//! Local conversation files.
//!
//! One JSON file per local id at `<saved>/<id>.txt`:
//!
//! ```text
//! { "openaiThreadId": "thread_abc", "title": "...", "messages": [...], "tokenTally": 1234 }
//! ```
//!
//! Older files hold a bare array of messages; they load as a conversation
//! with no remote thread.

use crate::ThreadMessage;
use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

const EXTENSION: &str = "txt";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    #[serde(rename = "openaiThreadId", default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub messages: Vec<ThreadMessage>,
    #[serde(rename = "tokenTally", default, skip_serializing_if = "Option::is_none")]
    pub token_tally: Option<u64>,
}

impl Conversation {
    /// Parse either the current object shape or a legacy message array.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        if value.is_array() {
            Ok(Self {
                messages: serde_json::from_value(value)?,
                ..Default::default()
            })
        } else {
            serde_json::from_value(value)
        }
    }

    pub fn message(&self, id: &str) -> Option<&ThreadMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn message_mut(&mut self, id: &str) -> Option<&mut ThreadMessage> {
        self.messages.iter_mut().find(|m| m.id == id)
    }
}

/// One row of [`ConversationStore::list`].
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub thread_id: Option<String>,
    pub message_count: usize,
}

#[derive(Debug, Clone)]
pub struct ConversationStore {
    dir: PathBuf,
}

impl ConversationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: &str) -> Result<PathBuf, RelayError> {
        validate_id(id)?;
        Ok(self.dir.join(format!("{id}.{EXTENSION}")))
    }

    pub async fn exists(&self, id: &str) -> bool {
        match self.path(id) {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Load a conversation. Missing, unreadable or malformed files start
    /// fresh; only the latter two are logged.
    pub async fn load(&self, id: &str) -> Result<Conversation, RelayError> {
        let path = self.path(id)?;
        let json = match fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("[{id}] no saved conversation, starting fresh");
                return Ok(Conversation::default());
            }
            Err(e) => {
                warn!("[{id}] failed to read {}: {e}; starting fresh", path.display());
                return Ok(Conversation::default());
            }
        };
        match Conversation::from_json(&json) {
            Ok(conv) => Ok(conv),
            Err(e) => {
                warn!("[{id}] failed to parse {}: {e}; starting fresh", path.display());
                Ok(Conversation::default())
            }
        }
    }

    /// Atomic write: serialize to a temp file, then rename into place.
    pub async fn save(&self, id: &str, conversation: &Conversation) -> Result<(), RelayError> {
        let final_path = self.path(id)?;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| RelayError::Persistence(format!("Failed to create {}: {e}", self.dir.display())))?;
        let tmp_path = self.dir.join(format!(".{id}.{EXTENSION}.tmp"));

        let json = serde_json::to_string_pretty(conversation)
            .map_err(|e| RelayError::Persistence(format!("Failed to serialize conversation: {e}")))?;
        fs::write(&tmp_path, json)
            .await
            .map_err(|e| RelayError::Persistence(format!("Failed to write temp file: {e}")))?;
        fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| RelayError::Persistence(format!("Failed to rename conversation file: {e}")))?;
        Ok(())
    }

    /// Every saved conversation, sorted by id. Malformed files are skipped.
    pub async fn list(&self) -> Result<Vec<ConversationSummary>, RelayError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(RelayError::Persistence(format!(
                    "Failed to read {}: {e}",
                    self.dir.display()
                )));
            }
        };

        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RelayError::Persistence(format!("Failed to read entry: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            if id.starts_with('.') {
                continue;
            }
            let parsed = match fs::read_to_string(&path).await {
                Ok(json) => Conversation::from_json(&json).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match parsed {
                Ok(conv) => out.push(ConversationSummary {
                    title: conv.title.clone().unwrap_or_else(|| id.clone()),
                    id,
                    thread_id: conv.thread_id,
                    message_count: conv.messages.len(),
                }),
                Err(e) => warn!("Skipping malformed conversation at {}: {e}", path.display()),
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    /// Remove the file. `false` if there was nothing to remove.
    pub async fn delete(&self, id: &str) -> Result<bool, RelayError> {
        let path = self.path(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(RelayError::Persistence(format!(
                "Failed to delete {}: {e}",
                path.display()
            ))),
        }
    }
}

/// Ids become file names, so they must be a single plain path segment.
pub fn validate_id(id: &str) -> Result<(), RelayError> {
    let bad = id.is_empty()
        || id.starts_with('.')
        || id.contains(['/', '\\', '\0'])
        || id.len() > 200;
    if bad {
        Err(RelayError::Validation(format!("Invalid conversation id '{id}'")))
    } else {
        Ok(())
    }
}
