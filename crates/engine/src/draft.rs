//! Per-ticket composer drafts
//!
//! Drafts live in a key/value resource under `draft:{ticket_id}`, one per
//! ticket, last write wins. Absence is the normal case on restore.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use ticketsync_shared::TicketId;

use crate::error::DraftError;

/// Key/value resource backing the draft store
pub trait DraftBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, DraftError>;
    fn set(&self, key: &str, value: String) -> Result<(), DraftError>;
    fn remove(&self, key: &str) -> Result<(), DraftError>;
}

/// Process-local backend
#[derive(Debug, Default)]
pub struct MemoryDraftBackend {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryDraftBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DraftBackend for MemoryDraftBackend {
    fn get(&self, key: &str) -> Result<Option<String>, DraftError> {
        let entries = self.entries.read().map_err(|_| DraftError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), DraftError> {
        let mut entries = self.entries.write().map_err(|_| DraftError::Poisoned)?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), DraftError> {
        let mut entries = self.entries.write().map_err(|_| DraftError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

/// Backend persisting every key in a single JSON object file.
///
/// Writes go to a temporary sibling file that is then renamed over the
/// original, so a crash never leaves a half-written file behind.
#[derive(Debug)]
pub struct JsonFileDraftBackend {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileDraftBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, String>, DraftError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, entries: &HashMap<String, String>) -> Result<(), DraftError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(serde_json::to_string_pretty(entries)?.as_bytes())?;
        tmp_file.sync_all()?;
        drop(tmp_file);

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut HashMap<String, String>)) -> Result<(), DraftError> {
        let _guard = self.lock.lock().map_err(|_| DraftError::Poisoned)?;
        let mut entries = self.load()?;
        f(&mut entries);
        self.save(&entries)
    }
}

impl DraftBackend for JsonFileDraftBackend {
    fn get(&self, key: &str) -> Result<Option<String>, DraftError> {
        let _guard = self.lock.lock().map_err(|_| DraftError::Poisoned)?;
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: String) -> Result<(), DraftError> {
        self.update(|entries| {
            entries.insert(key.to_string(), value);
        })
    }

    fn remove(&self, key: &str) -> Result<(), DraftError> {
        self.update(|entries| {
            entries.remove(key);
        })
    }
}

/// Saved composer text for a ticket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub ticket_id: TicketId,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub saved_at: OffsetDateTime,
}

pub struct DraftStore {
    backend: Arc<dyn DraftBackend>,
}

impl DraftStore {
    pub fn new(backend: Arc<dyn DraftBackend>) -> Self {
        Self { backend }
    }

    pub fn key(ticket_id: &TicketId) -> String {
        format!("draft:{ticket_id}")
    }

    /// Autosave the composer. Blank content removes the draft.
    pub fn save(&self, ticket_id: &TicketId, content: &str) -> Result<Option<Draft>, DraftError> {
        if content.trim().is_empty() {
            self.clear(ticket_id)?;
            return Ok(None);
        }

        let draft = Draft {
            ticket_id: ticket_id.clone(),
            content: content.to_string(),
            saved_at: OffsetDateTime::now_utc(),
        };
        self.backend.set(&Self::key(ticket_id), serde_json::to_string(&draft)?)?;
        Ok(Some(draft))
    }

    /// Draft for the ticket, if one was saved
    pub fn restore(&self, ticket_id: &TicketId) -> Result<Option<Draft>, DraftError> {
        let Some(raw) = self.backend.get(&Self::key(ticket_id))? else {
            return Ok(None);
        };

        match serde_json::from_str::<Draft>(&raw) {
            Ok(draft) => Ok(Some(draft)),
            Err(_) if raw.trim().is_empty() => Ok(None),
            Err(_) => {
                // Plain text stored by older clients
                tracing::debug!(ticket_id = %ticket_id, "Restoring legacy plain-text draft");
                Ok(Some(Draft {
                    ticket_id: ticket_id.clone(),
                    content: raw,
                    saved_at: OffsetDateTime::now_utc(),
                }))
            }
        }
    }

    /// Drop the draft (after a successful send or an explicit discard)
    pub fn clear(&self, ticket_id: &TicketId) -> Result<(), DraftError> {
        self.backend.remove(&Self::key(ticket_id))
    }
}
