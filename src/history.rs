//! Recently launched projects.
//!
//! The history is a bounded JSON list stored in the user's config directory. It
//! is advisory: a missing or corrupt file reads as empty.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::launch::LaunchConfig;

pub const HISTORY_FILE: &str = "project-history.json";
const APP_DIR: &str = "devlaunch";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Project key, see `project_key`.
    pub id: String,
    pub name: String,
    /// Absolute project directory.
    pub path: String,
    pub last_launched_at: DateTime<Utc>,
    pub config: LaunchConfig,
}

/// Stable project key for an absolute project path.
pub fn project_key(path: &Path) -> String {
    URL_SAFE_NO_PAD.encode(path.to_string_lossy().as_bytes())
}

/// `<config dir>/devlaunch/project-history.json`
pub fn default_history_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(HISTORY_FILE))
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
    max_entries: usize,
}

impl HistoryStore {
    pub fn new(path: PathBuf, max_entries: usize) -> Self {
        Self { path, max_entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries, most recently launched first.
    pub fn load(&self) -> Vec<HistoryEntry> {
        if !self.path.is_file() {
            return Vec::new();
        }
        let parsed = std::fs::read_to_string(&self.path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str::<Vec<HistoryEntry>>(&raw).map_err(Into::into));
        match parsed {
            Ok(mut entries) => {
                entries.sort_by(|a, b| b.last_launched_at.cmp(&a.last_launched_at));
                entries
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to load project history");
                Vec::new()
            }
        }
    }

    pub fn save(&self, entries: &[HistoryEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    /// Adds or replaces the entry with the same id, stamping it as just launched.
    pub fn upsert(&self, mut entry: HistoryEntry) -> Result<Vec<HistoryEntry>> {
        entry.last_launched_at = Utc::now();
        let mut entries = self.load();
        entries.retain(|e| e.id != entry.id);
        entries.insert(0, entry);
        entries.truncate(self.max_entries);
        self.save(&entries)?;
        Ok(entries)
    }

    /// Removes `id`; returns whether it was present.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut entries = self.load();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() != before;
        if removed {
            self.save(&entries)?;
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        self.save(&[])
    }
}
