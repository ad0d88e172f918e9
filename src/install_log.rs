//! Installation log: which content entries are installed and which files
//! each one owns.
//!
//! Persisted as JSON next to the priority config so a later run can remove
//! one entry's files without touching anything another entry owns.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const INSTALL_LOG_FILE: &str = "install_log.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledEntry {
    pub mod_id: String,
    pub mod_name: String,
    /// Numeric config block identifier this entry patched, when any.
    pub config_key: Option<String>,
    /// Files inside the rebuilt archive this entry owns.
    pub owned_files: Vec<String>,
    pub installed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallLog {
    /// mod id -> entry, insertion order not significant.
    #[serde(default)]
    entries: BTreeMap<String, InstalledEntry>,
}

impl InstallLog {
    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join(INSTALL_LOG_FILE)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read install log {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Malformed install log {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self).context("Cannot serialize install log")?;
        std::fs::write(path, text)
            .with_context(|| format!("Cannot write install log {}", path.display()))?;
        Ok(())
    }

    /// Record an installed entry, replacing any previous record for the same
    /// mod.
    pub fn record(&mut self, entry: InstalledEntry) {
        info!(
            "Recording installed entry {} ({} files)",
            entry.mod_id,
            entry.owned_files.len()
        );
        self.entries.insert(entry.mod_id.clone(), entry);
    }

    /// Remove an entry, returning the files it owned so the caller can
    /// delete them from the staging tree before the next recompile.
    pub fn remove(&mut self, mod_id: &str) -> Option<Vec<String>> {
        self.entries.remove(mod_id).map(|e| e.owned_files)
    }

    pub fn get(&self, mod_id: &str) -> Option<&InstalledEntry> {
        self.entries.get(mod_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &InstalledEntry> {
        self.entries.values()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
