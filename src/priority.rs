//! Persisted mod priority table and resolution-strategy defaults.
//!
//! Stored as JSON under the target installation's private data directory,
//! loaded at pipeline start and written back on explicit user edits.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::conflict::ResolutionStrategy;

/// Priorities are clamped into this range; lower = higher precedence.
pub const MIN_PRIORITY: u32 = 1;
pub const MAX_PRIORITY: u32 = 999;

pub const PRIORITY_CONFIG_FILE: &str = "mod_priorities.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModPriorityConfig {
    /// mod id -> priority.
    #[serde(default)]
    pub priorities: BTreeMap<String, u32>,

    /// Strategy used when no per-category override applies.
    #[serde(default = "default_strategy")]
    pub default_strategy: ResolutionStrategy,

    /// category -> strategy overrides.
    #[serde(default)]
    pub category_strategies: BTreeMap<String, ResolutionStrategy>,

    /// Allow automatic resolution of medium/high severity conflicts.
    #[serde(default = "default_true")]
    pub auto_resolve_non_breaking: bool,
}

fn default_strategy() -> ResolutionStrategy {
    ResolutionStrategy::HigherPriority
}

fn default_true() -> bool {
    true
}

impl Default for ModPriorityConfig {
    fn default() -> Self {
        Self {
            priorities: BTreeMap::new(),
            default_strategy: default_strategy(),
            category_strategies: BTreeMap::new(),
            auto_resolve_non_breaking: true,
        }
    }
}

impl ModPriorityConfig {
    /// Config file location inside the installation's private data dir.
    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join(PRIORITY_CONFIG_FILE)
    }

    /// Load from disk, or return defaults when the file does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read priority config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Malformed priority config {}", path.display()))
    }

    /// Write back to the same location it was loaded from.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self).context("Cannot serialize priority config")?;
        std::fs::write(path, text)
            .with_context(|| format!("Cannot write priority config {}", path.display()))?;
        info!("Saved priority config to {}", path.display());
        Ok(())
    }

    /// Set a mod's priority, clamped to the valid range.
    pub fn set_priority(&mut self, mod_id: impl Into<String>, priority: u32) {
        let clamped = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        self.priorities.insert(mod_id.into(), clamped);
    }

    pub fn priority_for(&self, mod_id: &str) -> Option<u32> {
        self.priorities.get(mod_id).copied()
    }

    /// Strategy for a category: the override when present, otherwise the
    /// default.
    pub fn strategy_for(&self, category: &str) -> ResolutionStrategy {
        self.category_strategies
            .get(category)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    /// Overwrite source priorities from the persisted table; sources without
    /// an entry keep the priority they registered with.
    pub fn apply_to(&self, sources: &mut [crate::conflict::ModSource]) {
        for source in sources {
            if let Some(p) = self.priority_for(&source.mod_id) {
                source.priority = p;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = ModPriorityConfig::load(&tmp.path().join("nope.json")).unwrap();
        assert!(cfg.priorities.is_empty());
        assert_eq!(cfg.default_strategy, ResolutionStrategy::HigherPriority);
        assert!(cfg.auto_resolve_non_breaking);
    }

    #[test]
    fn save_and_reload_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = ModPriorityConfig::path_in(tmp.path());

        let mut cfg = ModPriorityConfig::default();
        cfg.set_priority("hats-pack", 42);
        cfg.category_strategies
            .insert("weather".into(), ResolutionStrategy::MostRecent);
        cfg.auto_resolve_non_breaking = false;
        cfg.save(&path).unwrap();

        let loaded = ModPriorityConfig::load(&path).unwrap();
        assert_eq!(loaded.priority_for("hats-pack"), Some(42));
        assert_eq!(
            loaded.strategy_for("weather"),
            ResolutionStrategy::MostRecent
        );
        assert_eq!(
            loaded.strategy_for("anything-else"),
            ResolutionStrategy::HigherPriority
        );
        assert!(!loaded.auto_resolve_non_breaking);
    }

    #[test]
    fn priorities_are_clamped() {
        let mut cfg = ModPriorityConfig::default();
        cfg.set_priority("too-low", 0);
        cfg.set_priority("too-high", 5000);
        assert_eq!(cfg.priority_for("too-low"), Some(MIN_PRIORITY));
        assert_eq!(cfg.priority_for("too-high"), Some(MAX_PRIORITY));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(ModPriorityConfig::load(&path).is_err());
    }

    #[test]
    fn apply_to_overrides_registered_priorities() {
        use chrono::Utc;
        let mut cfg = ModPriorityConfig::default();
        cfg.set_priority("a", 7);

        let mut sources = vec![crate::conflict::ModSource {
            mod_id: "a".into(),
            mod_name: "A".into(),
            category: "misc".into(),
            priority: 500,
            applied_at: Utc::now(),
            affected_files: Vec::new(),
            config_keys: Vec::new(),
            settings: Default::default(),
        }];
        cfg.apply_to(&mut sources);
        assert_eq!(sources[0].priority, 7);
    }
}
