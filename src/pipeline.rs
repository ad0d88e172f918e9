//! The generation pipeline: fetch -> extract -> patch -> recompile -> replace.
//!
//! One sequential run per generation request. Conflicts between the requested
//! mods are resolved up front; a critical conflict without a caller decision
//! does not fail the run, it returns a blocked outcome the UI must act on by
//! collecting a choice and resubmitting.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::conflict::{
    self, ConflictState, ConflictType, ModConflict, ModSource, ResolutionOutcome,
    ResolutionStrategy,
};
use crate::error::PipelineError;
use crate::extract::{Extractor, MARKER_FILE};
use crate::fetch::Fetcher;
use crate::install_log::{InstallLog, InstalledEntry};
use crate::keyvalues;
use crate::priority::ModPriorityConfig;
use crate::recompile::Recompiler;
use crate::replace::Replacer;
use crate::runner::CommandRunner;
use crate::sources::SourceRanker;

/// Relative path of the shared base payload on every mirror.
pub const BASE_ASSET_PATH: &str = "Assets/Original.zip";

/// One textual patch against the item configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockPatch {
    pub identifier: String,
    #[serde(default)]
    pub owner_tag: Option<String>,
    /// Full replacement block text, braces included.
    pub block_text: String,
    /// Append the entry at document end when the identifier does not exist
    /// yet. Without this, a missing identifier is a `PatchNotApplied` error.
    #[serde(default)]
    pub allow_insert: bool,
}

/// A file the mod contributes to the rebuilt archive.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PayloadFile {
    /// Where the file currently lives on disk.
    pub source: PathBuf,
    /// Destination relative to the archive root.
    pub dest: String,
}

/// Everything one selected mod contributes to a generation run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModRequest {
    pub source: ModSource,
    #[serde(default)]
    pub patches: Vec<BlockPatch>,
    #[serde(default)]
    pub files: Vec<PayloadFile>,
}

/// A caller-supplied decision for a conflict that could not be resolved
/// automatically. Matched to a detected conflict by its participating mod
/// ids and type, since conflict ids are minted during detection.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UserDecision {
    pub mod_ids: Vec<String>,
    pub conflict_type: ConflictType,
    pub strategy: ResolutionStrategy,
    #[serde(default)]
    pub preferred: Option<String>,
}

impl UserDecision {
    fn matches(&self, conflict: &ModConflict) -> bool {
        if self.conflict_type != conflict.conflict_type {
            return false;
        }
        let ours: HashSet<&str> = self.mod_ids.iter().map(String::as_str).collect();
        let theirs: HashSet<&str> = conflict
            .conflicting_sources
            .iter()
            .map(|s| s.mod_id.as_str())
            .collect();
        ours == theirs
    }
}

/// Result of a generation run.
#[derive(Debug)]
pub enum GenerationOutcome {
    /// The rebuilt archive was installed into the live directory.
    Installed {
        archive: PathBuf,
        resolutions: Vec<ResolutionOutcome>,
    },
    /// One or more conflicts need a user decision before the run can
    /// proceed; nothing was modified.
    BlockedOnConflicts(Vec<ModConflict>),
}

/// Filesystem and mirror layout for a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Mirror base URLs, best-first ordering is learned at runtime.
    pub mirrors: Vec<String>,
    pub cache_root: PathBuf,
    /// Live installation directory holding the active archive.
    pub install_dir: PathBuf,
    /// Private data directory (priority table, install log).
    pub data_dir: PathBuf,
    /// Scratch space for extraction and builds.
    pub work_dir: PathBuf,
    /// Path to the external vpk tool.
    pub vpk_tool: PathBuf,
}

pub struct Pipeline<R: CommandRunner + Clone> {
    runner: R,
    config: PipelineConfig,
    ranker: std::sync::Arc<SourceRanker>,
    progress: Option<indicatif::ProgressBar>,
}

impl<R: CommandRunner + Clone> Pipeline<R> {
    pub fn new(runner: R, config: PipelineConfig) -> Self {
        let ranker = std::sync::Arc::new(SourceRanker::new(config.mirrors.clone()));
        Self {
            runner,
            config,
            ranker,
            progress: None,
        }
    }

    /// Attach a progress bar driven during the base payload download.
    pub fn with_progress_bar(mut self, bar: indicatif::ProgressBar) -> Self {
        self.progress = Some(bar);
        self
    }

    /// The shared ranker, for callers that want to inspect or pre-seed
    /// measurements.
    pub fn ranker(&self) -> std::sync::Arc<SourceRanker> {
        self.ranker.clone()
    }

    /// Run a full generation for the requested mod set.
    pub async fn generate(
        &self,
        mut requests: Vec<ModRequest>,
        decisions: &[UserDecision],
        cancel: watch::Receiver<bool>,
    ) -> Result<GenerationOutcome> {
        let priority_path = ModPriorityConfig::path_in(&self.config.data_dir);
        let priorities = ModPriorityConfig::load(&priority_path)?;

        let mut sources: Vec<ModSource> = requests.iter().map(|r| r.source.clone()).collect();
        priorities.apply_to(&mut sources);
        for (request, source) in requests.iter_mut().zip(&sources) {
            request.source = source.clone();
        }

        // Conflict resolution happens before any I/O so a blocked run leaves
        // the installation untouched.
        let mut conflicts = conflict::detect_conflicts(&sources);
        let mut resolutions = Vec::new();
        let mut blocked = Vec::new();

        for c in &mut conflicts {
            let decision = decisions.iter().find(|d| d.matches(c));

            let outcome = if let Some(d) = decision {
                conflict::resolve(c, d.strategy, d.preferred.as_deref())
            } else if conflict::can_auto_resolve(c, &priorities) {
                let strategy = priorities.strategy_for(&c.conflicting_sources[0].category);
                conflict::resolve(c, strategy, None)
            } else {
                debug!("Conflict {} awaits a user choice", c.id);
                blocked.push(c.clone());
                continue;
            };

            if !outcome.success {
                warn!(
                    "Resolution failed for conflict {}: {}",
                    c.id,
                    outcome.error_message.as_deref().unwrap_or("unknown")
                );
                blocked.push(c.clone());
                continue;
            }
            resolutions.push(outcome);
        }

        if !blocked.is_empty() {
            info!("{} conflict(s) need a user decision", blocked.len());
            return Ok(GenerationOutcome::BlockedOnConflicts(blocked));
        }

        let (skip_files, skip_keys) = loser_skips(&conflicts, &resolutions);

        check_cancel(&cancel)?;

        // Fetch the shared base payload.
        let fetcher = Fetcher::new(self.ranker.clone(), &self.config.cache_root)?;
        let cache_key = BASE_ASSET_PATH
            .rsplit('/')
            .next()
            .unwrap_or(BASE_ASSET_PATH)
            .to_ascii_lowercase();
        let fetched = fetcher
            .fetch_with_progress(BASE_ASSET_PATH, &cache_key, self.progress.as_ref(), cancel.clone())
            .await?;
        if let Some(pb) = &self.progress {
            pb.finish_and_clear();
        }
        info!(
            "Base payload ready ({} bytes from {})",
            fetched.size, fetched.provenance
        );

        // Extract into a clean staging tree.
        let staging = self.config.work_dir.join("staging");
        if staging.exists() {
            std::fs::remove_dir_all(&staging)
                .with_context(|| format!("Cannot reset staging {}", staging.display()))?;
        }
        let extractor = Extractor::new(self.runner.clone(), &self.config.vpk_tool);
        extractor
            .extract(&fetched.path, &staging, cancel.clone())
            .await?;

        // Patch the item configuration.
        let config_path = staging.join(MARKER_FILE);
        let raw = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Cannot read {}", config_path.display()))?;
        let mut doc = keyvalues::normalize(&raw);

        let log_path = InstallLog::path_in(&self.config.data_dir);
        let mut log = InstallLog::load(&log_path)?;

        for request in &requests {
            check_cancel(&cancel)?;
            let mod_id = &request.source.mod_id;

            for patch in &request.patches {
                if skip_keys.contains(&(mod_id.clone(), patch.identifier.clone())) {
                    debug!(
                        "Skipping patch {} from {} (lost conflict)",
                        patch.identifier, mod_id
                    );
                    continue;
                }
                doc = apply_patch(&doc, patch)?;
            }

            for file in &request.files {
                if skip_files.contains(&(mod_id.clone(), file.dest.clone())) {
                    debug!("Skipping file {} from {} (lost conflict)", file.dest, mod_id);
                    continue;
                }
                let dest = staging.join(&file.dest);
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Cannot create {}", parent.display()))?;
                }
                std::fs::copy(&file.source, &dest).with_context(|| {
                    format!(
                        "Cannot stage {} as {}",
                        file.source.display(),
                        file.dest
                    )
                })?;
            }

            log.record(InstalledEntry {
                mod_id: mod_id.clone(),
                mod_name: request.source.mod_name.clone(),
                config_key: request.patches.first().map(|p| p.identifier.clone()),
                owned_files: request
                    .files
                    .iter()
                    .filter(|f| !skip_files.contains(&(mod_id.clone(), f.dest.clone())))
                    .map(|f| f.dest.clone())
                    .collect(),
                installed_at: chrono::Utc::now(),
            });
        }

        std::fs::write(&config_path, &doc)
            .with_context(|| format!("Cannot write {}", config_path.display()))?;

        // Repack and install.
        let build_dir = self.config.work_dir.join("build");
        let recompiler = Recompiler::new(self.runner.clone(), &self.config.vpk_tool);
        let archive = recompiler
            .recompile(&staging, &build_dir, cancel.clone())
            .await?;

        Replacer::new()
            .replace(&self.config.install_dir, &archive, cancel.clone())
            .await?;

        log.save(&log_path)?;

        info!("Generation complete: {}", archive.display());
        Ok(GenerationOutcome::Installed {
            archive,
            resolutions,
        })
    }

    /// Forget an installed entry and return the files it owned so the caller
    /// can regenerate without them.
    pub fn remove_installed_entry(&self, mod_id: &str) -> Result<Option<Vec<String>>> {
        let log_path = InstallLog::path_in(&self.config.data_dir);
        let mut log = InstallLog::load(&log_path)?;
        let removed = log.remove(mod_id);
        if removed.is_some() {
            log.save(&log_path)?;
        }
        Ok(removed)
    }
}

fn check_cancel(cancel: &watch::Receiver<bool>) -> Result<(), PipelineError> {
    if *cancel.borrow() {
        return Err(PipelineError::Cancelled);
    }
    Ok(())
}

/// Replace the identified block, or append the entry when insertion is
/// allowed and the identifier is absent.
fn apply_patch(doc: &str, patch: &BlockPatch) -> Result<String> {
    let (next, applied) = keyvalues::replace_block(
        doc,
        &patch.identifier,
        patch.owner_tag.as_deref(),
        &patch.block_text,
    )
    .map_err(|e| PipelineError::CorruptArtifact(format!("config text unparseable: {e}")))?;

    if applied {
        debug!("Replaced block {}", patch.identifier);
        return Ok(next);
    }

    if patch.allow_insert {
        debug!("Appending new block {}", patch.identifier);
        let mut out = next;
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&format!("\"{}\"\n{}\n", patch.identifier, patch.block_text));
        return Ok(out);
    }

    Err(PipelineError::PatchNotApplied {
        identifier: patch.identifier.clone(),
        reason: match &patch.owner_tag {
            Some(tag) => format!("no block with owner tag '{tag}' found"),
            None => "block identifier not found".into(),
        },
    }
    .into())
}

/// For each resolved conflict with a single winner, the losing sources'
/// overlapping files and config keys are skipped during staging.
fn loser_skips(
    conflicts: &[ModConflict],
    resolutions: &[ResolutionOutcome],
) -> (HashSet<(String, String)>, HashSet<(String, String)>) {
    let mut files = HashSet::new();
    let mut keys = HashSet::new();

    for conflict in conflicts {
        if conflict.state != ConflictState::Resolved {
            continue;
        }
        let Some(outcome) = resolutions.iter().find(|o| o.conflict_id == conflict.id) else {
            continue;
        };
        // Merges keep both contributions.
        let Some(winner) = &outcome.winning_source else {
            continue;
        };

        for loser in conflict
            .conflicting_sources
            .iter()
            .filter(|s| s.mod_id != winner.mod_id)
        {
            for item in &conflict.affected_files {
                match conflict.conflict_type {
                    ConflictType::File | ConflictType::Asset => {
                        files.insert((loser.mod_id.clone(), item.clone()));
                    }
                    ConflictType::Script => {
                        keys.insert((loser.mod_id.clone(), item.clone()));
                    }
                    ConflictType::Configuration => {}
                }
            }
        }
    }

    (files, keys)
}
