//! Conflict detection and resolution between independent mod sources.
//!
//! Two mods collide when their affected files overlap, their targeted config
//! keys overlap, or their declared settings are mutually exclusive. Each
//! detected conflict starts in `Detected` (or `AwaitingUserChoice` when
//! critical) and is resolved exactly once; the outcome names the winning
//! source and the files it takes ownership of.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::priority::ModPriorityConfig;

/// One independently-selectable content contribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModSource {
    pub mod_id: String,
    pub mod_name: String,
    pub category: String,
    /// Lower value = higher precedence. Clamped to 1..=999 by the priority
    /// table.
    pub priority: u32,
    pub applied_at: DateTime<Utc>,
    /// Files inside the content archive this mod overwrites.
    pub affected_files: Vec<String>,
    /// Numeric config block identifiers this mod patches.
    pub config_keys: Vec<String>,
    /// Declared configuration settings (key -> value).
    pub settings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictType {
    File,
    Script,
    Asset,
    Configuration,
}

/// Ordered severity; `Critical` always requires a user decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConflictSeverity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionStrategy {
    /// Source with the numerically lowest priority wins.
    HigherPriority,
    /// Source with the numerically highest priority wins.
    LowerPriority,
    /// Source with the latest applied_at wins.
    MostRecent,
    /// The first-registered source wins.
    KeepExisting,
    /// The most-recently-registered source wins.
    UseNew,
    /// Structural merge; falls back to HigherPriority on failure.
    Merge,
    /// No automatic winner; an explicit caller choice is required.
    Interactive,
}

impl ResolutionStrategy {
    /// Fully-automatic strategies need no caller input.
    pub fn is_automatic(&self) -> bool {
        !matches!(self, ResolutionStrategy::Interactive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictState {
    Detected,
    AwaitingUserChoice,
    Resolved,
}

#[derive(Debug, Clone)]
pub struct ModConflict {
    pub id: Uuid,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub affected_files: Vec<String>,
    /// In registration order; always at least two.
    pub conflicting_sources: Vec<ModSource>,
    pub available_resolutions: Vec<ResolutionStrategy>,
    pub selected_resolution: Option<ResolutionStrategy>,
    pub state: ConflictState,
}

/// Produced exactly once per conflict; immutable thereafter.
#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    pub conflict_id: Uuid,
    pub success: bool,
    pub used_strategy: ResolutionStrategy,
    /// `None` for merges, which have no single winner.
    pub winning_source: Option<ModSource>,
    pub resolved_files: Vec<String>,
    pub error_message: Option<String>,
}

/// Severity for a file or script conflict from its overlap count.
fn severity_from_overlap(overlap: usize) -> ConflictSeverity {
    match overlap {
        0 => ConflictSeverity::None,
        1 => ConflictSeverity::Low,
        2..=3 => ConflictSeverity::Medium,
        4..=7 => ConflictSeverity::High,
        _ => ConflictSeverity::Critical,
    }
}

/// Strategies available at a given severity.
///
/// Critical conflicts expose only the interactive option; every other
/// severity must expose at least one fully-automatic option.
fn resolutions_for(conflict_type: ConflictType, severity: ConflictSeverity) -> Vec<ResolutionStrategy> {
    use ResolutionStrategy::*;

    if severity == ConflictSeverity::Critical {
        return vec![Interactive];
    }

    let mut out = vec![HigherPriority, LowerPriority, MostRecent, KeepExisting, UseNew];
    if matches!(conflict_type, ConflictType::Script | ConflictType::Configuration) {
        out.push(Merge);
    }
    out.push(Interactive);
    out
}

fn overlap(a: &[String], b: &[String]) -> Vec<String> {
    a.iter().filter(|x| b.contains(x)).cloned().collect()
}

/// True when two sources declare the same setting with different values.
fn settings_clash(a: &ModSource, b: &ModSource) -> bool {
    a.settings
        .iter()
        .any(|(k, v)| b.settings.get(k).map(|other| other != v).unwrap_or(false))
}

fn new_conflict(
    conflict_type: ConflictType,
    severity: ConflictSeverity,
    affected_files: Vec<String>,
    sources: Vec<ModSource>,
) -> ModConflict {
    let available = resolutions_for(conflict_type, severity);
    let state = if severity == ConflictSeverity::Critical {
        ConflictState::AwaitingUserChoice
    } else {
        ConflictState::Detected
    };
    ModConflict {
        id: Uuid::new_v4(),
        conflict_type,
        severity,
        affected_files,
        conflicting_sources: sources,
        available_resolutions: available,
        selected_resolution: None,
        state,
    }
}

/// Find every pairwise conflict among the given sources, in registration
/// order.
pub fn detect_conflicts(sources: &[ModSource]) -> Vec<ModConflict> {
    let mut out = Vec::new();

    for i in 0..sources.len() {
        for j in (i + 1)..sources.len() {
            let (a, b) = (&sources[i], &sources[j]);

            let shared_files = overlap(&a.affected_files, &b.affected_files);
            if !shared_files.is_empty() {
                let severity = severity_from_overlap(shared_files.len());
                debug!(
                    "File conflict between {} and {}: {} shared files ({:?})",
                    a.mod_id,
                    b.mod_id,
                    shared_files.len(),
                    severity
                );
                out.push(new_conflict(
                    ConflictType::File,
                    severity,
                    shared_files,
                    vec![a.clone(), b.clone()],
                ));
            }

            let shared_keys = overlap(&a.config_keys, &b.config_keys);
            if !shared_keys.is_empty() {
                let severity = severity_from_overlap(shared_keys.len());
                out.push(new_conflict(
                    ConflictType::Script,
                    severity,
                    shared_keys,
                    vec![a.clone(), b.clone()],
                ));
            }

            if settings_clash(a, b) {
                // Mutually exclusive settings always need intervention.
                out.push(new_conflict(
                    ConflictType::Configuration,
                    ConflictSeverity::Critical,
                    Vec::new(),
                    vec![a.clone(), b.clone()],
                ));
            }
        }
    }

    if !out.is_empty() {
        info!("Detected {} conflict(s)", out.len());
    }
    out
}

/// Whether a conflict may be resolved without user input under the given
/// configuration. Critical severity blocks auto-resolution unconditionally;
/// Medium and High defer to the `auto_resolve_non_breaking` flag; Low and
/// None always allow it.
pub fn can_auto_resolve(conflict: &ModConflict, config: &ModPriorityConfig) -> bool {
    match conflict.severity {
        ConflictSeverity::Critical => false,
        ConflictSeverity::High | ConflictSeverity::Medium => config.auto_resolve_non_breaking,
        ConflictSeverity::Low | ConflictSeverity::None => true,
    }
}

/// Resolve `conflict` with `strategy`. `preferred` names the winning mod id
/// for interactive choices; strategies that select their own winner ignore
/// it. Returns a failed outcome instead of panicking on misuse, and never
/// resolves the same conflict twice.
pub fn resolve(
    conflict: &mut ModConflict,
    strategy: ResolutionStrategy,
    preferred: Option<&str>,
) -> ResolutionOutcome {
    if conflict.state == ConflictState::Resolved {
        return failure(conflict, strategy, "conflict already resolved");
    }
    if conflict.conflicting_sources.len() < 2 {
        return failure(conflict, strategy, "conflict has fewer than two sources");
    }

    let outcome = match strategy {
        ResolutionStrategy::HigherPriority => winner_outcome(
            conflict,
            strategy,
            pick_by(conflict, |best, s| s.priority < best.priority),
        ),
        ResolutionStrategy::LowerPriority => winner_outcome(
            conflict,
            strategy,
            pick_by(conflict, |best, s| s.priority > best.priority),
        ),
        ResolutionStrategy::MostRecent => winner_outcome(
            conflict,
            strategy,
            pick_by(conflict, |best, s| s.applied_at > best.applied_at),
        ),
        ResolutionStrategy::KeepExisting => winner_outcome(
            conflict,
            strategy,
            conflict.conflicting_sources.first().cloned().unwrap(),
        ),
        ResolutionStrategy::UseNew => winner_outcome(
            conflict,
            strategy,
            conflict.conflicting_sources.last().cloned().unwrap(),
        ),
        ResolutionStrategy::Merge => merge_outcome(conflict),
        ResolutionStrategy::Interactive => match preferred {
            None => {
                return failure(
                    conflict,
                    strategy,
                    "interactive resolution requires a preferred source",
                )
            }
            Some(id) => match conflict
                .conflicting_sources
                .iter()
                .find(|s| s.mod_id == id)
                .cloned()
            {
                Some(winner) => winner_outcome(conflict, strategy, winner),
                None => {
                    return failure(
                        conflict,
                        strategy,
                        &format!("preferred source '{id}' is not part of this conflict"),
                    )
                }
            },
        },
    };

    conflict.selected_resolution = Some(outcome.used_strategy);
    conflict.state = ConflictState::Resolved;
    outcome
}

/// First-registered source wins ties.
fn pick_by(conflict: &ModConflict, better: impl Fn(&ModSource, &ModSource) -> bool) -> ModSource {
    let mut best = &conflict.conflicting_sources[0];
    for s in &conflict.conflicting_sources[1..] {
        if better(best, s) {
            best = s;
        }
    }
    best.clone()
}

fn winner_outcome(
    conflict: &ModConflict,
    strategy: ResolutionStrategy,
    winner: ModSource,
) -> ResolutionOutcome {
    info!(
        "Conflict {} resolved via {:?}: winner {}",
        conflict.id, strategy, winner.mod_id
    );
    ResolutionOutcome {
        conflict_id: conflict.id,
        success: true,
        used_strategy: strategy,
        resolved_files: conflict.affected_files.clone(),
        winning_source: Some(winner),
        error_message: None,
    }
}

/// Structural merge: legal for Script and Configuration conflicts whose
/// declared settings are disjoint or agree. Anything else falls back to
/// HigherPriority.
fn merge_outcome(conflict: &ModConflict) -> ResolutionOutcome {
    let mergeable = matches!(
        conflict.conflict_type,
        ConflictType::Script | ConflictType::Configuration
    );

    if mergeable {
        let mut merged: BTreeMap<String, String> = BTreeMap::new();
        let mut clash = false;
        'outer: for source in &conflict.conflicting_sources {
            for (k, v) in &source.settings {
                match merged.get(k) {
                    Some(existing) if existing != v => {
                        clash = true;
                        break 'outer;
                    }
                    _ => {
                        merged.insert(k.clone(), v.clone());
                    }
                }
            }
        }

        if !clash {
            info!("Conflict {} merged structurally", conflict.id);
            return ResolutionOutcome {
                conflict_id: conflict.id,
                success: true,
                used_strategy: ResolutionStrategy::Merge,
                winning_source: None,
                resolved_files: conflict.affected_files.clone(),
                error_message: None,
            };
        }
    }

    debug!(
        "Merge not possible for conflict {}, falling back to HigherPriority",
        conflict.id
    );
    winner_outcome(
        conflict,
        ResolutionStrategy::HigherPriority,
        pick_by(conflict, |best, s| s.priority < best.priority),
    )
}

fn failure(
    conflict: &ModConflict,
    strategy: ResolutionStrategy,
    message: &str,
) -> ResolutionOutcome {
    ResolutionOutcome {
        conflict_id: conflict.id,
        success: false,
        used_strategy: strategy,
        winning_source: None,
        resolved_files: Vec::new(),
        error_message: Some(message.to_string()),
    }
}
