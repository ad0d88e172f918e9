//! Stable error kinds for the deployment pipeline.
//!
//! Every failure that crosses a component boundary carries one of these
//! variants plus a human-readable message, so the invoking UI can present
//! actionable guidance instead of a raw backtrace.

use std::path::PathBuf;

/// Pipeline-level errors with stable kinds.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Every ranked content source failed or stalled.
    #[error("All content sources exhausted; last failure: {last_failure}")]
    SourceExhausted { last_failure: String },

    /// The local download cache could not be created or written to.
    #[error("Fetch cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Downloaded or extracted content failed structural validation.
    #[error("Corrupt artifact: {0}")]
    CorruptArtifact(String),

    /// A required external executable or shared library is absent.
    #[error("Required tool not found: {0}")]
    ToolMissing(String),

    /// An external tool exited non-zero or timed out.
    #[error("External tool failed: {0}")]
    ToolFailed(String),

    /// An expected output file never appeared after a tool run.
    #[error("Expected artifact not found: {0}")]
    ArtifactNotFound(PathBuf),

    /// The requested config block was not found, or its owner tag mismatched.
    #[error("Patch not applied for block '{identifier}': {reason}")]
    PatchNotApplied { identifier: String, reason: String },

    /// A critical-severity conflict lacks a caller decision. This is a normal
    /// result the UI must act on, not an internal failure.
    #[error("Conflict {0} requires a user decision")]
    ConflictUnresolved(String),

    /// The final copy into the live installation could not complete.
    #[error("Failed to replace live archive: {0}")]
    ReplaceFailed(String),

    /// The operation was cancelled by the caller. Distinct from timeouts and
    /// tool failures.
    #[error("Operation cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Short machine-stable kind name, for logs and UI dispatch.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::SourceExhausted { .. } => "SourceExhausted",
            PipelineError::CacheUnavailable(_) => "CacheUnavailable",
            PipelineError::CorruptArtifact(_) => "CorruptArtifact",
            PipelineError::ToolMissing(_) => "ToolMissing",
            PipelineError::ToolFailed(_) => "ToolFailed",
            PipelineError::ArtifactNotFound(_) => "ArtifactNotFound",
            PipelineError::PatchNotApplied { .. } => "PatchNotApplied",
            PipelineError::ConflictUnresolved(_) => "ConflictUnresolved",
            PipelineError::ReplaceFailed(_) => "ReplaceFailed",
            PipelineError::Cancelled => "Cancelled",
        }
    }
}
