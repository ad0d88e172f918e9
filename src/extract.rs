//! Content-archive extraction via the external `vpk` tool.
//!
//! The tool unpacks `pak01_dir.vpk` into a wrapper directory named after the
//! archive; the extractor flattens that wrapper into the target root and then
//! verifies the well-known marker file is present. The container format does
//! not report failure reliably, so the marker check is authoritative: no
//! marker, no valid extraction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::runner::{CommandError, CommandRunner, CommandSpec};

/// File that must exist under the target after a valid extraction.
pub const MARKER_FILE: &str = "scripts/items/items_game.txt";

/// Wrapper subdirectory the tool creates inside the target.
pub const WRAPPER_DIR: &str = "pak01_dir";

/// Name of the external unpack/repack executable.
pub const VPK_TOOL: &str = "vpk";

const EXTRACT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Locate the vpk tool: next to our executable first, then on PATH.
pub fn find_vpk_tool() -> Result<PathBuf, PipelineError> {
    if let Ok(exe) = std::env::current_exe() {
        let exe_dir = exe.parent().unwrap_or(Path::new("."));
        let candidates = [exe_dir.join(VPK_TOOL), exe_dir.join("bin").join(VPK_TOOL)];
        for path in &candidates {
            if path.exists() {
                return Ok(path.clone());
            }
        }
    }

    which::which(VPK_TOOL).map_err(|_| {
        PipelineError::ToolMissing(format!(
            "{VPK_TOOL} binary not found next to the executable or on PATH"
        ))
    })
}

/// Extractor over an injectable command runner.
pub struct Extractor<R: CommandRunner> {
    runner: R,
    tool: PathBuf,
    timeout: Duration,
}

impl<R: CommandRunner> Extractor<R> {
    pub fn new(runner: R, tool: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            tool: tool.into(),
            timeout: EXTRACT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Unpack `archive` into `target_dir`, flatten the wrapper, verify the
    /// marker file.
    pub async fn extract(
        &self,
        archive: &Path,
        target_dir: &Path,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        std::fs::create_dir_all(target_dir).map_err(|e| {
            PipelineError::ToolFailed(format!(
                "Cannot create extraction target {}: {e}",
                target_dir.display()
            ))
        })?;

        let spec = CommandSpec::new(&self.tool, self.timeout)
            .arg(archive.display().to_string())
            .current_dir(target_dir);

        info!(
            "Extracting {} into {}",
            archive.display(),
            target_dir.display()
        );

        let output = match self.runner.run(spec, cancel).await {
            Ok(output) => output,
            Err(CommandError::Spawn { exe, source }) => {
                return Err(PipelineError::ToolMissing(format!(
                    "{}: {source}",
                    exe.display()
                )));
            }
            Err(CommandError::Timeout(t)) => {
                return Err(PipelineError::ToolFailed(format!(
                    "extraction timed out after {t:?}"
                )));
            }
            Err(CommandError::Cancelled) => return Err(PipelineError::Cancelled),
        };

        if !output.success() {
            warn!("Extractor stderr: {}", output.stderr.trim());
            return Err(PipelineError::ToolFailed(format!(
                "extractor exited with {:?}: {}",
                output.exit_code,
                first_line(&output.stderr)
            )));
        }

        flatten_wrapper(target_dir)?;

        let marker = target_dir.join(MARKER_FILE);
        if !marker.exists() {
            return Err(PipelineError::CorruptArtifact(format!(
                "invalid archive: {} missing after extraction",
                MARKER_FILE
            )));
        }

        let file_count = walkdir::WalkDir::new(target_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count();
        debug!(
            "Extraction verified: {} files, marker {}",
            file_count,
            marker.display()
        );
        Ok(())
    }
}

/// Relocate everything under `target/pak01_dir/` into `target/` and delete
/// the then-empty wrapper. No wrapper is not an error; some tool versions
/// extract in place.
fn flatten_wrapper(target_dir: &Path) -> Result<(), PipelineError> {
    let wrapper = target_dir.join(WRAPPER_DIR);
    if !wrapper.is_dir() {
        return Ok(());
    }

    let entries = std::fs::read_dir(&wrapper).map_err(|e| {
        PipelineError::ToolFailed(format!("Cannot read wrapper {}: {e}", wrapper.display()))
    })?;

    for entry in entries {
        let entry = entry
            .map_err(|e| PipelineError::ToolFailed(format!("Cannot read wrapper entry: {e}")))?;
        let dest = target_dir.join(entry.file_name());
        std::fs::rename(entry.path(), &dest).map_err(|e| {
            PipelineError::ToolFailed(format!(
                "Cannot relocate {} out of wrapper: {e}",
                entry.path().display()
            ))
        })?;
    }

    std::fs::remove_dir(&wrapper).map_err(|e| {
        PipelineError::ToolFailed(format!(
            "Cannot remove empty wrapper {}: {e}",
            wrapper.display()
        ))
    })?;

    debug!("Flattened wrapper {}", wrapper.display());
    Ok(())
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("no diagnostic output").trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{no_cancel, CommandOutput};
    use std::sync::Mutex;

    /// Test double: runs a closure instead of a real process.
    struct MockRunner<F> {
        behavior: F,
        specs: Mutex<Vec<CommandSpec>>,
    }

    impl<F> MockRunner<F>
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput, CommandError> + Send + Sync,
    {
        fn new(behavior: F) -> Self {
            Self {
                behavior,
                specs: Mutex::new(Vec::new()),
            }
        }
    }

    impl<F> CommandRunner for MockRunner<F>
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput, CommandError> + Send + Sync,
    {
        async fn run(
            &self,
            spec: CommandSpec,
            _cancel: watch::Receiver<bool>,
        ) -> Result<CommandOutput, CommandError> {
            let result = (self.behavior)(&spec);
            self.specs.lock().unwrap().push(spec);
            result
        }
    }

    fn ok_output() -> CommandOutput {
        CommandOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    #[tokio::test]
    async fn valid_extraction_flattens_wrapper_and_finds_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("out");

        let runner = MockRunner::new(|spec: &CommandSpec| {
            // Simulate the tool dropping a wrapper dir inside its cwd.
            let cwd = spec.cwd.as_ref().unwrap();
            let inner = cwd.join(WRAPPER_DIR).join("scripts/items");
            std::fs::create_dir_all(&inner).unwrap();
            std::fs::write(inner.join("items_game.txt"), "\"items_master\"{}").unwrap();
            std::fs::write(cwd.join(WRAPPER_DIR).join("readme.txt"), "x").unwrap();
            Ok(ok_output())
        });

        let extractor = Extractor::new(runner, "/tools/vpk");
        extractor
            .extract(Path::new("/archives/pak01_dir.vpk"), &target, no_cancel())
            .await
            .unwrap();

        assert!(target.join(MARKER_FILE).exists());
        assert!(target.join("readme.txt").exists());
        assert!(!target.join(WRAPPER_DIR).exists());
    }

    #[tokio::test]
    async fn extraction_without_wrapper_still_validates_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("out");

        let runner = MockRunner::new(|spec: &CommandSpec| {
            let cwd = spec.cwd.as_ref().unwrap();
            let inner = cwd.join("scripts/items");
            std::fs::create_dir_all(&inner).unwrap();
            std::fs::write(inner.join("items_game.txt"), "{}").unwrap();
            Ok(ok_output())
        });

        let extractor = Extractor::new(runner, "/tools/vpk");
        extractor
            .extract(Path::new("/archives/pak01_dir.vpk"), &target, no_cancel())
            .await
            .unwrap();
        assert!(target.join(MARKER_FILE).exists());
    }

    #[tokio::test]
    async fn missing_marker_is_invalid_archive_not_tool_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("out");

        // Tool "succeeds" but produces nothing useful.
        let runner = MockRunner::new(|_spec: &CommandSpec| Ok(ok_output()));
        let extractor = Extractor::new(runner, "/tools/vpk");

        let err = extractor
            .extract(Path::new("/archives/pak01_dir.vpk"), &target, no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::CorruptArtifact(_)));
    }

    #[tokio::test]
    async fn spawn_failure_maps_to_tool_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = MockRunner::new(|spec: &CommandSpec| {
            Err(CommandError::Spawn {
                exe: spec.exe.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        });
        let extractor = Extractor::new(runner, "/missing/vpk");

        let err = extractor
            .extract(Path::new("/a.vpk"), &tmp.path().join("out"), no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ToolMissing(_)));
    }

    #[tokio::test]
    async fn nonzero_exit_maps_to_tool_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = MockRunner::new(|_spec: &CommandSpec| {
            Ok(CommandOutput {
                exit_code: Some(2),
                stdout: String::new(),
                stderr: "corrupt chunk at 0x40\nmore detail".into(),
            })
        });
        let extractor = Extractor::new(runner, "/tools/vpk");

        let err = extractor
            .extract(Path::new("/a.vpk"), &tmp.path().join("out"), no_cancel())
            .await
            .unwrap_err();
        match err {
            PipelineError::ToolFailed(msg) => assert!(msg.contains("corrupt chunk")),
            other => panic!("expected ToolFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_and_cancel_are_distinct() {
        let tmp = tempfile::tempdir().unwrap();

        let timeout_runner = MockRunner::new(|_spec: &CommandSpec| {
            Err(CommandError::Timeout(Duration::from_secs(1)))
        });
        let err = Extractor::new(timeout_runner, "/tools/vpk")
            .extract(Path::new("/a.vpk"), &tmp.path().join("o1"), no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ToolFailed(_)));

        let cancel_runner = MockRunner::new(|_spec: &CommandSpec| Err(CommandError::Cancelled));
        let err = Extractor::new(cancel_runner, "/tools/vpk")
            .extract(Path::new("/a.vpk"), &tmp.path().join("o2"), no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }
}
