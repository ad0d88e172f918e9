//! Repacking a prepared directory into a content archive.
//!
//! Drives the external `vpk` packer, then hunts for the freshly produced
//! archive among several candidate locations (the tool's output directory
//! varies between versions) and waits for the OS to release its write handle
//! before handing the path back. The packer may hold the file open briefly
//! after process exit.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::runner::{CommandError, CommandRunner, CommandSpec};

const RECOMPILE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Bounded post-exit polling for the output file to become readable.
const READ_POLL_ATTEMPTS: u32 = 20;
const READ_POLL_DELAY: Duration = Duration::from_millis(500);

/// Shared libraries the bundled packer layout ships next to the executable.
/// They come as a pair; one without the other is a broken install.
const PACKER_LIBS: [&str; 2] = ["libtier0_s.so", "libvstdlib_s.so"];

pub struct Recompiler<R: CommandRunner> {
    runner: R,
    tool: PathBuf,
    timeout: Duration,
    poll_delay: Duration,
}

impl<R: CommandRunner> Recompiler<R> {
    pub fn new(runner: R, tool: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            tool: tool.into(),
            timeout: RECOMPILE_TIMEOUT,
            poll_delay: READ_POLL_DELAY,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    /// Pack `source_dir` and return the path of the produced archive.
    pub async fn recompile(
        &self,
        source_dir: &Path,
        build_dir: &Path,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<PathBuf, PipelineError> {
        self.verify_preconditions(source_dir, build_dir)?;

        let started = filesystem_timestamp(build_dir)?;
        let spec = CommandSpec::new(&self.tool, self.timeout)
            .arg(source_dir.display().to_string())
            .current_dir(build_dir);

        info!(
            "Recompiling {} into an archive under {}",
            source_dir.display(),
            build_dir.display()
        );

        let output = match self.runner.run(spec, cancel.clone()).await {
            Ok(output) => output,
            Err(CommandError::Spawn { exe, source }) => {
                return Err(PipelineError::ToolMissing(format!(
                    "{}: {source}",
                    exe.display()
                )));
            }
            Err(CommandError::Timeout(t)) => {
                return Err(PipelineError::ToolFailed(format!(
                    "packer timed out after {t:?}"
                )));
            }
            Err(CommandError::Cancelled) => return Err(PipelineError::Cancelled),
        };

        if !output.success() {
            warn!("Packer stderr: {}", output.stderr.trim());
            return Err(PipelineError::ToolFailed(format!(
                "packer exited with {:?}: {}",
                output.exit_code,
                output.stderr.lines().next().unwrap_or("no diagnostics").trim()
            )));
        }
        debug!("Packer stdout: {}", output.stdout.trim());

        let archive = self
            .find_output(source_dir, build_dir, started)?
            .ok_or_else(|| PipelineError::ArtifactNotFound(build_dir.join("*.vpk")))?;

        self.wait_for_readable(&archive, &mut cancel).await?;
        info!("Recompiled archive ready: {}", archive.display());
        Ok(archive)
    }

    fn verify_preconditions(
        &self,
        source_dir: &Path,
        build_dir: &Path,
    ) -> Result<(), PipelineError> {
        if !self.tool.exists() {
            return Err(PipelineError::ToolMissing(format!(
                "packer not found at {}",
                self.tool.display()
            )));
        }

        // A bundled layout carries its own runtime libraries.
        if let Some(tool_dir) = self.tool.parent() {
            let present: Vec<&str> = PACKER_LIBS
                .iter()
                .copied()
                .filter(|lib| tool_dir.join(lib).exists())
                .collect();
            if present.len() == 1 {
                let missing: Vec<&str> = PACKER_LIBS
                    .iter()
                    .copied()
                    .filter(|lib| !present.contains(lib))
                    .collect();
                return Err(PipelineError::ToolMissing(format!(
                    "packer runtime library missing next to {}: {}",
                    self.tool.display(),
                    missing.join(", ")
                )));
            }
        }

        let non_empty = std::fs::read_dir(source_dir)
            .map(|mut d| d.next().is_some())
            .unwrap_or(false);
        if !non_empty {
            return Err(PipelineError::CorruptArtifact(format!(
                "source directory {} is missing or empty, nothing to pack",
                source_dir.display()
            )));
        }

        std::fs::create_dir_all(build_dir).map_err(|e| {
            PipelineError::ToolFailed(format!(
                "Cannot create build directory {}: {e}",
                build_dir.display()
            ))
        })?;

        Ok(())
    }

    /// Search candidate directories for an archive created during this run.
    ///
    /// Checked in priority order: the build directory, next to the source
    /// directory, and the source directory itself. Stale leftovers are
    /// excluded by creation time (modification time where the filesystem
    /// does not record creation).
    fn find_output(
        &self,
        source_dir: &Path,
        build_dir: &Path,
        started: SystemTime,
    ) -> Result<Option<PathBuf>, PipelineError> {
        let mut candidates: Vec<PathBuf> = vec![build_dir.to_path_buf()];
        if let Some(parent) = source_dir.parent() {
            candidates.push(parent.to_path_buf());
        }
        candidates.push(source_dir.to_path_buf());

        for dir in candidates {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };

            let mut newest: Option<(SystemTime, PathBuf)> = None;
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("vpk") {
                    continue;
                }
                let Ok(meta) = entry.metadata() else { continue };
                let stamp = meta.created().or_else(|_| meta.modified()).map_err(|e| {
                    PipelineError::ToolFailed(format!("Cannot stat {}: {e}", path.display()))
                })?;
                if stamp < started {
                    debug!("Ignoring stale archive {}", path.display());
                    continue;
                }
                if newest.as_ref().map(|(t, _)| stamp > *t).unwrap_or(true) {
                    newest = Some((stamp, path));
                }
            }

            if let Some((_, path)) = newest {
                return Ok(Some(path));
            }
        }

        Ok(None)
    }

    /// Poll until the archive can be opened for read and its size has
    /// settled. Fixed inter-poll delay, bounded attempts, cancellable at
    /// every boundary.
    async fn wait_for_readable(
        &self,
        path: &Path,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        let mut last_size: Option<u64> = None;

        for _ in 0..READ_POLL_ATTEMPTS {
            if *cancel.borrow() {
                return Err(PipelineError::Cancelled);
            }

            if let Ok(meta) = std::fs::metadata(path) {
                let size = meta.len();
                if size > 0 && last_size == Some(size) && std::fs::File::open(path).is_ok() {
                    return Ok(());
                }
                last_size = Some(size);
            }

            tokio::time::sleep(self.poll_delay).await;
        }

        Err(PipelineError::ToolFailed(format!(
            "archive {} never became readable",
            path.display()
        )))
    }
}

/// Creation-time baseline read from a file stamp in the build directory.
/// File timestamps come from a coarser kernel clock than `SystemTime::now()`
/// and can trail it by a tick; an archive written at run start must still
/// compare as fresh.
fn filesystem_timestamp(build_dir: &Path) -> Result<SystemTime, PipelineError> {
    let stamp_file = build_dir.join(".pack-start");
    std::fs::write(&stamp_file, b"").map_err(|e| {
        PipelineError::ToolFailed(format!(
            "Cannot write to build directory {}: {e}",
            build_dir.display()
        ))
    })?;

    let meta = std::fs::metadata(&stamp_file)
        .map_err(|e| PipelineError::ToolFailed(format!("Cannot stat {}: {e}", stamp_file.display())))?;
    let stamp = meta
        .created()
        .or_else(|_| meta.modified())
        .map_err(|e| PipelineError::ToolFailed(format!("Cannot stat {}: {e}", stamp_file.display())))?;

    let _ = std::fs::remove_file(&stamp_file);
    Ok(stamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{no_cancel, CommandOutput};

    struct MockRunner<F>(F);

    impl<F> CommandRunner for MockRunner<F>
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput, CommandError> + Send + Sync,
    {
        async fn run(
            &self,
            spec: CommandSpec,
            _cancel: watch::Receiver<bool>,
        ) -> Result<CommandOutput, CommandError> {
            (self.0)(&spec)
        }
    }

    fn ok_output() -> CommandOutput {
        CommandOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// A tool path that exists on disk, as preconditions require.
    fn fake_tool(dir: &Path) -> PathBuf {
        let tool = dir.join("vpk");
        std::fs::write(&tool, b"#!/bin/sh\n").unwrap();
        tool
    }

    fn populated_source(dir: &Path) -> PathBuf {
        let src = dir.join("staging");
        std::fs::create_dir_all(src.join("scripts/items")).unwrap();
        std::fs::write(src.join("scripts/items/items_game.txt"), "{}").unwrap();
        src
    }

    #[tokio::test]
    async fn produces_archive_from_build_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = fake_tool(tmp.path());
        let source = populated_source(tmp.path());
        let build = tmp.path().join("build");

        let runner = MockRunner(|spec: &CommandSpec| {
            let cwd = spec.cwd.as_ref().unwrap();
            std::fs::write(cwd.join("pak01_dir.vpk"), vec![1u8; 128]).unwrap();
            Ok(ok_output())
        });

        let recompiler = Recompiler::new(runner, tool).with_poll_delay(Duration::from_millis(10));
        let archive = recompiler
            .recompile(&source, &build, no_cancel())
            .await
            .unwrap();
        assert_eq!(archive, build.join("pak01_dir.vpk"));
    }

    #[tokio::test]
    async fn archive_written_at_run_start_is_not_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = fake_tool(tmp.path());
        let source = populated_source(tmp.path());

        let runner = MockRunner(|spec: &CommandSpec| {
            let cwd = spec.cwd.as_ref().unwrap();
            std::fs::write(cwd.join("pak01_dir.vpk"), vec![1u8; 128]).unwrap();
            Ok(ok_output())
        });
        let recompiler =
            Recompiler::new(runner, tool).with_poll_delay(Duration::from_millis(10));

        // The mock packer writes its output within the same kernel clock
        // tick as the baseline; repeated runs keep the window covered.
        for i in 0..25 {
            let build = tmp.path().join(format!("build-{i}"));
            let archive = recompiler
                .recompile(&source, &build, no_cancel())
                .await
                .unwrap();
            assert_eq!(archive, build.join("pak01_dir.vpk"));
        }
    }

    #[tokio::test]
    async fn stale_archives_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = fake_tool(tmp.path());
        let source = populated_source(tmp.path());
        let build = tmp.path().join("build");
        std::fs::create_dir_all(&build).unwrap();

        // A leftover from an earlier run, created before this run starts.
        std::fs::write(build.join("stale.vpk"), vec![0u8; 64]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let runner = MockRunner(|spec: &CommandSpec| {
            let cwd = spec.cwd.as_ref().unwrap();
            std::fs::write(cwd.join("fresh.vpk"), vec![1u8; 128]).unwrap();
            Ok(ok_output())
        });

        let recompiler =
            Recompiler::new(runner, tool).with_poll_delay(Duration::from_millis(10));
        let archive = recompiler
            .recompile(&source, &build, no_cancel())
            .await
            .unwrap();
        assert_eq!(archive.file_name().unwrap(), "fresh.vpk");
    }

    #[tokio::test]
    async fn archive_next_to_source_is_found() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = fake_tool(tmp.path());
        let source = populated_source(tmp.path());
        let build = tmp.path().join("build");

        let source_clone = source.clone();
        let runner = MockRunner(move |_spec: &CommandSpec| {
            // Some packer versions write next to the input directory.
            let parent = source_clone.parent().unwrap();
            std::fs::write(parent.join("staging.vpk"), vec![1u8; 128]).unwrap();
            Ok(ok_output())
        });

        let recompiler =
            Recompiler::new(runner, tool).with_poll_delay(Duration::from_millis(10));
        let archive = recompiler
            .recompile(&source, &build, no_cancel())
            .await
            .unwrap();
        assert_eq!(archive.file_name().unwrap(), "staging.vpk");
    }

    #[tokio::test]
    async fn missing_tool_fails_precondition() {
        let tmp = tempfile::tempdir().unwrap();
        let source = populated_source(tmp.path());

        let runner = MockRunner(|_spec: &CommandSpec| Ok(ok_output()));
        let recompiler = Recompiler::new(runner, tmp.path().join("no-such-vpk"));

        let err = recompiler
            .recompile(&source, &tmp.path().join("build"), no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ToolMissing(_)));
    }

    #[tokio::test]
    async fn half_present_runtime_libs_fail_precondition() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = fake_tool(tmp.path());
        std::fs::write(tmp.path().join("libtier0_s.so"), b"").unwrap();
        let source = populated_source(tmp.path());

        let runner = MockRunner(|_spec: &CommandSpec| Ok(ok_output()));
        let recompiler = Recompiler::new(runner, tool);

        let err = recompiler
            .recompile(&source, &tmp.path().join("build"), no_cancel())
            .await
            .unwrap_err();
        match err {
            PipelineError::ToolMissing(msg) => assert!(msg.contains("libvstdlib_s.so")),
            other => panic!("expected ToolMissing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_source_dir_fails_precondition() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = fake_tool(tmp.path());
        let empty = tmp.path().join("empty");
        std::fs::create_dir_all(&empty).unwrap();

        let runner = MockRunner(|_spec: &CommandSpec| Ok(ok_output()));
        let recompiler = Recompiler::new(runner, tool);

        let err = recompiler
            .recompile(&empty, &tmp.path().join("build"), no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::CorruptArtifact(_)));
    }

    #[tokio::test]
    async fn no_output_archive_is_artifact_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = fake_tool(tmp.path());
        let source = populated_source(tmp.path());

        // Exit 0 but write nothing.
        let runner = MockRunner(|_spec: &CommandSpec| Ok(ok_output()));
        let recompiler =
            Recompiler::new(runner, tool).with_poll_delay(Duration::from_millis(10));

        let err = recompiler
            .recompile(&source, &tmp.path().join("build"), no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ArtifactNotFound(_)));
    }

    #[tokio::test]
    async fn timeout_cancel_and_exit_code_are_distinct_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = fake_tool(tmp.path());
        let source = populated_source(tmp.path());

        let err = Recompiler::new(
            MockRunner(|_s: &CommandSpec| Err(CommandError::Timeout(Duration::from_secs(1)))),
            &tool,
        )
        .recompile(&source, &tmp.path().join("b1"), no_cancel())
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::ToolFailed(_)));
        assert!(err.to_string().contains("timed out"));

        let err = Recompiler::new(
            MockRunner(|_s: &CommandSpec| Err(CommandError::Cancelled)),
            &tool,
        )
        .recompile(&source, &tmp.path().join("b2"), no_cancel())
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));

        let err = Recompiler::new(
            MockRunner(|_s: &CommandSpec| {
                Ok(CommandOutput {
                    exit_code: Some(1),
                    stdout: String::new(),
                    stderr: "bad directory tree".into(),
                })
            }),
            &tool,
        )
        .recompile(&source, &tmp.path().join("b3"), no_cancel())
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::ToolFailed(_)));
        assert!(err.to_string().contains("bad directory tree"));
    }
}
