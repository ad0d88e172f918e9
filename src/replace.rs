//! Final installation of a rebuilt archive into the live game directory.
//!
//! The live location does not guarantee cross-device rename semantics, so the
//! source archive is never moved: it is copied into a staging file beside the
//! live archive, size-verified, and only then renamed into place. A failure
//! at any point leaves the previous live archive untouched and the rebuilt
//! archive still available for retry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::PipelineError;

/// Well-known live archive filename inside the target installation.
pub const LIVE_ARCHIVE: &str = "pak01_dir.vpk";

const READY_POLL_ATTEMPTS: u32 = 20;
const READY_POLL_DELAY: Duration = Duration::from_millis(500);

pub struct Replacer {
    poll_attempts: u32,
    poll_delay: Duration,
}

impl Default for Replacer {
    fn default() -> Self {
        Self {
            poll_attempts: READY_POLL_ATTEMPTS,
            poll_delay: READY_POLL_DELAY,
        }
    }
}

impl Replacer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_polling(mut self, attempts: u32, delay: Duration) -> Self {
        self.poll_attempts = attempts;
        self.poll_delay = delay;
        self
    }

    /// Install `new_archive` as the live archive inside `target_dir`.
    pub async fn replace(
        &self,
        target_dir: &Path,
        new_archive: &Path,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        let source_size = self.wait_until_readable(new_archive, &mut cancel).await?;

        let live = target_dir.join(LIVE_ARCHIVE);
        let staging = staging_path(&live);

        let result = install(new_archive, source_size, &live, &staging);
        if result.is_err() {
            let _ = std::fs::remove_file(&staging);
        }
        result?;

        info!(
            "Installed {} over {}",
            new_archive.display(),
            live.display()
        );
        Ok(())
    }

    /// Bounded poll until the source archive is fully readable: it opens,
    /// has a non-zero size, and the size holds steady across two polls.
    async fn wait_until_readable(
        &self,
        path: &Path,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<u64, PipelineError> {
        let mut last_size: Option<u64> = None;

        for _ in 0..self.poll_attempts {
            if *cancel.borrow() {
                return Err(PipelineError::Cancelled);
            }

            if let Ok(meta) = std::fs::metadata(path) {
                let size = meta.len();
                if size > 0 && last_size == Some(size) && std::fs::File::open(path).is_ok() {
                    return Ok(size);
                }
                last_size = Some(size);
            } else {
                last_size = None;
            }

            tokio::time::sleep(self.poll_delay).await;
        }

        Err(PipelineError::ReplaceFailed(format!(
            "new archive {} never became readable",
            path.display()
        )))
    }
}

fn staging_path(live: &Path) -> PathBuf {
    let mut name = live.file_name().unwrap_or_default().to_os_string();
    name.push(".staging");
    live.with_file_name(name)
}

/// Copy into staging, verify the byte count, then swap over the live file.
/// The source is read, never moved.
fn install(
    source: &Path,
    expected_size: u64,
    live: &Path,
    staging: &Path,
) -> Result<(), PipelineError> {
    let copied = std::fs::copy(source, staging).map_err(|e| {
        PipelineError::ReplaceFailed(format!("copy to {} failed: {e}", staging.display()))
    })?;

    if copied != expected_size {
        return Err(PipelineError::ReplaceFailed(format!(
            "short copy: wrote {copied} of {expected_size} bytes"
        )));
    }

    std::fs::rename(staging, live).map_err(|e| {
        PipelineError::ReplaceFailed(format!("swap into {} failed: {e}", live.display()))
    })?;

    debug!("Live archive replaced ({} bytes)", copied);
    Ok(())
}
