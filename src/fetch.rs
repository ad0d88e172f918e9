//! Resilient multi-source asset fetching with stall detection.
//!
//! A named asset lives at the same relative path on every mirror; the fetcher
//! walks the [`SourceRanker`](crate::sources::SourceRanker)'s ordered list,
//! streaming each attempt with two clocks running: an overall deadline
//! (minutes, the transfer as a whole) and a stall deadline (seconds, measured
//! from the last byte received). Transient request failures are retried with
//! exponential backoff against the same mirror; a stall, a blown deadline,
//! or an exhausted retry budget demotes the mirror and the next one is
//! tried. Only when the whole list is exhausted does the caller see an
//! error.
//!
//! Successful downloads are validated structurally and cached on disk keyed
//! by cache key; corrupt partials are deleted so a retry never silently
//! reuses bad data.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use indicatif::ProgressBar;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::runner::cancelled;
use crate::sources::SourceRanker;

/// Connection timeout: time to establish the TCP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum plausible payload size; anything smaller is a server error page
/// or a truncated write, not a content archive.
const MIN_PAYLOAD_BYTES: u64 = 64;

/// Timing knobs for a fetch. Defaults are production values; tests shrink
/// them to milliseconds.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Hard ceiling on one transfer attempt, start to finish.
    pub overall_deadline: Duration,
    /// Abort the attempt when no bytes arrive for this long.
    pub stall_deadline: Duration,
    /// Surface a warning (without aborting) once a stall lasts this long.
    pub stall_warning: Duration,
    /// How often the stall monitor wakes up.
    pub check_interval: Duration,
    /// Attempts against one source before demoting it and failing over.
    pub attempts_per_source: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_backoff: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            overall_deadline: Duration::from_secs(20 * 60),
            stall_deadline: Duration::from_secs(30),
            stall_warning: Duration::from_secs(10),
            check_interval: Duration::from_secs(1),
            attempts_per_source: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// A fetched asset: where it landed, how big it is, which mirror served it.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub path: PathBuf,
    pub size: u64,
    /// Base URL of the mirror that succeeded, or "cache" on a cache hit.
    pub provenance: String,
}

/// Called when a transfer has produced no bytes for longer than the warning
/// threshold, before the hard stall cutoff fires.
pub type StallWarningCallback = Arc<dyn Fn(Duration) + Send + Sync>;

/// Shared progress state between the read loop and the stall monitor.
struct TransferProgress {
    bytes: AtomicU64,
    last_progress: Mutex<Instant>,
    started: Instant,
}

impl TransferProgress {
    fn new() -> Self {
        Self {
            bytes: AtomicU64::new(0),
            last_progress: Mutex::new(Instant::now()),
            started: Instant::now(),
        }
    }

    fn add(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
        *self.last_progress.lock().unwrap() = Instant::now();
    }

    fn total(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn since_progress(&self) -> Duration {
        self.last_progress.lock().unwrap().elapsed()
    }

    fn bytes_per_sec(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.total() as f64 / elapsed
        } else {
            0.0
        }
    }
}

/// Multi-source fetcher over an injectable ranker.
pub struct Fetcher {
    client: reqwest::Client,
    ranker: Arc<SourceRanker>,
    cache_root: PathBuf,
    options: FetchOptions,
    stall_warning: Option<StallWarningCallback>,
}

impl Fetcher {
    pub fn new(ranker: Arc<SourceRanker>, cache_root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_options(ranker, cache_root, FetchOptions::default())
    }

    pub fn with_options(
        ranker: Arc<SourceRanker>,
        cache_root: impl Into<PathBuf>,
        options: FetchOptions,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pakforge/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            ranker,
            cache_root: cache_root.into(),
            options,
            stall_warning: None,
        })
    }

    /// Install a callback fired when a transfer stalls past the warning
    /// threshold, so a long-running UI can inform the user before failover.
    pub fn on_stall_warning(mut self, cb: StallWarningCallback) -> Self {
        self.stall_warning = Some(cb);
        self
    }

    /// Fetch `asset_path` from the best available mirror, or serve it from
    /// the on-disk cache.
    pub async fn fetch(
        &self,
        asset_path: &str,
        cache_key: &str,
    ) -> Result<FetchResult, PipelineError> {
        self.fetch_with_progress(asset_path, cache_key, None, crate::runner::no_cancel())
            .await
    }

    pub async fn fetch_with_progress(
        &self,
        asset_path: &str,
        cache_key: &str,
        progress_bar: Option<&ProgressBar>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<FetchResult, PipelineError> {
        let cached = self.cache_root.join(cache_key);
        if cached.exists() {
            match validate_payload(&cached) {
                Ok(size) => {
                    debug!("Cache hit for {}: {}", cache_key, cached.display());
                    return Ok(FetchResult {
                        path: cached,
                        size,
                        provenance: "cache".into(),
                    });
                }
                Err(e) => {
                    warn!("Cached artifact failed validation ({}), refetching", e);
                    let _ = std::fs::remove_file(&cached);
                }
            }
        }

        std::fs::create_dir_all(&self.cache_root).map_err(|e| {
            PipelineError::CacheUnavailable(format!(
                "cannot create cache directory {}: {}",
                self.cache_root.display(),
                e
            ))
        })?;

        let ranked = self.ranker.rank();
        if ranked.is_empty() {
            return Err(PipelineError::SourceExhausted {
                last_failure: "no content sources configured".into(),
            });
        }

        let partial = self.cache_root.join(format!("{cache_key}.part"));
        let mut last_failure = String::from("no attempts made");

        for base_url in ranked {
            if *cancel.borrow() {
                return Err(PipelineError::Cancelled);
            }

            let url = format!("{}/{}", base_url.trim_end_matches('/'), asset_path);
            info!("Fetching {} from {}", asset_path, base_url);

            let mut source_failure = String::from("no attempt made");
            let mut fetched: Option<(f64, u64)> = None;

            // Transient failures get a bounded retry against the same source
            // before it is demoted; a stall or a blown overall deadline has
            // already consumed its time budget and fails over immediately.
            for attempt in 1..=self.options.attempts_per_source.max(1) {
                if attempt > 1 {
                    let backoff = self.options.retry_backoff * 2u32.saturating_pow(attempt - 2);
                    debug!(
                        "Retrying {} in {:?} (attempt {}/{})",
                        base_url, backoff, attempt, self.options.attempts_per_source
                    );
                    tokio::select! {
                        biased;
                        _ = cancelled(&mut cancel) => return Err(PipelineError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }

                match self
                    .attempt(&url, &partial, progress_bar, cancel.clone())
                    .await
                {
                    Ok(speed) => match validate_payload(&partial) {
                        Ok(size) => {
                            fetched = Some((speed, size));
                            break;
                        }
                        Err(e) => {
                            warn!("Downloaded artifact from {} is corrupt: {}", base_url, e);
                            let _ = std::fs::remove_file(&partial);
                            source_failure = format!("corrupt artifact: {e}");
                        }
                    },
                    Err(AttemptError::Cancelled) => {
                        let _ = std::fs::remove_file(&partial);
                        return Err(PipelineError::Cancelled);
                    }
                    Err(e) => {
                        warn!("Source {} attempt {} failed: {}", base_url, attempt, e);
                        let _ = std::fs::remove_file(&partial);
                        source_failure = e.to_string();
                        if matches!(
                            e,
                            AttemptError::Stalled(_) | AttemptError::DeadlineExceeded(_)
                        ) {
                            break;
                        }
                    }
                }
            }

            if let Some((speed, size)) = fetched {
                std::fs::rename(&partial, &cached).map_err(|e| {
                    PipelineError::CacheUnavailable(format!("cannot move download into cache: {e}"))
                })?;
                self.ranker.report_speed(&base_url, speed);
                info!("Fetched {} ({} bytes) from {}", asset_path, size, base_url);
                return Ok(FetchResult {
                    path: cached,
                    size,
                    provenance: base_url,
                });
            }

            self.ranker.report_failure(&base_url);
            last_failure = format!("{base_url}: {source_failure}");
        }

        Err(PipelineError::SourceExhausted { last_failure })
    }

    /// One streaming attempt against one mirror. Returns average bytes/sec.
    async fn attempt(
        &self,
        url: &str,
        output: &Path,
        progress_bar: Option<&ProgressBar>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<f64, AttemptError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AttemptError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::Request(format!("HTTP {}", status.as_u16())));
        }

        if let Some(pb) = progress_bar {
            if let Some(len) = response.content_length() {
                pb.set_length(len);
            }
            pb.set_position(0);
        }

        let progress = Arc::new(TransferProgress::new());

        // One shared cancellation source: a detected stall flips it so the
        // read loop aborts, and read-loop completion flips it so the monitor
        // exits. The monitor is always awaited in the cleanup phase.
        let (abort_tx, abort_rx) = watch::channel(false);
        let abort_tx = Arc::new(abort_tx);

        let monitor = tokio::spawn(stall_monitor(
            progress.clone(),
            abort_rx.clone(),
            abort_tx.clone(),
            self.options.clone(),
            self.stall_warning.clone(),
        ));
        let mut abort_rx = abort_rx;

        let mut file = match tokio::fs::File::create(output).await {
            Ok(f) => f,
            Err(e) => {
                let _ = abort_tx.send(true);
                let _ = monitor.await;
                return Err(AttemptError::Io(e.to_string()));
            }
        };

        let mut stream = response.bytes_stream();
        let read_loop = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| AttemptError::Request(e.to_string()))?;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| AttemptError::Io(e.to_string()))?;
                let len = chunk.len() as u64;
                progress.add(len);
                if let Some(pb) = progress_bar {
                    pb.inc(len);
                }
            }
            file.flush().await.map_err(|e| AttemptError::Io(e.to_string()))?;
            Ok(())
        };
        tokio::pin!(read_loop);

        let result: Result<(), AttemptError> = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => Err(AttemptError::Cancelled),
            _ = cancelled(&mut abort_rx) => {
                Err(AttemptError::Stalled(self.options.stall_deadline))
            }
            res = tokio::time::timeout(self.options.overall_deadline, &mut read_loop) => {
                match res {
                    Ok(r) => r,
                    Err(_) => Err(AttemptError::DeadlineExceeded(self.options.overall_deadline)),
                }
            }
        };

        // Cleanup: stop and join the monitor even on success so no timer
        // outlives the attempt.
        let _ = abort_tx.send(true);
        let _ = monitor.await;

        result?;
        Ok(progress.bytes_per_sec())
    }
}

async fn stall_monitor(
    progress: Arc<TransferProgress>,
    mut abort_rx: watch::Receiver<bool>,
    abort_tx: Arc<watch::Sender<bool>>,
    options: FetchOptions,
    warning_cb: Option<StallWarningCallback>,
) {
    let mut warned = false;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(options.check_interval) => {
                let stalled_for = progress.since_progress();

                if stalled_for >= options.stall_deadline {
                    warn!(
                        "Transfer stalled: no data for {:.1}s, aborting attempt",
                        stalled_for.as_secs_f64()
                    );
                    let _ = abort_tx.send(true);
                    return;
                }

                if !warned && stalled_for >= options.stall_warning {
                    warn!(
                        "Transfer slow: no data for {:.1}s",
                        stalled_for.as_secs_f64()
                    );
                    if let Some(cb) = &warning_cb {
                        cb(stalled_for);
                    }
                    warned = true;
                }

                debug!("Transferred {} bytes", progress.total());
            }
            _ = abort_rx.changed() => return,
        }
    }
}

/// Per-attempt failure, internal to the fetcher.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("stalled: no data for {0:?}")]
    Stalled(Duration),

    #[error("transfer exceeded overall deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error("io error: {0}")]
    Io(String),

    #[error("cancelled")]
    Cancelled,
}

/// Structural sanity check: the payload is a non-trivial, openable ZIP
/// container with at least one entry.
pub fn validate_payload(path: &Path) -> Result<u64> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("Cannot stat {}", path.display()))?;
    if meta.len() < MIN_PAYLOAD_BYTES {
        bail!("payload is {} bytes, below minimum", meta.len());
    }

    let file = std::fs::File::open(path)
        .with_context(|| format!("Cannot open {}", path.display()))?;
    let archive = zip::ZipArchive::new(file).context("payload is not a readable container")?;
    if archive.is_empty() {
        bail!("payload container has no entries");
    }

    Ok(meta.len())
}

/// Remove every cached artifact under `cache_root`.
pub fn clear_cache(cache_root: &Path) -> Result<()> {
    if cache_root.exists() {
        std::fs::remove_dir_all(cache_root)
            .with_context(|| format!("Cannot clear cache at {}", cache_root.display()))?;
        info!("Cleared fetch cache at {}", cache_root.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    /// A small but valid ZIP payload, padded past the size floor.
    fn zip_payload() -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let opts = zip::write::SimpleFileOptions::default();
            writer.start_file("scripts/items/items_game.txt", opts).unwrap();
            writer
                .write_all("\"items_master\"\n{\n}\n".repeat(20).as_bytes())
                .unwrap();
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    fn test_options() -> FetchOptions {
        FetchOptions {
            overall_deadline: Duration::from_secs(10),
            stall_deadline: Duration::from_millis(400),
            stall_warning: Duration::from_millis(150),
            check_interval: Duration::from_millis(50),
            attempts_per_source: 2,
            retry_backoff: Duration::from_millis(20),
        }
    }

    /// Serve one HTTP response body on a fresh listener, then hold or close.
    async fn serve_once(body: Vec<u8>, truncate_at: Option<usize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            sock.write_all(header.as_bytes()).await.unwrap();
            match truncate_at {
                Some(n) => {
                    // Send a prefix then go silent: a stalled transfer.
                    sock.write_all(&body[..n]).await.unwrap();
                    sock.flush().await.unwrap();
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                None => {
                    sock.write_all(&body).await.unwrap();
                    sock.flush().await.unwrap();
                }
            }
        });

        format!("http://{addr}")
    }

    #[tokio::test]
    async fn fetches_from_first_healthy_source() {
        let payload = zip_payload();
        let base = serve_once(payload.clone(), None).await;

        let ranker = Arc::new(SourceRanker::new([base.clone()]));
        let tmp = tempfile::tempdir().unwrap();
        let fetcher =
            Fetcher::with_options(ranker, tmp.path().join("cache"), test_options()).unwrap();

        let result = fetcher.fetch("Assets/Original.zip", "original.zip").await.unwrap();
        assert_eq!(result.size, payload.len() as u64);
        assert_eq!(result.provenance, base);
        assert!(result.path.exists());
    }

    #[tokio::test]
    async fn stalled_source_fails_over_within_stall_window() {
        let payload = zip_payload();
        let stalling = serve_once(payload.clone(), Some(16)).await;
        let healthy = serve_once(payload.clone(), None).await;

        let ranker = Arc::new(SourceRanker::new([stalling.clone(), healthy.clone()]));
        let tmp = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::with_options(
            ranker.clone(),
            tmp.path().join("cache"),
            test_options(),
        )
        .unwrap();

        let started = Instant::now();
        let result = fetcher.fetch("Assets/Original.zip", "original.zip").await.unwrap();
        assert_eq!(result.provenance, healthy);
        // Failover happened on the stall clock, not the overall deadline.
        assert!(started.elapsed() < Duration::from_secs(5));
        // The stalled mirror was demoted below the healthy one.
        assert_eq!(ranker.rank()[0], healthy);
    }

    /// Drop the first connection before any response; serve the second.
    async fn serve_flaky(body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            drop(sock);

            let (mut sock, _) = listener.accept().await.unwrap();
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            sock.write_all(header.as_bytes()).await.unwrap();
            sock.write_all(&body).await.unwrap();
            sock.flush().await.unwrap();
        });

        format!("http://{addr}")
    }

    #[tokio::test]
    async fn transient_failure_is_retried_on_the_same_source() {
        let payload = zip_payload();
        let flaky = serve_flaky(payload.clone()).await;

        let ranker = Arc::new(SourceRanker::new([flaky.clone()]));
        let tmp = tempfile::tempdir().unwrap();
        let fetcher =
            Fetcher::with_options(ranker.clone(), tmp.path().join("cache"), test_options())
                .unwrap();

        let result = fetcher.fetch("Assets/Original.zip", "o.zip").await.unwrap();
        assert_eq!(result.provenance, flaky);
        assert_eq!(result.size, payload.len() as u64);
    }

    #[tokio::test]
    async fn unusable_cache_root_is_a_cache_failure() {
        let tmp = tempfile::tempdir().unwrap();
        // A file occupies the path where the cache directory must go.
        let cache = tmp.path().join("cache");
        std::fs::write(&cache, b"not a directory").unwrap();

        let ranker = Arc::new(SourceRanker::new(["http://127.0.0.1:1"]));
        let fetcher = Fetcher::with_options(ranker, cache, test_options()).unwrap();

        let err = fetcher.fetch("Assets/Original.zip", "o.zip").await.unwrap_err();
        assert_eq!(err.kind(), "CacheUnavailable");
    }

    #[tokio::test]
    async fn progress_bar_reflects_transfer_size() {
        let payload = zip_payload();
        let base = serve_once(payload.clone(), None).await;

        let ranker = Arc::new(SourceRanker::new([base]));
        let tmp = tempfile::tempdir().unwrap();
        let fetcher =
            Fetcher::with_options(ranker, tmp.path().join("cache"), test_options()).unwrap();

        let pb = ProgressBar::hidden();
        fetcher
            .fetch_with_progress(
                "Assets/Original.zip",
                "o.zip",
                Some(&pb),
                crate::runner::no_cancel(),
            )
            .await
            .unwrap();
        assert_eq!(pb.length(), Some(payload.len() as u64));
        assert_eq!(pb.position(), payload.len() as u64);
    }

    #[tokio::test]
    async fn exhausted_sources_surface_last_failure() {
        let ranker = Arc::new(SourceRanker::new(["http://127.0.0.1:1"]));
        let tmp = tempfile::tempdir().unwrap();
        let fetcher =
            Fetcher::with_options(ranker, tmp.path().join("cache"), test_options()).unwrap();

        let err = fetcher.fetch("Assets/Original.zip", "x.zip").await.unwrap_err();
        match err {
            PipelineError::SourceExhausted { last_failure } => {
                assert!(last_failure.contains("127.0.0.1:1"));
            }
            other => panic!("expected SourceExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn corrupt_payload_is_deleted_and_source_demoted() {
        let garbage = vec![0u8; 4096];
        let bad = serve_once(garbage, None).await;
        let good = serve_once(zip_payload(), None).await;

        let ranker = Arc::new(SourceRanker::new([bad.clone(), good.clone()]));
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path().join("cache");
        let fetcher =
            Fetcher::with_options(ranker, cache.clone(), test_options()).unwrap();

        let result = fetcher.fetch("Assets/Original.zip", "o.zip").await.unwrap();
        assert_eq!(result.provenance, good);
        assert!(!cache.join("o.zip.part").exists());
    }

    #[tokio::test]
    async fn cache_hit_skips_network() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path().join("cache");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("o.zip"), zip_payload()).unwrap();

        // No reachable source; the cache must satisfy the fetch.
        let ranker = Arc::new(SourceRanker::new(["http://127.0.0.1:1"]));
        let fetcher = Fetcher::with_options(ranker, cache, test_options()).unwrap();

        let result = fetcher.fetch("Assets/Original.zip", "o.zip").await.unwrap();
        assert_eq!(result.provenance, "cache");
    }

    #[tokio::test]
    async fn invalid_cached_artifact_is_refetched() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path().join("cache");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("o.zip"), b"tiny").unwrap();

        let good = serve_once(zip_payload(), None).await;
        let ranker = Arc::new(SourceRanker::new([good.clone()]));
        let fetcher = Fetcher::with_options(ranker, cache, test_options()).unwrap();

        let result = fetcher.fetch("Assets/Original.zip", "o.zip").await.unwrap();
        assert_eq!(result.provenance, good);
    }

    #[tokio::test]
    async fn stall_warning_fires_before_cutoff() {
        let payload = zip_payload();
        let stalling = serve_once(payload.clone(), Some(16)).await;
        let healthy = serve_once(payload, None).await;

        let warned = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let warned_clone = warned.clone();

        let ranker = Arc::new(SourceRanker::new([stalling, healthy]));
        let tmp = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::with_options(ranker, tmp.path().join("cache"), test_options())
            .unwrap()
            .on_stall_warning(Arc::new(move |_d| {
                warned_clone.store(true, Ordering::Relaxed);
            }));

        fetcher.fetch("Assets/Original.zip", "o.zip").await.unwrap();
        assert!(warned.load(Ordering::Relaxed));
    }

    #[test]
    fn clear_cache_removes_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path().join("cache");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("a"), b"x").unwrap();
        clear_cache(&cache).unwrap();
        assert!(!cache.exists());
    }
}
