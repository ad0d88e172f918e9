//! Ranked content-source list for mirror selection.
//!
//! Sources are interchangeable mirrors of the same asset tree; the ranker
//! orders them by measured transfer speed and demotes mirrors that fail or
//! stall so later fetch attempts try healthier ones first. All state is
//! in-memory for the lifetime of the process; nothing is persisted across
//! restarts.

use std::sync::Mutex;
use tracing::debug;

/// One mirror base URL with its rolling measurements.
#[derive(Debug, Clone)]
pub struct ContentSource {
    pub base_url: String,
    /// Last measured throughput in bytes/sec; `None` until first success.
    pub measured_speed: Option<f64>,
    /// Failures recorded this session.
    pub failures: u32,
}

impl ContentSource {
    fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            measured_speed: None,
            failures: 0,
        }
    }
}

/// Explicitly constructed, injectable ranking service.
///
/// Mutations are simple demote/promote records guarded by a mutex; exact
/// ordering of concurrent reporters is not significant (last-write-wins).
pub struct SourceRanker {
    sources: Mutex<Vec<ContentSource>>,
}

impl SourceRanker {
    pub fn new<I, S>(base_urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sources: Mutex::new(base_urls.into_iter().map(ContentSource::new).collect()),
        }
    }

    /// Ordered base URLs, fastest measured first.
    ///
    /// Unmeasured sources take a neutral position: after every measured
    /// source but before any source that has only failed. Within a tier the
    /// original configuration order is kept. No fairness guarantee: a
    /// repeatedly-failing mirror sorts last and may never be retried once
    /// others succeed.
    pub fn rank(&self) -> Vec<String> {
        let sources = self.sources.lock().unwrap();
        let mut indexed: Vec<(usize, &ContentSource)> = sources.iter().enumerate().collect();

        indexed.sort_by(|(ai, a), (bi, b)| {
            tier(a)
                .cmp(&tier(b))
                .then_with(|| match (a.measured_speed, b.measured_speed) {
                    (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(std::cmp::Ordering::Equal),
                    _ => std::cmp::Ordering::Equal,
                })
                .then_with(|| a.failures.cmp(&b.failures))
                .then_with(|| ai.cmp(bi))
        });

        indexed
            .into_iter()
            .map(|(_, s)| s.base_url.clone())
            .collect()
    }

    /// Record a measured transfer speed (bytes/sec) for a source.
    pub fn report_speed(&self, base_url: &str, bytes_per_sec: f64) {
        let mut sources = self.sources.lock().unwrap();
        if let Some(s) = sources.iter_mut().find(|s| s.base_url == base_url) {
            debug!("Source {} measured at {:.0} B/s", base_url, bytes_per_sec);
            s.measured_speed = Some(bytes_per_sec);
        }
    }

    /// Demote a source for the remainder of the session.
    pub fn report_failure(&self, base_url: &str) {
        let mut sources = self.sources.lock().unwrap();
        if let Some(s) = sources.iter_mut().find(|s| s.base_url == base_url) {
            s.failures += 1;
            // A mirror that fails after succeeding loses its measurement so
            // it no longer outranks working mirrors.
            s.measured_speed = None;
            debug!("Source {} demoted ({} failures)", base_url, s.failures);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.lock().unwrap().is_empty()
    }
}

/// Sort tier: measured (0) < unmeasured (1) < failed-only (2).
fn tier(s: &ContentSource) -> u8 {
    match (s.measured_speed, s.failures) {
        (Some(_), _) => 0,
        (None, 0) => 1,
        (None, _) => 2,
    }
}
