//! Sharded in-memory point cache for PUSH evaluation
//!
//! Each series keeps a window of recent `(time, value)` points, newest at
//! the front. Series are spread over 256 shards by the first two hex digits
//! of their fingerprint; every shard has its own reader/writer lock.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::models::HistoryPoint;
use crate::observability::JudgeMetrics;

/// One shard per two-hex-digit fingerprint prefix
pub const SHARD_COUNT: usize = 256;

/// Series whose newest point is older than this are swept (two days)
pub const DEFAULT_STALE_GRACE_SECS: i64 = 2 * 24 * 3600;

/// Ring buffer of one series, strictly decreasing in time front to back
#[derive(Debug, Default, Clone)]
pub struct SeriesWindow {
    points: VecDeque<HistoryPoint>,
}

impl SeriesWindow {
    /// Prepend a point and evict entries older than `maintain` seconds.
    ///
    /// Returns false when the point is not newer than the front.
    pub fn insert(&mut self, time: i64, value: f64, maintain: i64) -> bool {
        if let Some(front) = self.points.front() {
            if time <= front.timestamp {
                return false;
            }
        }
        self.points.push_front(HistoryPoint::new(time, value));

        let oldest_kept = time - maintain.max(0);
        while let Some(back) = self.points.back() {
            if back.timestamp < oldest_kept {
                self.points.pop_back();
            } else {
                break;
            }
        }
        true
    }

    /// Contiguous newest-first prefix with `timestamp >= since`
    pub fn since(&self, since: i64) -> Vec<HistoryPoint> {
        self.points
            .iter()
            .take_while(|p| p.timestamp >= since)
            .copied()
            .collect()
    }

    pub fn front_time(&self) -> Option<i64> {
        self.points.front().map(|p| p.timestamp)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryPoint> {
        self.points.iter()
    }
}

type Shard = RwLock<HashMap<String, SeriesWindow>>;

/// Recent points of every judged series, keyed by fingerprint.
///
/// Only points that matched at least one PUSH rule are cached.
pub struct PointCache {
    shards: Vec<Shard>,
}

impl Default for PointCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PointCache {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    /// Shard of a hex fingerprint; `None` if it does not start with two hex digits
    pub fn shard_index(fingerprint: &str) -> Option<usize> {
        let prefix = fingerprint.get(..2)?;
        u8::from_str_radix(prefix, 16).ok().map(usize::from)
    }

    /// Insert into the series window, keeping `maintain` seconds of history
    pub fn put(&self, fingerprint: &str, time: i64, value: f64, maintain: i64) -> bool {
        let Some(idx) = Self::shard_index(fingerprint) else {
            debug!(fingerprint = %fingerprint, "Fingerprint without shard prefix, point ignored");
            return false;
        };

        let mut shard = self.shards[idx].write();
        shard
            .entry(fingerprint.to_string())
            .or_default()
            .insert(time, value, maintain)
    }

    /// Newest-first window of the series with `timestamp >= since`
    pub fn history(&self, fingerprint: &str, since: i64) -> Vec<HistoryPoint> {
        let Some(idx) = Self::shard_index(fingerprint) else {
            return Vec::new();
        };
        self.shards[idx]
            .read()
            .get(fingerprint)
            .map(|w| w.since(since))
            .unwrap_or_default()
    }

    /// Number of cached points of a series; 0 when unknown
    pub fn window_len(&self, fingerprint: &str) -> usize {
        Self::shard_index(fingerprint)
            .and_then(|idx| self.shards[idx].read().get(fingerprint).map(SeriesWindow::len))
            .unwrap_or(0)
    }

    /// Copy of a whole window
    pub fn window(&self, fingerprint: &str) -> Option<SeriesWindow> {
        let idx = Self::shard_index(fingerprint)?;
        self.shards[idx].read().get(fingerprint).cloned()
    }

    /// Series currently held across all shards
    pub fn series_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Drop series whose newest point is older than `now - grace`
    pub fn clean_stale(&self, now: i64, grace: i64) -> usize {
        let cutoff = now - grace;
        let mut removed = 0;
        for shard in &self.shards {
            let mut guard = shard.write();
            let before = guard.len();
            guard.retain(|_, w| w.front_time().map(|t| t >= cutoff).unwrap_or(false));
            removed += before - guard.len();
        }
        removed
    }

    /// Periodic stale sweep until cancelled
    pub async fn run_sweeper(
        self: Arc<Self>,
        interval: Duration,
        grace: i64,
        metrics: JudgeMetrics,
        cancel: CancellationToken,
    ) {
        info!(
            interval_secs = interval.as_secs(),
            grace_secs = grace,
            "Starting point cache sweeper"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.clean_stale(chrono::Utc::now().timestamp(), grace);
                    let remaining = self.series_count();
                    metrics.set_cached_series(remaining);
                    if removed > 0 {
                        info!(removed = removed, remaining = remaining, "Swept stale series");
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Point cache sweeper stopped");
                    break;
                }
            }
        }
    }
}
