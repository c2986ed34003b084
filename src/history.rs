//! Per-config change-history ledger.
//!
//! Every successful artifact write appends one entry to
//! `<key>.crc32-history.json`: the artifact's CRC32 plus provenance.
//! Entries are newest-first and capped at [`MAX_ENTRIES`]; the file is
//! rewritten whole on each append, serialized per config so concurrent
//! appends cannot lose entries. Appends are best-effort: a failure is
//! logged and swallowed, never propagated into the write path.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::naming::ConfigId;

/// Ledger length cap; the oldest entries are evicted past this.
pub const MAX_ENTRIES: usize = 500;

/// Provenance of a generation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Fired by a cron timer.
    Scheduled,
    /// Inline request for a config without pre-generation.
    OnDemand,
    /// Explicit cache-bypassing request.
    Fresh,
    /// Inline generation after a cache miss.
    CacheMiss,
    /// Pre-generation at daemon startup.
    Boot,
    /// Re-generation after a config file change.
    ConfigChange,
    /// Generation forced by a checksum request.
    Crc32Check,
    /// Provenance not recorded.
    #[default]
    Unknown,
}

impl Trigger {
    /// Stable string form, matching the on-disk representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::OnDemand => "on_demand",
            Self::Fresh => "fresh",
            Self::CacheMiss => "cache_miss",
            Self::Boot => "boot",
            Self::ConfigChange => "config_change",
            Self::Crc32Check => "crc32_check",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "on_demand" => Ok(Self::OnDemand),
            "fresh" => Ok(Self::Fresh),
            "cache_miss" => Ok(Self::CacheMiss),
            "boot" => Ok(Self::Boot),
            "config_change" => Ok(Self::ConfigChange),
            "crc32_check" => Ok(Self::Crc32Check),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown trigger '{other}'")),
        }
    }
}

/// One recorded generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// CRC32 of the produced bytes, 8 lowercase hex chars.
    pub crc32: String,
    /// When the artifact was generated.
    pub timestamp: DateTime<Utc>,
    /// What caused the run.
    #[serde(default)]
    pub trigger: Trigger,
    /// End-to-end generation time in milliseconds, when measured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_duration: Option<u64>,
    /// Artifact size in bytes, when recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_size: Option<u64>,
}

/// Min/max/average of recorded generation durations, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurationStats {
    /// Fastest recorded run.
    pub min: u64,
    /// Slowest recorded run.
    pub max: u64,
    /// Mean, rounded to the nearest millisecond.
    pub avg: u64,
}

/// A maximal run of consecutive entries sharing a CRC32.
///
/// `start` is the newest timestamp in the run and `end` the oldest; the
/// inversion relative to common usage is the historical on-disk
/// convention and consumers render "from end to start".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// The shared checksum.
    pub crc32: String,
    /// Newest timestamp in the run.
    pub start: DateTime<Utc>,
    /// Oldest timestamp in the run.
    pub end: DateTime<Utc>,
    /// Number of entries in the run.
    pub count: usize,
}

/// Aggregate statistics over a config's ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    /// Number of distinct CRC32 values.
    pub unique_crc32_values: usize,
    /// Count of adjacent entry pairs with differing CRC32.
    pub changes: usize,
    /// Changes whose newer side lies within the past hour.
    pub changes_in_past_hour: usize,
    /// Changes whose newer side lies within the past 24 hours.
    #[serde(rename = "changesInPast24Hours")]
    pub changes_in_past_24_hours: usize,
    /// Duration aggregate; `None` when no entry carries a duration.
    pub duration_stats: Option<DurationStats>,
    /// Run-length grouping of consecutive identical checksums.
    pub blocks: Vec<Block>,
}

/// Append-only (bounded) CRC32 history, one JSON file per config.
pub struct HistoryLedger {
    dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for HistoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryLedger").field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl HistoryLedger {
    /// Create a ledger rooted at `dir` (shared with the image cache).
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.into(),
            locks: DashMap::new(),
            clock,
        })
    }

    /// Create the ledger directory if missing.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the directory cannot be
    /// created.
    pub async fn init(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    fn path_for(&self, id: &ConfigId) -> PathBuf {
        self.dir.join(format!("{}.crc32-history.json", id.cache_key()))
    }

    fn lock_for(&self, id: &ConfigId) -> Arc<Mutex<()>> {
        Arc::clone(
            &self
                .locks
                .entry(id.cache_key())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Append an entry: read, prepend, trim to [`MAX_ENTRIES`], write.
    ///
    /// Best-effort by contract: failures are logged and dropped so the
    /// artifact write path never fails on history I/O.
    pub async fn append(&self, id: &ConfigId, entry: HistoryEntry) {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut entries = self.read_entries(id).await;
        entries.insert(0, entry);
        entries.truncate(MAX_ENTRIES);

        let path = self.path_for(id);
        let json = match serde_json::to_vec(&entries) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Failed to serialize history");
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&path, json).await {
            tracing::warn!(id = %id, path = %path.display(), error = %e, "Failed to write history");
        }
    }

    /// Load up to `limit` entries, newest first.
    pub async fn load(&self, id: &ConfigId, limit: Option<usize>) -> Vec<HistoryEntry> {
        let mut entries = self.read_entries(id).await;
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        entries
    }

    /// Delete the history file; missing files are not an error.
    pub async fn delete(&self, id: &ConfigId) {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        let path = self.path_for(id);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(id = %id, path = %path.display(), error = %e, "Failed to delete history");
            }
        }
    }

    /// Compute aggregate statistics over the full ledger.
    pub async fn stats(&self, id: &ConfigId) -> HistoryStats {
        let entries = self.read_entries(id).await;
        compute_stats(&entries, self.clock.now())
    }

    async fn read_entries(&self, id: &ConfigId) -> Vec<HistoryEntry> {
        let path = self.path_for(id);
        match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                tracing::warn!(id = %id, error = %e, "History file is corrupt, starting fresh");
                Vec::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Failed to read history");
                Vec::new()
            }
        }
    }
}

/// Stats over a newest-first entry list.
fn compute_stats(entries: &[HistoryEntry], now: DateTime<Utc>) -> HistoryStats {
    let mut unique: Vec<&str> = entries.iter().map(|e| e.crc32.as_str()).collect();
    unique.sort_unstable();
    unique.dedup();

    let hour_ago = now - Duration::hours(1);
    let day_ago = now - Duration::hours(24);
    let mut changes = 0;
    let mut changes_in_past_hour = 0;
    let mut changes_in_past_24_hours = 0;
    for pair in entries.windows(2) {
        if pair[0].crc32 != pair[1].crc32 {
            changes += 1;
            // A change is dated by its newer side.
            if pair[0].timestamp >= hour_ago {
                changes_in_past_hour += 1;
            }
            if pair[0].timestamp >= day_ago {
                changes_in_past_24_hours += 1;
            }
        }
    }

    let durations: Vec<u64> = entries.iter().filter_map(|e| e.generation_duration).collect();
    let duration_stats = if durations.is_empty() {
        None
    } else {
        let min = durations.iter().copied().min().unwrap_or(0);
        let max = durations.iter().copied().max().unwrap_or(0);
        let sum: u64 = durations.iter().sum();
        #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]
        let avg = (sum as f64 / durations.len() as f64).round() as u64;
        Some(DurationStats { min, max, avg })
    };

    let mut blocks: Vec<Block> = Vec::new();
    for entry in entries {
        match blocks.last_mut() {
            Some(block) if block.crc32 == entry.crc32 => {
                // Entries are newest-first, so each subsequent member of a
                // run pushes `end` (the oldest edge) further back.
                block.end = entry.timestamp;
                block.count += 1;
            }
            _ => blocks.push(Block {
                crc32: entry.crc32.clone(),
                start: entry.timestamp,
                end: entry.timestamp,
                count: 1,
            }),
        }
    }

    HistoryStats {
        unique_crc32_values: unique.len(),
        changes,
        changes_in_past_hour,
        changes_in_past_24_hours,
        duration_stats,
        blocks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(crc: &str, minutes_ago: i64, duration: Option<u64>) -> HistoryEntry {
        HistoryEntry {
            crc32: crc.to_owned(),
            timestamp: base_now() - Duration::minutes(minutes_ago),
            trigger: Trigger::Scheduled,
            generation_duration: duration,
            image_size: Some(1024),
        }
    }

    fn base_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn stats_counts_changes_and_uniques() {
        // Newest first: aa, aa, bb, aa
        let entries = vec![
            entry("aaaaaaaa", 0, None),
            entry("aaaaaaaa", 10, None),
            entry("bbbbbbbb", 20, None),
            entry("aaaaaaaa", 30, None),
        ];
        let stats = compute_stats(&entries, base_now());
        assert_eq!(stats.unique_crc32_values, 2);
        assert_eq!(stats.changes, 2);
    }

    #[test]
    fn stats_windows_changes_by_newer_timestamp() {
        let entries = vec![
            entry("aaaaaaaa", 0, None),
            entry("bbbbbbbb", 30, None),       // change at t-0 (within the hour)
            entry("cccccccc", 90, None),       // change at t-30 (within the hour)
            entry("dddddddd", 60 * 25, None),  // change at t-90 (outside the hour, inside 24h)
            entry("eeeeeeee", 60 * 26, None),  // change at t-25h (outside 24h)
        ];
        let stats = compute_stats(&entries, base_now());
        assert_eq!(stats.changes, 4);
        assert_eq!(stats.changes_in_past_hour, 2);
        assert_eq!(stats.changes_in_past_24_hours, 3);
    }

    #[test]
    fn stats_duration_aggregate() {
        let entries = vec![
            entry("aaaaaaaa", 0, Some(120)),
            entry("aaaaaaaa", 10, None),
            entry("aaaaaaaa", 20, Some(101)),
        ];
        let stats = compute_stats(&entries, base_now());
        let durations = stats.duration_stats.unwrap();
        assert_eq!(durations.min, 101);
        assert_eq!(durations.max, 120);
        assert_eq!(durations.avg, 111); // (120 + 101) / 2 = 110.5, rounded

        let stats = compute_stats(&[entry("aaaaaaaa", 0, None)], base_now());
        assert!(stats.duration_stats.is_none());
    }

    #[test]
    fn blocks_group_consecutive_runs() {
        let entries = vec![
            entry("aaaaaaaa", 0, None),
            entry("aaaaaaaa", 10, None),
            entry("bbbbbbbb", 20, None),
            entry("aaaaaaaa", 30, None),
        ];
        let stats = compute_stats(&entries, base_now());
        assert_eq!(stats.blocks.len(), 3);

        let first = &stats.blocks[0];
        assert_eq!(first.crc32, "aaaaaaaa");
        assert_eq!(first.count, 2);
        // start = newest edge of the run, end = oldest edge.
        assert_eq!(first.start, base_now());
        assert_eq!(first.end, base_now() - Duration::minutes(10));
    }

    #[tokio::test]
    async fn append_caps_at_max_entries() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = HistoryLedger::new(
            dir.path(),
            Arc::new(crate::clock::FixedClock::new(base_now())),
        );
        ledger.init().await.unwrap();
        let id = ConfigId::new("a").unwrap();

        for i in 0..(MAX_ENTRIES + 1) {
            #[allow(clippy::cast_possible_wrap)]
            ledger.append(&id, entry("aaaaaaaa", i as i64, None)).await;
        }

        let entries = ledger.load(&id, None).await;
        assert_eq!(entries.len(), MAX_ENTRIES);
        // The latest append (largest minutes_ago here) sits at index 0.
        assert_eq!(
            entries[0].timestamp,
            base_now() - Duration::minutes(MAX_ENTRIES as i64)
        );
    }

    #[tokio::test]
    async fn load_limit_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = HistoryLedger::new(
            dir.path(),
            Arc::new(crate::clock::FixedClock::new(base_now())),
        );
        ledger.init().await.unwrap();
        let id = ConfigId::new("a").unwrap();

        ledger.append(&id, entry("aaaaaaaa", 0, None)).await;
        ledger.append(&id, entry("bbbbbbbb", 0, None)).await;
        assert_eq!(ledger.load(&id, Some(1)).await.len(), 1);

        ledger.delete(&id).await;
        assert!(ledger.load(&id, None).await.is_empty());
        // Deleting again is fine.
        ledger.delete(&id).await;
    }

    #[tokio::test]
    async fn corrupt_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = HistoryLedger::new(
            dir.path(),
            Arc::new(crate::clock::FixedClock::new(base_now())),
        );
        ledger.init().await.unwrap();
        let id = ConfigId::new("a").unwrap();

        tokio::fs::write(dir.path().join("a.crc32-history.json"), "not json")
            .await
            .unwrap();
        assert!(ledger.load(&id, None).await.is_empty());

        // Appending over a corrupt file starts a fresh ledger.
        ledger.append(&id, entry("aaaaaaaa", 0, None)).await;
        assert_eq!(ledger.load(&id, None).await.len(), 1);
    }

    #[test]
    fn trigger_round_trips_snake_case() {
        for trigger in [
            Trigger::Scheduled,
            Trigger::OnDemand,
            Trigger::Fresh,
            Trigger::CacheMiss,
            Trigger::Boot,
            Trigger::ConfigChange,
            Trigger::Crc32Check,
            Trigger::Unknown,
        ] {
            let json = serde_json::to_string(&trigger).unwrap();
            assert_eq!(json, format!("\"{}\"", trigger.as_str()));
            let parsed: Trigger = trigger.as_str().parse().unwrap();
            assert_eq!(parsed, trigger);
        }
    }
}
