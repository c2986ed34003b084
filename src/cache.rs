//! Two-tier (memory + disk) artifact cache.
//!
//! Disk layout per config: `<key>.<ext>` (raw image bytes) and
//! `<key>.meta.json`. Both are written to `.tmp` siblings first and then
//! renamed into place; the in-memory entry is published only after both
//! renames succeed, so memory never refers to a pair the disk does not
//! hold. Renames are atomic within a directory on POSIX, which makes the
//! pair crash-consistent: after a crash a reader sees either the old pair
//! or the new pair, and `ensure_dir` sweeps any leftover `.tmp` files.
//!
//! The memory map's mutex is held only to publish or snapshot; all disk
//! I/O happens outside the lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum;
use crate::clock::Clock;
use crate::config::ImageType;
use crate::errors::GenerateError;
use crate::history::{HistoryEntry, HistoryLedger, Trigger};
use crate::naming::ConfigId;

/// Sidecar metadata stored next to each cached image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    /// The config id this artifact belongs to.
    pub id: String,
    /// MIME type of the bytes.
    pub content_type: String,
    /// Output codec.
    pub image_type: ImageType,
    /// Size of the image file in bytes.
    pub size: u64,
    /// CRC32 of the image file, 8 lowercase hex chars.
    pub crc32: String,
    /// When the artifact was generated (UTC).
    pub generated_at: DateTime<Utc>,
    /// Path of the image file relative to the cache directory.
    pub cache_path: String,
}

/// A cached image with its metadata. Bytes are shared, not copied, when
/// handed to concurrent readers.
#[derive(Debug, Clone)]
pub struct CachedArtifact {
    /// The encoded image.
    pub bytes: Arc<Vec<u8>>,
    /// The sidecar metadata.
    pub metadata: CacheMetadata,
}

/// Provenance options for a cache write.
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// What caused the generation.
    pub trigger: Trigger,
    /// End-to-end generation time in milliseconds, when measured.
    pub generation_duration: Option<u64>,
}

/// When a write's history append runs relative to the commit.
///
/// Either way the append happens strictly after the memory publish; the
/// difference is only whether `write` waits for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryMode {
    /// Append on a background task. Right for the long-lived daemon,
    /// where the serving path must not block on history I/O.
    Detached,
    /// Await the append before returning. Required in one-shot processes
    /// (the worker child, the generate CLI): dropping the runtime at
    /// process exit cancels pending tasks, so a detached append would
    /// race exit and lose entries.
    Awaited,
}

/// Per-key line in a cache stats snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntryStats {
    /// Cache key.
    pub key: String,
    /// Image size in bytes.
    pub size: u64,
    /// Image checksum.
    pub crc32: String,
    /// Generation timestamp.
    pub generated_at: DateTime<Utc>,
}

/// Snapshot of the memory tier.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Number of entries held in memory.
    pub entries: usize,
    /// Sum of image sizes held in memory.
    pub total_bytes: u64,
    /// One line per entry.
    pub per_key: Vec<CacheEntryStats>,
}

/// The artifact store.
pub struct ImageCache {
    dir: PathBuf,
    memory: Mutex<HashMap<String, CachedArtifact>>,
    ledger: Arc<HistoryLedger>,
    clock: Arc<dyn Clock>,
    history_mode: HistoryMode,
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache").field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl ImageCache {
    /// Create a cache rooted at `dir` with detached history appends.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, ledger: Arc<HistoryLedger>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::with_history_mode(dir, ledger, clock, HistoryMode::Detached)
    }

    /// Create a cache rooted at `dir` with an explicit history mode.
    #[must_use]
    pub fn with_history_mode(
        dir: impl Into<PathBuf>,
        ledger: Arc<HistoryLedger>,
        clock: Arc<dyn Clock>,
        history_mode: HistoryMode,
    ) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.into(),
            memory: Mutex::new(HashMap::new()),
            ledger,
            clock,
            history_mode,
        })
    }

    /// The cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the cache directory if missing and sweep `*.tmp` remnants
    /// left behind by a crash mid-write.
    ///
    /// # Errors
    ///
    /// Returns an error only when the directory itself cannot be created;
    /// a failed tmp unlink is logged and skipped.
    pub async fn ensure_dir(&self) -> Result<(), GenerateError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| GenerateError::CacheWriteFailed {
                key: self.dir.display().to_string(),
                source: e.into(),
            })?;

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to scan cache directory for tmp files");
                return Ok(());
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        tracing::info!(path = %path.display(), "Removed stale tmp file");
                    }
                    Err(e) => {
                        let err = GenerateError::TempCleanupFailed { source: e.into() };
                        tracing::warn!(path = %path.display(), error = %err, "Tmp cleanup failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Read only the metadata, from disk. `None` on absence or parse
    /// failure.
    pub async fn read_meta(&self, id: &ConfigId) -> Option<CacheMetadata> {
        let path = self.meta_path(id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(id = %id, error = %e, "Failed to read cache metadata");
                }
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Cache metadata is corrupt");
                None
            }
        }
    }

    /// Read an artifact: memory first, then disk (populating memory).
    ///
    /// Concurrent readers may race to populate; last write wins, which is
    /// harmless because every populator read the same committed pair.
    pub async fn read(&self, id: &ConfigId) -> Option<CachedArtifact> {
        let key = id.cache_key();
        if let Some(artifact) = self.memory.lock().ok().and_then(|m| m.get(&key).cloned()) {
            tracing::debug!(id = %id, "Cache hit (memory)");
            return Some(artifact);
        }

        let metadata = self.read_meta(id).await?;
        let image_path = self.dir.join(&metadata.cache_path);
        let bytes = match tokio::fs::read(&image_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let err = GenerateError::CacheReadFailed {
                    key: key.clone(),
                    source: e.into(),
                };
                tracing::warn!(id = %id, error = %err, "Cache image unreadable, treating as miss");
                return None;
            }
        };

        let artifact = CachedArtifact {
            bytes: Arc::new(bytes),
            metadata,
        };
        if let Ok(mut memory) = self.memory.lock() {
            memory.insert(key, artifact.clone());
        }
        tracing::debug!(id = %id, "Cache hit (disk)");
        Some(artifact)
    }

    /// Commit a new artifact: temp files, two renames, memory publish,
    /// then the history append (detached or awaited per [`HistoryMode`]).
    /// Failure of either rename surfaces as `CacheWriteFailed` and
    /// nothing is published; an append failure never propagates.
    ///
    /// # Errors
    ///
    /// `CacheWriteFailed` when the temp files cannot be written or either
    /// rename fails.
    pub async fn write(
        &self,
        id: &ConfigId,
        bytes: Vec<u8>,
        content_type: &str,
        image_type: ImageType,
        options: WriteOptions,
    ) -> Result<CacheMetadata, GenerateError> {
        let key = id.cache_key();
        let crc = checksum::crc32_hex(&bytes);
        let generated_at = self.clock.now();
        let image_name = format!("{key}.{}", image_type.ext());
        let metadata = CacheMetadata {
            id: id.to_string(),
            content_type: content_type.to_owned(),
            image_type,
            size: bytes.len() as u64,
            crc32: crc.clone(),
            generated_at,
            cache_path: image_name.clone(),
        };

        let image_path = self.dir.join(&image_name);
        let meta_path = self.meta_path(id);
        let image_tmp = self.dir.join(format!("{image_name}.tmp"));
        let meta_tmp = self.dir.join(format!("{key}.meta.json.tmp"));

        let meta_json =
            serde_json::to_vec_pretty(&metadata).map_err(|e| GenerateError::CacheWriteFailed {
                key: key.clone(),
                source: e.into(),
            })?;

        let write_failed = |source: std::io::Error| GenerateError::CacheWriteFailed {
            key: key.clone(),
            source: source.into(),
        };
        tokio::fs::write(&image_tmp, &bytes).await.map_err(write_failed)?;
        tokio::fs::write(&meta_tmp, &meta_json).await.map_err(write_failed)?;

        // Both renames are attempted even if the first fails, so a
        // partial failure leaves at most one fresh half plus its tmp,
        // never a torn pair presented as current.
        let image_renamed = tokio::fs::rename(&image_tmp, &image_path).await;
        let meta_renamed = tokio::fs::rename(&meta_tmp, &meta_path).await;
        if let Err(e) = &image_renamed {
            tracing::error!(id = %id, error = %e, "Failed to commit image file");
        }
        if let Err(e) = &meta_renamed {
            tracing::error!(id = %id, error = %e, "Failed to commit metadata file");
        }
        if image_renamed.is_err() || meta_renamed.is_err() {
            return Err(GenerateError::CacheWriteFailed {
                key,
                source: anyhow::anyhow!("rename into place failed"),
            });
        }

        // Only now is the pair durable; publish to memory.
        let artifact = CachedArtifact {
            bytes: Arc::new(bytes),
            metadata: metadata.clone(),
        };
        if let Ok(mut memory) = self.memory.lock() {
            memory.insert(key.clone(), artifact);
        }

        self.remove_stale_variants(&key, image_type).await;

        tracing::info!(
            id = %id,
            crc32 = %crc,
            size = metadata.size,
            trigger = %options.trigger,
            "Cached new artifact"
        );

        // History lags the cache commit, never precedes it.
        let entry = HistoryEntry {
            crc32: crc,
            timestamp: generated_at,
            trigger: options.trigger,
            generation_duration: options.generation_duration,
            image_size: Some(metadata.size),
        };
        match self.history_mode {
            HistoryMode::Awaited => {
                self.ledger.append(id, entry).await;
            }
            HistoryMode::Detached => {
                let ledger = Arc::clone(&self.ledger);
                let ledger_id = id.clone();
                tokio::spawn(async move {
                    ledger.append(&ledger_id, entry).await;
                });
            }
        }

        Ok(metadata)
    }

    /// Drop an artifact: memory first, then both files. Missing files are
    /// not an error.
    pub async fn delete(&self, id: &ConfigId) {
        let key = id.cache_key();
        if let Ok(mut memory) = self.memory.lock() {
            memory.remove(&key);
        }

        let ext = self.read_meta(id).await.map(|m| m.image_type);
        let mut paths = vec![self.meta_path(id)];
        match ext {
            Some(image_type) => paths.push(self.dir.join(format!("{key}.{}", image_type.ext()))),
            None => {
                for image_type in [ImageType::Png, ImageType::Jpg, ImageType::Bmp] {
                    paths.push(self.dir.join(format!("{key}.{}", image_type.ext())));
                }
            }
        }
        for path in paths {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to delete cache file");
                }
            }
        }
        tracing::info!(id = %id, "Deleted cached artifact");
    }

    /// Snapshot the memory tier.
    pub fn stats(&self) -> CacheStats {
        let memory = match self.memory.lock() {
            Ok(memory) => memory,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut per_key: Vec<CacheEntryStats> = memory
            .iter()
            .map(|(key, artifact)| CacheEntryStats {
                key: key.clone(),
                size: artifact.metadata.size,
                crc32: artifact.metadata.crc32.clone(),
                generated_at: artifact.metadata.generated_at,
            })
            .collect();
        per_key.sort_by(|a, b| a.key.cmp(&b.key));
        CacheStats {
            entries: per_key.len(),
            total_bytes: per_key.iter().map(|e| e.size).sum(),
            per_key,
        }
    }

    fn meta_path(&self, id: &ConfigId) -> PathBuf {
        self.dir.join(format!("{}.meta.json", id.cache_key()))
    }

    /// After a codec change, `<key>.png` and `<key>.jpg` could both
    /// exist; remove any variant the metadata no longer points at.
    async fn remove_stale_variants(&self, key: &str, current: ImageType) {
        for image_type in [ImageType::Png, ImageType::Jpg, ImageType::Bmp] {
            if image_type == current {
                continue;
            }
            let path = self.dir.join(format!("{key}.{}", image_type.ext()));
            match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed stale image variant"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale variant"),
            }
        }
    }
}
