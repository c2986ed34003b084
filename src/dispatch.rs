//! Request-side contract for the HTTP layer.
//!
//! The dispatcher owns the read path: cache consultation, inline pipeline
//! runs with the right trigger and save flag, extension validation, and
//! history reads. It never touches the worker pool: inline runs execute
//! in-process so a request sees its own result directly.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::{CacheMetadata, ImageCache};
use crate::config::{Config, ConfigStore, ImageType};
use crate::errors::GenerateError;
use crate::history::{HistoryEntry, HistoryLedger, HistoryStats, MAX_ENTRIES, Trigger};
use crate::naming::ConfigId;
use crate::pipeline::{PipelineRunner, RunOptions};

/// How a response relates to the cache; becomes the `X-Cache` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from the cache.
    Hit,
    /// Generated inline after a cache miss, then cached.
    Miss,
    /// Config has no pre-generation; caching is off for it.
    Disabled,
    /// Cache deliberately bypassed.
    Bypass,
}

impl CacheStatus {
    /// Header value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Disabled => "DISABLED",
            Self::Bypass => "BYPASS",
        }
    }
}

/// An image ready to serve.
#[derive(Debug, Clone)]
pub struct ImageResponse {
    /// Encoded image bytes.
    pub bytes: Arc<Vec<u8>>,
    /// MIME type.
    pub content_type: String,
    /// CRC32 of the bytes.
    pub crc32: String,
    /// Cache relationship for the `X-Cache` header.
    pub cache_status: CacheStatus,
    /// Generation instant; present on cache hits for `X-Generated-At`.
    pub generated_at: Option<DateTime<Utc>>,
}

/// The history endpoint's body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryReport {
    /// The config id.
    pub id: String,
    /// Entries, newest first.
    pub history: Vec<HistoryEntry>,
    /// Aggregate statistics.
    pub stats: HistoryStats,
    /// The ledger's bound.
    pub max_entries: usize,
}

/// Read-side operations the HTTP handlers call.
pub struct Dispatcher {
    configs: Arc<ConfigStore>,
    cache: Arc<ImageCache>,
    ledger: Arc<HistoryLedger>,
    pipeline: Arc<dyn PipelineRunner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Wire up a dispatcher from its collaborators.
    #[must_use]
    pub fn new(
        configs: Arc<ConfigStore>,
        cache: Arc<ImageCache>,
        ledger: Arc<HistoryLedger>,
        pipeline: Arc<dyn PipelineRunner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            configs,
            cache,
            ledger,
            pipeline,
        })
    }

    /// Serve the image for `id`, preferring the cache for pre-generated
    /// configs.
    ///
    /// # Errors
    ///
    /// `InvalidName`, `ConfigNotFound` / `ConfigInvalid`, `ExtMismatch`,
    /// or any pipeline failure from an inline run.
    pub async fn get_image(&self, id: &str, ext: &str) -> Result<ImageResponse, GenerateError> {
        let (id, config) = self.load_checked(id, ext).await?;

        if config.is_schedulable() {
            if let Some(artifact) = self.cache.read(&id).await {
                return Ok(ImageResponse {
                    bytes: artifact.bytes,
                    content_type: artifact.metadata.content_type,
                    crc32: artifact.metadata.crc32,
                    cache_status: CacheStatus::Hit,
                    generated_at: Some(artifact.metadata.generated_at),
                });
            }
            tracing::info!(id = %id, "Cache miss, generating inline");
            let output = self
                .pipeline
                .run(
                    &id,
                    RunOptions {
                        trigger: Trigger::CacheMiss,
                        save_cache: true,
                    },
                )
                .await?;
            return Ok(ImageResponse {
                crc32: output.crc32,
                content_type: output.content_type,
                bytes: Arc::new(output.bytes),
                cache_status: CacheStatus::Miss,
                generated_at: None,
            });
        }

        let output = self
            .pipeline
            .run(
                &id,
                RunOptions {
                    trigger: Trigger::OnDemand,
                    save_cache: false,
                },
            )
            .await?;
        Ok(ImageResponse {
            crc32: output.crc32,
            content_type: output.content_type,
            bytes: Arc::new(output.bytes),
            cache_status: CacheStatus::Disabled,
            generated_at: None,
        })
    }

    /// Generate a fresh image, bypassing the cache for the read (the
    /// result is still committed so later reads see it).
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::get_image`].
    pub async fn get_fresh_image(&self, id: &str, ext: &str) -> Result<ImageResponse, GenerateError> {
        let (id, _config) = self.load_checked(id, ext).await?;
        let output = self
            .pipeline
            .run(
                &id,
                RunOptions {
                    trigger: Trigger::Fresh,
                    save_cache: true,
                },
            )
            .await?;
        Ok(ImageResponse {
            crc32: output.crc32,
            content_type: output.content_type,
            bytes: Arc::new(output.bytes),
            cache_status: CacheStatus::Bypass,
            generated_at: None,
        })
    }

    /// The current checksum for `id`: cached metadata when available,
    /// otherwise a caching generation run.
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::get_image`].
    pub async fn get_checksum(&self, id: &str, ext: &str) -> Result<String, GenerateError> {
        let (id, _config) = self.load_checked(id, ext).await?;
        if let Some(meta) = self.cache.read_meta(&id).await {
            return Ok(meta.crc32);
        }
        let output = self
            .pipeline
            .run(
                &id,
                RunOptions {
                    trigger: Trigger::Crc32Check,
                    save_cache: true,
                },
            )
            .await?;
        Ok(output.crc32)
    }

    /// The change history for `id`. `None` when the config exists but has
    /// never produced an entry.
    ///
    /// # Errors
    ///
    /// `InvalidName`, `ConfigNotFound`, or `ConfigInvalid`.
    pub async fn get_history(&self, id: &str) -> Result<Option<HistoryReport>, GenerateError> {
        let id = ConfigId::new(id)?;
        self.configs.load(&id).await?;

        let history = self.ledger.load(&id, None).await;
        if history.is_empty() {
            return Ok(None);
        }
        let stats = self.ledger.stats(&id).await;
        Ok(Some(HistoryReport {
            id: id.to_string(),
            history,
            stats,
            max_entries: MAX_ENTRIES,
        }))
    }

    /// Cached metadata for `id`, when an artifact exists.
    ///
    /// # Errors
    ///
    /// `InvalidName`, `ConfigNotFound`, or `ConfigInvalid`.
    pub async fn get_meta(&self, id: &str) -> Result<Option<CacheMetadata>, GenerateError> {
        let id = ConfigId::new(id)?;
        self.configs.load(&id).await?;
        Ok(self.cache.read_meta(&id).await)
    }

    /// Explicitly drop the cached artifact for `id`. The history file is
    /// kept.
    ///
    /// # Errors
    ///
    /// `InvalidName` only; deleting a never-cached config is a no-op.
    pub async fn delete_cache(&self, id: &str) -> Result<(), GenerateError> {
        let id = ConfigId::new(id)?;
        self.cache.delete(&id).await;
        Ok(())
    }

    /// Validate the id, load the config, and check the extension against
    /// its image type.
    async fn load_checked(&self, id: &str, ext: &str) -> Result<(ConfigId, Config), GenerateError> {
        let id = ConfigId::new(id)?;
        let config = self.configs.load(&id).await?;
        if ImageType::from_ext(ext) != Some(config.image_type) {
            return Err(GenerateError::ExtMismatch {
                id: id.to_string(),
                expected: config.image_type.ext().to_owned(),
                requested: ext.to_owned(),
            });
        }
        Ok((id, config))
    }
}
