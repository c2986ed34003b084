//! The generation pipeline: config → events + extras → HTML → image.
//!
//! One run loads the config, fetches calendar events and auxiliary data
//! in parallel, renders and rasterizes, classifies the result against the
//! previously cached checksum, and (when asked) commits the artifact to
//! the cache. All collaborators are injected, so the same pipeline runs
//! inline in the daemon, inside a worker child, and against fakes in
//! tests.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::cache::{CacheMetadata, ImageCache, WriteOptions};
use crate::clock::Clock;
use crate::config::{Config, ConfigStore, ImageType};
use crate::errors::GenerateError;
use crate::fetch::{EventSource, EventWindow, ExtraDataFetcher};
use crate::history::Trigger;
use crate::naming::ConfigId;
use crate::render::{RasterOptions, RenderContext, Renderer};

/// Per-run options.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Provenance recorded with the artifact.
    pub trigger: Trigger,
    /// Whether to commit the result to the cache.
    pub save_cache: bool,
}

/// The product of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Encoded image bytes.
    pub bytes: Vec<u8>,
    /// MIME type of the bytes.
    pub content_type: String,
    /// Output codec.
    pub image_type: ImageType,
    /// CRC32 of the bytes, 8 lowercase hex chars.
    pub crc32: String,
    /// Whether the checksum differs from the previously cached artifact.
    pub changed: bool,
    /// End-to-end run time in milliseconds.
    pub duration_ms: u64,
    /// Number of events that went into the render.
    pub event_count: usize,
    /// When the run happened.
    pub generated_at: DateTime<Utc>,
    /// Cache metadata, present when the run committed to the cache.
    pub metadata: Option<CacheMetadata>,
}

/// Capability to execute a pipeline run; what the dispatcher and worker
/// child are handed at composition time.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    /// Execute one run for `id`.
    ///
    /// # Errors
    ///
    /// Any [`GenerateError`] from config loading through cache commit.
    async fn run(&self, id: &ConfigId, options: RunOptions) -> Result<PipelineOutput, GenerateError>;
}

/// The production pipeline.
pub struct Pipeline {
    configs: Arc<ConfigStore>,
    cache: Arc<ImageCache>,
    events: Arc<dyn EventSource>,
    extras: Arc<dyn ExtraDataFetcher>,
    renderer: Arc<dyn Renderer>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Wire up a pipeline from its collaborators.
    #[must_use]
    pub fn new(
        configs: Arc<ConfigStore>,
        cache: Arc<ImageCache>,
        events: Arc<dyn EventSource>,
        extras: Arc<dyn ExtraDataFetcher>,
        renderer: Arc<dyn Renderer>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            configs,
            cache,
            events,
            extras,
            renderer,
            clock,
        })
    }

    fn effective_timezone(config: &Config) -> Tz {
        config
            .timezone
            .as_deref()
            .and_then(|tz| tz.parse().ok())
            .unwrap_or(Tz::UTC)
    }
}

#[async_trait]
impl PipelineRunner for Pipeline {
    async fn run(&self, id: &ConfigId, options: RunOptions) -> Result<PipelineOutput, GenerateError> {
        let started = Instant::now();
        let config = self.configs.load(id).await?;
        let timezone = Self::effective_timezone(&config);
        let now = self.clock.now();
        let window = EventWindow::around(now, config.expand_recurring_from, config.expand_recurring_to);

        let events_fut = async {
            match &config.ics_url {
                Some(ics) => self.events.events(&ics.sources(), window, timezone).await,
                None => Ok(Vec::new()),
            }
        };
        let extras_fut = async {
            match &config.extra_data_url {
                Some(extra) => self
                    .extras
                    .extra(extra, &config.extra_data_headers, config.extra_data_cache_ttl)
                    .await
                    .map(Some),
                None => Ok(None),
            }
        };
        let (events, extra_data) = tokio::try_join!(events_fut, extras_fut)?;
        let event_count = events.len();

        let context = RenderContext {
            id: id.to_string(),
            events,
            extra_data,
            now,
            locale: config.locale.clone(),
            timezone: timezone.name().to_owned(),
            config: config.clone(),
        };
        let html = self.renderer.render_template(&config.template, &context).await?;
        let raster = self
            .renderer
            .rasterize(&html, &RasterOptions::from_config(&config))
            .await?;

        let crc = crate::checksum::crc32_hex(&raster.bytes);
        let previous_crc = self.cache.read_meta(id).await.map(|meta| meta.crc32);
        let changed = previous_crc.as_deref() != Some(crc.as_str());
        let duration_ms = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);

        tracing::info!(
            id = %id,
            template = %config.template,
            crc32 = %crc,
            previous_crc32 = previous_crc.as_deref().unwrap_or("-"),
            changed,
            duration_ms,
            image_size = raster.bytes.len(),
            event_count,
            trigger = %options.trigger,
            "Generated image"
        );

        let metadata = if options.save_cache {
            Some(
                self.cache
                    .write(
                        id,
                        raster.bytes.clone(),
                        &raster.content_type,
                        config.image_type,
                        WriteOptions {
                            trigger: options.trigger,
                            generation_duration: Some(duration_ms),
                        },
                    )
                    .await?,
            )
        } else {
            None
        };

        Ok(PipelineOutput {
            bytes: raster.bytes,
            content_type: raster.content_type,
            image_type: config.image_type,
            crc32: crc,
            changed,
            duration_ms,
            event_count,
            generated_at: now,
            metadata,
        })
    }
}
