//! Error taxonomy for the generation pipeline and its surroundings.
//!
//! Every failure that can cross a component boundary is one of these
//! kinds. The HTTP layer maps kinds to status codes in one place
//! (`api::error`); components below it only classify.

use thiserror::Error;

use crate::naming::InvalidName;

/// Failure kinds for config loading, generation, caching, and dispatch.
#[derive(Debug, Error)]
pub enum GenerateError {
    /// The config identifier failed validation.
    #[error(transparent)]
    InvalidName(#[from] InvalidName),

    /// No config file exists for the identifier.
    #[error("Configuration {id} not found")]
    ConfigNotFound {
        /// The missing config id.
        id: String,
    },

    /// The config file exists but failed parsing or validation.
    #[error("Configuration {id} is invalid: {reason}")]
    ConfigInvalid {
        /// The offending config id.
        id: String,
        /// Parse or validation failure detail.
        reason: String,
    },

    /// The requested extension does not match the config's image type.
    #[error("Config {id} serves {expected} images, not {requested}")]
    ExtMismatch {
        /// The config id.
        id: String,
        /// The extension the config produces.
        expected: String,
        /// The extension the caller asked for.
        requested: String,
    },

    /// An upstream fetch (ICS feed or auxiliary JSON) failed.
    #[error("Fetch failed for {url}: {source}")]
    FetchFailed {
        /// The URL that failed.
        url: String,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// Template loading or rendering failed.
    #[error("Template '{template}' failed: {source}")]
    TemplateFailed {
        /// The template identifier.
        template: String,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// Rasterization or encoding failed.
    #[error("Rasterization failed: {source}")]
    RasterFailed {
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// Reading a cached artifact from disk failed. Callers treat this as
    /// a cache miss; it is never surfaced to clients.
    #[error("Cache read failed for {key}: {source}")]
    CacheReadFailed {
        /// The cache key.
        key: String,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// Committing an artifact to disk failed.
    #[error("Cache write failed for {key}: {source}")]
    CacheWriteFailed {
        /// The cache key.
        key: String,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// Appending a history entry failed. Best-effort; logged only.
    #[error("History append failed for {key}: {source}")]
    HistoryAppendFailed {
        /// The cache key.
        key: String,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// A worker child exited without producing a result.
    #[error("Worker for {id} crashed: {message}")]
    WorkerCrashed {
        /// The config id the worker was generating.
        id: String,
        /// Exit code, if the child exited at all.
        exit_code: Option<i32>,
        /// Whatever detail the parent could recover.
        message: String,
    },

    /// Removing stale `.tmp` files at startup failed. Logged only.
    #[error("Temp file cleanup failed: {source}")]
    TempCleanupFailed {
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },
}

impl GenerateError {
    /// Machine-readable kind, stable across releases; used in API error
    /// bodies and worker IPC headers.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidName(_) => "InvalidName",
            Self::ConfigNotFound { .. } => "ConfigNotFound",
            Self::ConfigInvalid { .. } => "ConfigInvalid",
            Self::ExtMismatch { .. } => "ExtMismatch",
            Self::FetchFailed { .. } => "FetchFailed",
            Self::TemplateFailed { .. } => "TemplateFailed",
            Self::RasterFailed { .. } => "RasterFailed",
            Self::CacheReadFailed { .. } => "CacheReadFailed",
            Self::CacheWriteFailed { .. } => "CacheWriteFailed",
            Self::HistoryAppendFailed { .. } => "HistoryAppendFailed",
            Self::WorkerCrashed { .. } => "WorkerCrashed",
            Self::TempCleanupFailed { .. } => "TempCleanupFailed",
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, GenerateError>;
