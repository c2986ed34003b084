//! Loading and listing config files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::errors::GenerateError;
use crate::naming::ConfigId;

/// Reads `<dir>/<id>.json` files, applying defaults and validation.
#[derive(Debug)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    /// Create a store over the given config directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { dir: dir.into() })
    }

    /// The directory this store reads from.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the config file for `id`.
    #[must_use]
    pub fn path_for(&self, id: &ConfigId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Load, parse, default, and validate the config for `id`.
    ///
    /// # Errors
    ///
    /// `ConfigNotFound` when the file does not exist; `ConfigInvalid` when
    /// it cannot be read, parsed, or validated.
    pub async fn load(&self, id: &ConfigId) -> Result<Config, GenerateError> {
        let path = self.path_for(id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GenerateError::ConfigNotFound { id: id.to_string() });
            }
            Err(e) => {
                return Err(GenerateError::ConfigInvalid {
                    id: id.to_string(),
                    reason: format!("failed to read {}: {e}", path.display()),
                });
            }
        };

        let config: Config =
            serde_json::from_str(&raw).map_err(|e| GenerateError::ConfigInvalid {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        config.validate().map_err(|reason| GenerateError::ConfigInvalid {
            id: id.to_string(),
            reason,
        })?;

        Ok(config)
    }

    /// List the ids of all config files in the directory, sorted.
    ///
    /// Files whose stem is not a valid id are skipped with a warning; a
    /// missing directory yields the empty list.
    pub async fn list(&self) -> Vec<ConfigId> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to list config directory");
                return ids;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match ConfigId::new(stem) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "Skipping config with invalid name");
                }
            }
        }

        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }
}
