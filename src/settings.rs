//! Directory resolution for the daemon and worker processes.
//!
//! Three directories drive the service: configs are read from
//! `CONFIG_DIR`, artifacts and history live in `CACHE_DIR`, and templates
//! are loaded from `TEMPLATES_DIR`. The worker child inherits the parent's
//! environment, so both processes resolve identical paths.

use std::path::PathBuf;

/// Resolved data directories.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding `<id>.json` config files.
    pub config_dir: PathBuf,
    /// Directory holding cached artifacts, metadata, and history files.
    pub cache_dir: PathBuf,
    /// Directory holding `<template>.html` files.
    pub templates_dir: PathBuf,
}

impl Settings {
    /// Resolve directories from the environment, falling back to
    /// `./config`, `./cache`, and `./templates`.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            config_dir: env_dir("CONFIG_DIR", "config"),
            cache_dir: env_dir("CACHE_DIR", "cache"),
            templates_dir: env_dir("TEMPLATES_DIR", "templates"),
        }
    }
}

fn env_dir(var: &str, default: &str) -> PathBuf {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map_or_else(|| PathBuf::from(default), PathBuf::from)
}
