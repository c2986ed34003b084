//! Polling config-directory watcher.
//!
//! Kernel file notification is deliberately not used: a ~2 second re-list
//! of the directory comparing `(path, mtime, size)` behaves identically on
//! every platform and is trivial to test. Events are delivered over an
//! mpsc channel, so consumers process them one at a time in discovery
//! order; a `Changed` event fires only when the re-loaded config differs
//! structurally from the last one observed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{Config, ConfigStore};
use crate::naming::ConfigId;

/// A change observed in the config directory.
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    /// A config file appeared and passed validation.
    Added {
        /// The new config's id.
        id: ConfigId,
        /// The loaded config.
        config: Config,
    },
    /// A config file disappeared or became invalid.
    Removed {
        /// The removed config's id.
        id: ConfigId,
    },
    /// A config file changed and re-loaded to a structurally different
    /// config.
    Changed {
        /// The changed config's id.
        id: ConfigId,
        /// The config before the change.
        previous: Config,
        /// The config after the change.
        config: Config,
    },
}

/// Watcher tuning.
#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    /// Delay between directory scans.
    pub interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
        }
    }
}

/// `(mtime, size)` fingerprint used to detect file changes between scans.
type FileStamp = (Option<SystemTime>, u64);

/// Start watching the store's directory.
///
/// Returns the event receiver and the watcher task handle. The task exits
/// when the receiver is dropped.
pub fn spawn(
    store: Arc<ConfigStore>,
    options: WatchOptions,
) -> (mpsc::Receiver<ConfigEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(64);
    let handle = tokio::spawn(async move {
        watch_loop(&store, options, &tx).await;
    });
    (rx, handle)
}

async fn watch_loop(
    store: &ConfigStore,
    options: WatchOptions,
    tx: &mpsc::Sender<ConfigEvent>,
) {
    // Prime the baseline without emitting events: configs present at
    // startup are handled by Scheduler::init, not the watcher.
    let mut stamps = scan(store).await;
    let mut known: HashMap<String, (ConfigId, Config)> = HashMap::new();
    for key in stamps.keys() {
        if let Ok(id) = ConfigId::new(key) {
            if let Ok(config) = store.load(&id).await {
                known.insert(key.clone(), (id, config));
            }
        }
    }

    let mut ticker = tokio::time::interval(options.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick completes immediately

    loop {
        ticker.tick().await;
        let current = scan(store).await;

        // Removed files first, in stable order.
        let mut removed: Vec<String> = stamps
            .keys()
            .filter(|key| !current.contains_key(*key))
            .cloned()
            .collect();
        removed.sort();
        for key in removed {
            if let Some((id, _)) = known.remove(&key) {
                if !emit(tx, ConfigEvent::Removed { id }).await {
                    return;
                }
            }
        }

        // New and changed files, in stable order.
        let mut keys: Vec<&String> = current.keys().collect();
        keys.sort();
        for key in keys {
            let stamp = current[key];
            let previous_stamp = stamps.get(key).copied();
            if previous_stamp == Some(stamp) {
                continue;
            }

            let Ok(id) = ConfigId::new(key) else { continue };
            match store.load(&id).await {
                Ok(config) => match known.get(key) {
                    None => {
                        known.insert(key.clone(), (id.clone(), config.clone()));
                        if !emit(tx, ConfigEvent::Added { id, config }).await {
                            return;
                        }
                    }
                    Some((_, previous)) if *previous != config => {
                        let previous = previous.clone();
                        known.insert(key.clone(), (id.clone(), config.clone()));
                        if !emit(tx, ConfigEvent::Changed { id, previous, config }).await {
                            return;
                        }
                    }
                    Some(_) => {} // touched but structurally identical
                },
                Err(e) => {
                    // A file that no longer loads stops being a config.
                    tracing::warn!(id = %id, error = %e, "Config failed to load during watch");
                    if known.remove(key).is_some() {
                        if !emit(tx, ConfigEvent::Removed { id }).await {
                            return;
                        }
                    }
                }
            }
        }

        stamps = current;
    }
}

async fn emit(tx: &mpsc::Sender<ConfigEvent>, event: ConfigEvent) -> bool {
    tx.send(event).await.is_ok()
}

/// Fingerprint every `<id>.json` in the directory.
async fn scan(store: &ConfigStore) -> HashMap<String, FileStamp> {
    let mut stamps = HashMap::new();
    let mut entries = match tokio::fs::read_dir(store.dir()).await {
        Ok(entries) => entries,
        Err(_) => return stamps,
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if ConfigId::new(stem).is_err() {
            continue;
        }
        if let Ok(meta) = entry.metadata().await {
            stamps.insert(stem.to_owned(), (meta.modified().ok(), meta.len()));
        }
    }
    stamps
}
