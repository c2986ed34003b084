//! Cron-driven pre-generation.
//!
//! One timer task per schedulable config. A timer computes the next cron
//! occurrence, sleeps until it, and hands the run to the worker pool;
//! because it awaits the submission before computing the next tick, and
//! the pool is single-flight per config, handlers for one config never
//! overlap. The timer map reconciles against config-watch events, so
//! adding, editing, or deleting a config file takes effect within one
//! watch poll.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::cache::ImageCache;
use crate::clock::Clock;
use crate::config::{Config, ConfigEvent, ConfigStore};
use crate::cron;
use crate::errors::GenerateError;
use crate::history::{HistoryLedger, Trigger};
use crate::naming::ConfigId;
use crate::worker::JobRunner;

/// One scheduled config, as reported by [`Scheduler::status`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleStatus {
    /// The config id.
    pub id: String,
    /// Its cron expression.
    pub cron_expression: String,
    /// The next firing instant, if one exists.
    pub next_run: Option<DateTime<Utc>>,
}

struct ScheduledJob {
    cron: String,
    handle: JoinHandle<()>,
}

/// Owns the timer set and keeps it aligned with the config directory.
pub struct Scheduler {
    configs: Arc<ConfigStore>,
    cache: Arc<ImageCache>,
    ledger: Arc<HistoryLedger>,
    runner: Arc<dyn JobRunner>,
    clock: Arc<dyn Clock>,
    timers: Mutex<HashMap<String, ScheduledJob>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Wire up a scheduler from its collaborators.
    #[must_use]
    pub fn new(
        configs: Arc<ConfigStore>,
        cache: Arc<ImageCache>,
        ledger: Arc<HistoryLedger>,
        runner: Arc<dyn JobRunner>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            configs,
            cache,
            ledger,
            runner,
            clock,
            timers: Mutex::new(HashMap::new()),
        })
    }

    /// Prepare directories, schedule every cron-carrying config, and kick
    /// off one `boot` pre-generation per scheduled config.
    ///
    /// # Errors
    ///
    /// Fails when the cache or ledger directory cannot be created;
    /// individual config failures are logged and skipped.
    pub async fn init(self: &Arc<Self>) -> Result<(), GenerateError> {
        self.cache.ensure_dir().await?;
        self.ledger.init().await.map_err(|e| GenerateError::CacheWriteFailed {
            key: "history".to_owned(),
            source: e.into(),
        })?;

        for id in self.configs.list().await {
            let config = match self.configs.load(&id).await {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "Skipping config at startup");
                    continue;
                }
            };
            if let Some(cron_expr) = &config.pre_generate_interval {
                if let Err(e) = self.schedule(&id, cron_expr) {
                    tracing::warn!(id = %id, error = %e, "Failed to schedule config");
                    continue;
                }
                self.spawn_run(&id, Trigger::Boot);
            }
        }

        tracing::info!(scheduled = self.timers_len(), "Scheduler initialized");
        Ok(())
    }

    /// Consume config-watch events until the channel closes. Events are
    /// handled strictly one at a time.
    pub async fn watch(self: Arc<Self>, mut events: tokio::sync::mpsc::Receiver<ConfigEvent>) {
        while let Some(event) = events.recv().await {
            self.reconcile(event);
        }
        tracing::debug!("Config watch channel closed");
    }

    /// Apply one config change to the timer set.
    pub fn reconcile(self: &Arc<Self>, event: ConfigEvent) {
        match event {
            ConfigEvent::Added { id, config } => {
                if let Some(cron_expr) = &config.pre_generate_interval {
                    tracing::info!(id = %id, cron = %cron_expr, "Scheduling new config");
                    if let Err(e) = self.schedule(&id, cron_expr) {
                        tracing::warn!(id = %id, error = %e, "Failed to schedule new config");
                    }
                }
            }
            ConfigEvent::Removed { id } => {
                self.unschedule(&id);
            }
            ConfigEvent::Changed { id, previous, config } => {
                self.reconcile_change(&id, &previous, &config);
            }
        }
    }

    fn reconcile_change(self: &Arc<Self>, id: &ConfigId, previous: &Config, config: &Config) {
        let before = previous.pre_generate_interval.as_deref();
        let after = config.pre_generate_interval.as_deref();
        match (before, after) {
            (Some(_), None) => {
                tracing::info!(id = %id, "Pre-generation disabled by config change");
                self.unschedule(id);
            }
            (_, Some(cron_expr)) => {
                if before != after {
                    tracing::info!(id = %id, cron = %cron_expr, "Re-binding timer after config change");
                    if let Err(e) = self.schedule(id, cron_expr) {
                        tracing::warn!(id = %id, error = %e, "Failed to re-schedule config");
                        return;
                    }
                }
                // Any structural change to a scheduled config warrants a
                // regeneration so the cached artifact matches the file.
                self.spawn_run(id, Trigger::ConfigChange);
            }
            (None, None) => {}
        }
    }

    /// Bind (or re-bind) the timer for `id`.
    ///
    /// # Errors
    ///
    /// Returns the validation message for a malformed cron expression.
    pub fn schedule(self: &Arc<Self>, id: &ConfigId, cron_expr: &str) -> Result<(), String> {
        cron::validate(cron_expr)?;

        let task = Arc::clone(self);
        let task_id = id.clone();
        let task_cron = cron_expr.to_owned();
        let handle = tokio::spawn(async move {
            task.timer_loop(&task_id, &task_cron).await;
        });

        let mut timers = self.lock_timers();
        if let Some(replaced) = timers.insert(
            id.to_string(),
            ScheduledJob {
                cron: cron_expr.to_owned(),
                handle,
            },
        ) {
            replaced.handle.abort();
        }
        Ok(())
    }

    /// Cancel and remove the timer for `id`, if any.
    pub fn unschedule(&self, id: &ConfigId) {
        if let Some(job) = self.lock_timers().remove(id.as_str()) {
            job.handle.abort();
            tracing::info!(id = %id, "Unscheduled config");
        }
    }

    /// Cancel every timer.
    pub fn stop_all(&self) {
        let mut timers = self.lock_timers();
        for (id, job) in timers.drain() {
            job.handle.abort();
            tracing::debug!(id = %id, "Cancelled timer");
        }
        tracing::info!("All timers stopped");
    }

    /// Snapshot of the timer set, sorted by id.
    pub fn status(&self) -> Vec<ScheduleStatus> {
        let now = self.clock.now();
        let timers = self.lock_timers();
        let mut status: Vec<ScheduleStatus> = timers
            .iter()
            .map(|(id, job)| ScheduleStatus {
                id: id.clone(),
                cron_expression: job.cron.clone(),
                next_run: cron::next_occurrence(&job.cron, &now),
            })
            .collect();
        drop(timers);
        status.sort_by(|a, b| a.id.cmp(&b.id));
        status
    }

    fn timers_len(&self) -> usize {
        self.lock_timers().len()
    }

    fn lock_timers(&self) -> std::sync::MutexGuard<'_, HashMap<String, ScheduledJob>> {
        self.timers.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Fire-and-forget a pool run; failures are logged, the next cron
    /// tick retries naturally.
    fn spawn_run(&self, id: &ConfigId, trigger: Trigger) {
        let runner = Arc::clone(&self.runner);
        let id = id.clone();
        tokio::spawn(async move {
            match runner.submit(&id, trigger).await {
                Ok(outcome) => {
                    tracing::debug!(id = %id, crc32 = %outcome.crc32, trigger = %trigger, "Run complete");
                }
                Err(e) => {
                    tracing::warn!(id = %id, trigger = %trigger, error = %e, "Run failed");
                }
            }
        });
    }

    async fn timer_loop(self: Arc<Self>, id: &ConfigId, cron_expr: &str) {
        loop {
            let now = self.clock.now();
            let Some(next) = cron::next_occurrence(cron_expr, &now) else {
                tracing::warn!(id = %id, cron = %cron_expr, "Cron expression never fires, dropping timer");
                return;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            // Awaiting here (plus pool single-flight) keeps handlers for
            // one config from overlapping.
            match self.runner.submit(id, Trigger::Scheduled).await {
                Ok(outcome) => {
                    tracing::debug!(id = %id, crc32 = %outcome.crc32, "Scheduled run complete");
                }
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "Scheduled run failed");
                }
            }
        }
    }
}
