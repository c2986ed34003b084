//! Shared fixtures for the integration suite.

#![allow(dead_code, reason = "not every test file uses every helper")]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tempfile::TempDir;

use calimg::cache::ImageCache;
use calimg::clock::{Clock, FixedClock};
use calimg::config::{ConfigStore, IcsSource};
use calimg::dispatch::Dispatcher;
use calimg::errors::GenerateError;
use calimg::fetch::{CalendarEvent, EventSource, EventWindow, ExtraDataFetcher, HttpFetcher};
use calimg::history::HistoryLedger;
use calimg::pipeline::{Pipeline, PipelineRunner};
use calimg::render::TemplateRenderer;

/// The pinned instant every fixture starts at.
pub fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 5, 12, 0, 0).unwrap()
}

/// An event source serving a fixed in-memory list.
#[derive(Debug, Default)]
pub struct StaticEvents {
    pub events: Vec<CalendarEvent>,
}

#[async_trait]
impl EventSource for StaticEvents {
    async fn events(
        &self,
        _sources: &[IcsSource],
        _window: EventWindow,
        _timezone: Tz,
    ) -> Result<Vec<CalendarEvent>, GenerateError> {
        Ok(self.events.clone())
    }
}

/// One deterministic event for fixtures that want a non-empty calendar.
pub fn sample_event() -> CalendarEvent {
    CalendarEvent {
        summary: "Standup".to_owned(),
        start: test_now(),
        end: None,
        all_day: false,
        location: None,
        description: None,
        source_name: Some("work".to_owned()),
    }
}

/// A fully wired stack over temp directories and a pinned clock.
pub struct TestEnv {
    pub config_dir: TempDir,
    pub cache_dir: TempDir,
    pub templates_dir: TempDir,
    pub clock: Arc<FixedClock>,
    pub configs: Arc<ConfigStore>,
    pub ledger: Arc<HistoryLedger>,
    pub cache: Arc<ImageCache>,
    pub pipeline: Arc<dyn PipelineRunner>,
    pub dispatcher: Arc<Dispatcher>,
}

impl TestEnv {
    /// Build the stack with the given config files and a default
    /// `week-view` template, serving `events` from a static source.
    pub async fn new(configs: &[(&str, &str)], events: Vec<CalendarEvent>) -> Self {
        let config_dir = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let templates_dir = TempDir::new().unwrap();

        for (name, body) in configs {
            tokio::fs::write(config_dir.path().join(name), body).await.unwrap();
        }
        tokio::fs::write(
            templates_dir.path().join("week-view.html"),
            "<html><body><h1>{{id}}</h1></body></html>",
        )
        .await
        .unwrap();

        let clock = Arc::new(FixedClock::new(test_now()));
        let clock_dyn: Arc<dyn Clock> = Arc::clone(&clock) as _;

        let store = ConfigStore::new(config_dir.path());
        let ledger = HistoryLedger::new(cache_dir.path(), Arc::clone(&clock_dyn));
        let cache = ImageCache::new(cache_dir.path(), Arc::clone(&ledger), Arc::clone(&clock_dyn));
        cache.ensure_dir().await.unwrap();

        let renderer = TemplateRenderer::new(templates_dir.path());
        let event_source: Arc<dyn EventSource> = Arc::new(StaticEvents { events });
        let extras: Arc<dyn ExtraDataFetcher> = HttpFetcher::new() as _;

        let pipeline: Arc<dyn PipelineRunner> = Pipeline::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            event_source,
            extras,
            renderer as _,
            Arc::clone(&clock_dyn),
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&ledger),
            Arc::clone(&pipeline),
        );

        Self {
            config_dir,
            cache_dir,
            templates_dir,
            clock,
            configs: store,
            ledger,
            cache,
            pipeline,
            dispatcher,
        }
    }
}

/// A schedulable PNG config body.
pub fn scheduled_config() -> &'static str {
    r#"{"template":"week-view","width":400,"height":300,"imageType":"png","preGenerateInterval":"*/5 * * * *"}"#
}

/// An on-demand (cache-disabled) PNG config body.
pub fn on_demand_config() -> &'static str {
    r#"{"template":"week-view","width":400,"height":300,"imageType":"png"}"#
}
