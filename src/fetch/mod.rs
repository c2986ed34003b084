//! Upstream data: iCalendar feeds and auxiliary JSON.
//!
//! The pipeline depends only on the [`EventSource`] and
//! [`ExtraDataFetcher`] traits; [`HttpFetcher`] is the production
//! implementation on `reqwest`. Auxiliary JSON responses are cached in
//! memory per URL with a TTL so dashboards refreshing every few minutes
//! do not hammer slow upstreams.

pub mod ics;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::config::{ExtraDataSource, ExtraDataUrl, IcsSource};
use crate::errors::GenerateError;

/// One calendar event, recurrence already expanded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    /// Event title.
    pub summary: String,
    /// Start instant (UTC). For all-day events, midnight in the
    /// configured zone.
    pub start: DateTime<Utc>,
    /// End instant (UTC), when the event carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    /// Whether the event is a date (not a date-time) event.
    pub all_day: bool,
    /// Location, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Description, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Label of the source feed, for multi-calendar configs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
}

/// The absolute window events are expanded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventWindow {
    /// Inclusive lower bound.
    pub from: DateTime<Utc>,
    /// Inclusive upper bound.
    pub to: DateTime<Utc>,
}

impl EventWindow {
    /// Build a window around `now` from day offsets
    /// (`expandRecurringFrom` / `expandRecurringTo`).
    #[must_use]
    pub fn around(now: DateTime<Utc>, from_days: i32, to_days: i32) -> Self {
        Self {
            from: now + chrono::Duration::days(i64::from(from_days)),
            to: now + chrono::Duration::days(i64::from(to_days)),
        }
    }
}

/// Provider of calendar events.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Fetch and expand events from every source, filtered to `window`.
    ///
    /// # Errors
    ///
    /// `FetchFailed` when any feed cannot be fetched or parsed.
    async fn events(
        &self,
        sources: &[IcsSource],
        window: EventWindow,
        timezone: Tz,
    ) -> Result<Vec<CalendarEvent>, GenerateError>;
}

/// Provider of auxiliary JSON data.
#[async_trait]
pub trait ExtraDataFetcher: Send + Sync {
    /// Fetch the configured auxiliary data.
    ///
    /// A string source yields the fetched value; an array yields a
    /// `Value::Array` with one element per source, in list order.
    ///
    /// # Errors
    ///
    /// `FetchFailed` when any source cannot be fetched or parsed.
    async fn extra(
        &self,
        request: &ExtraDataUrl,
        default_headers: &BTreeMap<String, String>,
        default_ttl_secs: u64,
    ) -> Result<serde_json::Value, GenerateError>;
}

/// A TTL'd auxiliary response.
struct CachedExtra {
    fetched_at: Instant,
    ttl_secs: u64,
    value: serde_json::Value,
}

/// Production fetcher over `reqwest`.
pub struct HttpFetcher {
    client: reqwest::Client,
    extra_cache: Mutex<HashMap<String, CachedExtra>>,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher").finish_non_exhaustive()
    }
}

impl HttpFetcher {
    /// Create a fetcher with a 30 second request timeout.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent(concat!("calimg/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            client,
            extra_cache: Mutex::new(HashMap::new()),
        })
    }

    async fn fetch_text(&self, url: &str) -> Result<String, GenerateError> {
        let started = Instant::now();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_failed(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GenerateError::FetchFailed {
                url: url.to_owned(),
                source: anyhow::anyhow!("upstream returned status {status}"),
            });
        }
        let body = response.text().await.map_err(|e| fetch_failed(url, e))?;
        tracing::debug!(
            url = %url,
            bytes = body.len(),
            fetch_ms = started.elapsed().as_millis() as u64,
            "Fetched calendar feed"
        );
        Ok(body)
    }

    async fn fetch_extra_value(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        ttl_secs: u64,
    ) -> Result<serde_json::Value, GenerateError> {
        if let Some(value) = self.cached_extra(url) {
            tracing::debug!(url = %url, "Auxiliary data served from TTL cache");
            return Ok(value);
        }

        let started = Instant::now();
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().await.map_err(|e| fetch_failed(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GenerateError::FetchFailed {
                url: url.to_owned(),
                source: anyhow::anyhow!("upstream returned status {status}"),
            });
        }
        let value: serde_json::Value = response.json().await.map_err(|e| fetch_failed(url, e))?;
        tracing::debug!(
            url = %url,
            fetch_ms = started.elapsed().as_millis() as u64,
            "Fetched auxiliary data"
        );

        if ttl_secs > 0 {
            if let Ok(mut cache) = self.extra_cache.lock() {
                cache.insert(
                    url.to_owned(),
                    CachedExtra {
                        fetched_at: Instant::now(),
                        ttl_secs,
                        value: value.clone(),
                    },
                );
            }
        }
        Ok(value)
    }

    fn cached_extra(&self, url: &str) -> Option<serde_json::Value> {
        let cache = self.extra_cache.lock().ok()?;
        let entry = cache.get(url)?;
        if entry.fetched_at.elapsed().as_secs() < entry.ttl_secs {
            Some(entry.value.clone())
        } else {
            None
        }
    }
}

fn fetch_failed(url: &str, e: reqwest::Error) -> GenerateError {
    GenerateError::FetchFailed {
        url: url.to_owned(),
        source: e.into(),
    }
}

#[async_trait]
impl EventSource for HttpFetcher {
    async fn events(
        &self,
        sources: &[IcsSource],
        window: EventWindow,
        timezone: Tz,
    ) -> Result<Vec<CalendarEvent>, GenerateError> {
        let fetches = sources.iter().map(|source| async move {
            let body = self.fetch_text(&source.url).await?;
            let mut events = ics::parse_events(&body, window, timezone).map_err(|reason| {
                GenerateError::FetchFailed {
                    url: source.url.clone(),
                    source: anyhow::anyhow!("invalid iCalendar data: {reason}"),
                }
            })?;
            for event in &mut events {
                event.source_name.clone_from(&source.source_name);
            }
            Ok::<_, GenerateError>(events)
        });

        let mut events: Vec<CalendarEvent> = futures::future::try_join_all(fetches)
            .await?
            .into_iter()
            .flatten()
            .collect();
        events.sort_by_key(|e| e.start);
        Ok(events)
    }
}

#[async_trait]
impl ExtraDataFetcher for HttpFetcher {
    async fn extra(
        &self,
        request: &ExtraDataUrl,
        default_headers: &BTreeMap<String, String>,
        default_ttl_secs: u64,
    ) -> Result<serde_json::Value, GenerateError> {
        match request {
            ExtraDataUrl::Single(url) => {
                self.fetch_extra_value(url, default_headers, default_ttl_secs).await
            }
            ExtraDataUrl::Multi(list) => {
                let fetches = list.iter().map(|source| self.fetch_source(source, default_headers, default_ttl_secs));
                let values = futures::future::try_join_all(fetches).await?;
                Ok(serde_json::Value::Array(values))
            }
        }
    }
}

impl HttpFetcher {
    async fn fetch_source(
        &self,
        source: &ExtraDataSource,
        default_headers: &BTreeMap<String, String>,
        default_ttl_secs: u64,
    ) -> Result<serde_json::Value, GenerateError> {
        // Per-source headers are merged over the defaults.
        let mut headers = default_headers.clone();
        if let Some(own) = &source.headers {
            for (name, value) in own {
                headers.insert(name.clone(), value.clone());
            }
        }
        let ttl = source.cache_ttl.unwrap_or(default_ttl_secs);
        self.fetch_extra_value(&source.url, &headers, ttl).await
    }
}
