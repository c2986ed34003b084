//! calimg: pre-rendered calendar images over HTTP.
//!
//! A config file names a template, output dimensions, calendar and
//! auxiliary data sources, and optionally a cron schedule. The daemon
//! turns each config into an up-to-date image, keeps it in a two-tier
//! (memory + disk) cache with crash-safe replacement, pre-generates on
//! cron in isolated worker processes, and records every produced
//! artifact's checksum in a bounded per-config history ledger.

#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(unreachable_pub)]
#![warn(elided_lifetimes_in_paths)]
#![deny(unused_must_use)]

/// HTTP surface: router, handlers, error mapping.
pub mod api;
/// Two-tier artifact cache with atomic disk replacement.
pub mod cache;
/// CRC32 checksums.
pub mod checksum;
/// Injectable time source.
pub mod clock;
/// Config schema, loading, and directory watching.
pub mod config;
/// 5-field cron expressions.
pub mod cron;
/// Request-side contract consumed by the HTTP layer.
pub mod dispatch;
/// Error taxonomy.
pub mod errors;
/// iCalendar and auxiliary JSON fetching.
pub mod fetch;
/// Per-config CRC32 history ledger.
pub mod history;
/// Config identifier validation and cache keys.
pub mod naming;
/// The generation pipeline.
pub mod pipeline;
/// Template rendering and rasterization.
pub mod render;
/// Cron-driven pre-generation timers.
pub mod scheduler;
/// Directory and environment resolution.
pub mod settings;
/// Isolated worker processes and their framed IPC.
pub mod worker;
