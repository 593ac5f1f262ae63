//! Staticserv Core Library
//!
//! This library provides the core of a concurrent static-file HTTP/1.1
//! server: an acceptor task admits TCP connections through a bounded
//! admission queue and distributes them round-robin to a fixed set of
//! workers, each of which dispatches requests to a bounded pool of
//! handler tasks backed by a private LRU file cache. A single buffered,
//! size-rotated access log and a shared statistics block span all workers.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`config`] - Configuration file parsing and defaults
//! - [`http`] - Request parsing, range handling, response framing, MIME types
//! - [`cache`] - Per-worker LRU file cache with pin counts
//! - [`access_log`] - Shared access log with size-triggered rotation
//! - [`stats`] - Shared request/byte/status counters
//! - [`server`] - Acceptor, admission queue, workers, request handler

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod access_log;
pub mod cache;
pub mod config;
pub mod http;
pub mod server;
pub mod stats;

// Re-export commonly used types
pub use access_log::AccessLog;
pub use cache::{CacheError, CacheHandle, CacheStats, FileCache};
pub use config::{Config, ConfigError};
pub use server::{Server, ServerError};
pub use stats::{ServerStats, StatsSnapshot};
