//! Metadata caching and request dispatch core for a network file-service
//! daemon.
//!
//! The crate has two halves. [`cache`] is an in-memory metadata cache over a
//! backing filesystem abstraction layer ([`fsal`]): reference-counted entries
//! keyed by opaque object handles, directories materialized as a head segment
//! plus a chain of continuation segments, and an LRU-driven garbage collector
//! that reclaims entries nobody has touched in a while. [`dispatch`] is the
//! request side: a fixed pool of worker threads, each with its own pending
//! queue and duplicate-request cache, pushing decoded requests through an
//! export/auth gate and into protocol handlers that drive the cache.

pub mod app_config;
pub mod cache;
pub mod dispatch;
pub mod fsal;
pub mod trc;

pub use app_config::{Config, ConfigError};
pub use cache::{CacheClient, CacheEntry, CacheError, CacheKey, CacheTable, EntryPool, LruList};
pub use dispatch::{WorkerPool, WorkerPoolConfig};
