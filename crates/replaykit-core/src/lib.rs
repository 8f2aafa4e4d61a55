//! replaykit-core: ingestion side of replaykit
//!
//! Pulls session-replay batches off a queue, decodes them with
//! `replaykit-codec`, and hands asset references to a cacher.
//!
//! # Architecture
//!
//! ```text
//! queue record → BatchDecoder → AssetHandler → AssetCacher → asset jobs
//!                                    ↑
//!          AssetService loop (signals, cacher errors, maintenance)
//! ```
//!
//! # Modules
//!
//! - `config`: Configuration management
//! - `logging`: `tracing` subscriber setup
//! - `queue`: Queue consumers (spool stream, in-process channel)
//! - `assets`: Per-message dispatch to the cacher
//! - `sources`: Script file references in exception stack traces
//! - `cacher`: Asset cacher trait and the local deduplicating cacher
//! - `service`: The priority-polling ingestion loop
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod assets;
pub mod cacher;
pub mod config;
pub mod error;
pub mod logging;
pub mod queue;
pub mod service;
pub mod sources;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
