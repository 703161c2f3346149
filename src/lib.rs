//! # Metrics Relay
//!
//! A metrics agent and server pair.
//!
//! The agent samples process and host statistics on a poll timer, buffers
//! them, and on a report timer hands the buffered batch to a bounded pool of
//! senders that gzip, sign and POST it with a fixed-backoff retry.
//!
//! The server validates incoming metrics, accumulates counters against stored
//! state inside a unit of work, and persists them through one of three
//! interchangeable backends (memory, append-only file, PostgreSQL). A snapshot
//! worker restores the live set at startup and dumps it periodically and at
//! shutdown.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────── agent ─────────────────────────────┐
//! │ Scheduler ──poll──▶ Collector ──▶ MetricBuffer                  │
//! │     └──report──▶ Dispatcher ──▶ workers ──▶ HttpTransport ──┐   │
//! └─────────────────────────────────────────────────────────────┼───┘
//!                                                               │ POST /updates/
//! ┌──────────────────────────── server ────────────────────────▼───┐
//! │ axum router ──▶ UpdateEngine ──▶ UnitOfWork ──▶ Storage         │
//! │                      ▲                             ▲           │
//! │                      └────── SnapshotWorker ───────┘           │
//! └────────────────────────────────────────────────────────────────┘
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model;
pub mod retry;
pub mod server;
pub mod shutdown;
pub mod signing;
pub mod snapshot;
pub mod storage;
pub mod validation;

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Crate version
pub const RELAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Header carrying the hex HMAC-SHA256 of the uncompressed body
pub const SIGNATURE_HEADER: &str = "HashSHA256";

/// Default listen / target address for both processes
pub const DEFAULT_ADDRESS: &str = "localhost:8080";

/// Grace window shared by the HTTP listener and the final snapshot
pub const SHUTDOWN_GRACE_SECS: u64 = 10;
