//! Logging and tracing initialization.
//!
//! The server logs through `tracing`. Nothing is printed until a subscriber
//! is installed, so binaries call one of these functions first.
//!
//! ```rust,no_run
//! use vgx_server::logging::init_logging;
//!
//! init_logging();
//! ```
//!
//! The level comes from `RUST_LOG` when set:
//!
//! ```bash
//! # Per-request flow
//! RUST_LOG=vgx_server=debug vgx-serve
//!
//! # Rejected connections and defects only
//! RUST_LOG=warn vgx-serve
//! ```
//!
//! Installing a second subscriber is a no-op, so tests may call these freely.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging at `info` unless `RUST_LOG` says otherwise.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize logging with a default level.
///
/// # Common Levels
///
/// - `"trace"` - ring buffer resizes and every request line
/// - `"debug"` - per-request flow, failed requests
/// - `"info"` - server lifecycle (recommended)
/// - `"warn"` - rejected connections, reclaimed slots
/// - `"error"` - engineering defects only
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init();
}

/// Initialize JSON-formatted logging for log aggregation.
pub fn init_logging_json() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .try_init();
}
