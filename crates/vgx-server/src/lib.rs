// src/lib.rs
//! Request-dispatch core of the VGX graph server.
//!
//! One I/O thread multiplexes every client connection with `poll()`, parses
//! HTTP/1.1 requests incrementally and hands complete requests to a fixed
//! pool of executor threads through load-balanced dispatch queues. Finished
//! clients come back through a single completion queue and the I/O thread
//! sends their responses.
//!
//! ```rust,no_run
//! use vgx_server::{PluginOutcome, PluginPhases, QueryParams, Registry, RequestView, ResponseSink, Server};
//!
//! fn hello(_: &str, _: bool, _: &QueryParams, _: &RequestView<'_>, out: &mut ResponseSink<'_>) -> PluginOutcome {
//!     match out.write(b"\"hello\"") {
//!         Ok(()) => PluginOutcome::ok(),
//!         Err(e) => PluginOutcome::error(vgx_server::HttpStatus::INTERNAL_SERVER_ERROR, e.to_string()),
//!     }
//! }
//!
//! let registry = Registry::builder().plugin("hello", PluginPhases::NONE, hello).build();
//! Server::bind("127.0.0.1:9000").executors(4).registry(registry).serve()?;
//! # Ok::<(), vgx_server::ServerError>(())
//! ```

pub mod buffer;
pub mod client;
pub mod completion;
pub mod config;
pub mod counters;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod http;
pub mod io;
pub mod logging;
pub mod matrix;
pub mod parser;
pub mod pool;
pub mod registry;
pub mod request;
pub mod response;
pub mod server;
pub mod service;
pub mod syscalls;
pub mod wake;

// Re-exports for users
pub use buffer::StreamBuffer;
pub use client::{Client, ClientState};
pub use completion::CompletionQueue;
pub use config::ServerConfig;
pub use counters::CountersSnapshot;
pub use error::{ServerError, ServerResult};
pub use http::{HttpStatus, MediaType, Method};
pub use matrix::{Matrix, NoMatrix, PartialResult};
pub use registry::{
    Plugin, PluginOutcome, PluginPhases, QueryParams, Registry, RegistryBuilder, RequestView, ResponseSink,
};
pub use server::{Server, ServerHandle};
pub use service::ServiceState;
pub use wake::WakeMode;
