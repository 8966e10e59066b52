// src/config.rs
use crate::error::{ServerError, ServerResult};
use crate::wake::WakeMode;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

pub const MAX_EXECUTORS: usize = 32;
pub const MIN_CLIENTS: usize = 16;
pub const MAX_CLIENTS: usize = 1024;
/// Slots 0 and 1 never hold a live connection.
pub const RESERVED_CLIENT_SLOTS: usize = 2;
pub const DISPATCH_QUEUES: usize = 4;

/// Server configuration loaded from `VGX_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen host (default: 127.0.0.1)
    pub host: String,

    /// Listen port (default: 9000)
    pub port: u16,

    /// Admin port: service-out does not apply and min-executor hints are honored.
    pub admin: bool,

    /// Executor threads, 1..=32 (default: number of CPUs)
    pub executors: usize,

    /// Connection slots including the two reserved ones, 16..=1024 (default: 256)
    pub client_capacity: usize,

    pub dispatch_queues: usize,

    /// Executors allowed to park on one queue at a time (default: 4)
    pub max_waiting_per_queue: usize,

    /// Base executor park time; each thread adds up to the same again as jitter (default: 25ms)
    pub fetch_base_wait_ms: u64,

    /// A fully responded connection idle this long may be reclaimed (default: 5s)
    pub idle_reclaim_secs: u64,

    /// Executors silent this long during shutdown are abandoned (default: 5s)
    pub watchdog_secs: u64,

    /// Zero-timeout polls before a blocking poll (default: 8)
    pub spin_polls: u32,

    pub blocking_poll_ms: i32,

    /// Resubmissions before a request is answered 508 (default: 9999)
    pub max_resubmit: u32,

    /// Pin the I/O thread to the first core.
    pub pin_io_thread: bool,

    /// Counters log period, 0 disables (default: 0)
    pub metrics_interval_secs: u64,

    pub wake: WakeMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            admin: false,
            executors: num_cpus::get().clamp(1, MAX_EXECUTORS),
            client_capacity: 256,
            dispatch_queues: DISPATCH_QUEUES,
            max_waiting_per_queue: 4,
            fetch_base_wait_ms: 25,
            idle_reclaim_secs: 5,
            watchdog_secs: 5,
            spin_polls: 8,
            blocking_poll_ms: 5,
            max_resubmit: 9999,
            pin_io_thread: false,
            metrics_interval_secs: 0,
            wake: WakeMode::Auto,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

impl ServerConfig {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> ServerResult<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();

        let d = ServerConfig::default();
        let wake = match std::env::var("VGX_WAKE") {
            Ok(v) => v.parse()?,
            Err(_) => d.wake,
        };
        let config = ServerConfig {
            host: std::env::var("VGX_HOST").unwrap_or(d.host),
            port: env_or("VGX_PORT", d.port),
            admin: env_flag("VGX_ADMIN", d.admin),
            executors: env_or("VGX_EXECUTORS", d.executors),
            client_capacity: env_or("VGX_CLIENT_CAPACITY", d.client_capacity),
            dispatch_queues: d.dispatch_queues,
            max_waiting_per_queue: env_or("VGX_MAX_WAITING_PER_QUEUE", d.max_waiting_per_queue),
            fetch_base_wait_ms: env_or("VGX_FETCH_BASE_WAIT_MS", d.fetch_base_wait_ms),
            idle_reclaim_secs: env_or("VGX_IDLE_RECLAIM_SECS", d.idle_reclaim_secs),
            watchdog_secs: env_or("VGX_WATCHDOG_SECS", d.watchdog_secs),
            spin_polls: env_or("VGX_SPIN_POLLS", d.spin_polls),
            blocking_poll_ms: env_or("VGX_BLOCKING_POLL_MS", d.blocking_poll_ms),
            max_resubmit: env_or("VGX_MAX_RESUBMIT", d.max_resubmit),
            pin_io_thread: env_flag("VGX_PIN_IO_THREAD", d.pin_io_thread),
            metrics_interval_secs: env_or("VGX_METRICS_INTERVAL_SECS", d.metrics_interval_secs),
            wake,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ServerResult<()> {
        if !(1..=MAX_EXECUTORS).contains(&self.executors) {
            return Err(ServerError::Config(format!(
                "executors must be 1..={}, got {}",
                MAX_EXECUTORS, self.executors
            )));
        }
        if !(MIN_CLIENTS..=MAX_CLIENTS).contains(&self.client_capacity) {
            return Err(ServerError::Config(format!(
                "client_capacity must be {}..={}, got {}",
                MIN_CLIENTS, MAX_CLIENTS, self.client_capacity
            )));
        }
        if self.dispatch_queues != DISPATCH_QUEUES {
            return Err(ServerError::Config(format!(
                "dispatch_queues is fixed at {}",
                DISPATCH_QUEUES
            )));
        }
        if self.blocking_poll_ms < 0 {
            return Err(ServerError::Config("blocking_poll_ms must not be negative".into()));
        }
        if self.fetch_base_wait_ms == 0 {
            return Err(ServerError::Config("fetch_base_wait_ms must be positive".into()));
        }
        Ok(())
    }

    /// Resolve the listen address.
    pub fn server_addr(&self) -> ServerResult<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ServerError::Config(format!("cannot resolve {}:{}", self.host, self.port)))
    }

    pub fn idle_reclaim(&self) -> Duration {
        Duration::from_secs(self.idle_reclaim_secs)
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs)
    }
}
