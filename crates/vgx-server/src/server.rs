// src/server.rs
use crate::completion::CompletionQueue;
use crate::config::ServerConfig;
use crate::counters::{CountersSnapshot, DispatchCounters, PerfCounters};
use crate::dispatch::DispatchQueues;
use crate::error::{ServerError, ServerResult};
use crate::executor::{Executor, ExecutorContext};
use crate::io::{EventLoop, EventLoopContext};
use crate::matrix::{Matrix, NoMatrix};
use crate::registry::Registry;
use crate::service::{ServiceControl, ServiceState};
use crate::syscalls;
use crate::wake::WakeMonitor;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct Server {
    host_port: Option<String>,
    config: ServerConfig,
    registry: Arc<Registry>,
    matrix: Arc<dyn Matrix>,
}

impl Server {
    pub fn bind(host_port: &str) -> Self {
        Self {
            host_port: Some(host_port.to_string()),
            ..Self::from_config(ServerConfig::default())
        }
    }

    /// Listen on the configured host and port.
    pub fn from_config(config: ServerConfig) -> Self {
        Self {
            host_port: None,
            config,
            registry: Arc::new(Registry::builder().build()),
            matrix: Arc::new(NoMatrix),
        }
    }

    pub fn executors(mut self, executors: usize) -> Self {
        self.config.executors = executors;
        self
    }

    /// Replace the configuration. An address given to [`bind`](Self::bind)
    /// still wins over the configured host and port.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn matrix(mut self, matrix: impl Matrix + 'static) -> Self {
        self.matrix = Arc::new(matrix);
        self
    }

    fn resolve(&self) -> ServerResult<SocketAddr> {
        match &self.host_port {
            Some(host_port) => host_port
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| ServerError::Config(format!("cannot resolve {host_port}"))),
            None => self.config.server_addr(),
        }
    }

    /// Bind, spawn the executor pool and the I/O thread, and return at once.
    pub fn start(self) -> ServerResult<ServerHandle> {
        self.config.validate()?;
        let addr = self.resolve()?;
        let listener = syscalls::create_listen_socket(&addr)?;
        let local_addr = listener.local_addr()?;

        let mut config = self.config;
        config.port = local_addr.port();

        let wake = Arc::new(WakeMonitor::new(config.wake)?);
        let completion = Arc::new(CompletionQueue::new(wake));
        let queues = Arc::new(DispatchQueues::new(
            config.dispatch_queues,
            config.executors,
            config.max_waiting_per_queue,
        ));
        let service = Arc::new(ServiceControl::new(ServiceState::Serving));
        let perf = Arc::new(PerfCounters::new());
        let dispatch = Arc::new(DispatchCounters::new());
        let stop = Arc::new(AtomicBool::new(false));

        let executor_cx = Arc::new(ExecutorContext {
            queues: Arc::clone(&queues),
            completion: Arc::clone(&completion),
            registry: Arc::clone(&self.registry),
            matrix: Arc::clone(&self.matrix),
            port: local_addr.port(),
            base_wait: Duration::from_millis(config.fetch_base_wait_ms),
        });

        let mut executors = Vec::with_capacity(queues.pool_size());
        for shared in queues.executors() {
            let executor = Executor::new(Arc::clone(shared), Arc::clone(&executor_cx));
            let spawned = thread::Builder::new()
                .name(format!("vgx-executor-{}", shared.id))
                .spawn(move || executor.run());
            match spawned {
                Ok(handle) => executors.push(handle),
                Err(e) => {
                    queues.request_suspend();
                    for handle in executors {
                        let _ = handle.join();
                    }
                    return Err(e.into());
                }
            }
        }

        let loop_cx = EventLoopContext {
            queues: Arc::clone(&queues),
            completion,
            registry: self.registry,
            matrix: self.matrix,
            service: Arc::clone(&service),
            perf: Arc::clone(&perf),
            dispatch: Arc::clone(&dispatch),
            stop: Arc::clone(&stop),
        };
        let pin = config.pin_io_thread;
        let io = thread::Builder::new().name("vgx-io".to_string()).spawn(move || {
            if pin {
                match core_affinity::get_core_ids().and_then(|ids| ids.first().copied()) {
                    Some(core) if core_affinity::set_for_current(core) => {
                        tracing::debug!(core = core.id, "I/O thread pinned");
                    }
                    _ => tracing::warn!("failed to pin I/O thread"),
                }
            }
            let mut event_loop = EventLoop::new(listener, config, loop_cx);
            let result = event_loop.run();
            if let Err(e) = &result {
                tracing::error!(error = %e, "I/O loop failed");
            }
            event_loop.shutdown(executors);
            result
        });
        let io = match io {
            Ok(handle) => handle,
            Err(e) => {
                queues.request_suspend();
                return Err(e.into());
            }
        };

        tracing::info!(%local_addr, "VGX server listening");
        Ok(ServerHandle {
            local_addr,
            service,
            perf,
            dispatch,
            queues,
            stop,
            io: Some(io),
        })
    }

    /// Start and block until the server stops.
    pub fn serve(self) -> ServerResult<()> {
        self.start()?.join()
    }
}

/// Control surface of a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    service: Arc<ServiceControl>,
    perf: Arc<PerfCounters>,
    dispatch: Arc<DispatchCounters>,
    queues: Arc<DispatchQueues>,
    stop: Arc<AtomicBool>,
    io: Option<JoinHandle<ServerResult<()>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn service_state(&self) -> ServiceState {
        self.service.get()
    }

    pub fn service_in(&self) {
        tracing::info!("service in");
        self.service.set(ServiceState::Serving);
    }

    pub fn service_out(&self) {
        tracing::info!("service out");
        self.service.set(ServiceState::ServiceOut);
    }

    pub fn counters(&self) -> CountersSnapshot {
        CountersSnapshot::capture(&self.perf, &self.dispatch, self.queues.processed())
    }

    /// Flag observed by the I/O thread, for signal handlers.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Wait for the I/O thread to finish its shutdown.
    pub fn join(mut self) -> ServerResult<()> {
        self.join_io()
    }

    fn join_io(&mut self) -> ServerResult<()> {
        match self.io.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| ServerError::Other("I/O thread panicked".into()))?,
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.io.is_some() {
            self.stop();
            let _ = self.join_io();
        }
    }
}
