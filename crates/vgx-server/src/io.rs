// src/io.rs
//! The I/O thread.
//!
//! One [`EventLoop`] owns the listen socket, the connection pool and every
//! client not currently held by an executor. Each iteration polls, drains
//! the completion queue, services ready sockets and finally revisits
//! yielded clients.

use crate::client::{Client, ClientState};
use crate::completion::{CompletionAction, CompletionQueue, completion_action};
use crate::config::ServerConfig;
use crate::counters::{CountersSnapshot, DispatchCounters, PerfCounters};
use crate::dispatch::DispatchQueues;
use crate::error::{ServerError, ServerResult};
use crate::http::{HTTP_LINE_MAX, HttpStatus, MediaType};
use crate::matrix::Matrix;
use crate::pool::ClientPool;
use crate::registry::Registry;
use crate::request::{self, HandleContext, HandleOutcome, REQUEST_STREAM_MAX};
use crate::service::{ServiceControl, ServiceState};
use crate::syscalls::{self, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, Socket};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Upper bound for one recv() or one send() segment.
pub const IO_CHUNK: usize = 1 << 13;

#[derive(Debug, Clone, Copy)]
enum PollEntry {
    Listener,
    Wake,
    /// Descriptor recorded at snapshot time; a mismatch means the slot
    /// was closed and reused since.
    Client { id: usize, fd: RawFd },
    Channel { fd: RawFd },
}

/// Where received bytes go.
#[derive(Debug, PartialEq, Eq)]
enum RecvTarget {
    Stream(usize),
    Content(usize),
    /// The request stream is at its bound.
    Full,
}

enum RecvResult {
    Data,
    Nothing,
    Closed,
    TooLarge,
}

/// Shared handles an [`EventLoop`] is built from.
pub struct EventLoopContext {
    pub queues: Arc<DispatchQueues>,
    pub completion: Arc<CompletionQueue>,
    pub registry: Arc<Registry>,
    pub matrix: Arc<dyn Matrix>,
    pub service: Arc<ServiceControl>,
    pub perf: Arc<PerfCounters>,
    pub dispatch: Arc<DispatchCounters>,
    pub stop: Arc<AtomicBool>,
}

pub struct EventLoop {
    listener: Option<Socket>,
    pool: ClientPool,
    queues: Arc<DispatchQueues>,
    completion: Arc<CompletionQueue>,
    registry: Arc<Registry>,
    matrix: Arc<dyn Matrix>,
    service: Arc<ServiceControl>,
    perf: Arc<PerfCounters>,
    dispatch: Arc<DispatchCounters>,
    stop: Arc<AtomicBool>,
    config: ServerConfig,
    pollfds: Vec<libc::pollfd>,
    entries: Vec<PollEntry>,
    yielded: Vec<usize>,
    last_metrics: Instant,
}

impl EventLoop {
    pub fn new(listener: Socket, config: ServerConfig, cx: EventLoopContext) -> Self {
        let capacity = config.client_capacity;
        Self {
            listener: Some(listener),
            pool: ClientPool::new(capacity),
            queues: cx.queues,
            completion: cx.completion,
            registry: cx.registry,
            matrix: cx.matrix,
            service: cx.service,
            perf: cx.perf,
            dispatch: cx.dispatch,
            stop: cx.stop,
            config,
            pollfds: Vec::with_capacity(capacity + 2),
            entries: Vec::with_capacity(capacity + 2),
            yielded: Vec::with_capacity(capacity),
            last_metrics: Instant::now(),
        }
    }

    /// Serve until the stop flag is raised.
    pub fn run(&mut self) -> ServerResult<()> {
        tracing::info!(
            port = self.config.port,
            executors = self.queues.pool_size(),
            clients = self.pool.capacity(),
            wake = if self.completion.wake().is_eventfd() { "eventfd" } else { "loopback" },
            "I/O loop started"
        );
        while !self.stop.load(Ordering::Acquire) {
            self.iterate()?;
            self.log_metrics();
        }
        Ok(())
    }

    fn iterate(&mut self) -> ServerResult<()> {
        self.build_pollset();
        let n_ready = self.poll()?;
        self.executor_complete();
        if n_ready > 0 {
            self.process_ready();
        }
        self.process_yielded();
        Ok(())
    }

    fn build_pollset(&mut self) {
        self.pollfds.clear();
        self.entries.clear();
        if let Some(listener) = &self.listener {
            self.pollfds.push(syscalls::pollfd(listener.fd(), POLLIN));
            self.entries.push(PollEntry::Listener);
        }
        self.pollfds.push(syscalls::pollfd(self.completion.wake().poll_fd(), POLLIN));
        self.entries.push(PollEntry::Wake);

        for id in self.pool.active_ids() {
            let (Some(fd), Some(client)) = (self.pool.fd(id), self.pool.client(id)) else {
                continue;
            };
            let mut events = 0;
            if wants_input(client) {
                events |= POLLIN;
            }
            if client.has_output() {
                events |= POLLOUT;
            }
            self.pollfds.push(syscalls::pollfd(fd, events));
            self.entries.push(PollEntry::Client { id, fd });
        }

        if self.matrix.enabled() {
            let start = self.pollfds.len();
            self.matrix.poll_fds(&mut self.pollfds);
            for pfd in &self.pollfds[start..] {
                self.entries.push(PollEntry::Channel { fd: pfd.fd });
            }
        }
    }

    /// Spin a few zero-timeout polls before blocking.
    fn poll(&mut self) -> io::Result<usize> {
        for _ in 0..self.config.spin_polls {
            let n = syscalls::poll(&mut self.pollfds, 0)?;
            if n > 0 {
                return Ok(n);
            }
            if !self.completion.is_empty() || !self.yielded.is_empty() {
                return Ok(0);
            }
            std::hint::spin_loop();
        }
        if !self.completion.enter_blocking() {
            return Ok(0);
        }
        let res = syscalls::poll(&mut self.pollfds, self.config.blocking_poll_ms);
        self.completion.leave_blocking();
        res
    }

    fn process_ready(&mut self) {
        for i in 0..self.pollfds.len() {
            let revents = self.pollfds[i].revents;
            if revents == 0 {
                continue;
            }
            match self.entries[i] {
                PollEntry::Listener => self.accept(),
                PollEntry::Wake => {
                    self.completion.wake().drain();
                }
                PollEntry::Client { id, fd } => self.client_io(id, fd, revents),
                PollEntry::Channel { fd } => self.matrix.channel_ready(fd, revents),
            }
        }
    }

    fn process_yielded(&mut self) {
        if self.yielded.is_empty() {
            return;
        }
        let yielded = std::mem::take(&mut self.yielded);
        for &id in &yielded {
            let revisit = self.pool.client_mut(id).is_some_and(|client| {
                let revisit = client.yielded;
                client.yielded = false;
                revisit
            });
            if revisit {
                self.dispatch_ready(id);
            }
        }
        // Reuse the allocation
        let mut yielded = yielded;
        yielded.clear();
        yielded.append(&mut self.yielded);
        self.yielded = yielded;
    }

    fn accept(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };
        let (socket, peer) = match syscalls::accept_connection(listener.fd()) {
            Ok(Some(accepted)) => accepted,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                return;
            }
        };

        if self.service.get() == ServiceState::Suspended {
            self.reject(socket, peer, ServerError::ServiceOut);
            return;
        }
        match self.pool.register(socket, peer, self.config.idle_reclaim()) {
            Ok(id) => {
                self.perf.inc_conn();
                tracing::debug!(client = id, ?peer, "client connected");
            }
            Err(socket) => self.reject(socket, peer, ServerError::PoolExhausted),
        }
    }

    /// Best-effort response on a socket that never gets a slot.
    fn reject(&mut self, socket: Socket, peer: Option<SocketAddr>, reason: ServerError) {
        let status = reason.status_code();
        let bytes = self.pool.reject_response(status, &reason.to_string());
        if let Err(e) = socket.send(&bytes) {
            tracing::debug!(?peer, error = %e, "reject response not sent");
        }
        self.perf.inc_rejected();
        self.perf.record_status(status.code());
        tracing::warn!(?peer, status = status.code(), %reason, "connection rejected");
    }

    fn close(&mut self, id: usize) {
        if let Some(client) = self.pool.client_mut(id) {
            if client.matrix.dispatched {
                self.matrix.complete(client);
            }
        }
        if self.pool.close(id) {
            self.perf.dec_conn();
            tracing::debug!(client = id, "client closed");
        }
    }

    fn client_io(&mut self, id: usize, fd: RawFd, revents: i16) {
        if self.pool.fd(id) != Some(fd) || self.pool.is_in_flight(id) {
            return;
        }
        if revents & (POLLERR | POLLNVAL) != 0 || (revents & POLLHUP != 0 && revents & POLLIN == 0) {
            self.close(id);
            return;
        }
        if revents & POLLOUT != 0 {
            self.front_send(id);
            if !self.pool.is_connected(id) || self.pool.is_in_flight(id) || self.pool.fd(id) != Some(fd) {
                return;
            }
        }
        if revents & POLLIN != 0 && self.pool.client(id).is_some_and(wants_input) {
            self.recv(id);
        }
    }

    fn recv(&mut self, id: usize) {
        let service = self.service.get();
        let result = {
            let Some((socket, client)) = self.pool.split_mut(id) else {
                return;
            };
            if client.error {
                return;
            }
            if client.state == ClientState::ResponseComplete && !client.request.stream.is_readable() {
                if service == ServiceState::Suspended {
                    client.fail(HttpStatus::SERVICE_UNAVAILABLE, "Service suspended");
                } else {
                    client.reset_exchange();
                }
            }
            let (buffer, limit) = match recv_target(client) {
                RecvTarget::Full => (&mut client.request.stream, None),
                RecvTarget::Stream(limit) => (&mut client.request.stream, Some(limit)),
                RecvTarget::Content(limit) => (&mut client.request.content, Some(limit)),
            };
            match limit {
                None => RecvResult::TooLarge,
                Some(0) => RecvResult::Nothing,
                Some(limit) => match buffer.writable_segment_ex(1) {
                    Err(_) => RecvResult::TooLarge,
                    Ok(segment) => {
                        let len = segment.len().min(limit);
                        match socket.recv(&mut segment[..len]) {
                            Ok(0) => RecvResult::Closed,
                            Ok(n) => match buffer.advance_write(n) {
                                Ok(_) => {
                                    self.perf.add_bytes_in(n);
                                    RecvResult::Data
                                }
                                Err(e) => {
                                    tracing::error!(client = id, error = %e, "recv overran buffer");
                                    RecvResult::Closed
                                }
                            },
                            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                                RecvResult::Nothing
                            }
                            Err(e) => {
                                tracing::debug!(client = id, error = %e, "recv failed");
                                RecvResult::Closed
                            }
                        }
                    }
                },
            }
        };

        match result {
            RecvResult::Closed => self.close(id),
            RecvResult::TooLarge => {
                if let Some(client) = self.pool.client_mut(id) {
                    client.fail(HttpStatus::PAYLOAD_TOO_LARGE, "Request too large");
                }
                self.front_send(id);
            }
            RecvResult::Nothing => {
                // A suspended server may have produced a refusal
                if self.pool.client(id).is_some_and(|c| c.error) {
                    self.front_send(id);
                }
            }
            RecvResult::Data => {
                let accepts_input = self.pool.client(id).is_some_and(|c| {
                    c.state.is_pre_content() || c.state == ClientState::ExpectContent
                });
                if accepts_input {
                    self.dispatch_ready(id);
                }
            }
        }
    }

    /// Run the request state machine and act on its outcome.
    fn dispatch_ready(&mut self, id: usize) {
        let outcome = {
            let cx = HandleContext {
                registry: &self.registry,
                admin: self.config.admin,
                service: self.service.get(),
                matrix_enabled: self.matrix.enabled(),
                multi_partial: self.matrix.multi_partial(),
            };
            let Some(client) = self.pool.client_mut(id) else {
                return;
            };
            if !(client.state.is_pre_content() || client.state == ClientState::ExpectContent) {
                return;
            }
            request::handle(client, &cx)
        };
        match outcome {
            HandleOutcome::Incomplete => {}
            HandleOutcome::Yielded => self.yielded.push(id),
            HandleOutcome::Dispatch => self.stage_request(id),
            HandleOutcome::Error => self.front_send(id),
        }
    }

    /// First hand-off of a parsed request.
    fn stage_request(&mut self, id: usize) {
        let Some(mut client) = self.pool.take(id) else {
            return;
        };
        client.dispatch_ns = client.io_t0.elapsed().as_nanos() as u64;
        match self.stage(client) {
            Ok(()) => self.dispatch.inc_dispatched(),
            Err(client) => {
                let e = ServerError::Dispatch("queue push failed");
                tracing::error!(client = id, error = %e, "request not dispatched");
                if self.pool.restore(client) {
                    if let Some(client) = self.pool.client_mut(id) {
                        client.fail(HttpStatus::INTERNAL_SERVER_ERROR, "Internal dispatch error");
                    }
                    self.front_send(id);
                }
            }
        }
    }

    /// Move `client` to the next pipeline stage: the matrix for direct
    /// requests, otherwise an executor queue.
    fn stage(&mut self, mut client: Box<Client>) -> Result<(), Box<Client>> {
        let matrix_enabled = self.matrix.enabled();
        let next = match client.state {
            ClientState::HandleRequest | ClientState::Resubmit => {
                if client.flags.direct && matrix_enabled {
                    return self.forward(client);
                }
                if matrix_enabled && client.route.phases.has_pre() {
                    ClientState::Preprocess
                } else {
                    ClientState::Execute
                }
            }
            ClientState::DispatchComplete if client.flags.multipart => ClientState::Merge,
            ClientState::DispatchComplete => ClientState::Postprocess,
            state => {
                tracing::error!(client = client.id, ?state, "cannot stage client");
                return Err(client);
            }
        };
        client.state = next;
        let start = client.request.min_executor as usize;
        let queue = self.queues.dispatch(client, start)?;
        tracing::trace!(queue, "client staged");
        Ok(())
    }

    fn forward(&mut self, mut client: Box<Client>) -> Result<(), Box<Client>> {
        client.state = ClientState::Dispatch;
        client.matrix.dispatched = true;
        self.matrix.forward(client, &self.completion).map_err(|mut client| {
            client.matrix.dispatched = false;
            client
        })
    }

    /// Drain returned clients, at most one per executor.
    fn executor_complete(&mut self) {
        if self.completion.is_empty() {
            return;
        }
        let matrix_enabled = self.matrix.enabled();
        let batch = self.completion.drain(self.queues.pool_size());
        for mut client in batch {
            match completion_action(&client, matrix_enabled) {
                CompletionAction::Collect => self.collect(client),
                CompletionAction::Forward => {
                    if let Err(mut client) = self.forward(client) {
                        client.response.pending_error = HttpStatus::BAD_GATEWAY;
                        self.collect(client);
                    }
                }
                CompletionAction::Resubmit => {
                    client.nresubmit += 1;
                    if client.nresubmit > self.config.max_resubmit {
                        tracing::warn!(client = client.id, resubmits = client.nresubmit, "resubmit limit reached");
                        client.response.pending_error = HttpStatus::LOOP_DETECTED;
                        self.collect(client);
                        continue;
                    }
                    let (mediatype, allowed) = (client.response.mediatype, client.response.allowed);
                    client.response.reset();
                    client.response.mediatype = mediatype;
                    client.response.allowed = allowed;
                    if let Err(mut client) = self.stage(client) {
                        client.response.pending_error = HttpStatus::INTERNAL_SERVER_ERROR;
                        self.collect(client);
                    }
                }
                CompletionAction::Stage => {
                    if let Err(mut client) = self.stage(client) {
                        client.response.pending_error = HttpStatus::INTERNAL_SERVER_ERROR;
                        self.collect(client);
                    }
                }
                CompletionAction::Defect => {
                    let id = client.id;
                    tracing::error!(client = id, state = ?client.state, "completion state mismatch");
                    self.dispatch.inc_completed();
                    if self.pool.restore(client) {
                        self.close(id);
                    }
                }
            }
        }
    }

    /// Finalize a response and start sending it.
    fn collect(&mut self, mut client: Box<Client>) {
        let id = client.id;
        let pending = std::mem::replace(&mut client.response.pending_error, HttpStatus::NONE);
        if !pending.is_none() {
            client.response.clear_body();
            let method = client.request.method;
            if let Err(e) = client.response.produce_error(pending, Some(pending.reason()), method) {
                tracing::error!(client = id, error = %e, "failed to produce error response");
            }
        }
        client.response.set_backlog(self.dispatch.in_flight());
        if client.matrix.dispatched {
            self.matrix.complete(&mut client);
        }
        client.request.content.clear();
        client.state = ClientState::Collected;
        self.dispatch.inc_completed();
        if self.pool.restore(client) {
            self.front_send(id);
        }
    }

    /// Send buffered response bytes. Once everything is out, account the
    /// response and move on to a pipelined request if one is buffered.
    fn front_send(&mut self, id: usize) {
        let sent = {
            let Some((socket, client)) = self.pool.split_mut(id) else {
                return;
            };
            let response = &mut client.response;
            if response.stream.is_readable()
                && response.content.is_readable()
                && response.stream.size() + response.content.size() <= IO_CHUNK
            {
                if let Err(e) = response.stream.absorb(&mut response.content, IO_CHUNK) {
                    tracing::debug!(client = id, error = %e, "sending head and body separately");
                }
            }

            let mut total = 0;
            let mut failed = false;
            for _ in 0..2 {
                let buffer = if response.stream.is_readable() {
                    &mut response.stream
                } else if response.content.is_readable() {
                    &mut response.content
                } else {
                    break;
                };
                let segment = buffer.readable_segment(IO_CHUNK);
                let len = segment.len();
                match socket.send(segment) {
                    Ok(n) => {
                        if let Err(e) = buffer.advance_read(n) {
                            tracing::error!(client = id, error = %e, "send overran buffer");
                            failed = true;
                            break;
                        }
                        total += n;
                        if n < len {
                            break;
                        }
                    }
                    Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => break,
                    Err(e) => {
                        tracing::debug!(client = id, error = %e, "send failed");
                        failed = true;
                        break;
                    }
                }
            }
            self.perf.add_bytes_out(total);
            if failed { None } else { Some(client.has_output()) }
        };

        match sent {
            None => self.close(id),
            Some(true) => {}
            Some(false) => self.response_complete(id),
        }
    }

    fn response_complete(&mut self, id: usize) {
        let (error, pipelined) = {
            let Some(client) = self.pool.client_mut(id) else {
                return;
            };
            if !(client.state == ClientState::Collected || client.error) {
                return;
            }
            if !client.flags.nometrics {
                let secs = client.io_t0.elapsed().as_secs_f64();
                self.perf.record_response(client.response.status.code(), secs, client.route.is_plugin());
            }
            let error = client.error;
            if error && client.request.accept != MediaType::XVgxPartial {
                (true, false)
            } else {
                client.state = ClientState::ResponseComplete;
                client.io_t0 = Instant::now();
                let pipelined = client.request.stream.is_readable();
                if pipelined {
                    client.reset_exchange();
                }
                (false, pipelined)
            }
        };
        if error {
            self.close(id);
        } else if pipelined {
            self.dispatch_ready(id);
        }
    }

    fn log_metrics(&mut self) {
        let interval = self.config.metrics_interval_secs;
        if interval == 0 || self.last_metrics.elapsed() < Duration::from_secs(interval) {
            return;
        }
        self.last_metrics = Instant::now();
        let snapshot = CountersSnapshot::capture(&self.perf, &self.dispatch, self.queues.processed());
        match serde_json::to_string(&snapshot) {
            Ok(json) => tracing::info!(counters = %json, "server counters"),
            Err(e) => tracing::warn!(error = %e, "failed to render counters"),
        }
    }

    /// Stop accepting, stop the executors and disconnect everyone.
    ///
    /// Executors are joined while their liveness stamps keep moving; a pool
    /// that stays silent for `watchdog_secs` is abandoned.
    pub fn shutdown(mut self, executors: Vec<JoinHandle<()>>) {
        self.service.set(ServiceState::Suspended);
        self.listener = None;
        self.queues.request_suspend();

        let watchdog = self.config.watchdog();
        let mut pending = executors;
        let mut last_stamp = self.latest_stamp();
        let mut last_progress = Instant::now();
        while !pending.is_empty() {
            let (finished, running): (Vec<_>, Vec<_>) = pending.into_iter().partition(|h| h.is_finished());
            pending = running;
            if !finished.is_empty() {
                last_progress = Instant::now();
            }
            for handle in finished {
                if handle.join().is_err() {
                    tracing::error!("executor panicked");
                }
            }
            let stamp = self.latest_stamp();
            if stamp != last_stamp {
                last_stamp = stamp;
                last_progress = Instant::now();
            }
            if !pending.is_empty() && last_progress.elapsed() > watchdog {
                tracing::error!(stuck = pending.len(), "executors unresponsive, forcing shutdown");
                break;
            }
            // Keep returned clients moving so no executor waits on us
            self.completion.wake().drain();
            std::thread::sleep(Duration::from_millis(5));
        }

        for client in self.completion.clear().into_iter().chain(self.queues.drain_all()) {
            let id = client.id;
            if self.pool.restore(client) {
                self.close(id);
            }
        }
        for id in self.pool.connected_ids() {
            self.close(id);
        }
        tracing::info!(detached = pending.len(), "I/O loop stopped");
    }

    fn latest_stamp(&self) -> u64 {
        self.queues.executors().iter().map(|e| e.last_alive_ms()).max().unwrap_or(0)
    }
}

/// Only clients that can still take request bytes poll for input.
fn wants_input(client: &Client) -> bool {
    !client.error
        && (client.state.is_pre_content()
            || matches!(client.state, ClientState::ExpectContent | ClientState::ResponseComplete))
}

fn recv_target(client: &Client) -> RecvTarget {
    if client.error {
        return RecvTarget::Stream(0);
    }
    if client.state == ClientState::ExpectContent {
        return RecvTarget::Content(client.request.unfilled().clamp(1, IO_CHUNK));
    }
    let want = if client.state.is_pre_content() { HTTP_LINE_MAX } else { IO_CHUNK };
    match REQUEST_STREAM_MAX.saturating_sub(client.request.stream.size()) {
        0 => RecvTarget::Full,
        room => RecvTarget::Stream(want.min(room)),
    }
}
