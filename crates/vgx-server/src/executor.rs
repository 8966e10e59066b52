// src/executor.rs
use crate::buffer::BufferError;
use crate::client::{Client, ClientState};
use crate::completion::CompletionQueue;
use crate::dispatch::{DispatchQueues, ExecutorShared, Fetch, Work};
use crate::http::{HttpStatus, MediaType, Method};
use crate::matrix::Matrix;
use crate::registry::{PluginOutcome, QueryParams, Registry, RequestView, ResponseSink, RouteKind};
use crate::response::ResponseMeta;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Everything an executor thread shares with the rest of the server.
pub struct ExecutorContext {
    pub queues: Arc<DispatchQueues>,
    pub completion: Arc<CompletionQueue>,
    pub registry: Arc<Registry>,
    pub matrix: Arc<dyn Matrix>,
    /// Reported in JSON response metas.
    pub port: u16,
    pub base_wait: Duration,
}

pub struct Executor {
    shared: Arc<ExecutorShared>,
    cx: Arc<ExecutorContext>,
    rng: StdRng,
}

impl Executor {
    pub fn new(shared: Arc<ExecutorShared>, cx: Arc<ExecutorContext>) -> Self {
        // Per-thread seed spreads park timeouts apart
        let rng = StdRng::seed_from_u64(0x5647_5800 ^ shared.id as u64);
        Self { shared, cx, rng }
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Fetch and process clients until a stop is requested.
    pub fn run(mut self) {
        tracing::debug!(executor = self.shared.id, queue = self.shared.queue, "executor started");
        loop {
            self.shared.touch();
            if self.cx.queues.is_suspend_requested() {
                break;
            }
            let wait = self.park_time();
            match self.cx.queues.fetch(self.shared.queue, wait) {
                Fetch::Work(Work::Client(client)) => {
                    let client = self.process(client);
                    self.complete(client);
                }
                Fetch::Work(Work::Stop) => break,
                Fetch::Timeout => {}
                Fetch::Saturated => self.shared.park(wait),
            }
        }
        self.shared.touch();
        tracing::debug!(
            executor = self.shared.id,
            processed = self.shared.processed(),
            "executor stopped"
        );
    }

    fn park_time(&mut self) -> Duration {
        let base = self.cx.base_wait.as_millis() as u64;
        Duration::from_millis(base + self.rng.gen_range(0..=base))
    }

    fn complete(&self, mut client: Box<Client>) {
        loop {
            match self.cx.completion.push(client) {
                Ok(()) => return,
                Err(returned) => {
                    tracing::error!(client = returned.id, executor = self.shared.id, "failed to return client, retrying");
                    client = returned;
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    /// Run one pipeline phase for `client` and hand it back.
    pub fn process(&mut self, mut client: Box<Client>) -> Box<Client> {
        client.request.executor_id = Some(self.shared.id);
        self.shared.inc_processed();
        let t0 = Instant::now();
        client.exec_t0 = t0;
        if let Err(e) = self.step(&mut client) {
            tracing::error!(client = client.id, executor = self.shared.id, error = %e, "response production failed");
            client.response.pending_error = HttpStatus::INTERNAL_SERVER_ERROR;
        }
        client.response.exec_ns += t0.elapsed().as_nanos() as u64;
        client
    }

    fn step(&self, client: &mut Client) -> Result<(), BufferError> {
        match client.state {
            ClientState::Preprocess => self.preprocess(client),
            ClientState::Execute => self.execute(client),
            ClientState::Merge => self.merge(client),
            ClientState::Postprocess => self.postprocess(client),
            state => {
                tracing::error!(client = client.id, ?state, "executor received client in unexpected state");
                Ok(())
            }
        }
    }

    fn preprocess(&self, client: &mut Client) -> Result<(), BufferError> {
        if !self.cx.matrix.enabled() {
            client.state = ClientState::Execute;
            return self.execute(client);
        }
        let outcome = self.call_plugin(client, false);
        if outcome.resubmit {
            client.state = ClientState::Resubmit;
            return Ok(());
        }
        if !outcome.is_ok() {
            client.complete = true;
            return self.produce_failure(client, outcome);
        }
        // Preprocessed output becomes the forwarded request body
        if client.response.content.is_readable() {
            client.request.content.swap(&mut client.response.content);
            client.request.content_offset = 0;
            client.response.clear_body();
        }
        Ok(())
    }

    fn execute(&self, client: &mut Client) -> Result<(), BufferError> {
        if client.request.method == Method::Options {
            return self.produce(client, HttpStatus::OK);
        }
        match client.route.kind {
            RouteKind::HealthCheck => {
                client.response.prepare_body()?;
                let body: &[u8] = match client.response.mediatype {
                    MediaType::Json => b"\"OK\"",
                    _ => b"OK",
                };
                client.response.content.write(body)?;
                self.produce(client, HttpStatus::OK)
            }
            RouteKind::NotFound => {
                let outcome = PluginOutcome::error(HttpStatus::NOT_FOUND, format!("Not found: {}", client.request.path));
                self.produce_failure(client, outcome)
            }
            RouteKind::Builtin | RouteKind::Plugin => {
                client.response.prepare_body()?;
                let outcome = self.call_plugin_with_body(client, false)?;
                if outcome.resubmit {
                    client.state = ClientState::Resubmit;
                    return Ok(());
                }
                if !outcome.is_ok() {
                    return self.produce_failure(client, outcome);
                }
                if client.route.phases.has_post() {
                    client.state = ClientState::Postprocess;
                    return self.postprocess(client);
                }
                self.produce(client, outcome.status)
            }
        }
    }

    fn merge(&self, client: &mut Client) -> Result<(), BufferError> {
        if !self.cx.matrix.enabled() {
            client.state = ClientState::Postprocess;
            return self.postprocess(client);
        }
        let Some(mut partial) = client.matrix.partial.take() else {
            let outcome = PluginOutcome::error(HttpStatus::BAD_GATEWAY, "No partial result");
            return self.produce_failure(client, outcome);
        };
        partial.content.advance_read(partial.content_offset.min(partial.content.size()))?;
        client.response.clear_body();
        client.response.content.absorb(&mut partial.content, usize::MAX)?;
        if partial.status == HttpStatus::OK && client.route.phases.has_post() {
            client.state = ClientState::Postprocess;
            return self.postprocess(client);
        }
        self.produce(client, partial.status)
    }

    fn postprocess(&self, client: &mut Client) -> Result<(), BufferError> {
        if !client.route.phases.has_post() {
            return self.produce(client, HttpStatus::OK);
        }
        let outcome = self.call_plugin(client, true);
        if outcome.resubmit {
            client.state = ClientState::Resubmit;
            return Ok(());
        }
        if !outcome.is_ok() {
            return self.produce_failure(client, outcome);
        }
        self.produce(client, outcome.status)
    }

    /// Main call into an opened JSON wrapper. A plugin that writes nothing
    /// answers `null`.
    fn call_plugin_with_body(&self, client: &mut Client, post: bool) -> Result<PluginOutcome, BufferError> {
        let before = client.response.content.size();
        let outcome = self.call_plugin(client, post);
        if outcome.is_ok() && client.response.is_prewrapped() && client.response.content.size() == before {
            client.response.content.write(b"null")?;
        }
        Ok(outcome)
    }

    fn call_plugin(&self, client: &mut Client, post: bool) -> PluginOutcome {
        let Some(entry) = self.cx.registry.entry(&client.route) else {
            return PluginOutcome::error(HttpStatus::NOT_FOUND, format!("Not found: {}", client.request.path));
        };
        let params = match QueryParams::parse(&client.route.query) {
            Ok(params) => params,
            Err(e) => return PluginOutcome::error(HttpStatus::BAD_REQUEST, format!("Invalid query: {e}")),
        };
        let Client { id, request, response, route, ident, .. } = client;
        let view = RequestView {
            method: request.method,
            path: &request.path,
            headers: &request.headers,
            content_type: request.content_type,
            content: request.body(),
            ident: *ident,
        };
        let mut sink = ResponseSink::new(response);
        let result = catch_unwind(AssertUnwindSafe(|| {
            entry.plugin.call(&route.name, post, &params, &view, &mut sink)
        }));
        match result {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(client = *id, plugin = %route.name, post, "plugin panicked");
                PluginOutcome::error(HttpStatus::INTERNAL_SERVER_ERROR, "Plugin failed")
            }
        }
    }

    fn meta(&self, client: &Client) -> ResponseMeta {
        ResponseMeta {
            port: self.cx.port,
            port_offset: 0,
            executor_id: Some(self.shared.id),
            exec_ms: client.exec_t0.elapsed().as_secs_f64() * 1000.0,
            nometas: client.flags.nometas,
        }
    }

    fn produce(&self, client: &mut Client, status: HttpStatus) -> Result<(), BufferError> {
        let meta = self.meta(client);
        client.response.produce(status, client.request.method, &meta)
    }

    /// Error body for the response media type; the connection stays usable.
    fn produce_failure(&self, client: &mut Client, outcome: PluginOutcome) -> Result<(), BufferError> {
        let status = if outcome.status.is_error() {
            outcome.status
        } else {
            HttpStatus::INTERNAL_SERVER_ERROR
        };
        tracing::debug!(client = client.id, status = status.code(), error = ?outcome.error, "request failed in executor");
        client.response.prepare_body_error(outcome.error.as_deref())?;
        self.produce(client, status)
    }
}
