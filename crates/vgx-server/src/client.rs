// src/client.rs
use crate::buffer::BufferError;
use crate::http::HttpStatus;
use crate::matrix::MatrixLink;
use crate::parser::PartialIdent;
use crate::registry::{RequestView, Route};
use crate::request::Request;
use crate::response::Response;
use std::net::SocketAddr;
use std::time::Instant;

/// Connection lifecycle. The I/O thread owns every state except the executor
/// subset, which only an executor holding the client may set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ClientState {
    #[default]
    Reset = 0,
    Ready = 1,
    ExpectInitial = 2,
    ExpectHeaders = 3,
    ExpectContent = 4,
    HandleRequest = 5,
    AwaitDispatch = 6,
    Dispatch = 7,
    DispatchComplete = 8,
    // Executor states
    Preprocess = 9,
    Execute = 10,
    Merge = 11,
    Postprocess = 12,
    Resubmit = 13,
    // Back on the I/O thread
    Collected = 14,
    ResponseComplete = 15,
}

impl ClientState {
    #[inline(always)]
    pub fn is_executor_state(&self) -> bool {
        matches!(
            self,
            ClientState::Preprocess
                | ClientState::Execute
                | ClientState::Merge
                | ClientState::Postprocess
                | ClientState::Resubmit
        )
    }

    /// Still reading request framing.
    #[inline(always)]
    pub fn is_pre_content(&self) -> bool {
        matches!(
            self,
            ClientState::Ready | ClientState::ExpectInitial | ClientState::ExpectHeaders
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientFlags {
    /// Forwarded straight to the backend matrix without preprocessing.
    pub direct: bool,
    /// Response is assembled from partial results.
    pub multipart: bool,
    pub nometrics: bool,
    pub nometas: bool,
}

pub struct Client {
    pub id: usize,
    pub peer: Option<SocketAddr>,
    pub state: ClientState,
    pub error: bool,
    pub yielded: bool,
    /// The executor produced the final response during preprocessing.
    pub complete: bool,
    pub flags: ClientFlags,
    pub route: Route,
    pub ident: Option<PartialIdent>,
    pub request: Request,
    pub response: Response,
    pub matrix: MatrixLink,
    pub io_t0: Instant,
    pub exec_t0: Instant,
    /// Time spent on the I/O thread before dispatch.
    pub dispatch_ns: u64,
    pub nresubmit: u32,
}

impl Client {
    pub fn new(id: usize) -> Result<Self, BufferError> {
        let now = Instant::now();
        Ok(Self {
            id,
            peer: None,
            state: ClientState::Reset,
            error: false,
            yielded: false,
            complete: false,
            flags: ClientFlags::default(),
            route: Route::default(),
            ident: None,
            request: Request::new()?,
            response: Response::new()?,
            matrix: MatrixLink::default(),
            io_t0: now,
            exec_t0: now,
            dispatch_ns: 0,
            nresubmit: 0,
        })
    }

    /// Prepare for the next request on this connection. Pipelined bytes in
    /// the request stream are kept.
    pub fn reset_exchange(&mut self) {
        self.request.reset();
        self.response.reset();
        self.error = false;
        self.complete = false;
        self.flags = ClientFlags::default();
        self.route = Route::default();
        self.matrix = MatrixLink::default();
        self.dispatch_ns = 0;
        self.nresubmit = 0;
        self.state = ClientState::Ready;
    }

    /// Mark the connection errored and produce an error response.
    pub fn fail(&mut self, status: HttpStatus, message: &str) {
        tracing::debug!(client = self.id, peer = ?self.peer, status = status.code(), reason = message, "request failed");
        self.error = true;
        if let Err(e) = self.response.produce_error(status, Some(message), self.request.method) {
            tracing::error!(client = self.id, error = %e, "failed to produce error response");
        }
    }

    #[inline(always)]
    pub fn has_output(&self) -> bool {
        self.response.has_output()
    }

    pub fn request_view(&self) -> RequestView<'_> {
        RequestView {
            method: self.request.method,
            path: &self.request.path,
            headers: &self.request.headers,
            content_type: self.request.content_type,
            content: self.request.body(),
            ident: self.ident,
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("error", &self.error)
            .field("path", &self.request.path)
            .finish()
    }
}
