// src/request.rs
//! Incremental request state machine.
//!
//! [`handle`] is called whenever bytes have arrived for a connection, or when
//! a yielded connection is revisited. It consumes as much of the buffered
//! request as it can and reports whether the request is ready for dispatch,
//! needs more input, or failed. Every call resumes from `client.state`, so a
//! request split across any number of reads parses the same as one read.

use crate::buffer::{BufferError, StreamBuffer};
use crate::client::{Client, ClientState};
use crate::error::ParseError;
use crate::http::{HTTP_LINE_MAX, HTTP_MAX_HEADERS, HttpStatus, MediaType, Method};
use crate::parser::{self, HeaderLine, RequestLine};
use crate::registry::{Registry, RouteKind};
use crate::service::ServiceState;
use arrayvec::ArrayVec;
use std::time::Instant;

pub const REQUEST_STREAM_ORDER: u32 = 10;
pub const REQUEST_CONTENT_ORDER: u32 = 13;
/// Bound on buffered request framing, pipelined requests included.
pub const REQUEST_STREAM_MAX: usize = 16 * HTTP_LINE_MAX;

const MULTIPART_ACCEPT: &[u8] = b"Accept: application/x-vgx-partial\r\n";

/// Raw header lines kept for forwarding.
#[derive(Debug, Default)]
pub struct Headers {
    lines: ArrayVec<String, HTTP_MAX_HEADERS>,
}

impl Headers {
    pub fn add(&mut self, line: &[u8]) -> Result<(), ParseError> {
        if self.lines.is_full() {
            return Err(ParseError::TooManyHeaders);
        }
        let line = String::from_utf8_lossy(line).into_owned();
        self.lines.push(line);
        Ok(())
    }

    /// Lookup by case-insensitive name. Returns the trimmed value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

pub struct Request {
    /// Framing bytes as read off the socket, possibly holding pipelined requests.
    pub stream: StreamBuffer,
    pub content: StreamBuffer,
    line: Box<[u8]>,
    pub method: Method,
    pub path: String,
    pub version: (u8, u8),
    pub headers: Headers,
    pub accept: MediaType,
    pub content_type: MediaType,
    pub content_length: usize,
    /// Start of the body in `content`. Bytes before it are forwarded framing.
    pub content_offset: usize,
    /// Partial index whose result answers this request, if any.
    pub target_partial: Option<u32>,
    pub min_executor: u8,
    pub bypass_sout: bool,
    /// Executor that fetched this request.
    pub executor_id: Option<usize>,
}

impl Request {
    pub fn new() -> Result<Self, BufferError> {
        Ok(Self {
            stream: StreamBuffer::new(REQUEST_STREAM_ORDER)?,
            content: StreamBuffer::new(REQUEST_CONTENT_ORDER)?,
            line: vec![0u8; HTTP_LINE_MAX].into_boxed_slice(),
            method: Method::None,
            path: String::new(),
            version: (0, 0),
            headers: Headers::default(),
            accept: MediaType::Any,
            content_type: MediaType::None,
            content_length: 0,
            content_offset: 0,
            target_partial: None,
            min_executor: 0,
            bypass_sout: false,
            executor_id: None,
        })
    }

    /// Clear everything but the framing stream.
    pub fn reset(&mut self) {
        self.content.clear();
        self.method = Method::None;
        self.path.clear();
        self.version = (0, 0);
        self.headers.clear();
        self.accept = MediaType::Any;
        self.content_type = MediaType::None;
        self.content_length = 0;
        self.content_offset = 0;
        self.target_partial = None;
        self.min_executor = 0;
        self.bypass_sout = false;
        self.executor_id = None;
    }

    /// Shrink grown buffers back to their initial allocation.
    pub fn trim(&mut self) {
        let defaults = [
            (&mut self.stream, REQUEST_STREAM_ORDER),
            (&mut self.content, REQUEST_CONTENT_ORDER),
        ];
        for (buffer, order) in defaults {
            if let Err(e) = buffer.trim((1 << order) - 1) {
                tracing::debug!(error = %e, "request buffer kept at current size");
            }
        }
    }

    /// Body bytes still expected.
    #[inline(always)]
    pub fn unfilled(&self) -> usize {
        let buffered = self.content.size().saturating_sub(self.content_offset);
        self.content_length.saturating_sub(buffered)
    }

    /// The request body, after any forwarded framing.
    pub fn body(&self) -> &[u8] {
        match self.content.as_single_segment() {
            Some(bytes) if self.content_offset <= bytes.len() => &bytes[self.content_offset..],
            _ => &[],
        }
    }

    fn read_line(&mut self) -> Result<usize, Failure> {
        match self.stream.read_until(&mut self.line, HTTP_LINE_MAX, b'\n') {
            Ok(0) if self.stream.size() >= HTTP_LINE_MAX => Err(ParseError::LineTooLong.into()),
            Ok(n) => Ok(n),
            Err(_) => Err(Failure::INTERNAL),
        }
    }

    #[inline(always)]
    fn line(&self, n: usize) -> &[u8] {
        &self.line[..n]
    }
}

/// What the caller does next with the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Wait for more bytes from the socket.
    Incomplete,
    /// Revisit later; more requests may already be buffered.
    Yielded,
    /// The request is complete and in `HandleRequest`.
    Dispatch,
    /// An error response was produced.
    Error,
}

/// Server-wide facts the state machine consults.
pub struct HandleContext<'a> {
    pub registry: &'a Registry,
    pub admin: bool,
    pub service: ServiceState,
    pub matrix_enabled: bool,
    pub multi_partial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Failure(HttpStatus, &'static str);

impl Failure {
    const INTERNAL: Failure = Failure(HttpStatus::INTERNAL_SERVER_ERROR, "Internal error");
    const MEMORY: Failure = Failure(HttpStatus::INTERNAL_SERVER_ERROR, "Out of memory");
    const SERVICE_OUT: Failure = Failure(HttpStatus::SERVICE_UNAVAILABLE, "Service out");
    const STATE: Failure = Failure(HttpStatus::INTERNAL_SERVER_ERROR, "Request state machine error");
}

impl From<ParseError> for Failure {
    fn from(e: ParseError) -> Self {
        let message = match e {
            ParseError::BadRequest(message) => message,
            ParseError::VersionNotSupported => "HTTP version not supported",
            ParseError::LineTooLong => "Request line too long",
            ParseError::TooManyHeaders => "Too many headers",
            ParseError::Incomplete => "Incomplete request",
        };
        Failure(e.status_code(), message)
    }
}

impl From<BufferError> for Failure {
    fn from(_: BufferError) -> Self {
        Failure::MEMORY
    }
}

/// Advance the request state machine as far as buffered bytes allow.
pub fn handle(client: &mut Client, cx: &HandleContext<'_>) -> HandleOutcome {
    match step(client, cx) {
        Ok(HandleOutcome::Incomplete) => {
            client.yielded = false;
            HandleOutcome::Incomplete
        }
        Ok(outcome) => outcome,
        Err(Failure(status, message)) => {
            client.fail(status, message);
            HandleOutcome::Error
        }
    }
}

fn step(client: &mut Client, cx: &HandleContext<'_>) -> Result<HandleOutcome, Failure> {
    loop {
        match client.state {
            ClientState::Ready => {
                let now = Instant::now();
                client.io_t0 = now;
                client.exec_t0 = now;
                client.state = ClientState::ExpectInitial;
            }
            ClientState::ExpectInitial => {
                let n = client.request.read_line()?;
                if n == 0 {
                    return Ok(HandleOutcome::Incomplete);
                }
                if expect_initial(client, cx, n)? {
                    return Ok(HandleOutcome::Yielded);
                }
            }
            ClientState::ExpectHeaders => {
                if !expect_headers(client, cx)? {
                    return Ok(HandleOutcome::Incomplete);
                }
                if !service_allows(client, cx) {
                    return Err(Failure::SERVICE_OUT);
                }
                client.request.content_offset = client.request.content.size();
            }
            ClientState::ExpectContent => {
                let request = &mut client.request;
                let unfilled = request.unfilled();
                if unfilled > 0 {
                    if request.stream.is_empty() {
                        return Ok(HandleOutcome::Incomplete);
                    }
                    request.content.absorb(&mut request.stream, unfilled)?;
                    if request.unfilled() > 0 {
                        return Ok(HandleOutcome::Incomplete);
                    }
                }
                client.state = ClientState::HandleRequest;
                client.yielded = false;
                return Ok(HandleOutcome::Dispatch);
            }
            _ => return Err(Failure::STATE),
        }
    }
}

/// Parse the request line. Returns `true` when the connection should yield.
fn expect_initial(client: &mut Client, cx: &HandleContext<'_>, n: usize) -> Result<bool, Failure> {
    let request = &mut client.request;
    match parser::parse_request_line(&request.line[..n])? {
        RequestLine::Ident(ident) => {
            tracing::debug!(client = client.id, ?ident, "partial identity");
            client.ident = Some(ident);
            request.version = (1, 1);
            client.state = ClientState::Ready;
            client.yielded = true;
            return Ok(true);
        }
        RequestLine::Request { method, path, version } => {
            request.method = method;
            request.version = version;
            request.path.clear();
            request.path.push_str(path);
        }
    }

    client.route = cx.registry.route(&request.path);
    let hc = client.route.is_health_check();
    client.flags.nometrics = hc;
    client.flags.nometas = hc;

    if cx.matrix_enabled && client.route.is_plugin() {
        let phases = client.route.phases;
        client.flags.direct = !phases.has_pre();
        client.flags.multipart = cx.multi_partial || phases.has_any_processor();
        if client.flags.multipart {
            request.headers.add(MULTIPART_ACCEPT)?;
        }
        if client.flags.direct {
            request.content.write(&request.line[..n])?;
        }
    }

    tracing::trace!(client = client.id, method = %request.method, path = %request.path, "request line");
    client.state = ClientState::ExpectHeaders;
    Ok(false)
}

/// Consume header lines. Returns `true` once the blank line was seen.
fn expect_headers(client: &mut Client, cx: &HandleContext<'_>) -> Result<bool, Failure> {
    let multipart = client.flags.multipart;
    let direct = client.flags.direct;
    let request = &mut client.request;
    loop {
        let n = request.read_line()?;
        if n == 0 {
            return Ok(false);
        }
        let header = parser::parse_header_line(request.line(n), cx.admin)?;
        match header {
            HeaderLine::End => {
                if direct {
                    request.content.write(b"\r\n")?;
                }
                break;
            }
            HeaderLine::Accept(mediatype) => {
                request.accept = mediatype;
                if multipart {
                    continue;
                }
            }
            HeaderLine::ContentType(mediatype) => request.content_type = mediatype,
            HeaderLine::ContentLength(length) => request.content_length = length,
            HeaderLine::PartialTarget(target) => {
                request.target_partial = u32::try_from(target).ok();
            }
            HeaderLine::MinExecutor(min) => request.min_executor = min,
            HeaderLine::BypassServiceOut(bypass) => request.bypass_sout = bypass,
            HeaderLine::Other => {}
        }
        request.headers.add(&request.line[..n])?;
        if direct {
            request.content.write(&request.line[..n])?;
        }
    }

    if multipart {
        request.accept = MediaType::XVgxPartial;
    }
    client.response.mediatype = match request.accept {
        MediaType::XVgxPartial => MediaType::XVgxPartial,
        MediaType::Json => MediaType::Json,
        MediaType::Text => MediaType::Text,
        _ => client.route.suffix_type.unwrap_or(MediaType::Json),
    };
    client.response.allowed = client.route.allowed_methods();
    client.state = ClientState::ExpectContent;
    Ok(true)
}

fn service_allows(client: &Client, cx: &HandleContext<'_>) -> bool {
    match cx.service {
        ServiceState::Serving => true,
        ServiceState::Suspended => false,
        ServiceState::ServiceOut => {
            let hc = client.route.is_health_check();
            if cx.admin && !hc {
                return true;
            }
            if client.request.executor_id.is_some() || client.request.bypass_sout {
                return true;
            }
            if hc {
                return false;
            }
            !matches!(client.route.kind, RouteKind::Plugin | RouteKind::Builtin)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PluginOutcome, PluginPhases, QueryParams, RequestView, ResponseSink};

    fn noop(_: &str, _: bool, _: &QueryParams, _: &RequestView<'_>, _: &mut ResponseSink<'_>) -> PluginOutcome {
        PluginOutcome::ok()
    }

    fn registry() -> Registry {
        Registry::builder()
            .plugin("myplugin", PluginPhases::NONE, noop)
            .plugin("search", PluginPhases::PRE, noop)
            .build()
    }

    fn context(registry: &Registry) -> HandleContext<'_> {
        HandleContext {
            registry,
            admin: false,
            service: ServiceState::Serving,
            matrix_enabled: false,
            multi_partial: false,
        }
    }

    fn ready_client() -> Client {
        let mut client = Client::new(2).unwrap();
        client.state = ClientState::Ready;
        client
    }

    fn feed(client: &mut Client, cx: &HandleContext<'_>, bytes: &[u8]) -> HandleOutcome {
        client.request.stream.write(bytes).unwrap();
        handle(client, cx)
    }

    fn text(buf: &StreamBuffer) -> String {
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn test_single_read_request() {
        let registry = registry();
        let cx = context(&registry);
        let mut client = ready_client();
        let outcome = feed(&mut client, &cx, b"GET /vgx/hc HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(outcome, HandleOutcome::Dispatch);
        assert_eq!(client.state, ClientState::HandleRequest);
        assert_eq!(client.request.method, Method::Get);
        assert_eq!(client.request.path, "/vgx/hc");
        assert_eq!(client.request.version, (1, 1));
        assert_eq!(client.request.headers.get("host"), Some("x"));
        assert!(client.flags.nometrics);
        assert_eq!(client.response.mediatype, MediaType::Json);
    }

    #[test]
    fn test_byte_at_a_time_matches_single_read() {
        let registry = registry();
        let cx = context(&registry);
        let mut client = ready_client();
        let request = b"POST /vgx/plugin/myplugin?x=1 HTTP/1.0\r\nContent-Length: 3\r\n\r\nabc";
        let mut last = HandleOutcome::Incomplete;
        for (i, byte) in request.iter().enumerate() {
            last = feed(&mut client, &cx, std::slice::from_ref(byte));
            if i + 1 < request.len() {
                assert_eq!(last, HandleOutcome::Incomplete, "early outcome at byte {}", i);
            }
        }
        assert_eq!(last, HandleOutcome::Dispatch);
        assert_eq!(client.request.method, Method::Post);
        assert_eq!(client.request.path, "/vgx/plugin/myplugin?x=1");
        assert_eq!(client.request.version, (1, 0));
        assert_eq!(client.request.body(), b"abc");
        assert_eq!(client.route.name, "myplugin");
    }

    #[test]
    fn test_split_body_waits_for_content() {
        let registry = registry();
        let cx = context(&registry);
        let mut client = ready_client();
        let outcome = feed(&mut client, &cx, b"POST /vgx/plugin/myplugin HTTP/1.1\r\nContent-Length: 5\r\n\r\n");
        assert_eq!(outcome, HandleOutcome::Incomplete);
        assert_eq!(client.state, ClientState::ExpectContent);
        assert_eq!(client.request.unfilled(), 5);

        // The I/O thread receives body bytes straight into content
        client.request.content.write(b"hel").unwrap();
        assert_eq!(handle(&mut client, &cx), HandleOutcome::Incomplete);
        client.request.content.write(b"lo").unwrap();
        assert_eq!(handle(&mut client, &cx), HandleOutcome::Dispatch);
        assert_eq!(client.request.body(), b"hello");
    }

    #[test]
    fn test_pipelined_bytes_stay_in_stream() {
        let registry = registry();
        let cx = context(&registry);
        let mut client = ready_client();
        let outcome = feed(
            &mut client,
            &cx,
            b"POST /vgx/plugin/myplugin HTTP/1.1\r\nContent-Length: 2\r\n\r\nokGET /vgx/hc HTTP/1.1\r\n\r\n",
        );
        assert_eq!(outcome, HandleOutcome::Dispatch);
        assert_eq!(client.request.body(), b"ok");
        assert_eq!(text(&client.request.stream), "GET /vgx/hc HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn test_overlong_line_is_rejected() {
        let registry = registry();
        let cx = context(&registry);
        let mut client = ready_client();
        let mut line = b"GET /".to_vec();
        line.extend(std::iter::repeat_n(b'a', HTTP_LINE_MAX));
        assert_eq!(feed(&mut client, &cx, &line), HandleOutcome::Error);
        assert!(client.error);
        assert_eq!(client.response.status, HttpStatus::URI_TOO_LONG);
    }

    #[test]
    fn test_bad_request_line() {
        let registry = registry();
        let cx = context(&registry);
        let mut client = ready_client();
        assert_eq!(feed(&mut client, &cx, b"BREW /pot HTTP/1.1\r\n"), HandleOutcome::Error);
        assert_eq!(client.response.status, HttpStatus::BAD_REQUEST);
        assert!(text(&client.response.content).contains("400 Invalid HTTP request line"));

        let mut client = ready_client();
        assert_eq!(feed(&mut client, &cx, b"GET / HTTP/3.0\r\n"), HandleOutcome::Error);
        assert_eq!(client.response.status, HttpStatus::HTTP_VERSION_NOT_SUPPORTED);
    }

    #[test]
    fn test_ident_yields_without_response() {
        let registry = registry();
        let cx = context(&registry);
        let mut client = ready_client();
        let outcome = feed(&mut client, &cx, b"XVGXIDENT 2 1 1 0 0 3 1\r\nGET /vgx/hc HTTP/1.1\r\n\r\n");
        assert_eq!(outcome, HandleOutcome::Yielded);
        assert!(client.yielded);
        assert_eq!(client.state, ClientState::Ready);
        assert_eq!(client.ident.map(|i| i.channel), Some(3));
        assert!(!client.has_output());

        assert_eq!(handle(&mut client, &cx), HandleOutcome::Dispatch);
        assert!(!client.yielded);
    }

    #[test]
    fn test_service_out_rules() {
        let registry = registry();
        let mut cx = context(&registry);
        cx.service = ServiceState::ServiceOut;

        let mut client = ready_client();
        assert_eq!(feed(&mut client, &cx, b"GET /vgx/plugin/myplugin HTTP/1.1\r\n\r\n"), HandleOutcome::Error);
        assert_eq!(client.response.status, HttpStatus::SERVICE_UNAVAILABLE);

        let mut client = ready_client();
        assert_eq!(feed(&mut client, &cx, b"GET /vgx/hc HTTP/1.1\r\n\r\n"), HandleOutcome::Error);

        let mut client = ready_client();
        let bypass = b"GET /vgx/plugin/myplugin HTTP/1.1\r\nx-vgx-bypass-sout: 1\r\n\r\n";
        assert_eq!(feed(&mut client, &cx, bypass), HandleOutcome::Dispatch);

        cx.admin = true;
        let mut client = ready_client();
        assert_eq!(feed(&mut client, &cx, b"GET /vgx/plugin/myplugin HTTP/1.1\r\n\r\n"), HandleOutcome::Dispatch);
        let mut client = ready_client();
        assert_eq!(feed(&mut client, &cx, b"GET /vgx/hc HTTP/1.1\r\n\r\n"), HandleOutcome::Error);

        cx.service = ServiceState::Suspended;
        let mut client = ready_client();
        assert_eq!(feed(&mut client, &cx, bypass), HandleOutcome::Error);
    }

    #[test]
    fn test_service_out_admits_request_with_executor() {
        let registry = registry();
        let mut cx = context(&registry);
        cx.service = ServiceState::ServiceOut;

        let mut client = ready_client();
        client.request.executor_id = Some(1);
        let request = b"POST /vgx/plugin/myplugin HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi";
        assert_eq!(feed(&mut client, &cx, request), HandleOutcome::Dispatch);
        assert!(!client.error);

        // Takes precedence over the health check refusal
        let mut client = ready_client();
        client.request.executor_id = Some(1);
        assert_eq!(feed(&mut client, &cx, b"GET /vgx/hc HTTP/1.1\r\n\r\n"), HandleOutcome::Dispatch);
    }

    #[test]
    fn test_direct_request_framing_goes_to_content() {
        let registry = registry();
        let mut cx = context(&registry);
        cx.matrix_enabled = true;
        let mut client = ready_client();
        let request = b"POST /vgx/plugin/myplugin HTTP/1.1\r\nAccept: text/plain\r\nContent-Length: 2\r\n\r\nhi";
        assert_eq!(feed(&mut client, &cx, request), HandleOutcome::Dispatch);
        assert!(client.flags.direct);
        assert!(!client.flags.multipart);
        assert_eq!(
            text(&client.request.content),
            "POST /vgx/plugin/myplugin HTTP/1.1\r\nAccept: text/plain\r\nContent-Length: 2\r\n\r\nhi"
        );
        assert_eq!(client.request.body(), b"hi");
        assert_eq!(client.response.mediatype, MediaType::Text);
    }

    #[test]
    fn test_multipart_forces_partial_accept() {
        let registry = registry();
        let mut cx = context(&registry);
        cx.matrix_enabled = true;
        let mut client = ready_client();
        let request = b"GET /vgx/plugin/search HTTP/1.1\r\nAccept: application/json\r\n\r\n";
        assert_eq!(feed(&mut client, &cx, request), HandleOutcome::Dispatch);
        assert!(!client.flags.direct);
        assert!(client.flags.multipart);
        assert_eq!(client.request.accept, MediaType::XVgxPartial);
        assert_eq!(client.response.mediatype, MediaType::XVgxPartial);
        let raw: Vec<&str> = client.request.headers.iter().collect();
        assert_eq!(raw, vec!["Accept: application/x-vgx-partial\r\n"]);
    }

    #[test]
    fn test_headers_overflow() {
        let registry = registry();
        let cx = context(&registry);
        let mut client = ready_client();
        let mut request = b"GET /vgx/hc HTTP/1.1\r\n".to_vec();
        for i in 0..=HTTP_MAX_HEADERS {
            request.extend_from_slice(format!("X-Filler-{}: {}\r\n", i, i).as_bytes());
        }
        request.extend_from_slice(b"\r\n");
        assert_eq!(feed(&mut client, &cx, &request), HandleOutcome::Error);
        assert_eq!(client.response.status, HttpStatus::REQUEST_HEADER_FIELDS_TOO_LARGE);
    }

    #[test]
    fn test_unexpected_state_is_internal_error() {
        let registry = registry();
        let cx = context(&registry);
        let mut client = ready_client();
        client.state = ClientState::Collected;
        assert_eq!(handle(&mut client, &cx), HandleOutcome::Error);
        assert_eq!(client.response.status, HttpStatus::INTERNAL_SERVER_ERROR);
    }
}
