// src/response.rs
//! Response framing.
//!
//! A response is two ring buffers: `stream` carries the status line and
//! headers, `content` the body. Headers are produced only after the body is
//! complete so Content-Length is exact. The `X-Vgx-Backlog` header is
//! written as a fixed-width `0000` placeholder whose offset is remembered;
//! the I/O thread patches it with the in-flight request count at collection
//! time without re-serializing anything.

use crate::buffer::{BufferError, StreamBuffer};
use crate::http::{HttpStatus, MediaType, Method};
use std::fmt::Write as _;

pub const SEND_CHUNK_ORDER: u32 = 13;

const BODY_OK_PREWRAP: &[u8] = b"{\"status\": \"OK\", \"response\": ";
const BODY_ERROR_PREWRAP: &[u8] = b"{\"status\": \"ERROR\", \"message\": ";
const BACKLOG_HEADER: &[u8] = b"X-Vgx-Backlog: 0000\r\n";
const BACKLOG_VALUE_OFFSET: usize = 15;
const COMMON_HEADERS: &[u8] =
    b"Server: VGX/3\r\nConnection: keep-Alive\r\nAccess-Control-Allow-Origin: *\r\n";

/// Execution details appended to a wrapped JSON body.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseMeta {
    pub port: u16,
    pub port_offset: u16,
    pub executor_id: Option<usize>,
    pub exec_ms: f64,
    pub nometas: bool,
}

pub struct Response {
    pub stream: StreamBuffer,
    pub content: StreamBuffer,
    /// Status of the last produced head.
    pub status: HttpStatus,
    /// Error to produce once the client is collected.
    pub pending_error: HttpStatus,
    pub mediatype: MediaType,
    pub allowed: &'static [Method],
    pub content_length: usize,
    pub exec_ns: u64,
    backlog_offset: Option<usize>,
    prewrapped: bool,
}

impl Response {
    pub fn new() -> Result<Self, BufferError> {
        Ok(Self {
            stream: StreamBuffer::new(SEND_CHUNK_ORDER)?,
            content: StreamBuffer::new(SEND_CHUNK_ORDER)?,
            status: HttpStatus::NONE,
            pending_error: HttpStatus::NONE,
            mediatype: MediaType::None,
            allowed: &[],
            content_length: 0,
            exec_ns: 0,
            backlog_offset: None,
            prewrapped: false,
        })
    }

    pub fn reset(&mut self) {
        self.stream.clear();
        self.content.clear();
        self.status = HttpStatus::NONE;
        self.pending_error = HttpStatus::NONE;
        self.mediatype = MediaType::None;
        self.allowed = &[];
        self.content_length = 0;
        self.exec_ns = 0;
        self.backlog_offset = None;
        self.prewrapped = false;
    }

    /// True while framing or body bytes remain to be sent.
    #[inline(always)]
    pub fn has_output(&self) -> bool {
        self.stream.is_readable() || self.content.is_readable()
    }

    #[inline(always)]
    pub fn is_prewrapped(&self) -> bool {
        self.prewrapped
    }

    pub fn clear_body(&mut self) {
        self.content.clear();
        self.prewrapped = false;
    }

    /// Open the JSON success wrapper. The caller then writes the value.
    pub fn prepare_body(&mut self) -> Result<(), BufferError> {
        if self.mediatype == MediaType::Json && !self.prewrapped {
            self.content.write(BODY_OK_PREWRAP)?;
            self.prewrapped = true;
        }
        Ok(())
    }

    fn complete_body(&mut self, meta: &ResponseMeta) -> Result<(), BufferError> {
        let mut tail = String::with_capacity(128);
        if !meta.nometas {
            let exec_id = meta.executor_id.map(|id| id as i64).unwrap_or(-1);
            let _ = write!(tail, ", \"port\": [{}, {}]", meta.port, meta.port_offset);
            let _ = write!(tail, ", \"exec_id\": {}", exec_id);
        }
        tail.push_str(", \"level\": 0, \"partitions\": null");
        let _ = write!(tail, ", \"exec_ms\": {:.3}", meta.exec_ms);
        tail.push('}');
        self.content.write(tail.as_bytes())?;
        Ok(())
    }

    /// Replace the body with an error document for the current media type.
    pub fn prepare_body_error(&mut self, message: Option<&str>) -> Result<(), BufferError> {
        self.content.clear();
        self.prewrapped = false;
        let message = message.unwrap_or("unknown error");
        match self.mediatype {
            MediaType::Json => {
                self.content.write(BODY_ERROR_PREWRAP)?;
                if is_json_literal(message) {
                    self.content.write(message.as_bytes())?;
                } else {
                    self.content.write(json_string(message).as_bytes())?;
                }
                self.content.write(b"}")?;
            }
            _ => {
                self.content.write(b"ERROR: ")?;
                self.content.write(message.as_bytes())?;
            }
        }
        Ok(())
    }

    /// Write status line and headers for the current body.
    ///
    /// A 200 JSON response gets its wrapper completed (or created, when the
    /// body is empty) with the execution metas.
    pub fn produce(&mut self, status: HttpStatus, method: Method, meta: &ResponseMeta) -> Result<(), BufferError> {
        if status == HttpStatus::OK && self.mediatype == MediaType::Json && method != Method::Options {
            if self.content.is_empty() {
                self.prepare_body()?;
                self.content.write(b"null")?;
            }
            if self.prewrapped {
                self.complete_body(meta)?;
                self.prewrapped = false;
            }
        }
        self.write_head(status, method)
    }

    /// Produce an error response. A message replaces the body with
    /// `"<code> <message>"`, quoted for JSON.
    pub fn produce_error(&mut self, status: HttpStatus, message: Option<&str>, method: Method) -> Result<(), BufferError> {
        if let Some(message) = message {
            self.content.clear();
            self.prewrapped = false;
            let text = format!("{:03} {}", status.code(), message);
            if self.mediatype == MediaType::Json {
                self.content.write(json_string(&text).as_bytes())?;
            } else {
                self.content.write(text.as_bytes())?;
            }
        }
        self.write_head(status, method)
    }

    fn write_head(&mut self, status: HttpStatus, method: Method) -> Result<(), BufferError> {
        self.stream.clear();
        self.status = status;

        let mut head = String::with_capacity(256);
        let _ = write!(head, "HTTP/1.1 {} {}\r\n", status.code(), status.reason());
        let backlog_offset = head.len() + BACKLOG_VALUE_OFFSET;
        self.stream.write(head.as_bytes())?;
        self.stream.write(BACKLOG_HEADER)?;
        head.clear();

        // HEAD keeps the Content-Length of the body it drops
        let content_length = self.content.size();
        match method {
            Method::Head => self.content.clear(),
            Method::Options => {
                head.push_str("Allowed: OPTIONS");
                for m in self.allowed {
                    let _ = write!(head, ", {}", m);
                }
                head.push_str("\r\n");
            }
            _ => {}
        }
        self.stream.write(head.as_bytes())?;
        self.stream.write(COMMON_HEADERS)?;

        if content_length > 0 {
            head.clear();
            let mediatype = match self.mediatype {
                MediaType::None | MediaType::Any => MediaType::Text,
                mt => mt,
            };
            let _ = write!(head, "Content-Type: {}\r\nContent-Length: {}\r\n", mediatype, content_length);
            self.stream.write(head.as_bytes())?;
        }
        self.stream.write(b"\r\n")?;

        self.content_length = content_length;
        self.backlog_offset = Some(backlog_offset);
        Ok(())
    }

    /// Patch the backlog placeholder with `backlog` as four hex digits.
    pub fn set_backlog(&mut self, backlog: usize) -> bool {
        let Some(offset) = self.backlog_offset.take() else {
            return false;
        };
        let word = format!("{:04X}", backlog.min(0xffff));
        self.stream.overwrite(offset, word.as_bytes())
    }

    /// Trim idle buffers back toward their default allocation.
    pub fn trim(&mut self, max: usize) {
        for buffer in [&mut self.stream, &mut self.content] {
            if let Err(e) = buffer.trim(max) {
                tracing::debug!(error = %e, "response buffer kept at current size");
            }
        }
    }
}

fn is_json_literal(message: &str) -> bool {
    let bytes = message.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(b'{'), Some(b'}')) | (Some(b'['), Some(b']')) => true,
        (Some(b'"'), Some(b'"')) => bytes.len() >= 2,
        _ => false,
    }
}

fn json_string(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| String::from("\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(buf: &StreamBuffer) -> String {
        String::from_utf8(buf.to_vec()).unwrap()
    }

    fn json_response() -> Response {
        let mut response = Response::new().unwrap();
        response.mediatype = MediaType::Json;
        response
    }

    #[test]
    fn test_ok_json_is_wrapped_with_metas() {
        let mut response = json_response();
        response.prepare_body().unwrap();
        response.content.write(b"[1, 2]").unwrap();
        let meta = ResponseMeta {
            port: 9000,
            executor_id: Some(3),
            exec_ms: 1.5,
            ..Default::default()
        };
        response.produce(HttpStatus::OK, Method::Get, &meta).unwrap();

        let body = text(&response.content);
        let doc: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(doc["status"], "OK");
        assert_eq!(doc["response"], serde_json::json!([1, 2]));
        assert_eq!(doc["port"], serde_json::json!([9000, 0]));
        assert_eq!(doc["exec_id"], 3);
        assert_eq!(doc["level"], 0);
        assert!(doc["partitions"].is_null());
        assert_eq!(doc["exec_ms"], 1.5);

        let head = text(&response.stream);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\nX-Vgx-Backlog: 0000\r\n"));
        assert!(head.contains("Server: VGX/3\r\nConnection: keep-Alive\r\nAccess-Control-Allow-Origin: *\r\n"));
        assert!(head.contains("Content-Type: application/json\r\n"));
        assert!(head.contains(&format!("Content-Length: {}\r\n", body.len())));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_empty_ok_json_gets_null_response() {
        let mut response = json_response();
        let meta = ResponseMeta { nometas: true, ..Default::default() };
        response.produce(HttpStatus::OK, Method::Get, &meta).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text(&response.content)).unwrap();
        assert!(doc["response"].is_null());
        assert!(doc.get("port").is_none());
    }

    #[test]
    fn test_backlog_placeholder_is_patched() {
        let mut response = json_response();
        response.produce_error(HttpStatus::BAD_REQUEST, Some("bad"), Method::Get).unwrap();
        assert!(response.set_backlog(0x2a));
        assert!(text(&response.stream).starts_with("HTTP/1.1 400 Bad Request\r\nX-Vgx-Backlog: 002A\r\n"));
        // Only once per produced head
        assert!(!response.set_backlog(1));
    }

    #[test]
    fn test_error_messages_per_media_type() {
        let mut response = json_response();
        response.produce_error(HttpStatus::SERVICE_UNAVAILABLE, Some("Service out"), Method::Get).unwrap();
        assert_eq!(text(&response.content), "\"503 Service out\"");

        let mut response = Response::new().unwrap();
        response.mediatype = MediaType::Text;
        response.produce_error(HttpStatus::URI_TOO_LONG, Some("Line too long"), Method::Get).unwrap();
        assert_eq!(text(&response.content), "414 Line too long");
        assert!(text(&response.stream).contains("Content-Type: text/plain\r\n"));
    }

    #[test]
    fn test_body_error_quoting() {
        let mut response = json_response();
        response.prepare_body_error(Some("no such vertex")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text(&response.content)).unwrap();
        assert_eq!(doc["message"], "no such vertex");

        response.prepare_body_error(Some("{\"code\": 7}")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text(&response.content)).unwrap();
        assert_eq!(doc["message"]["code"], 7);

        let mut response = Response::new().unwrap();
        response.mediatype = MediaType::Text;
        response.prepare_body_error(Some("boom")).unwrap();
        assert_eq!(text(&response.content), "ERROR: boom");
    }

    #[test]
    fn test_head_drops_body_keeps_length() {
        let mut response = Response::new().unwrap();
        response.mediatype = MediaType::Text;
        response.content.write(b"hello").unwrap();
        response.produce(HttpStatus::OK, Method::Head, &ResponseMeta::default()).unwrap();
        assert!(response.content.is_empty());
        assert!(text(&response.stream).contains("Content-Length: 5\r\n"));
    }

    #[test]
    fn test_options_lists_allowed_methods() {
        let mut response = json_response();
        response.allowed = &[Method::Get, Method::Post];
        response.produce(HttpStatus::OK, Method::Options, &ResponseMeta::default()).unwrap();
        let head = text(&response.stream);
        assert!(head.contains("Allowed: OPTIONS, GET, POST\r\n"));
        assert!(!head.contains("Content-Length"));
    }
}
