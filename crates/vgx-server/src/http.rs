// src/http.rs
//! Protocol vocabulary shared by the parser, the executors and the response
//! builder: methods, status codes with reason phrases, and media types.

use std::fmt;

/// Line and path limits for request framing.
pub const HTTP_LINE_MAX: usize = 8192;
pub const HTTP_PATH_MAX: usize = HTTP_LINE_MAX - 21;
pub const HTTP_MAX_HEADERS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    None,
    Get,
    Head,
    Post,
    Put,
    Patch,
    Options,
    Delete,
    Connect,
    Trace,
    /// Partition/replica identification sent by trusted upstream peers.
    XVgxIdent,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::None => "",
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Trace => "TRACE",
            Method::XVgxIdent => "XVGXIDENT",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric HTTP status. `NONE` (0) means no status has been produced yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HttpStatus(pub u16);

impl HttpStatus {
    pub const NONE: HttpStatus = HttpStatus(0);
    pub const CONTINUE: HttpStatus = HttpStatus(100);
    pub const OK: HttpStatus = HttpStatus(200);
    pub const NO_CONTENT: HttpStatus = HttpStatus(204);
    pub const BAD_REQUEST: HttpStatus = HttpStatus(400);
    pub const FORBIDDEN: HttpStatus = HttpStatus(403);
    pub const NOT_FOUND: HttpStatus = HttpStatus(404);
    pub const METHOD_NOT_ALLOWED: HttpStatus = HttpStatus(405);
    pub const REQUEST_TIMEOUT: HttpStatus = HttpStatus(408);
    pub const PAYLOAD_TOO_LARGE: HttpStatus = HttpStatus(413);
    pub const URI_TOO_LONG: HttpStatus = HttpStatus(414);
    pub const TOO_MANY_REQUESTS: HttpStatus = HttpStatus(429);
    pub const REQUEST_HEADER_FIELDS_TOO_LARGE: HttpStatus = HttpStatus(431);
    pub const INTERNAL_SERVER_ERROR: HttpStatus = HttpStatus(500);
    pub const NOT_IMPLEMENTED: HttpStatus = HttpStatus(501);
    pub const BAD_GATEWAY: HttpStatus = HttpStatus(502);
    pub const SERVICE_UNAVAILABLE: HttpStatus = HttpStatus(503);
    pub const GATEWAY_TIMEOUT: HttpStatus = HttpStatus(504);
    pub const HTTP_VERSION_NOT_SUPPORTED: HttpStatus = HttpStatus(505);
    pub const LOOP_DETECTED: HttpStatus = HttpStatus(508);

    #[inline(always)]
    pub fn code(&self) -> u16 {
        self.0
    }

    #[inline(always)]
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn is_error(&self) -> bool {
        self.0 >= 400
    }

    pub fn reason(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            102 => "Processing",
            103 => "Early Hints",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            203 => "Non-Authoritative Information",
            204 => "No Content",
            205 => "Reset Content",
            206 => "Partial Content",
            207 => "Multi-Status",
            208 => "Already Reported",
            226 => "IM Used",
            300 => "Multiple Choices",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            305 => "Use Proxy",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            402 => "Payment Required",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            406 => "Not Acceptable",
            407 => "Proxy Authentication Required",
            408 => "Request Timeout",
            409 => "Conflict",
            410 => "Gone",
            411 => "Length Required",
            412 => "Precondition Failed",
            413 => "Payload Too Large",
            414 => "URI Too Long",
            415 => "Unsupported Media Type",
            416 => "Range Not Satisfiable",
            417 => "Expectation Failed",
            418 => "I'm a teapot",
            421 => "Misdirected Request",
            422 => "Unprocessable Entity",
            423 => "Locked",
            424 => "Failed Dependency",
            425 => "Too Early",
            426 => "Upgrade Required",
            428 => "Precondition Required",
            429 => "Too Many Requests",
            431 => "Request Header Fields Too Large",
            444 => "No Response",
            451 => "Unavailable For Legal Reasons",
            494 => "Request Header Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            506 => "Variant Also Negotiates",
            507 => "Insufficient Storage",
            508 => "Loop Detected",
            510 => "Not Extended",
            511 => "Network Authentication Required",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum MediaType {
    #[default]
    None = 0,
    Javascript = 0x1001,
    Json = 0x1002,
    Pdf = 0x1003,
    Xml = 0x1004,
    Octet = 0x1005,
    XVgxPartial = 0x1000_2001,
    Text = 0x4001,
    Css = 0x4002,
    Html = 0x4003,
    Image = 0x8000,
    Ico = 0x8001,
    Gif = 0x8002,
    Png = 0x8003,
    Jpg = 0x8004,
    Any = 0x7FFF_FFFF,
}

impl MediaType {
    pub fn mime(&self) -> &'static str {
        match self {
            MediaType::None => "",
            MediaType::Javascript => "application/javascript",
            MediaType::Json => "application/json",
            MediaType::Pdf => "application/pdf",
            MediaType::Xml => "application/xml",
            MediaType::Octet => "application/octet-stream",
            MediaType::XVgxPartial => "application/x-vgx-partial",
            MediaType::Text => "text/plain",
            MediaType::Css => "text/css",
            MediaType::Html => "text/html",
            MediaType::Image => "image/*",
            MediaType::Ico => "image/x-icon",
            MediaType::Gif => "image/gif",
            MediaType::Png => "image/png",
            MediaType::Jpg => "image/jpeg",
            MediaType::Any => "*/*",
        }
    }

    /// Media types the request parser distinguishes in Accept and Content-Type.
    pub fn from_header_value(value: &[u8]) -> MediaType {
        for token in value.split(|b| *b == b',') {
            let token = token.trim_ascii();
            let token = match token.iter().position(|b| *b == b';') {
                Some(i) => token[..i].trim_ascii(),
                None => token,
            };
            if token.eq_ignore_ascii_case(b"application/x-vgx-partial") {
                return MediaType::XVgxPartial;
            }
            if token.eq_ignore_ascii_case(b"application/json") {
                return MediaType::Json;
            }
            if token.eq_ignore_ascii_case(b"text/plain") {
                return MediaType::Text;
            }
        }
        MediaType::Any
    }

    pub fn from_suffix(suffix: &str) -> Option<MediaType> {
        let mt = match suffix.to_ascii_lowercase().as_str() {
            "js" => MediaType::Javascript,
            "json" => MediaType::Json,
            "pdf" => MediaType::Pdf,
            "xml" => MediaType::Xml,
            "bin" => MediaType::Octet,
            "txt" => MediaType::Text,
            "css" => MediaType::Css,
            "htm" | "html" => MediaType::Html,
            "ico" => MediaType::Ico,
            "gif" => MediaType::Gif,
            "png" => MediaType::Png,
            "jpg" | "jpeg" => MediaType::Jpg,
            _ => return None,
        };
        Some(mt)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}
