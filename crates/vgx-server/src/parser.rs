// src/parser.rs
use crate::error::ParseError;
use crate::http::{HTTP_PATH_MAX, MediaType, Method};

/// Partition/replica identity announced by an upstream peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartialIdent {
    pub width: u8,
    pub height: u8,
    pub depth: u8,
    pub partition: u8,
    pub replica: u8,
    pub channel: u8,
    pub primary: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RequestLine<'a> {
    Request {
        method: Method,
        path: &'a str,
        version: (u8, u8),
    },
    Ident(PartialIdent),
}

/// One header line, classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLine {
    /// The blank line that ends the header block.
    End,
    PartialTarget(i32),
    MinExecutor(u8),
    BypassServiceOut(bool),
    ContentType(MediaType),
    ContentLength(usize),
    Accept(MediaType),
    Other,
}

const BAD_LINE: ParseError = ParseError::BadRequest("Invalid HTTP request line");
const BAD_HEADER: ParseError = ParseError::BadRequest("Invalid HTTP header");

/// Matches `token` at `buf[cursor..]` followed by a separator byte (<= 32).
#[inline(always)]
fn expect_token(buf: &[u8], cursor: usize, token: &[u8]) -> Option<usize> {
    let end = cursor + token.len();
    if end < buf.len() && &buf[cursor..end] == token && buf[end] <= 32 {
        Some(end)
    } else {
        None
    }
}

const METHODS: &[(&[u8], Method)] = &[
    (b"GET", Method::Get),
    (b"HEAD", Method::Head),
    (b"POST", Method::Post),
    (b"PUT", Method::Put),
    (b"PATCH", Method::Patch),
    (b"OPTIONS", Method::Options),
    (b"DELETE", Method::Delete),
    (b"CONNECT", Method::Connect),
    (b"TRACE", Method::Trace),
    (b"XVGXIDENT", Method::XVgxIdent),
];

fn parse_method(buf: &[u8]) -> Result<(Method, usize), ParseError> {
    let first = *buf.first().ok_or(BAD_LINE)?;
    METHODS
        .iter()
        .filter(|(token, _)| token[0] == first)
        .find_map(|(token, method)| expect_token(buf, 0, token).map(|end| (*method, end)))
        .ok_or(BAD_LINE)
}

#[inline(always)]
fn skip_spaces(buf: &[u8], mut cursor: usize) -> usize {
    while cursor < buf.len() && (buf[cursor] == b' ' || buf[cursor] == b'\t') {
        cursor += 1;
    }
    cursor
}

/// Signed decimal at `buf[cursor..]`. Returns the value and the cursor after it.
fn parse_int(buf: &[u8], cursor: usize) -> Option<(i64, usize)> {
    let mut cursor = skip_spaces(buf, cursor);
    let negative = buf.get(cursor) == Some(&b'-');
    if negative {
        cursor += 1;
    }
    let start = cursor;
    let mut value: i64 = 0;
    while cursor < buf.len() && buf[cursor].is_ascii_digit() {
        value = value.checked_mul(10)?.checked_add((buf[cursor] - b'0') as i64)?;
        cursor += 1;
    }
    if cursor == start {
        return None;
    }
    Some((if negative { -value } else { value }, cursor))
}

/// Nothing but whitespace may follow a numeric header value.
fn int_value(buf: &[u8], cursor: usize) -> Result<i64, ParseError> {
    let (value, end) = parse_int(buf, cursor).ok_or(BAD_HEADER)?;
    if buf[end..].iter().all(|b| b.is_ascii_whitespace()) {
        Ok(value)
    } else {
        Err(BAD_HEADER)
    }
}

fn parse_ident(buf: &[u8], mut cursor: usize) -> Result<PartialIdent, ParseError> {
    let mut fields = [0u8; 7];
    for field in fields.iter_mut() {
        let (value, end) = parse_int(buf, cursor).ok_or(BAD_LINE)?;
        *field = u8::try_from(value).map_err(|_| BAD_LINE)?;
        cursor = end;
    }
    Ok(PartialIdent {
        width: fields[0],
        height: fields[1],
        depth: fields[2],
        partition: fields[3],
        replica: fields[4],
        channel: fields[5],
        primary: fields[6] != 0,
    })
}

/// Parses `METHOD PATH HTTP/x.y\r\n` or the identification pseudo-method.
///
/// `line` must be one complete line including its `\n`.
pub fn parse_request_line(line: &[u8]) -> Result<RequestLine<'_>, ParseError> {
    if line.last() != Some(&b'\n') {
        return Err(BAD_LINE);
    }
    let (method, cursor) = parse_method(line)?;
    if method == Method::XVgxIdent {
        return parse_ident(line, cursor).map(RequestLine::Ident);
    }

    let start = skip_spaces(line, cursor);
    let mut end = start;
    while end < line.len() && line[end] > 32 {
        end += 1;
        if end - start >= HTTP_PATH_MAX {
            return Err(BAD_LINE);
        }
    }
    if end == start {
        return Err(BAD_LINE);
    }
    let path = std::str::from_utf8(&line[start..end]).map_err(|_| BAD_LINE)?;

    let cursor = skip_spaces(line, end);
    let rest = &line[cursor..];
    if rest.len() < 8 || &rest[..5] != b"HTTP/" || rest[6] != b'.' {
        return Err(BAD_LINE);
    }
    let (major, minor) = (rest[5], rest[7]);
    if !major.is_ascii_digit() || !minor.is_ascii_digit() {
        return Err(BAD_LINE);
    }
    if major != b'1' {
        return Err(ParseError::VersionNotSupported);
    }
    if !rest[8..].iter().all(|b| b.is_ascii_whitespace()) {
        return Err(BAD_LINE);
    }

    Ok(RequestLine::Request {
        method,
        path,
        version: (major - b'0', minor - b'0'),
    })
}

/// Case-insensitive prefix match. Returns the cursor after the prefix.
#[inline(always)]
fn header_prefix(line: &[u8], prefix: &[u8]) -> Option<usize> {
    if line.len() >= prefix.len()
        && line.iter().zip(prefix).all(|(c, p)| (c | 0x20) == *p || c == p)
    {
        Some(prefix.len())
    } else {
        None
    }
}

/// Classifies one header line. `admin` enables the executor hint header.
pub fn parse_header_line(line: &[u8], admin: bool) -> Result<HeaderLine, ParseError> {
    if line == b"\r\n" || line == b"\n" {
        return Ok(HeaderLine::End);
    }
    if let Some(cursor) = header_prefix(line, b"x-vgx-partial-target:") {
        let value = int_value(line, cursor)?;
        let target = if value < 0 { -1 } else { i32::try_from(value).map_err(|_| BAD_HEADER)? };
        return Ok(HeaderLine::PartialTarget(target));
    }
    if let Some(cursor) = header_prefix(line, b"x-vgx-builtin-min-executor:") {
        if !admin {
            return Ok(HeaderLine::Other);
        }
        let value = int_value(line, cursor)?;
        if value < 0 {
            return Err(BAD_HEADER);
        }
        return Ok(HeaderLine::MinExecutor(value.min(3) as u8));
    }
    if let Some(cursor) = header_prefix(line, b"x-vgx-bypass-sout:") {
        let value = int_value(line, cursor)?;
        if value < 0 {
            return Err(BAD_HEADER);
        }
        return Ok(HeaderLine::BypassServiceOut(value > 0));
    }
    if let Some(cursor) = header_prefix(line, b"content-type:") {
        let mt = match MediaType::from_header_value(&line[cursor..]) {
            MediaType::Any => MediaType::None,
            mt => mt,
        };
        return Ok(HeaderLine::ContentType(mt));
    }
    if let Some(cursor) = header_prefix(line, b"content-length:") {
        let value = int_value(line, cursor)?;
        let length = usize::try_from(value).map_err(|_| BAD_HEADER)?;
        return Ok(HeaderLine::ContentLength(length));
    }
    if let Some(cursor) = header_prefix(line, b"accept:") {
        return Ok(HeaderLine::Accept(MediaType::from_header_value(&line[cursor..])));
    }
    Ok(HeaderLine::Other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_line() {
        let parsed = parse_request_line(b"GET /vgx/hc HTTP/1.1\r\n").unwrap();
        assert_eq!(
            parsed,
            RequestLine::Request {
                method: Method::Get,
                path: "/vgx/hc",
                version: (1, 1)
            }
        );
        let parsed = parse_request_line(b"PATCH /x?y=1 HTTP/1.0\n").unwrap();
        assert!(matches!(parsed, RequestLine::Request { method: Method::Patch, path: "/x?y=1", version: (1, 0) }));
    }

    #[test]
    fn test_bad_request_lines() {
        assert_eq!(parse_request_line(b"GETX / HTTP/1.1\r\n"), Err(BAD_LINE));
        assert_eq!(parse_request_line(b"FOO / HTTP/1.1\r\n"), Err(BAD_LINE));
        assert_eq!(parse_request_line(b"GET / HTTP/1.1"), Err(BAD_LINE));
        assert_eq!(parse_request_line(b"GET  HTTP/1.1\r\n"), Err(BAD_LINE));
        assert_eq!(parse_request_line(b"GET / HTTX/1.1\r\n"), Err(BAD_LINE));
        assert_eq!(
            parse_request_line(b"GET / HTTP/2.0\r\n"),
            Err(ParseError::VersionNotSupported)
        );
    }

    #[test]
    fn test_path_overflow() {
        let mut line = b"GET /".to_vec();
        line.extend(std::iter::repeat_n(b'a', HTTP_PATH_MAX));
        line.extend_from_slice(b" HTTP/1.1\r\n");
        assert_eq!(parse_request_line(&line), Err(BAD_LINE));
    }

    #[test]
    fn test_parse_ident() {
        let parsed = parse_request_line(b"XVGXIDENT 4 2 1 3 1 7 1\r\n").unwrap();
        assert_eq!(
            parsed,
            RequestLine::Ident(PartialIdent {
                width: 4,
                height: 2,
                depth: 1,
                partition: 3,
                replica: 1,
                channel: 7,
                primary: true,
            })
        );
        assert_eq!(parse_request_line(b"XVGXIDENT 4 2 1 3 1 700 1\r\n"), Err(BAD_LINE));
        assert_eq!(parse_request_line(b"XVGXIDENT 4 2\r\n"), Err(BAD_LINE));
    }

    #[test]
    fn test_header_classification() {
        assert_eq!(parse_header_line(b"\r\n", false), Ok(HeaderLine::End));
        assert_eq!(
            parse_header_line(b"Content-Length: 42\r\n", false),
            Ok(HeaderLine::ContentLength(42))
        );
        assert_eq!(
            parse_header_line(b"Content-Type: application/json\r\n", false),
            Ok(HeaderLine::ContentType(MediaType::Json))
        );
        assert_eq!(
            parse_header_line(b"Content-Type: image/png\r\n", false),
            Ok(HeaderLine::ContentType(MediaType::None))
        );
        assert_eq!(
            parse_header_line(b"ACCEPT: text/plain\r\n", false),
            Ok(HeaderLine::Accept(MediaType::Text))
        );
        assert_eq!(
            parse_header_line(b"X-Vgx-Partial-Target: -5\r\n", false),
            Ok(HeaderLine::PartialTarget(-1))
        );
        assert_eq!(
            parse_header_line(b"X-Vgx-Bypass-Sout: 1\r\n", false),
            Ok(HeaderLine::BypassServiceOut(true))
        );
        assert_eq!(parse_header_line(b"Host: localhost\r\n", false), Ok(HeaderLine::Other));
    }

    #[test]
    fn test_min_executor_header() {
        assert_eq!(
            parse_header_line(b"x-vgx-builtin-min-executor: 9\r\n", true),
            Ok(HeaderLine::MinExecutor(3))
        );
        assert_eq!(
            parse_header_line(b"x-vgx-builtin-min-executor: 9\r\n", false),
            Ok(HeaderLine::Other)
        );
        assert_eq!(parse_header_line(b"x-vgx-builtin-min-executor: -1\r\n", true), Err(BAD_HEADER));
    }

    #[test]
    fn test_bad_content_length() {
        assert_eq!(parse_header_line(b"Content-Length: -1\r\n", false), Err(BAD_HEADER));
        assert_eq!(parse_header_line(b"Content-Length: abc\r\n", false), Err(BAD_HEADER));
        assert_eq!(parse_header_line(b"Content-Length: 12x\r\n", false), Err(BAD_HEADER));
    }
}
