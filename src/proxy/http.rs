//! Incremental HTTP/1.1 framing: request-line/header parsing without
//! body buffering, plus the small set of response writers the proxy
//! needs (403/502/500 and the CONNECT "200 Connection established").
//! Grounded in the teacher's request-line splitting, generalized into a
//! proper incremental reader because the teacher reads a whole buffer
//! up front and we must not (spec 4.4: "no body buffering").

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BoundaryError, Result};

pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    ContentLength(u64),
    Chunked,
    /// No framing information; read until the peer closes the connection.
    UntilClose,
}

pub fn request_framing(head: &RequestHead) -> BodyFraming {
    framing_from_headers(&head.headers)
}

pub fn response_framing(head: &ResponseHead) -> BodyFraming {
    framing_from_headers(&head.headers)
}

fn framing_from_headers(headers: &[(String, String)]) -> BodyFraming {
    let is_chunked = headers.iter().any(|(k, v)| {
        k.eq_ignore_ascii_case("transfer-encoding") && v.to_ascii_lowercase().contains("chunked")
    });
    if is_chunked {
        return BodyFraming::Chunked;
    }
    if let Some(len) = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<u64>().ok())
    {
        return BodyFraming::ContentLength(len);
    }
    BodyFraming::UntilClose
}

/// Read one HTTP/1.1 request head from `stream`, prepending `carry` (bytes
/// already buffered from a previous call on the same keep-alive
/// connection). Returns `None` on a clean EOF before any bytes arrive.
/// On success, `carry` is left holding whatever was read past the blank
/// line: the start of the body, or of the next pipelined request.
pub async fn read_request_head<S: AsyncRead + Unpin>(
    stream: &mut S,
    carry: &mut Vec<u8>,
) -> Result<Option<RequestHead>> {
    let Some(raw) = read_until_blank_line(stream, carry).await? else {
        return Ok(None);
    };
    let text = String::from_utf8_lossy(&raw);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.splitn(3, ' ');
    let method = parts
        .next()
        .ok_or_else(|| malformed("missing method"))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| malformed("missing request target"))?
        .to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").trim().to_string();
    if method.is_empty() || target.is_empty() {
        return Err(malformed("empty request line"));
    }
    let headers = parse_headers(lines);
    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
    }))
}

pub async fn read_response_head<S: AsyncRead + Unpin>(
    stream: &mut S,
    carry: &mut Vec<u8>,
) -> Result<Option<ResponseHead>> {
    let Some(raw) = read_until_blank_line(stream, carry).await? else {
        return Ok(None);
    };
    let text = String::from_utf8_lossy(&raw);
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| malformed("missing response version"))?
        .to_string();
    let status: u16 = parts
        .next()
        .ok_or_else(|| malformed("missing status code"))?
        .parse()
        .map_err(|_| malformed("non-numeric status code"))?;
    let reason = parts.next().unwrap_or("").to_string();
    let headers = parse_headers(lines);
    Ok(Some(ResponseHead {
        status,
        reason,
        version,
        headers,
    }))
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<(String, String)> {
    lines
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn malformed(reason: &str) -> BoundaryError {
    BoundaryError::RuleEvalError(format!("malformed HTTP head: {reason}"))
}

/// Grow `carry` by reading from `stream` until it contains a full
/// `\r\n\r\n`-terminated head, then split it into `(head_bytes,
/// leftover)` and leave `leftover` in `carry`. Never reads further than
/// one byte past the terminator lookahead requires.
async fn read_until_blank_line<S: AsyncRead + Unpin>(
    stream: &mut S,
    carry: &mut Vec<u8>,
) -> Result<Option<Vec<u8>>> {
    loop {
        if let Some(idx) = find_double_crlf(carry) {
            let mut head = carry.split_off(0);
            let leftover = head.split_off(idx + 4);
            *carry = leftover;
            // Drop the trailing blank line's own CRLFCRLF from the head.
            head.truncate(head.len().saturating_sub(4));
            return Ok(Some(head));
        }
        let mut chunk = [0u8; 512];
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|source| BoundaryError::UpstreamReadError {
                host: "client".into(),
                source,
            })?;
        if n == 0 {
            if carry.is_empty() {
                return Ok(None);
            }
            return Err(malformed("connection closed mid-header"));
        }
        carry.extend_from_slice(&chunk[..n]);
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Copy exactly `len` bytes from `src` to `dst`, `carry` first.
pub async fn copy_bounded<R, W>(
    src: &mut R,
    dst: &mut W,
    len: u64,
    carry: &mut Vec<u8>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = len;
    if !carry.is_empty() {
        let take = (carry.len() as u64).min(remaining) as usize;
        dst.write_all(&carry[..take]).await?;
        let leftover = carry.split_off(take);
        *carry = leftover;
        remaining -= take as u64;
    }
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let want = (buf.len() as u64).min(remaining) as usize;
        let n = src.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Relay a chunked-transfer body byte-for-byte, stopping once the
/// terminating `0`-size chunk and its trailer have been forwarded.
/// Bytes are passed through as-is rather than decoded, since the proxy
/// does not rewrite bodies.
pub async fn copy_chunked<R, W>(
    src: &mut R,
    dst: &mut W,
    carry: &mut Vec<u8>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let size_line = read_line(src, carry).await?;
        dst.write_all(size_line.as_bytes()).await?;
        let size_str = size_line
            .trim_end()
            .split(';')
            .next()
            .unwrap_or("0")
            .trim();
        let size = u64::from_str_radix(size_str, 16).unwrap_or(0);
        if size == 0 {
            // Trailing headers, possibly empty, end with a blank line.
            loop {
                let line = read_line(src, carry).await?;
                dst.write_all(line.as_bytes()).await?;
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            return Ok(());
        }
        copy_bounded(src, dst, size, carry).await?;
        let trailer = read_line(src, carry).await?;
        dst.write_all(trailer.as_bytes()).await?;
    }
}

async fn read_line<R: AsyncRead + Unpin>(src: &mut R, carry: &mut Vec<u8>) -> std::io::Result<String> {
    loop {
        if let Some(idx) = carry.windows(2).position(|w| w == b"\r\n") {
            let line: Vec<u8> = carry.drain(..idx + 2).collect();
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
        let mut byte = [0u8; 1];
        let n = src.read(&mut byte).await?;
        if n == 0 {
            let line = std::mem::take(carry);
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
        carry.push(byte[0]);
    }
}

pub async fn copy_until_eof<R, W>(src: &mut R, dst: &mut W, carry: &mut Vec<u8>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if !carry.is_empty() {
        dst.write_all(carry).await?;
        carry.clear();
    }
    tokio::io::copy(src, dst).await.map(|_| ())
}

/// Per spec 4.4 item 3, a blocked request is closed or kept alive "per
/// protocol version" exactly like an allowed one: denial is a response
/// body, not a reason to tear down an otherwise-healthy keep-alive
/// connection.
pub fn blocked_response(method: &str, path: &str, host: &str, keep_alive: bool) -> Vec<u8> {
    let body = format!(
        "Request Blocked by Boundary\n\nmethod: {method}\npath: {path}\nhost: {host}\n\n\
         To allow this request, add: --allow \"domain={host}\"\n"
    );
    render_response(403, "Forbidden", &body, keep_alive)
}

pub fn bad_gateway_response(reason: &str) -> Vec<u8> {
    render_response(502, "Bad Gateway", &format!("Bad Gateway: {reason}\n"), false)
}

pub fn internal_error_response(reason: &str) -> Vec<u8> {
    render_response(
        500,
        "Internal Server Error",
        &format!("Internal Server Error: {reason}\n"),
        false,
    )
}

fn render_response(status: u16, reason: &str, body: &str, keep_alive: bool) -> Vec<u8> {
    let connection = if keep_alive { "keep-alive" } else { "close" };
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {len}\r\nConnection: {connection}\r\n\r\n{body}",
        len = body.len()
    )
    .into_bytes()
}

/// Whether the client's own request indicates this connection should
/// stay open for another request: an explicit `Connection` header wins;
/// otherwise HTTP/1.1 defaults to keep-alive and HTTP/1.0 defaults to
/// close.
pub fn request_keep_alive(head: &RequestHead) -> bool {
    match head.header("connection").map(|v| v.to_ascii_lowercase()) {
        Some(v) if v.contains("close") => false,
        Some(v) if v.contains("keep-alive") => true,
        _ => head.version.eq_ignore_ascii_case("HTTP/1.1"),
    }
}

/// Consume and discard a request's body (if any) so a denied request
/// doesn't leave unread body bytes in front of the next pipelined
/// request on a kept-alive connection. A request with no declared body
/// framing has nothing to drain; any bytes already sitting in `carry`
/// in that case belong to the next request, not this one, and must be
/// left alone.
pub async fn drain_request_body<S: AsyncRead + Unpin>(
    stream: &mut S,
    head: &RequestHead,
    carry: &mut Vec<u8>,
) -> std::io::Result<()> {
    match request_framing(head) {
        BodyFraming::ContentLength(len) if len > 0 => {
            copy_bounded(stream, &mut tokio::io::sink(), len, carry).await
        }
        BodyFraming::Chunked => copy_chunked(stream, &mut tokio::io::sink(), carry).await,
        _ => Ok(()),
    }
}

pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Headers that must not be forwarded verbatim to the upstream target;
/// the proxy is the sole owner of connection-level framing.
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection" | "proxy-connection" | "keep-alive" | "proxy-authenticate" | "proxy-authorization" | "te" | "trailer" | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_request_line_and_headers() {
        let raw = b"GET /widgets?x=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\nBODY".to_vec();
        let mut carry = Vec::new();
        let mut cursor = std::io::Cursor::new(raw);
        let head = read_request_head(&mut cursor, &mut carry)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/widgets?x=1");
        assert_eq!(head.header("host"), Some("example.com"));
        assert_eq!(carry, b"BODY");
    }

    #[tokio::test]
    async fn connect_request_has_no_headers_required() {
        let raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n".to_vec();
        let mut carry = Vec::new();
        let mut cursor = std::io::Cursor::new(raw);
        let head = read_request_head(&mut cursor, &mut carry)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "example.com:443");
        assert!(carry.is_empty());
    }

    #[test]
    fn blocked_response_contains_stable_anchor() {
        let resp = blocked_response("GET", "/", "example.com", false);
        let text = String::from_utf8(resp).unwrap();
        assert!(text.contains("Request Blocked by Boundary"));
        assert!(text.contains("--allow \"domain=example.com\""));
        assert!(text.starts_with("HTTP/1.1 403 Forbidden"));
        assert!(text.contains("Connection: close"));
    }

    #[test]
    fn blocked_response_can_keep_connection_alive() {
        let resp = blocked_response("GET", "/", "example.com", true);
        let text = String::from_utf8(resp).unwrap();
        assert!(text.contains("Connection: keep-alive"));
    }

    #[test]
    fn request_keep_alive_defaults_by_version_and_honors_explicit_header() {
        let http11_default = RequestHead {
            method: "GET".into(),
            target: "/".into(),
            version: "HTTP/1.1".into(),
            headers: vec![],
        };
        assert!(request_keep_alive(&http11_default));

        let http11_close = RequestHead {
            headers: vec![("Connection".into(), "close".into())],
            ..http11_default
        };
        assert!(!request_keep_alive(&http11_close));

        let http10_default = RequestHead {
            method: "GET".into(),
            target: "/".into(),
            version: "HTTP/1.0".into(),
            headers: vec![],
        };
        assert!(!request_keep_alive(&http10_default));

        let http10_explicit = RequestHead {
            headers: vec![("Connection".into(), "keep-alive".into())],
            ..http10_default
        };
        assert!(request_keep_alive(&http10_explicit));
    }

    #[test]
    fn framing_prefers_chunked_over_content_length() {
        let head = RequestHead {
            method: "POST".into(),
            target: "/".into(),
            version: "HTTP/1.1".into(),
            headers: vec![
                ("Transfer-Encoding".into(), "chunked".into()),
                ("Content-Length".into(), "10".into()),
            ],
        };
        assert_eq!(request_framing(&head), BodyFraming::Chunked);
    }

    #[tokio::test]
    async fn copy_bounded_respects_carry_and_limit() {
        let mut carry = b"ab".to_vec();
        let mut src = std::io::Cursor::new(b"cdef".to_vec());
        let mut dst = Vec::new();
        copy_bounded(&mut src, &mut dst, 4, &mut carry).await.unwrap();
        assert_eq!(dst, b"abcd");
    }
}
