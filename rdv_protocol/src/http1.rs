//! Minimal HTTP/1.1 codec for the rdv upgrade.
//!
//! The rdv handshake is a plain HTTP/1.1 upgrade (`Connection: upgrade`,
//! `Upgrade: rdv/1`) after which both sides own the raw TCP stream. Since
//! the server hands the hijacked socket to a relay engine, the buffered
//! reader used while parsing is kept alongside the stream: it may already
//! hold bytes belonging to the post-upgrade line protocol.
//!
//! Only the subset of HTTP/1.1 needed by rdv is implemented: a request or
//! status line, a bounded header block, and short plain-text error bodies.

use crate::framing::read_line;
use crate::{
    Error, HEADER_OBSERVED_ADDR, HEADER_PEER_ADDRS, HEADER_SELF_ADDRS, MAX_ADDRS, Meta,
    PROTOCOL_NAME, SHORT_WRITE_TIMEOUT, path_unescape,
};
use std::net::SocketAddr;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on the number of headers accepted in one message.
const MAX_HEADERS: usize = 64;

/// How much of an error response body is retained for diagnostics.
pub const MAX_BODY_SLURP: usize = 1024;

/// An ordered, case-insensitive header map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Headers {
        Headers(Vec::new())
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces all values for `name` with a single one.
    pub fn set(&mut self, name: &str, value: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.0.push((name.to_string(), value.to_string()));
    }

    /// Appends a value without touching existing ones.
    pub fn append(&mut self, name: &str, value: &str) {
        self.0.push((name.to_string(), value.to_string()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An HTTP/1.1 request, as read from or written to the wire.
///
/// The method is kept as a string here; rdv validation happens in
/// [`parse_rdv_request`] so that a broken request can still be answered
/// with the right status code.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: Headers,
}

/// An HTTP/1.1 response. `body` is only populated for error responses.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    /// An empty response with the standard reason phrase for `status`.
    pub fn new(status: u16) -> Response {
        Response {
            status,
            reason: reason_phrase(status).to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// The retained body as text, for error reporting.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        400 => "Bad Request",
        408 => "Request Timeout",
        409 => "Conflict",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "",
    }
}

/// Reads a request line and headers, up to the blank line.
pub async fn read_request<R>(r: &mut R) -> Result<Request, Error>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(r).await?;
    let line = line.trim_end_matches('\r');
    let mut parts = line.split(' ');
    let (Some(method), Some(path), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::Protocol(format!("malformed request line [{line}]")));
    };
    Ok(Request {
        method: method.to_string(),
        path: path.to_string(),
        version: version.to_string(),
        headers: read_headers(r).await?,
    })
}

/// Writes a request line and headers, with the final blank line.
pub async fn write_request<W>(w: &mut W, req: &Request) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let mut out = format!("{} {} {}\r\n", req.method, req.path, req.version);
    for (name, value) in req.headers.iter() {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    w.write_all(out.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Reads a status line and headers. The body, if any, is left unread.
pub async fn read_response<R>(r: &mut R) -> Result<Response, Error>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(r).await?;
    let line = line.trim_end_matches('\r');
    let mut parts = line.splitn(3, ' ');
    let (Some(version), Some(status)) = (parts.next(), parts.next()) else {
        return Err(Error::Protocol(format!("malformed status line [{line}]")));
    };
    if !version.eq_ignore_ascii_case("HTTP/1.1") {
        return Err(Error::Protocol(format!("unexpected http version [{version}]")));
    }
    let status: u16 = status
        .parse()
        .map_err(|_| Error::Protocol(format!("malformed status line [{line}]")))?;
    Ok(Response {
        status,
        reason: parts.next().unwrap_or_default().to_string(),
        headers: read_headers(r).await?,
        body: Vec::new(),
    })
}

/// Writes a status line, headers and body.
pub async fn write_response<W>(w: &mut W, resp: &Response) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let mut out = format!("HTTP/1.1 {} {}\r\n", resp.status, resp.reason);
    for (name, value) in resp.headers.iter() {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    w.write_all(out.as_bytes()).await?;
    if !resp.body.is_empty() {
        w.write_all(&resp.body).await?;
    }
    w.flush().await?;
    Ok(())
}

async fn read_headers<R>(r: &mut R) -> Result<Headers, Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Headers::new();
    loop {
        let line = read_line(r).await?;
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADERS {
            return Err(Error::Protocol("too many headers".into()));
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::Protocol(format!("malformed header line [{line}]")));
        };
        headers.append(name.trim(), value.trim());
    }
}

/// Reads up to `max` body bytes into `resp`, stopping early at the declared
/// `Content-Length`. Best effort: a short read is not an error.
pub async fn slurp_body<R>(r: &mut R, resp: &mut Response, max: usize)
where
    R: AsyncBufRead + Unpin,
{
    let mut want = max;
    if let Some(len) = resp.headers.get("Content-Length").and_then(|v| v.parse().ok()) {
        want = max.min(len);
    }
    let mut buf = vec![0u8; want];
    let mut filled = 0;
    while filled < want {
        match r.read(&mut buf[filled..]).await {
            Ok(0) | Err(_) => break,
            Ok(n) => filled += n,
        }
    }
    buf.truncate(filled);
    resp.body = buf;
}

/// Checks that `Connection: upgrade` and `Upgrade: rdv/1` are present.
pub fn check_upgrade_headers(headers: &Headers) -> Result<(), Error> {
    let connection = headers.get("Connection").unwrap_or_default();
    if !connection.eq_ignore_ascii_case("upgrade") {
        return Err(Error::Upgrade("requires connection upgrade".into()));
    }
    // Upgrade allows multiple comma-separated protos, but we don't, so an
    // exact match is expected.
    let upgrade = headers.get("Upgrade").unwrap_or_default().trim();
    if upgrade.is_empty() {
        return Err(Error::Upgrade("missing upgrade header".into()));
    }
    if !upgrade.eq_ignore_ascii_case(PROTOCOL_NAME) {
        return Err(Error::Upgrade(format!("bad upgrade {upgrade}")));
    }
    Ok(())
}

/// Sets the `Connection: upgrade` and `Upgrade: rdv/1` headers.
pub fn set_upgrade_headers(headers: &mut Headers) {
    headers.set("Connection", "upgrade");
    headers.set("Upgrade", PROTOCOL_NAME);
}

/// Validates an incoming rdv request and extracts its [`Meta`].
///
/// [`Error::Upgrade`] means the request was not an rdv upgrade at all
/// (answer with `426`); [`Error::Protocol`] means it was malformed
/// (answer with `400`).
pub fn parse_rdv_request(req: &Request) -> Result<Meta, Error> {
    // Check the upgrade intent before the protocol details, to report a
    // better error.
    check_upgrade_headers(&req.headers)?;
    if !req.version.eq_ignore_ascii_case("HTTP/1.1") {
        return Err(Error::Upgrade(format!(
            "bad http version for upgrade {}",
            req.version
        )));
    }
    let method = req.method.parse()?;
    let token = path_unescape(req.path.strip_prefix('/').unwrap_or(&req.path))?;
    let mut meta = Meta::new(method, &token)?;
    let raw = req.headers.get(HEADER_SELF_ADDRS).unwrap_or_default();
    meta.self_addrs = parse_addr_list(raw)
        .map_err(|_| Error::Protocol(format!("invalid self addrs [{raw}]")))?;
    if meta.self_addrs.len() > MAX_ADDRS - 1 {
        return Err(Error::Protocol(format!("too many self addrs [{raw}]")));
    }
    Ok(meta)
}

/// The `101 Switching Protocols` response for a paired conn.
pub fn rdv_response(meta: &Meta) -> Response {
    let mut resp = Response::new(101);
    set_upgrade_headers(&mut resp.headers);
    resp.headers
        .set(HEADER_PEER_ADDRS, &format_addr_list(&meta.peer_addrs));
    if let Some(observed) = meta.observed_addr {
        resp.headers.set(HEADER_OBSERVED_ADDR, &observed.to_string());
    }
    resp
}

/// Validates a `101` response's rdv headers and fills the response fields
/// of `meta`. The status code itself is the caller's concern.
pub fn parse_rdv_response(meta: &mut Meta, resp: &Response) -> Result<(), Error> {
    check_upgrade_headers(&resp.headers)?;
    let raw = resp.headers.get(HEADER_PEER_ADDRS).unwrap_or_default();
    meta.peer_addrs =
        parse_addr_list(raw).map_err(|_| Error::Protocol(format!("invalid peer addrs [{raw}]")))?;
    if meta.peer_addrs.len() > MAX_ADDRS {
        return Err(Error::Protocol(format!("too many peer addrs [{raw}]")));
    }
    if let Some(raw) = resp.headers.get(HEADER_OBSERVED_ADDR) {
        let observed = raw
            .parse()
            .map_err(|_| Error::Protocol(format!("invalid observed addr [{raw}]")))?;
        meta.observed_addr = Some(observed);
    }
    Ok(())
}

/// An error response with a short plain-text body.
pub fn error_response(status: u16, reason: &str) -> Response {
    let mut resp = Response::new(status);
    resp.headers.set("Content-Type", "text/plain; charset=utf-8");
    resp.headers.set("X-Content-Type-Options", "nosniff");
    resp.headers.set("Content-Length", &reason.len().to_string());
    resp.body = reason.as_bytes().to_vec();
    resp
}

/// Best-effort write of an error response under [`SHORT_WRITE_TIMEOUT`].
///
/// Never blocks teardown: timeouts and write errors are swallowed, and the
/// conn should be dropped afterwards.
pub async fn write_response_err<W>(w: &mut W, status: u16, reason: &str)
where
    W: AsyncWrite + Unpin,
{
    let resp = error_response(status, reason);
    let _ = tokio::time::timeout(SHORT_WRITE_TIMEOUT, async {
        write_response(w, &resp).await?;
        w.shutdown().await?;
        Ok::<(), Error>(())
    })
    .await;
}

/// Parses a comma-separated `ip:port` list. An empty string is an empty
/// list.
pub fn parse_addr_list(raw: &str) -> Result<Vec<SocketAddr>, Error> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|part| {
            part.trim()
                .parse()
                .map_err(|_| Error::Protocol(format!("invalid addr [{part}]")))
        })
        .collect()
}

/// Formats a comma-separated `ip:port` list.
pub fn format_addr_list(addrs: &[SocketAddr]) -> String {
    addrs
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
