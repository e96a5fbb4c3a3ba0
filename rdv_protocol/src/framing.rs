//! The post-upgrade line protocol.
//!
//! Two kinds of LF-terminated ASCII lines exist after the HTTP upgrade:
//!
//! - A header line on every direct candidate connection:
//!   `rdv/1 <METHOD> <escaped-token>\n`. Each side writes its own and
//!   verifies the peer's, which rejects misdials early.
//! - A command line from the dialer once a winner is chosen: `CONTINUE\n` on
//!   the winning conn, or `OTHER <ip:port>\n` on the relay when a direct
//!   connection won.
//!
//! All reads are bounded by [`MAX_LINE_LEN`]; malformed input is a protocol
//! error rather than a panic or an unbounded allocation.

use crate::{Error, Method, PROTOCOL_NAME, path_escape, path_unescape};
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Longest accepted line, including HTTP request and header lines.
pub const MAX_LINE_LEN: usize = 4096;

const CMD_CONTINUE: &str = "CONTINUE";
const CMD_OTHER: &str = "OTHER";

/// Reads one LF-terminated line, without the terminator.
///
/// Returns an `UnexpectedEof` IO error if the stream ends mid-line and a
/// protocol error if the line exceeds [`MAX_LINE_LEN`].
pub async fn read_line<R>(r: &mut R) -> Result<String, Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut line: Vec<u8> = Vec::new();
    loop {
        let (used, done) = {
            let buf = r.fill_buf().await?;
            if buf.is_empty() {
                return Err(Error::Io(ErrorKind::UnexpectedEof.into()));
            }
            match buf.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    line.extend_from_slice(&buf[..i]);
                    (i + 1, true)
                }
                None => {
                    line.extend_from_slice(buf);
                    (buf.len(), false)
                }
            }
        };
        r.consume(used);
        if line.len() > MAX_LINE_LEN {
            return Err(Error::Protocol("line too long".into()));
        }
        if done {
            break;
        }
    }
    String::from_utf8(line).map_err(|_| Error::Protocol("line is not utf-8".into()))
}

/// The `rdv/1 <METHOD> <token>` header line exchanged between peers on
/// direct connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHeader {
    pub method: Method,
    pub token: String,
}

/// Writes a header line with the given method and token.
pub async fn write_header<W>(w: &mut W, method: Method, token: &str) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let line = format!("{PROTOCOL_NAME} {method} {}\n", path_escape(token));
    w.write_all(line.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Reads and parses a peer header line.
pub async fn read_header<R>(r: &mut R) -> Result<PeerHeader, Error>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(r).await?;
    let mut parts = line.split_whitespace();
    let (Some(proto), Some(method), Some(token), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::Protocol("malformed header".into()));
    };
    if proto != PROTOCOL_NAME {
        return Err(Error::Protocol("malformed header".into()));
    }
    let method: Method = method.parse()?;
    let token =
        path_unescape(token).map_err(|_| Error::Protocol("malformed header token".into()))?;
    Ok(PeerHeader { method, token })
}

/// A command line sent by the dialer after picking a winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Sent on the chosen conn: proceed with this connection.
    Continue,
    /// Sent on the relay when a direct connection won, carrying the winning
    /// remote address. The address is informational; an unparsable one is
    /// kept as `None` rather than failing the command.
    Other(Option<SocketAddr>),
}

/// Reads and parses a command line.
pub async fn read_command<R>(r: &mut R) -> Result<Command, Error>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(r).await?;
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some(CMD_CONTINUE) => Ok(Command::Continue),
        Some(CMD_OTHER) => Ok(Command::Other(parts.next().and_then(|s| s.parse().ok()))),
        _ => Err(Error::Protocol("invalid command".into())),
    }
}

/// Writes the `CONTINUE` command.
pub async fn write_continue<W>(w: &mut W) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(b"CONTINUE\n").await?;
    w.flush().await?;
    Ok(())
}

/// Writes the `OTHER <ip:port>` command.
pub async fn write_other<W>(w: &mut W, addr: SocketAddr) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let line = format!("{CMD_OTHER} {addr}\n");
    w.write_all(line.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}
