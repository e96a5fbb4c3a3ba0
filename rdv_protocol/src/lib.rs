//! Wire protocol shared by rdv clients and servers.
//!
//! Two peers that know a common token meet at a rendezvous server over an
//! HTTP/1.1 upgrade, learn each other's candidate socket addresses, and then
//! race direct TCP connections while the server keeps the upgraded streams
//! around as a relay fallback.
//!
//! On its own this crate only defines the shared protocol pieces:
//!
//! - [`Method`] and [`Meta`]: the request/response metadata of an rdv
//!   handshake.
//! - [`AddrSpace`] and [`AddrSpaces`]: address classification used to filter
//!   candidates.
//! - [`framing`]: the post-upgrade line protocol (`rdv/1` header line and the
//!   `CONTINUE`/`OTHER` commands).
//! - [`http1`]: the HTTP/1.1 upgrade request/response codec.
//! - [`Conn`]: an upgraded rdv connection, direct or relayed.
//!
//! In most cases you should use `rdv_client` or `rdv_server` instead.
#![forbid(unsafe_code)]
#![warn(clippy::all)]

mod addrs;
mod conn;
mod escape;
pub mod framing;
pub mod http1;

pub use addrs::{AddrSpace, AddrSpaces, unmap};
pub use conn::{Conn, Stream};
pub use escape::{path_escape, path_unescape};

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Name of the protocol in the `Upgrade` header and the peer header line.
pub const PROTOCOL_NAME: &str = "rdv/1";

/// Upper bound on the peer address list shipped in a response.
///
/// Requests are allowed one less, leaving room for the observed address.
pub const MAX_ADDRS: usize = 10;

/// Deadline for best-effort writes that must never delay teardown:
/// HTTP error bodies, `OTHER` notices and the final `CONTINUE`.
pub const SHORT_WRITE_TIMEOUT: Duration = Duration::from_millis(10);

/// Request header carrying the client's self-reported `ip:port` list.
pub const HEADER_SELF_ADDRS: &str = "Rdv-Self-Addrs";

/// Response header carrying the peer's observed and self-reported addrs.
pub const HEADER_PEER_ADDRS: &str = "Rdv-Peer-Addrs";

/// Response header carrying the source address the server saw.
pub const HEADER_OBSERVED_ADDR: &str = "Rdv-Observed-Addr";

/// The role a peer takes in an rdv exchange, doubling as the HTTP method
/// of the upgrade request.
///
/// Both peers agree on their roles out-of-band. The protocol is identical
/// apart from who confirms the chosen connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Dial,
    Accept,
}

impl Method {
    pub const fn as_str(self) -> &'static str {
        match self {
            Method::Dial => "DIAL",
            Method::Accept => "ACCEPT",
        }
    }

    /// The role the other peer must have.
    pub const fn opposite(self) -> Method {
        match self {
            Method::Dial => Method::Accept,
            Method::Accept => Method::Dial,
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "DIAL" => Ok(Method::Dial),
            "ACCEPT" => Ok(Method::Accept),
            other => Err(Error::Protocol(format!("unknown rdv method [{other}]"))),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata associated with the rdv HTTP handshake between client and server.
///
/// The request fields are filled by the client; the response fields by the
/// server once a pair is formed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    /// The role of the client that produced this request.
    pub method: Method,
    /// Opaque matching token, chosen by the dialer.
    pub token: String,
    /// Local candidate addresses the client reported about itself.
    pub self_addrs: Vec<SocketAddr>,
    /// Source address of the client as seen by the server. Response only.
    pub observed_addr: Option<SocketAddr>,
    /// Candidate addresses of the other peer. Response only.
    pub peer_addrs: Vec<SocketAddr>,
}

impl Meta {
    /// Creates request metadata. The token must be non-empty.
    pub fn new(method: Method, token: &str) -> Result<Meta, Error> {
        if token.is_empty() {
            return Err(Error::Protocol("missing rdv token".into()));
        }
        Ok(Meta {
            method,
            token: token.to_string(),
            self_addrs: Vec::new(),
            observed_addr: None,
            peer_addrs: Vec::new(),
        })
    }

    /// The self-reported and observed addrs combined, deduplicated and
    /// sorted. This is what the partner receives as its peer addrs.
    pub fn self_and_observed_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs = self.self_addrs.clone();
        addrs.extend(self.observed_addr);
        sort_dedup_addrs(&mut addrs);
        addrs
    }
}

/// Sorts by `(ip, port)` and removes duplicates, in place.
pub fn sort_dedup_addrs(addrs: &mut Vec<SocketAddr>) {
    addrs.sort_by_key(|a| (a.ip(), a.port()));
    addrs.dedup();
}

/// Protocol-level error.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Malformed rdv header line, command, token or address list.
    #[error("rdv protocol error: {0}")]
    Protocol(String),

    /// The HTTP exchange was not a well-formed rdv upgrade.
    #[error("invalid rdv upgrade: {0}")]
    Upgrade(String),

    /// IO error on the underlying stream.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
