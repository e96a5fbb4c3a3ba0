//! Client engine for establishing rdv connections.
//!
//! Two peers that share an out-of-band token meet at a rendezvous server.
//! The server pairs them, exchanges their candidate socket addresses, and
//! keeps its own TCP connection available as a fallback relay. The client
//! then races direct connection attempts against every candidate, dialing
//! and listening on the same `SO_REUSEPORT` port (which enables TCP
//! simultaneous open), and a [`Picker`] chooses the winner.
//!
//! ```no_run
//! use rdv_client::Client;
//! use rdv_protocol::Method;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), rdv_client::Error> {
//! let client = Client::default();
//! let ctx = CancellationToken::new();
//! let (conn, _resp) = client
//!     .dial(&ctx, "http://rdv.example.com:8686", "some token", None)
//!     .await?;
//! println!("connected, relay: {}", conn.is_relay());
//! # Ok(())
//! # }
//! ```
#![forbid(unsafe_code)]
#![warn(clippy::all)]

mod picker;
mod probe;
mod race;
mod socket;
mod url;

pub use picker::{ConnPicker, Picker};

use crate::socket::Socket;
use crate::url::{Scheme, ServerUrl};
use rdv_protocol::http1::{
    self, Headers, MAX_BODY_SLURP, Request, Response, read_response, slurp_body, write_request,
};
use rdv_protocol::{AddrSpaces, Conn, HEADER_SELF_ADDRS, Meta, Method, Stream};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio_rustls::rustls;
use tokio_util::sync::CancellationToken;

/// Client can dial and accept rdv conns. The default value is valid.
#[derive(Clone, Default)]
pub struct Client {
    /// Restricts which address spaces are probed, reported and attempted.
    /// The default is optimal for both LAN and WAN connectivity;
    /// [`AddrSpaces::NONE`] forces a relay conn.
    pub addr_spaces: AddrSpaces,

    /// Picker used by the dialing side. If `None`, defaults to
    /// [`ConnPicker::wait_for_p2p`] with a one second deadline. The
    /// accepting side always picks its first (and only) survivor.
    pub picker: Option<Arc<dyn Picker>>,

    /// Timeout for the full dial/accept process, if provided. Note this
    /// includes DNS, TLS, signaling delay and probing for p2p. More than 3
    /// seconds is recommended in production.
    pub timeout: Option<Duration>,

    /// Custom TLS config to use with https rdv servers. If `None`, the
    /// webpki root store is used.
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("addr_spaces", &self.addr_spaces)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Dials a peer, shorthand for [`Client::connect`] with [`Method::Dial`].
    pub async fn dial(
        &self,
        ctx: &CancellationToken,
        addr: &str,
        token: &str,
        headers: Option<&Headers>,
    ) -> Result<(Conn, Response), Error> {
        self.connect(ctx, Method::Dial, addr, token, headers).await
    }

    /// Accepts a peer conn, shorthand for [`Client::connect`] with
    /// [`Method::Accept`].
    pub async fn accept(
        &self,
        ctx: &CancellationToken,
        addr: &str,
        token: &str,
        headers: Option<&Headers>,
    ) -> Result<(Conn, Response), Error> {
        self.connect(ctx, Method::Accept, addr, token, headers)
            .await
    }

    /// Connects with another peer through an rdv server endpoint.
    ///
    /// - `ctx`: cancels the whole process, including all in-flight dials.
    /// - `addr`: http(s) addr of the rdv server endpoint.
    /// - `token`: an arbitrary string for matching the two peers, typically
    ///   chosen by the dialer.
    /// - `headers`: optional extra headers included in the request, e.g.
    ///   for authorization.
    ///
    /// Returns [`Error::BadHandshake`] if the server doesn't upgrade the
    /// rdv conn properly; the rejecting HTTP response is attached when
    /// available.
    pub async fn connect(
        &self,
        ctx: &CancellationToken,
        method: Method,
        addr: &str,
        token: &str,
        headers: Option<&Headers>,
    ) -> Result<(Conn, Response), Error> {
        let meta = Meta::new(method, token)?;
        let inner = self.connect_inner(meta, addr, headers);
        let timed = async {
            match self.timeout {
                Some(timeout) => tokio::time::timeout(timeout, inner)
                    .await
                    .map_err(|_| Error::Timeout)?,
                None => inner.await,
            }
        };
        tokio::select! {
            _ = ctx.cancelled() => Err(Error::Canceled),
            res = timed => res,
        }
    }

    async fn connect_inner(
        &self,
        mut meta: Meta,
        addr: &str,
        headers: Option<&Headers>,
    ) -> Result<(Conn, Response), Error> {
        let spaces = self.addr_spaces;
        let picker: Arc<dyn Picker> = match (meta.method, &self.picker) {
            // The accepter has at most one survivor, nothing to wait for
            (Method::Accept, _) => Arc::new(ConnPicker::first()),
            (Method::Dial, Some(picker)) => picker.clone(),
            (Method::Dial, None) => Arc::new(ConnPicker::wait_for_p2p(Duration::from_secs(1))),
        };
        let url = ServerUrl::parse(addr)?;

        let socket = Socket::bind(0)?;
        let laddrs = if spaces.is_none() {
            Default::default()
        } else {
            probe::probe_local_addrs(spaces)
        };
        meta.self_addrs = probe::self_addrs(&laddrs, socket.port(), spaces);
        log::debug!(
            "rdv: request method={} token={} self_addrs={:?}",
            meta.method,
            meta.token,
            meta.self_addrs
        );

        let (relay, resp) = self.dial_rdv_server(&socket, &mut meta, &url, headers).await?;
        log::debug!(
            "rdv: response token={} observed={:?} peer_addrs={:?}",
            meta.token,
            meta.observed_addr,
            meta.peer_addrs
        );

        let conns = if spaces.is_none() {
            race::run_relay_only(relay, picker).await
        } else {
            race::run(socket, laddrs, &meta, relay, picker).await
        };
        if conns.is_empty() {
            return Err(Error::Timeout);
        }
        let chosen = race::commit(conns).await?;
        Ok((chosen, resp))
    }

    /// Dials the rdv server over IPv4 and performs the HTTP upgrade,
    /// returning the relay conn and the parsed response.
    async fn dial_rdv_server(
        &self,
        socket: &Socket,
        meta: &mut Meta,
        url: &ServerUrl,
        headers: Option<&Headers>,
    ) -> Result<(Conn, Response), Error> {
        let tcp = socket::dial_server_v4(socket.port(), &url.host, url.port).await?;
        let stream = match url.scheme {
            Scheme::Http => Stream::Tcp(tcp),
            Scheme::Https => {
                let config = match &self.tls {
                    Some(config) => config.clone(),
                    None => default_tls_config(),
                };
                let connector = tokio_rustls::TlsConnector::from(config);
                let name = rustls::pki_types::ServerName::try_from(url.host.clone())?;
                Stream::ClientTls(Box::new(connector.connect(name, tcp).await?))
            }
        };
        let mut io = BufReader::new(stream);

        let mut req = Request {
            method: meta.method.as_str().to_string(),
            path: url.request_path(&meta.token),
            version: "HTTP/1.1".to_string(),
            headers: headers.cloned().unwrap_or_default(),
        };
        req.headers.set("Host", &url.host_header());
        http1::set_upgrade_headers(&mut req.headers);
        req.headers
            .set(HEADER_SELF_ADDRS, &http1::format_addr_list(&meta.self_addrs));

        write_request(&mut io, &req).await?;
        let mut resp = read_response(&mut io).await?;
        if resp.status != 101 {
            slurp_body(&mut io, &mut resp, MAX_BODY_SLURP).await;
            return Err(Error::BadHandshake {
                reason: format!("unexpected http status {}", resp.status),
                response: Some(Box::new(resp)),
            });
        }
        if let Err(err) = http1::parse_rdv_response(meta, &resp) {
            return Err(Error::BadHandshake {
                reason: err.to_string(),
                response: Some(Box::new(resp)),
            });
        }
        Ok((Conn::relay(io, meta.clone(), None), resp))
    }
}

/// Default TLS config, trusting the webpki roots.
fn default_tls_config() -> Arc<rustls::ClientConfig> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The server didn't upgrade the rdv conn properly. The rejecting HTTP
    /// response is attached when one was parsed.
    #[error("bad http handshake: {reason}{}", bad_handshake_detail(.response))]
    BadHandshake {
        reason: String,
        response: Option<Box<Response>>,
    },

    /// Malformed rdv token, header line or command.
    #[error(transparent)]
    Protocol(#[from] rdv_protocol::Error),

    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    #[error("couldn't resolve any IPv4 addresses for server '{0}'")]
    CouldntResolveAddress(String),

    /// The configured timeout or the picker deadline expired without any
    /// usable conn.
    #[error("timed out waiting for a usable conn")]
    Timeout,

    /// The caller's cancellation token fired.
    #[error("canceled")]
    Canceled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid server DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),
}

fn bad_handshake_detail(response: &Option<Box<Response>>) -> String {
    match response {
        Some(resp) if !resp.body.is_empty() => format!(": {}", resp.body_text()),
        _ => String::new(),
    }
}
