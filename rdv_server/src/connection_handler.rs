//! Per-connection upgrade handling.

use crate::lobby::ServerHandle;
use rdv_protocol::http1::{self, Request, read_request, write_response_err};
use rdv_protocol::{Conn, Error, Stream};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

/// Extracts the observed address of a client from its upgrade request and
/// peer socket address. Returning `None` leaves the observed addr unset.
pub type ObservedAddrFn = Arc<dyn Fn(&Request, SocketAddr) -> Option<SocketAddr> + Send + Sync>;

/// Observed-addr hook for servers behind a reverse proxy: takes the first
/// `X-Forwarded-For` entry, with `X-Forwarded-Port` or the source port.
pub fn forwarded_observed_addr(req: &Request, origin: SocketAddr) -> Option<SocketAddr> {
    let ip = req
        .headers
        .get("X-Forwarded-For")?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()?;
    let port = match req.headers.get("X-Forwarded-Port") {
        Some(port) => port.trim().parse().ok()?,
        None => origin.port(),
    };
    Some(SocketAddr::new(ip, port))
}

/// Handles one incoming TCP connection: optional TLS accept, HTTP upgrade
/// validation, then hand-off to the lobby. Rejected upgrades are answered
/// with a real HTTP error. Logs with [`log`].
pub async fn handle_connection(
    tcp_stream: TcpStream,
    origin: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    observed_addr_fn: Option<ObservedAddrFn>,
    handle: ServerHandle,
) {
    let stream = if let Some(tls_acceptor) = tls_acceptor {
        match tls_acceptor.accept(tcp_stream).await {
            Ok(tls_stream) => Stream::ServerTls(Box::new(tls_stream)),
            Err(err) => {
                log::warn!("rdv: TLS accept failed addr={origin} err={err}");
                return;
            }
        }
    } else {
        Stream::Tcp(tcp_stream)
    };

    match upgrade(stream, origin, observed_addr_fn).await {
        Ok(conn) => {
            // The lobby answers with a 503 itself when shutting down
            let _ = handle.upgrade(conn).await;
        }
        Err(err) => log::info!("rdv: bad request addr={origin} err={err}"),
    }
}

/// Reads and validates the upgrade request, returning the hijacked conn
/// with its metadata. The buffered reader survives into the conn, since it
/// may hold bytes belonging to the post-upgrade stream.
async fn upgrade(
    stream: Stream,
    origin: SocketAddr,
    observed_addr_fn: Option<ObservedAddrFn>,
) -> Result<Conn, Error> {
    let mut io = BufReader::new(stream);
    let req = match read_request(&mut io).await {
        Ok(req) => req,
        Err(err) => {
            if matches!(err, Error::Protocol(_)) {
                write_response_err(&mut io, 400, &err.to_string()).await;
            }
            return Err(err);
        }
    };
    let mut meta = match http1::parse_rdv_request(&req) {
        Ok(meta) => meta,
        Err(err) => {
            let status = match &err {
                Error::Upgrade(_) => 426,
                _ => 400,
            };
            write_response_err(&mut io, status, &err.to_string()).await;
            return Err(err);
        }
    };
    meta.observed_addr = match observed_addr_fn {
        Some(observed_addr_fn) => observed_addr_fn(&req, origin),
        None => Some(origin),
    };
    if meta.observed_addr.is_none() {
        log::warn!("rdv: could not get observed addr addr={origin}");
    }
    Ok(Conn::relay(io, meta, Some(req)))
}
