#![forbid(unsafe_code)]
#![warn(clippy::all)]
//! Runs a rendezvous server for rdv peers.
//!
//! Clients upgrade an HTTP/1.1 request into an rdv conn; the server parks
//! each one in a per-token lobby, pairs the first arriving dial/accept of
//! matching token, exchanges their candidate addresses in the upgrade
//! response, and keeps both TCP connections around as a fallback relay.

mod connection_handler;
mod lobby;
mod relayer;

pub use connection_handler::{ObservedAddrFn, forwarded_observed_addr, handle_connection};
pub use lobby::{Server, ServerClosed, ServerHandle};
pub use relayer::{RelayError, Relayer};

use anyhow::{Context, anyhow};
use clap::Parser;
use log::{debug, error, info};
use socket2::{Domain, Protocol, TcpKeepalive, Type};
use std::future::Future;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_rustls::{TlsAcceptor, rustls};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// PEM file of private TLS server key
    #[arg(short, long, required_unless_present("unencrypted"))]
    pub key: Option<PathBuf>,

    /// PEM file of signed TLS server certificate
    #[arg(short, long, required_unless_present("unencrypted"))]
    pub certificate: Option<PathBuf>,

    /// Use unencrypted TCP instead of TLS
    #[arg(short, long, conflicts_with_all(["key", "certificate"]))]
    pub unencrypted: bool,

    /// Socket addresses on which to listen.
    #[arg(short, long, default_values = ["0.0.0.0:8686", "[::]:8686"])]
    pub addresses: Vec<SocketAddr>,

    /// Number of seconds one peer can wait in the lobby for its partner.
    /// 0 disables the timeout.
    #[arg(short, long, default_value = "60")]
    pub lobby_timeout: u64,

    /// Number of seconds of relay inactivity after which a pair is
    /// disconnected. 0 disables the timeout.
    #[arg(short, long, default_value = "0")]
    pub idle_timeout: u64,

    /// Log verbosity. (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub verbosity: log::LevelFilter,
}

/// Spawns the rdv server in the background.
///
/// Returns the addresses actually listened on, the lobby handle (for
/// shutdown), and a future that drives the accept loops.
///
/// Must be called from a tokio async context.
pub fn start_server(
    args: Args,
) -> anyhow::Result<(Vec<SocketAddr>, ServerHandle, impl Future<Output = ()>)> {
    // set the log level according to the command line argument
    if let Err(err) = env_logger::builder()
        .filter_level(args.verbosity)
        .try_init()
    {
        debug!("Couldn't initialize logger: {err}")
    }

    let tcp_listeners: anyhow::Result<Vec<tokio::net::TcpListener>> =
        args.addresses.into_iter().map(bind_listener).collect();
    let tcp_listeners = tcp_listeners?;

    // the addresses we've actually bound to, with OS-chosen ports resolved
    let addresses: std::io::Result<Vec<SocketAddr>> =
        tcp_listeners.iter().map(|l| l.local_addr()).collect();
    let addresses = addresses.context("Couldn't determine local address")?;

    let tls_acceptor = if let (Some(key), Some(cert)) = (args.key, args.certificate) {
        Some(load_tls_acceptor(&key, &cert)?)
    } else {
        None
    };

    let server = Server {
        lobby_timeout: timeout_secs(args.lobby_timeout),
        relayer: Relayer {
            idle_timeout: timeout_secs(args.idle_timeout),
            buffer_size: None,
        },
    };
    let ctx = CancellationToken::new();
    let handle = server.start(&ctx);

    let mut joinset = JoinSet::new();
    for tcp_listener in tcp_listeners {
        joinset.spawn(run_single_server(
            handle.clone(),
            tcp_listener,
            tls_acceptor.clone(),
        ));
    }
    let accept_loops = async move {
        // relay teardown token lives as long as the accept loops
        let _ctx = ctx;
        joinset.join_all().await;
    };

    info!("Listening on these addresses: {addresses:?}");
    info!("Is encrypted?: {}", tls_acceptor.is_some());
    info!("Lobby timeout in seconds (0 = none): {}", args.lobby_timeout);
    info!("Relay idle timeout in seconds (0 = none): {}", args.idle_timeout);
    info!("Server is now running.");

    Ok((addresses, handle, accept_loops))
}

fn timeout_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

async fn run_single_server(
    handle: ServerHandle,
    tcp_listener: tokio::net::TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
) {
    loop {
        let (stream, origin) = match tcp_listener.accept().await {
            Ok(ok) => ok,
            Err(err) => {
                error!("Error accepting incoming TCP connection: {err}.");
                continue;
            }
        };
        debug!("Accepted incoming TCP connection from {origin}.");

        tokio::spawn(handle_connection(
            stream,
            origin,
            tls_acceptor.clone(),
            None,
            handle.clone(),
        ));
    }
}

/// Binds one listening socket.
///
/// IPv6 listeners are kept v6-only so they don't shadow the IPv4 listener
/// bound to the same port, and keepalive reclaims conns whose peer went
/// silent while parked in the lobby.
fn bind_listener(addr: SocketAddr) -> anyhow::Result<tokio::net::TcpListener> {
    let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .with_context(|| format!("socket creation failed for {addr}"))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(120))
        .with_interval(Duration::from_secs(15));
    socket.set_tcp_keepalive(&keepalive)?;
    socket.bind(&addr.into())?;
    socket.listen(64)?;

    let std_listener: std::net::TcpListener = socket.into();
    std_listener.set_nonblocking(true)?;
    tokio::net::TcpListener::from_std(std_listener)
        .with_context(|| format!("listener setup failed for {addr}"))
}

/// Loads a PEM key/certificate pair into a [`TlsAcceptor`].
fn load_tls_acceptor(key_path: &Path, cert_path: &Path) -> anyhow::Result<TlsAcceptor> {
    let mut key_reader = BufReader::new(
        std::fs::File::open(key_path).with_context(|| format!("reading TLS key {key_path:?}"))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("parsing TLS key {key_path:?}"))?
        .ok_or_else(|| anyhow!("{key_path:?} contains no private key"))?;

    let mut cert_reader = BufReader::new(
        std::fs::File::open(cert_path)
            .with_context(|| format!("reading TLS certificate {cert_path:?}"))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing TLS certificate {cert_path:?}"))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building the TLS server config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
