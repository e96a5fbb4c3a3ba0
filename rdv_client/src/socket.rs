//! The shared `SO_REUSEPORT` socket.
//!
//! A single TCP port backs everything the client does: the dial to the
//! rendezvous server, every outbound dial to a peer candidate, and the
//! inbound listener. Reusing one port means both peers punch holes with
//! the same 4-tuples, which is what makes TCP simultaneous open and
//! symmetric NAT traversal possible.

use socket2::{SockRef, TcpKeepalive};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

/// The reuseport listener plus the port number all dials share.
#[derive(Debug)]
pub(crate) struct Socket {
    listener: TcpListener,
    port: u16,
}

impl Socket {
    /// Binds the shared socket on `port` (0 for an OS-chosen one).
    ///
    /// Prefers a dual-stack IPv6 listener so both families share one port;
    /// falls back to IPv4-only where the OS refuses.
    pub(crate) fn bind(port: u16) -> std::io::Result<Socket> {
        let listener = match bind_listener(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port)) {
            Ok(listener) => listener,
            Err(_) => bind_listener(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port))?,
        };
        let port = listener.local_addr()?.port();
        Ok(Socket { listener, port })
    }

    /// The dial- and listening port number for the socket.
    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = new_reuse_socket(addr.ip())?;
    if addr.is_ipv6() {
        // Accept IPv4 on the same listener where the OS permits
        let _ = SockRef::from(&socket).set_only_v6(false);
    }
    socket.bind(addr)?;
    socket.listen(1024)
}

/// Dials `peer` from `(laddr, port)` on a fresh socket sharing the
/// reuseport port.
pub(crate) async fn dial_from(
    laddr: IpAddr,
    port: u16,
    peer: SocketAddr,
) -> std::io::Result<TcpStream> {
    let socket = new_reuse_socket(peer.ip())?;
    socket.bind(SocketAddr::new(laddr, port))?;
    socket.connect(peer).await
}

/// Dials the server over IPv4 specifically, from the unspecified address on
/// the reuseport port. The observed-addr contract is an IPv4 one, so an
/// IPv4 path to the server doubles as a zero-STUN public address probe.
pub(crate) async fn dial_server_v4(
    port: u16,
    host: &str,
    server_port: u16,
) -> Result<TcpStream, crate::Error> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, server_port))
        .await?
        .filter(|a| a.is_ipv4())
        .collect();
    if addrs.is_empty() {
        return Err(crate::Error::CouldntResolveAddress(host.to_string()));
    }
    let mut recent_err = std::io::Error::other("no addresses attempted");
    for addr in addrs {
        let attempt = async {
            let socket = new_reuse_socket(addr.ip())?;
            socket.bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port))?;
            socket.connect(addr).await
        };
        match attempt.await {
            Ok(stream) => return Ok(stream),
            Err(err) => recent_err = err,
        }
    }
    Err(crate::Error::Io(recent_err))
}

/// An unbound socket for `ip`'s family with the reuse options already set.
///
/// Every socket of the race must carry `SO_REUSEADDR` and `SO_REUSEPORT`
/// before binding, since they all claim the same local port. Windows has no
/// separate `SO_REUSEPORT` (its `SO_REUSEADDR` subsumes it), and solaris
/// and illumos lack it entirely, so the option is only set where tokio
/// exposes it.
fn new_reuse_socket(ip: IpAddr) -> std::io::Result<TcpSocket> {
    let socket = if ip.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuseport(true)?;

    // Punched paths can die silently mid-race; keepalive probes surface
    // that instead of leaving a wedged candidate around
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(3));
    let _ = SockRef::from(&socket).set_tcp_keepalive(&keepalive);

    Ok(socket)
}
