//! The rdv connection type.

use crate::{Meta, Method, http1::Request};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::net::TcpStream;

/// A TCP or TLS stream carrying an rdv conn.
#[pin_project::pin_project(project = StreamProj)]
#[derive(Debug)]
pub enum Stream {
    Tcp(#[pin] TcpStream),
    /// Client side of a TLS session with an rdv server.
    ClientTls(#[pin] Box<tokio_rustls::client::TlsStream<TcpStream>>),
    /// Server side of a TLS session with an rdv client.
    ServerTls(#[pin] Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Tcp(tcp) => tcp,
            Stream::ClientTls(tls) => tls.get_ref().0,
            Stream::ServerTls(tls) => tls.get_ref().0,
        }
    }

    /// Local socket address of the underlying TCP stream.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp().local_addr()
    }

    /// Remote socket address of the underlying TCP stream.
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.project() {
            StreamProj::Tcp(tcp) => tcp.poll_read(cx, buf),
            StreamProj::ClientTls(tls) => tls.poll_read(cx, buf),
            StreamProj::ServerTls(tls) => tls.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.project() {
            StreamProj::Tcp(tcp) => tcp.poll_write(cx, buf),
            StreamProj::ClientTls(tls) => tls.poll_write(cx, buf),
            StreamProj::ServerTls(tls) => tls.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.project() {
            StreamProj::Tcp(tcp) => tcp.poll_flush(cx),
            StreamProj::ClientTls(tls) => tls.poll_flush(cx),
            StreamProj::ServerTls(tls) => tls.poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.project() {
            StreamProj::Tcp(tcp) => tcp.poll_shutdown(cx),
            StreamProj::ClientTls(tls) => tls.poll_shutdown(cx),
            StreamProj::ServerTls(tls) => tls.poll_shutdown(cx),
        }
    }
}

/// An rdv conn, either direct (p2p) or relayed through the server.
///
/// Reads go through the buffered reader that was used for the handshake,
/// since it may already hold post-upgrade bytes. Implements the usual
/// async stream traits, so it can be used anywhere a TCP stream can.
#[derive(Debug)]
pub struct Conn {
    io: BufReader<Stream>,
    meta: Meta,
    is_relay: bool,
    request: Option<Request>,
}

impl Conn {
    /// Wraps a freshly established direct connection.
    pub fn direct(stream: Stream, meta: Meta) -> Conn {
        Conn {
            io: BufReader::new(stream),
            meta,
            is_relay: false,
            request: None,
        }
    }

    /// Wraps an upgraded HTTP connection, preserving the buffered reader
    /// from the handshake. `request` is the server-side upgrade request,
    /// if any.
    pub fn relay(io: BufReader<Stream>, meta: Meta, request: Option<Request>) -> Conn {
        Conn {
            io,
            meta,
            is_relay: true,
            request,
        }
    }

    /// Whether the conn is relayed by an rdv server. Client conns only.
    pub fn is_relay(&self) -> bool {
        self.is_relay
    }

    pub fn method(&self) -> Method {
        self.meta.method
    }

    pub fn token(&self) -> &str {
        &self.meta.token
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    /// The source address the server observed, if known.
    pub fn observed_addr(&self) -> Option<SocketAddr> {
        self.meta.observed_addr
    }

    /// The peer's candidate addresses, as reported by the server.
    pub fn peer_addrs(&self) -> &[SocketAddr] {
        &self.meta.peer_addrs
    }

    /// Read-only upgrade request. Server conns only.
    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.io.get_ref().local_addr()
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.io.get_ref().peer_addr()
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncBufRead for Conn {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<&[u8]>> {
        Pin::new(&mut self.get_mut().io).poll_fill_buf(cx)
    }

    fn consume(mut self: Pin<&mut Self>, amt: usize) {
        Pin::new(&mut self.io).consume(amt)
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
