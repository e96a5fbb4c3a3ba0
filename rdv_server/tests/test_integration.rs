#![forbid(unsafe_code)]
#![warn(clippy::all)]

use rdv_protocol::framing::{self, Command};
use rdv_protocol::http1::{self, Headers, Request, read_response, slurp_body};
use rdv_protocol::{HEADER_PEER_ADDRS, HEADER_SELF_ADDRS, Method, path_escape};
use rdv_server::{Relayer, Server, ServerHandle};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Starts a lobby with an accept loop on an OS-chosen loopback port.
async fn start_test_server(server: Server) -> (SocketAddr, ServerHandle) {
    let ctx = CancellationToken::new();
    let handle = server.start(&ctx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_handle = handle.clone();
    tokio::spawn(async move {
        let _ctx = ctx;
        loop {
            let Ok((stream, origin)) = listener.accept().await else {
                break;
            };
            tokio::spawn(rdv_server::handle_connection(
                stream,
                origin,
                None,
                None,
                accept_handle.clone(),
            ));
        }
    });
    (addr, handle)
}

/// Sends a raw rdv upgrade request and returns the conn with the response
/// unread.
async fn upgrade(addr: SocketAddr, method: Method, token: &str) -> BufReader<TcpStream> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut io = BufReader::new(stream);
    let mut headers = Headers::new();
    headers.set("Host", &addr.to_string());
    http1::set_upgrade_headers(&mut headers);
    headers.set(HEADER_SELF_ADDRS, "");
    let req = Request {
        method: method.as_str().to_string(),
        path: format!("/{}", path_escape(token)),
        version: "HTTP/1.1".to_string(),
        headers,
    };
    http1::write_request(&mut io, &req).await.unwrap();
    io
}

/// Reads an error response and its body.
async fn read_error(io: &mut BufReader<TcpStream>) -> (u16, String) {
    let mut resp = read_response(io).await.unwrap();
    slurp_body(io, &mut resp, 1024).await;
    (resp.status, resp.body_text())
}

#[tokio::test]
async fn test_pair_and_relay() {
    let (addr, _handle) = start_test_server(Server::default()).await;

    let mut accepter = upgrade(addr, Method::Accept, "t1").await;
    let mut dialer = upgrade(addr, Method::Dial, "t1").await;

    let dial_resp = read_response(&mut dialer).await.unwrap();
    assert_eq!(dial_resp.status, 101);
    let accept_resp = read_response(&mut accepter).await.unwrap();
    assert_eq!(accept_resp.status, 101);

    // Each side's peer addrs hold the other's observed loopback addr
    for resp in [&dial_resp, &accept_resp] {
        let peers = http1::parse_addr_list(resp.headers.get(HEADER_PEER_ADDRS).unwrap()).unwrap();
        assert_eq!(peers.len(), 1);
        assert!(peers[0].ip().is_loopback());
    }

    framing::write_continue(&mut dialer).await.unwrap();
    assert_eq!(
        framing::read_command(&mut accepter).await.unwrap(),
        Command::Continue
    );

    dialer.write_all(b"hello").await.unwrap();
    dialer.flush().await.unwrap();
    let mut buf = [0u8; 5];
    accepter.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    accepter.write_all(b"world").await.unwrap();
    accepter.flush().await.unwrap();
    dialer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");

    // One side closing ends the relay for both
    drop(dialer);
    let mut rest = Vec::new();
    accepter.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_same_method_replacement() {
    let (addr, _handle) = start_test_server(Server::default()).await;

    let mut first = upgrade(addr, Method::Dial, "r").await;
    let mut second = upgrade(addr, Method::Dial, "r").await;

    // The older conn of the same method is evicted
    let (status, body) = read_error(&mut first).await;
    assert_eq!(status, 409);
    assert_eq!(body, "replaced by another conn");

    // The accepter pairs with the replacement
    let mut accepter = upgrade(addr, Method::Accept, "r").await;
    assert_eq!(read_response(&mut second).await.unwrap().status, 101);
    assert_eq!(read_response(&mut accepter).await.unwrap().status, 101);
}

#[tokio::test]
async fn test_lobby_timeout() {
    let server = Server {
        lobby_timeout: Some(Duration::from_millis(200)),
        ..Server::default()
    };
    let (addr, _handle) = start_test_server(server).await;

    let mut alone = upgrade(addr, Method::Dial, "z").await;
    let (status, body) = read_error(&mut alone).await;
    assert_eq!(status, 408);
    assert_eq!(body, "no matching peer found");
}

#[tokio::test]
async fn test_mismatched_tokens_never_pair() {
    let server = Server {
        lobby_timeout: Some(Duration::from_millis(200)),
        ..Server::default()
    };
    let (addr, _handle) = start_test_server(server).await;

    let mut dialer = upgrade(addr, Method::Dial, "x").await;
    let mut accepter = upgrade(addr, Method::Accept, "y").await;

    assert_eq!(read_error(&mut dialer).await.0, 408);
    assert_eq!(read_error(&mut accepter).await.0, 408);
}

#[tokio::test]
async fn test_watchdog_kills_early_writer() {
    let (addr, _handle) = start_test_server(Server::default()).await;

    let mut eager = upgrade(addr, Method::Dial, "w").await;
    // Writing anything before the 101 breaks the protocol
    eager.write_all(b"x").await.unwrap();
    eager.flush().await.unwrap();

    let (status, body) = read_error(&mut eager).await;
    assert_eq!(status, 400);
    assert_eq!(body, "conn must idle while waiting for response header");
}

#[tokio::test]
async fn test_rejects_non_upgrade_requests() {
    let (addr, _handle) = start_test_server(Server::default()).await;

    // No upgrade headers at all
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut io = BufReader::new(stream);
    let req = Request {
        method: "GET".to_string(),
        path: "/t".to_string(),
        version: "HTTP/1.1".to_string(),
        headers: Headers::new(),
    };
    http1::write_request(&mut io, &req).await.unwrap();
    assert_eq!(read_error(&mut io).await.0, 426);

    // Upgrade headers but a bogus method
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut io = BufReader::new(stream);
    let mut headers = Headers::new();
    http1::set_upgrade_headers(&mut headers);
    let req = Request {
        method: "GET".to_string(),
        path: "/t".to_string(),
        version: "HTTP/1.1".to_string(),
        headers,
    };
    http1::write_request(&mut io, &req).await.unwrap();
    assert_eq!(read_error(&mut io).await.0, 400);

    // Upgrade headers but an empty token
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut io = BufReader::new(stream);
    let mut headers = Headers::new();
    http1::set_upgrade_headers(&mut headers);
    let req = Request {
        method: "DIAL".to_string(),
        path: "/".to_string(),
        version: "HTTP/1.1".to_string(),
        headers,
    };
    http1::write_request(&mut io, &req).await.unwrap();
    assert_eq!(read_error(&mut io).await.0, 400);
}

#[tokio::test]
async fn test_other_ends_relay_without_copying() {
    let (addr, _handle) = start_test_server(Server::default()).await;

    let mut accepter = upgrade(addr, Method::Accept, "o").await;
    let mut dialer = upgrade(addr, Method::Dial, "o").await;
    assert_eq!(read_response(&mut dialer).await.unwrap().status, 101);
    assert_eq!(read_response(&mut accepter).await.unwrap().status, 101);

    // The peers got a direct conn; the server should stop relaying
    framing::write_other(&mut dialer, "10.0.0.9:1234".parse().unwrap())
        .await
        .unwrap();

    // The accepter never sees a CONTINUE, just the teardown
    let mut rest = Vec::new();
    let _ = accepter.read_to_end(&mut rest).await;
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_relay_idle_timeout() {
    let server = Server {
        relayer: Relayer {
            idle_timeout: Some(Duration::from_millis(200)),
            buffer_size: None,
        },
        ..Server::default()
    };
    let (addr, _handle) = start_test_server(server).await;

    let mut accepter = upgrade(addr, Method::Accept, "i").await;
    let mut dialer = upgrade(addr, Method::Dial, "i").await;
    assert_eq!(read_response(&mut dialer).await.unwrap().status, 101);
    assert_eq!(read_response(&mut accepter).await.unwrap().status, 101);
    framing::write_continue(&mut dialer).await.unwrap();
    assert_eq!(
        framing::read_command(&mut accepter).await.unwrap(),
        Command::Continue
    );

    // No traffic in either direction: the idle timer tears the pair down
    let mut rest = Vec::new();
    let _ = accepter.read_to_end(&mut rest).await;
    assert!(rest.is_empty());
    let mut rest = Vec::new();
    let _ = dialer.read_to_end(&mut rest).await;
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_forwarded_observed_addr() {
    // A server behind a reverse proxy trusts the forwarding headers
    let ctx = CancellationToken::new();
    let handle = Server::default().start(&ctx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_handle = handle.clone();
    tokio::spawn(async move {
        let _ctx = ctx;
        loop {
            let Ok((stream, origin)) = listener.accept().await else {
                break;
            };
            tokio::spawn(rdv_server::handle_connection(
                stream,
                origin,
                None,
                Some(std::sync::Arc::new(rdv_server::forwarded_observed_addr)),
                accept_handle.clone(),
            ));
        }
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut dialer = BufReader::new(stream);
    let mut headers = Headers::new();
    http1::set_upgrade_headers(&mut headers);
    headers.set(HEADER_SELF_ADDRS, "");
    headers.set("X-Forwarded-For", "203.0.113.9");
    headers.set("X-Forwarded-Port", "4242");
    let req = Request {
        method: "DIAL".to_string(),
        path: "/f".to_string(),
        version: "HTTP/1.1".to_string(),
        headers,
    };
    http1::write_request(&mut dialer, &req).await.unwrap();

    let mut accepter = upgrade(addr, Method::Accept, "f").await;
    let accept_resp = read_response(&mut accepter).await.unwrap();
    assert_eq!(accept_resp.status, 101);
    let peers =
        http1::parse_addr_list(accept_resp.headers.get(HEADER_PEER_ADDRS).unwrap()).unwrap();
    assert_eq!(peers, vec!["203.0.113.9:4242".parse().unwrap()]);
}

#[tokio::test]
async fn test_shutdown_rejects_idle_and_new() {
    let (addr, handle) = start_test_server(Server::default()).await;

    let mut parked = upgrade(addr, Method::Accept, "s").await;
    // Give the upgrade time to reach the lobby
    tokio::time::sleep(Duration::from_millis(100)).await;

    handle.shutdown();
    let (status, body) = read_error(&mut parked).await;
    assert_eq!(status, 503);
    assert_eq!(body, "rdv server shutting down, try again");

    // New arrivals are rejected outright
    let mut late = upgrade(addr, Method::Dial, "s").await;
    assert_eq!(read_error(&mut late).await.0, 503);

    handle.close().await;
}
