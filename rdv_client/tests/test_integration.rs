#![forbid(unsafe_code)]
#![warn(clippy::all)]

use rdv_client::{Client, Error};
use rdv_protocol::framing;
use rdv_protocol::http1::{self, Headers, Request, read_response};
use rdv_protocol::{AddrSpaces, HEADER_PEER_ADDRS, HEADER_SELF_ADDRS, Method};
use rdv_server::{Server, ServerHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_util::sync::CancellationToken;

/// Starts a lobby with an accept loop on an OS-chosen loopback port.
async fn start_test_server(server: Server) -> (String, ServerHandle) {
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
    (format!("http://{addr}"), handle)
}

fn relay_only_client() -> Client {
    Client {
        addr_spaces: AddrSpaces::NONE,
        timeout: Some(Duration::from_secs(5)),
        ..Client::default()
    }
}

fn lan_client() -> Client {
    // ALL includes loopback, so two processes on one machine can win a
    // direct conn through the test server
    Client {
        addr_spaces: AddrSpaces::ALL,
        timeout: Some(Duration::from_secs(5)),
        ..Client::default()
    }
}

#[tokio::test]
async fn test_relay_only() {
    let (url, _handle) = start_test_server(Server::default()).await;

    let accepter = tokio::spawn({
        let url = url.clone();
        async move {
            let ctx = CancellationToken::new();
            let (conn, _resp) = relay_only_client()
                .accept(&ctx, &url, "t1", None)
                .await
                .unwrap();
            conn
        }
    });

    let ctx = CancellationToken::new();
    let (mut dial_conn, _resp) = relay_only_client()
        .dial(&ctx, &url, "t1", None)
        .await
        .unwrap();
    assert!(dial_conn.is_relay());
    // With no self-addrs, the only candidate the peer learns is the
    // observed addr
    assert_eq!(dial_conn.peer_addrs().len(), 1);

    dial_conn.write_all(b"hello").await.unwrap();
    dial_conn.shutdown().await.unwrap();

    let mut accept_conn = accepter.await.unwrap();
    assert!(accept_conn.is_relay());
    assert_eq!(accept_conn.method(), Method::Accept);
    assert_eq!(accept_conn.token(), "t1");

    let mut received = Vec::new();
    accept_conn.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"hello");
}

#[tokio::test]
async fn test_direct_win_on_loopback() {
    let (url, _handle) = start_test_server(Server::default()).await;

    let accepter = tokio::spawn({
        let url = url.clone();
        async move {
            let ctx = CancellationToken::new();
            let (conn, _resp) = lan_client()
                .accept(&ctx, &url, "uuid-abc", None)
                .await
                .unwrap();
            conn
        }
    });

    let ctx = CancellationToken::new();
    let (mut dial_conn, _resp) = lan_client()
        .dial(&ctx, &url, "uuid-abc", None)
        .await
        .unwrap();

    assert!(!dial_conn.is_relay());
    assert!(dial_conn.peer_addr().unwrap().ip().is_loopback());

    let mut accept_conn = accepter.await.unwrap();
    assert!(!accept_conn.is_relay());
    assert!(accept_conn.peer_addr().unwrap().ip().is_loopback());

    dial_conn.write_all(b"ping").await.unwrap();
    dial_conn.flush().await.unwrap();
    let mut buf = [0u8; 4];
    accept_conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    accept_conn.write_all(b"pong").await.unwrap();
    accept_conn.flush().await.unwrap();
    dial_conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
}

#[tokio::test]
async fn test_empty_token_rejected_preflight() {
    let ctx = CancellationToken::new();
    let err = Client::default()
        .dial(&ctx, "http://127.0.0.1:1", "", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

#[tokio::test]
async fn test_lobby_timeout_surfaces_as_bad_handshake() {
    let server = Server {
        lobby_timeout: Some(Duration::from_millis(200)),
        ..Server::default()
    };
    let (url, _handle) = start_test_server(server).await;

    let ctx = CancellationToken::new();
    let err = relay_only_client()
        .accept(&ctx, &url, "nobody-dials", None)
        .await
        .unwrap_err();
    let Error::BadHandshake {
        response: Some(resp),
        ..
    } = err
    else {
        panic!("expected BadHandshake, got {err:?}");
    };
    assert_eq!(resp.status, 408);
    assert_eq!(resp.body_text(), "no matching peer found");
}

#[tokio::test]
async fn test_cancellation() {
    let (url, _handle) = start_test_server(Server::default()).await;

    let ctx = CancellationToken::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let client = Client {
        addr_spaces: AddrSpaces::NONE,
        ..Client::default()
    };
    let err = client.accept(&ctx, &url, "nobody", None).await.unwrap_err();
    assert!(matches!(err, Error::Canceled));
}

/// Full dial/accept over TLS on both sides: the server terminates TLS with
/// a checked-in self-signed certificate, and the clients trust it through
/// a custom root store.
#[tokio::test]
async fn test_tls_end_to_end() {
    let data_dir = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data");
    let args = rdv_server::Args {
        key: Some(format!("{data_dir}/key.pem").into()),
        certificate: Some(format!("{data_dir}/cert.pem").into()),
        unencrypted: false,
        addresses: vec!["127.0.0.1:0".parse().unwrap()],
        lobby_timeout: 60,
        idle_timeout: 0,
        verbosity: log::LevelFilter::Off,
    };
    let (addrs, _handle, accept_loops) = rdv_server::start_server(args).unwrap();
    tokio::spawn(accept_loops);
    let url = format!("https://localhost:{}", addrs[0].port());

    // Trust the test certificate instead of the webpki roots
    let mut roots = rustls::RootCertStore::empty();
    let cert_file = std::fs::File::open(format!("{data_dir}/cert.pem")).unwrap();
    for cert in rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file)) {
        roots.add(cert.unwrap()).unwrap();
    }
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    );
    let tls_client = Client {
        addr_spaces: AddrSpaces::NONE,
        timeout: Some(Duration::from_secs(5)),
        tls: Some(tls_config),
        ..Client::default()
    };

    let accepter = tokio::spawn({
        let client = tls_client.clone();
        let url = url.clone();
        async move {
            let ctx = CancellationToken::new();
            let (conn, _resp) = client.accept(&ctx, &url, "tls-token", None).await.unwrap();
            conn
        }
    });

    let ctx = CancellationToken::new();
    let (mut dial_conn, _resp) = tls_client.dial(&ctx, &url, "tls-token", None).await.unwrap();
    assert!(dial_conn.is_relay());

    dial_conn.write_all(b"hello").await.unwrap();
    dial_conn.flush().await.unwrap();

    let mut accept_conn = accepter.await.unwrap();
    assert!(accept_conn.is_relay());
    let mut buf = [0u8; 5];
    accept_conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}

/// A stranger who learns a candidate port but not the token must be
/// dropped without disturbing the race.
#[tokio::test]
async fn test_wrong_token_hand_is_dropped() {
    let (url, _handle) = start_test_server(Server::default()).await;
    let server_addr: SocketAddr = url.strip_prefix("http://").unwrap().parse().unwrap();

    let accepter = tokio::spawn({
        let url = url.clone();
        async move {
            let ctx = CancellationToken::new();
            let (conn, _resp) = lan_client()
                .accept(&ctx, &url, "secret", None)
                .await
                .unwrap();
            conn
        }
    });
    // Let the accepter reach the lobby
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The attacker pairs over the rdv protocol (it knows the token here,
    // to learn the candidate list) but probes a candidate port with the
    // wrong token
    let stream = TcpStream::connect(server_addr).await.unwrap();
    let mut relay = BufReader::new(stream);
    let mut headers = Headers::new();
    headers.set("Host", &server_addr.to_string());
    http1::set_upgrade_headers(&mut headers);
    headers.set(HEADER_SELF_ADDRS, "");
    let req = Request {
        method: Method::Dial.as_str().to_string(),
        path: "/secret".to_string(),
        version: "HTTP/1.1".to_string(),
        headers,
    };
    http1::write_request(&mut relay, &req).await.unwrap();
    let resp = read_response(&mut relay).await.unwrap();
    assert_eq!(resp.status, 101);
    let peers = http1::parse_addr_list(resp.headers.get(HEADER_PEER_ADDRS).unwrap()).unwrap();
    let target = *peers
        .iter()
        .find(|a| a.is_ipv4() && a.ip().is_loopback())
        .unwrap();

    let mut bogus = TcpStream::connect(target).await.unwrap();
    bogus.write_all(b"rdv/1 DIAL wrongtoken\n").await.unwrap();
    bogus.flush().await.unwrap();
    // The accepter sends its header, sees the mismatch, and hangs up
    let mut rest = Vec::new();
    let _ = bogus.read_to_end(&mut rest).await;

    // The legitimate path is unaffected: committing on the relay completes
    // the accepter's hand
    framing::write_continue(&mut relay).await.unwrap();
    let mut accept_conn = accepter.await.unwrap();
    assert!(accept_conn.is_relay());

    relay.write_all(b"ping").await.unwrap();
    relay.flush().await.unwrap();
    let mut buf = [0u8; 4];
    accept_conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
}
