//! The concurrent dial-listen race and the framed hand on each candidate.

use crate::picker::Picker;
use crate::socket::{self, Socket};
use crate::Error;
use rdv_protocol::framing::{
    Command, read_command, read_header, write_continue, write_header, write_other,
};
use rdv_protocol::{AddrSpace, Conn, Meta, Method, SHORT_WRITE_TIMEOUT, Stream, unmap};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Runs the race to completion: spawns the dial/listen fan-out and the hand
/// tasks, feeds the relay conn in as the first candidate, and returns
/// whatever the picker chose, in order of preference.
///
/// Takes ownership of the socket; by the time this returns, the listener is
/// closed and every conn not returned has been torn down.
pub(crate) async fn run(
    socket: Socket,
    laddrs: HashMap<AddrSpace, IpAddr>,
    meta: &Meta,
    relay: Conn,
    picker: Arc<dyn Picker>,
) -> Vec<Conn> {
    let cancel = CancellationToken::new();
    // Tears the race down even if the caller's future is dropped mid-pick
    let _guard = cancel.clone().drop_guard();
    let (conn_tx, conn_rx) = mpsc::channel(8);
    let (candidate_tx, mut candidate_rx) = mpsc::channel(8);

    tokio::spawn(dial_and_listen(
        cancel.clone(),
        laddrs,
        meta.clone(),
        socket,
        conn_tx.clone(),
    ));
    tokio::spawn(hands(cancel.clone(), conn_rx, candidate_tx));

    // The relay conn is a candidate like any other
    let _ = conn_tx.send(relay).await;
    drop(conn_tx);

    let conns = picker.pick(&mut candidate_rx, &cancel).await;
    cancel.cancel();
    conns
}

/// Relay-only variant for `AddrSpaces::NONE`: no probing, no dialing, no
/// listening. The hand still runs so the accepter waits for `CONTINUE`.
pub(crate) async fn run_relay_only(relay: Conn, picker: Arc<dyn Picker>) -> Vec<Conn> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let (conn_tx, conn_rx) = mpsc::channel(1);
    let (candidate_tx, mut candidate_rx) = mpsc::channel(1);

    tokio::spawn(hands(cancel.clone(), conn_rx, candidate_tx));
    let _ = conn_tx.send(relay).await;
    drop(conn_tx);

    let conns = picker.pick(&mut candidate_rx, &cancel).await;
    cancel.cancel();
    conns
}

/// Dials and listens simultaneously to find a p2p match, until canceled.
/// Connected streams are sent to `out`. Takes ownership of the socket.
async fn dial_and_listen(
    cancel: CancellationToken,
    laddrs: HashMap<AddrSpace, IpAddr>,
    meta: Meta,
    socket: Socket,
    out: mpsc::Sender<Conn>,
) {
    let port = socket.port();
    let mut dials = JoinSet::new();
    for &addr in &meta.peer_addrs {
        let addr = unmap(addr);
        let space = AddrSpace::of(addr.ip());
        let Some(&laddr) = space.and_then(|s| laddrs.get(&s)) else {
            log::debug!("rdv: skip addr={addr} space={}", space_str(space));
            continue;
        };
        let cancel = cancel.clone();
        let meta = meta.clone();
        let out = out.clone();
        dials.spawn(async move {
            let res = tokio::select! {
                _ = cancel.cancelled() => return,
                res = socket::dial_from(laddr, port, addr) => res,
            };
            match res {
                Ok(stream) => {
                    let _ = out.send(Conn::direct(Stream::Tcp(stream), meta)).await;
                }
                Err(err) => log::debug!("rdv: dial err addr={addr} err={err}"),
            }
        });
    }

    loop {
        let (stream, raddr) = tokio::select! {
            _ = cancel.cancelled() => break,
            res = socket.accept() => match res {
                Ok(ok) => ok,
                Err(err) => {
                    log::debug!("rdv: accept err err={err}");
                    break;
                }
            },
        };
        let raddr = unmap(raddr);
        let space = AddrSpace::of(raddr.ip());
        if space.is_some_and(|s| laddrs.contains_key(&s)) {
            let _ = out.send(Conn::direct(Stream::Tcp(stream), meta.clone())).await;
        } else {
            log::debug!("rdv: reject addr={raddr} space={}", space_str(space));
        }
    }
    while dials.join_next().await.is_some() {}
    // The socket drops here; only established conns survive
}

fn space_str(space: Option<AddrSpace>) -> String {
    match space {
        Some(space) => space.to_string(),
        None => "invalid".to_string(),
    }
}

/// Runs the client hand for each incoming conn; survivors go to `out`.
async fn hands(cancel: CancellationToken, mut conns: mpsc::Receiver<Conn>, out: mpsc::Sender<Conn>) {
    let mut set = JoinSet::new();
    while let Some(mut conn) = conns.recv().await {
        let cancel = cancel.clone();
        let out = out.clone();
        set.spawn(async move {
            let res = tokio::select! {
                _ = cancel.cancelled() => return,
                res = client_hand(&mut conn) => res,
            };
            match res {
                Ok(()) => {
                    log::debug!("rdv: hand ok addr={:?}", conn.peer_addr().ok());
                    let _ = out.send(conn).await;
                }
                // A failed hand closes and discards the candidate; a single
                // surviving one still suffices
                Err(err) => log::debug!("rdv: hand err addr={:?} err={err}", conn.peer_addr().ok()),
            }
        });
    }
    while set.join_next().await.is_some() {}
}

/// Establishes a candidate connection. The accepter has at most one
/// successful hand, the dialer can have several.
async fn client_hand(conn: &mut Conn) -> Result<(), rdv_protocol::Error> {
    if !conn.is_relay() {
        exchange_headers(conn).await?;
    }
    if conn.method() == Method::Accept {
        // The accepter surfaces a candidate only once the dialer commits
        match read_command(conn).await? {
            Command::Continue => {}
            Command::Other(_) => {
                return Err(rdv_protocol::Error::Protocol("unexpected command".into()));
            }
        }
    }
    Ok(())
}

/// Direct conns write and read the rdv header line; a mismatch means a
/// misdial or a stranger and fails the hand.
async fn exchange_headers(conn: &mut Conn) -> Result<(), rdv_protocol::Error> {
    let method = conn.method();
    let token = conn.token().to_string();
    write_header(conn, method, &token).await?;
    let peer = read_header(conn).await?;
    if peer.method != method.opposite() || peer.token != token {
        return Err(rdv_protocol::Error::Protocol(
            "unexpected header args".into(),
        ));
    }
    Ok(())
}

/// Finalizes the race: commits to `conns[0]` and rejects the rest.
///
/// The dialer confirms the winner with `CONTINUE`; a rejected relay gets an
/// `OTHER` notice so the server stops expecting to relay. A conn whose
/// commit write fails is never returned.
pub(crate) async fn commit(mut conns: Vec<Conn>) -> Result<Conn, Error> {
    let mut chosen = conns.remove(0);
    let chosen_addr = chosen.peer_addr().ok().map(unmap);
    for mut loser in conns {
        log::debug!("rdv: discard addr={:?}", loser.peer_addr().ok());
        if loser.method() == Method::Dial && loser.is_relay() {
            if let Some(addr) = chosen_addr {
                let _ = tokio::time::timeout(SHORT_WRITE_TIMEOUT, write_other(&mut loser, addr))
                    .await;
            }
        }
        // Dropping the loser closes it
    }
    if chosen.method() == Method::Dial {
        match tokio::time::timeout(SHORT_WRITE_TIMEOUT, write_continue(&mut chosen)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Err(Error::Timeout),
        }
    }
    Ok(chosen)
}
