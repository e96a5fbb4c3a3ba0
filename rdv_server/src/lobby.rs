//! The lobby: pairing upgraded conns by token.
//!
//! A single reconciliation task owns the idle map, which makes pairing
//! order deterministic: within one token, arrivals are processed FIFO and
//! the first matching opposite method wins. Everything else (watchdogs,
//! relays) runs concurrently and communicates through bounded channels.
//!
//! While a conn idles in the lobby, a watchdog reads one byte from it. A
//! well-behaved client writes nothing until it receives the `101`, so the
//! expected outcomes are a claim (its partner arrived) or a lobby timeout.
//! Anything else is a protocol violation and the conn is killed with `400`.

use crate::relayer::Relayer;
use rdv_protocol::http1::write_response_err;
use rdv_protocol::{Conn, Method};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// An rdv lobby server. Configure it, then [`Server::start`] it.
#[derive(Debug, Clone, Default)]
pub struct Server {
    /// Amount of time one peer can wait in the lobby for its partner.
    /// `None` means no timeout.
    pub lobby_timeout: Option<Duration>,

    /// Relays paired conns. Customize to set idle timeouts or buffer
    /// sizes.
    pub relayer: Relayer,
}

impl Server {
    /// Starts the reconciliation task and returns the handle used to feed
    /// upgraded conns in.
    ///
    /// `ctx` is handed down to relay handlers: canceling it tears down
    /// running relays, which neither [`ServerHandle::shutdown`] nor
    /// [`ServerHandle::close`] do on their own.
    pub fn start(self, ctx: &CancellationToken) -> ServerHandle {
        let (conn_tx, conn_rx) = mpsc::channel(8);
        let (mon_tx, mon_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let reconciler = Reconciler {
            idle: HashMap::new(),
            conn_rx,
            mon_tx,
            mon_rx,
            lobby_timeout: self.lobby_timeout,
            relayer: self.relayer,
            handlers: JoinSet::new(),
            ctx: ctx.clone(),
            shutdown: shutdown.clone(),
            next_id: 0,
        };
        let task = tokio::spawn(reconciler.run());
        ServerHandle {
            conn_tx,
            closed: Arc::new(AtomicBool::new(false)),
            shutdown,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

/// Returned by [`ServerHandle::upgrade`] once the server is shutting down.
#[derive(thiserror::Error, Debug)]
#[error("rdv server is closed")]
pub struct ServerClosed;

/// Handle to a started lobby. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    conn_tx: mpsc::Sender<Conn>,
    closed: Arc<AtomicBool>,
    shutdown: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ServerHandle {
    /// Adds an upgraded conn to the lobby for matching.
    ///
    /// If the server is shutting down the conn is rejected with a `503`
    /// and [`ServerClosed`] is returned.
    pub async fn upgrade(&self, conn: Conn) -> Result<(), ServerClosed> {
        if self.closed.load(Ordering::SeqCst) {
            reject_closed(conn).await;
            return Err(ServerClosed);
        }
        match self.conn_tx.send(conn).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(conn)) => {
                reject_closed(conn).await;
                Err(ServerClosed)
            }
        }
    }

    /// Evicts all idle clients with a `503` and stops accepting upgrades.
    /// Already-paired relays keep running to completion or idle-timeout.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.cancel();
        }
    }

    /// Calls [`ServerHandle::shutdown`] and waits for relay handlers and
    /// internal tasks to finish. Safe to call multiple times.
    pub async fn close(&self) {
        self.shutdown();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn reject_closed(mut conn: Conn) {
    write_response_err(&mut conn, 503, "rdv server shutting down, try again").await;
}

/// What a watchdog reports back about its conn. `conn` is `None` when the
/// watchdog already killed it for a protocol violation.
struct MonEvent {
    token: String,
    id: u64,
    conn: Option<Conn>,
}

struct IdleEntry {
    id: u64,
    method: Method,
    // Dropping this sender claims the conn back from its watchdog
    _claim: oneshot::Sender<()>,
}

struct Reconciler {
    idle: HashMap<String, IdleEntry>,
    conn_rx: mpsc::Receiver<Conn>,
    mon_tx: mpsc::Sender<MonEvent>,
    mon_rx: mpsc::Receiver<MonEvent>,
    lobby_timeout: Option<Duration>,
    relayer: Relayer,
    handlers: JoinSet<()>,
    ctx: CancellationToken,
    shutdown: CancellationToken,
    next_id: u64,
}

impl Reconciler {
    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(event) = self.mon_rx.recv() => self.kick(event).await,
                conn = self.conn_rx.recv() => match conn {
                    Some(conn) => self.reconcile(conn).await,
                    None => break,
                },
                _ = self.shutdown.cancelled() => break,
            }
        }
        log::info!("rdv: shutting down lobby_conns={}", self.idle.len());

        // Late arrivals that raced the closed flag
        while let Ok(conn) = self.conn_rx.try_recv() {
            reject_closed(conn).await;
        }

        // Dropping the entries claims every idle conn back; each watchdog
        // then reports exactly one event
        let outstanding = self.idle.len();
        self.idle.clear();
        for _ in 0..outstanding {
            if let Some(event) = self.mon_rx.recv().await
                && let Some(conn) = event.conn
            {
                reject_closed(conn).await;
            }
        }

        while self.handlers.join_next().await.is_some() {}
    }

    /// Handles one new arrival: pair, replace, or park it.
    async fn reconcile(&mut self, conn: Conn) {
        let token = conn.token().to_string();
        let Some(entry) = self.idle.remove(&token) else {
            self.insert(conn);
            return;
        };
        if entry.method != conn.method() {
            // Happy path: opposite methods are a pair
            match self.reclaim(entry).await {
                Some(partner) => self.dispatch(partner, conn),
                // The idle conn died just as its partner arrived; the
                // newcomer waits for the next one instead
                None => self.insert(conn),
            }
        } else {
            // Same method: the newcomer replaces the old conn
            let old = self.reclaim(entry).await;
            log::debug!(
                "rdv: replaced token={token} addr={:?}",
                conn.observed_addr()
            );
            self.insert(conn);
            if let Some(mut old) = old {
                write_response_err(&mut old, 409, "replaced by another conn").await;
            }
        }
    }

    /// Parks a conn in the idle map and spawns its watchdog.
    fn insert(&mut self, conn: Conn) {
        let token = conn.token().to_string();
        let method = conn.method();
        log::debug!("rdv: joined token={token} addr={:?}", conn.observed_addr());
        self.next_id += 1;
        let id = self.next_id;
        let (claim_tx, claim_rx) = oneshot::channel();
        tokio::spawn(watch(
            conn,
            id,
            claim_rx,
            self.lobby_timeout,
            self.mon_tx.clone(),
        ));
        self.idle.insert(
            token,
            IdleEntry {
                id,
                method,
                _claim: claim_tx,
            },
        );
    }

    /// Interrupts an entry's watchdog and waits for the conn to come back.
    /// Unrelated conns completing meanwhile are kicked out, which must
    /// happen before our own event since the watchdog answers immediately.
    async fn reclaim(&mut self, entry: IdleEntry) -> Option<Conn> {
        let id = entry.id;
        drop(entry);
        loop {
            let event = self.mon_rx.recv().await?;
            if event.id == id {
                return event.conn;
            }
            self.kick(event).await;
        }
    }

    /// Removes a conn whose watchdog completed on its own: lobby timeout
    /// (answered with `408`) or protocol violation (already killed). The
    /// lookup is guarded by the entry id, so a stale event for a replaced
    /// token can never evict its successor.
    async fn kick(&mut self, event: MonEvent) {
        match self.idle.get(&event.token) {
            Some(entry) if entry.id == event.id => {}
            _ => return,
        }
        self.idle.remove(&event.token);
        match event.conn {
            Some(mut conn) => {
                log::debug!(
                    "rdv: client timed out token={} addr={:?}",
                    event.token,
                    conn.observed_addr()
                );
                write_response_err(&mut conn, 408, "no matching peer found").await;
            }
            None => log::debug!("rdv: client broke protocol token={}", event.token),
        }
    }

    /// Cross-populates peer addrs and hands the pair to a relay task.
    fn dispatch(&mut self, a: Conn, b: Conn) {
        let (mut dc, mut ac) = match a.method() {
            Method::Dial => (a, b),
            Method::Accept => (b, a),
        };
        dc.meta_mut().peer_addrs = ac.meta().self_and_observed_addrs();
        ac.meta_mut().peer_addrs = dc.meta().self_and_observed_addrs();
        let relayer = self.relayer.clone();
        let ctx = self.ctx.clone();
        self.handlers.spawn(async move {
            relayer.serve(&ctx, dc, ac).await;
        });
    }
}

enum Probe {
    /// The reconciler wants the conn back for pairing or eviction.
    Claimed,
    /// Nothing happened for the lobby timeout; the expected idle outcome.
    TimedOut,
    /// The conn produced bytes, EOF or an error before its `101`.
    Read(std::io::Result<usize>),
}

/// Holds an idle conn, watching for misbehavior until the lobby timeout or
/// a claim. Reports exactly one event back to the reconciler.
async fn watch(
    mut conn: Conn,
    id: u64,
    mut claim: oneshot::Receiver<()>,
    lobby_timeout: Option<Duration>,
    mon_tx: mpsc::Sender<MonEvent>,
) {
    let token = conn.token().to_string();
    let outcome = {
        let mut buf = [0u8; 1];
        let probe = async {
            match lobby_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, conn.read(&mut buf)).await {
                    Ok(res) => Probe::Read(res),
                    Err(_) => Probe::TimedOut,
                },
                None => Probe::Read(conn.read(&mut buf).await),
            }
        };
        tokio::select! {
            _ = &mut claim => Probe::Claimed,
            outcome = probe => outcome,
        }
    };
    let conn = match outcome {
        Probe::Claimed | Probe::TimedOut => Some(conn),
        Probe::Read(_) => {
            write_response_err(
                &mut conn,
                400,
                "conn must idle while waiting for response header",
            )
            .await;
            None
        }
    };
    let _ = mon_tx.send(MonEvent { token, id, conn }).await;
}
