//! Connection pickers.
//!
//! A picker is the policy that decides which candidate connections to use
//! as they become available from the hand phase.

use async_trait::async_trait;
use rdv_protocol::Conn;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Decides which conns to use, as they become available.
///
/// `pick` is invoked when peers begin their connection attempts to each
/// other. Implementations must drain the candidates channel and return all
/// conns in order of preference, where the first will be chosen and
/// returned to the user. The channel is closed when a timeout or
/// cancellation occurs upstream, or through the `cancel` token.
#[async_trait]
pub trait Picker: Send + Sync {
    async fn pick(
        &self,
        candidates: &mut mpsc::Receiver<Conn>,
        cancel: &CancellationToken,
    ) -> Vec<Conn>;
}

/// The built-in picker policies.
#[derive(Debug, Clone)]
pub struct ConnPicker {
    /// If set, the picker completes when this expires.
    timeout: Option<Duration>,

    /// A hook that causes the picker to complete immediately.
    complete_on: fn(&Conn) -> bool,
}

impl ConnPicker {
    /// Completes as soon as any conn is available.
    ///
    /// This is what the accepting side always uses, since it surfaces at
    /// most one survivor.
    pub fn first() -> ConnPicker {
        ConnPicker {
            timeout: None,
            complete_on: |_| true,
        }
    }

    /// Completes when a p2p conn is found, or falls back to the relay when
    /// the timeout expires.
    ///
    /// Experimentally, it takes ~2-3 RTT to establish a p2p conn, whereas
    /// the relay conn is already present. Thus, "penalizing" the relay conn
    /// by 300-3000 ms is a reasonable balance between finding the best
    /// connection and keeping establishment time low.
    ///
    /// Remember to set any application-level dial/accept timeouts much
    /// higher than this picking timeout, since rdv involves several more
    /// steps, like dns lookups and tcp/tls establishment.
    pub fn wait_for_p2p(timeout: Duration) -> ConnPicker {
        ConnPicker {
            timeout: Some(timeout),
            complete_on: |conn| !conn.is_relay(),
        }
    }

    /// Always waits for a specific amount of time and returns every
    /// candidate. Useful for debugging and collecting stats.
    pub fn wait_constant(timeout: Duration) -> ConnPicker {
        ConnPicker {
            timeout: Some(timeout),
            complete_on: |_| false,
        }
    }
}

#[async_trait]
impl Picker for ConnPicker {
    async fn pick(
        &self,
        candidates: &mut mpsc::Receiver<Conn>,
        cancel: &CancellationToken,
    ) -> Vec<Conn> {
        let timer = async {
            match self.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timer);
        let mut fired = false;

        let mut conns = Vec::new();
        loop {
            tokio::select! {
                candidate = candidates.recv() => match candidate {
                    Some(conn) => {
                        if (self.complete_on)(&conn) {
                            cancel.cancel();
                        }
                        conns.push(conn);
                    }
                    None => break,
                },
                _ = &mut timer, if !fired => {
                    fired = true;
                    cancel.cancel();
                }
            }
        }
        // Relays sort last; the sort is stable so arrival order decides
        // otherwise
        conns.sort_by_key(Conn::is_relay);
        conns
    }
}
