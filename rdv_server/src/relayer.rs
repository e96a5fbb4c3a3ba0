//! The relay engine.
//!
//! Given a paired dialer and accepter conn, the relayer writes both `101`
//! responses, reads the dialer's post-handshake command, and on `CONTINUE`
//! copies bytes in both directions until either side closes,
//! an idle timer fires, or the parent context is canceled. The two conns
//! are always torn down together.

use rdv_protocol::framing::{Command, read_command, write_continue};
use rdv_protocol::http1::{rdv_response, write_response};
use rdv_protocol::{Conn, SHORT_WRITE_TIMEOUT};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Why a relay ended. The first cause wins.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum RelayError {
    /// The peers established a direct connection. This is the intended
    /// outcome from their point of view, but an "error" for the server,
    /// which expected to relay data.
    #[error("rdv other: {0:?}")]
    Other(Option<SocketAddr>),

    /// One side closed its write half; the normal end of a relay.
    #[error("EOF")]
    Eof,

    /// No bytes moved in either direction for the idle timeout.
    #[error("relay idled out")]
    IdleTimeout,

    /// The parent context was canceled.
    #[error("canceled")]
    Canceled,

    #[error(transparent)]
    Protocol(#[from] rdv_protocol::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Relays data between a pair of rdv conns. The default value can be used.
#[derive(Debug, Clone, Default)]
pub struct Relayer {
    /// Duration of inactivity after which the relay is closed. `None`
    /// means no timeout. Also bounds the pre-relay command exchange.
    pub idle_timeout: Option<Duration>,

    /// Size of the copy buffers. Defaults to 16 KiB.
    pub buffer_size: Option<usize>,
}

impl Relayer {
    /// Serves a pair by completing the handshake and relaying data between
    /// the peers as necessary. Progress and byte counts are logged.
    ///
    /// Call [`Relayer::proceed`] and [`Relayer::relay`] directly for custom
    /// behavior, monitoring or rate limiting.
    pub async fn serve(&self, ctx: &CancellationToken, mut dc: Conn, mut ac: Conn) {
        let token = dc.token().to_string();
        let start = Instant::now();
        match self.proceed(ctx, &mut dc, &mut ac).await {
            Ok(()) => {
                log::debug!("rdv: continue token={token} dur={:?}", start.elapsed());
            }
            Err(RelayError::Other(addr)) => {
                // The peers succeeded on their own; nothing to relay
                log::info!("rdv: other token={token} addr={addr:?}");
                return;
            }
            Err(err) => {
                log::info!("rdv: continue failed token={token} err={err}");
                return;
            }
        }
        let (dial_bytes, accept_bytes, cause) = self.relay(ctx, dc, ac).await;
        log::info!(
            "rdv: relay done token={token} dial_bytes={dial_bytes} accept_bytes={accept_bytes} cause={cause}"
        );
    }

    /// Sends the HTTP upgrade response to both conns (dialer first) and
    /// forwards the dialer's `CONTINUE` to the accepter, completing the
    /// accepter's hand. Returns [`RelayError::Other`] if a p2p conn was
    /// established instead.
    pub async fn proceed(
        &self,
        ctx: &CancellationToken,
        dc: &mut Conn,
        ac: &mut Conn,
    ) -> Result<(), RelayError> {
        let exchange = async {
            write_response(dc, &rdv_response(dc.meta())).await?;
            write_response(ac, &rdv_response(ac.meta())).await?;
            // The 101 goes out before the dialer's command is read
            match read_command(dc).await? {
                Command::Continue => {}
                Command::Other(addr) => return Err(RelayError::Other(addr)),
            }
            write_continue(ac).await?;
            Ok(())
        };
        let bounded = async {
            match self.idle_timeout {
                Some(timeout) => tokio::time::timeout(timeout, exchange)
                    .await
                    .map_err(|_| RelayError::IdleTimeout)?,
                None => exchange.await,
            }
        };
        tokio::select! {
            _ = ctx.cancelled() => Err(RelayError::Canceled),
            res = bounded => res,
        }
    }

    /// Copies data between the two conns until either side closes, the
    /// idle timer fires, or `ctx` is canceled; the first cause closes both
    /// sides. Returns the bytes copied from the dialer, the bytes copied
    /// from the accepter, and the cause.
    ///
    /// [`Relayer::proceed`] must have completed beforehand.
    pub async fn relay(
        &self,
        ctx: &CancellationToken,
        dc: Conn,
        ac: Conn,
    ) -> (u64, u64, RelayError) {
        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        let teardown = Arc::new(Teardown::default());
        let activity = Arc::new(Mutex::new(Instant::now()));

        let (dial_read, dial_write) = tokio::io::split(dc);
        let (accept_read, accept_write) = tokio::io::split(ac);

        let from_accepter = tokio::spawn(copy_direction(
            accept_read,
            dial_write,
            buffer_size,
            activity.clone(),
            teardown.clone(),
        ));
        let from_dialer = copy_direction(
            dial_read,
            accept_write,
            buffer_size,
            activity.clone(),
            teardown.clone(),
        );

        let watch = async {
            tokio::select! {
                _ = teardown.done.cancelled() => {}
                _ = ctx.cancelled() => teardown.finish(RelayError::Canceled),
                _ = idle_monitor(self.idle_timeout, &activity) => {
                    teardown.finish(RelayError::IdleTimeout)
                }
            }
        };

        let (dial_bytes, ()) = tokio::join!(from_dialer, watch);
        let accept_bytes = from_accepter.await.unwrap_or(0);
        let cause = teardown.take_cause();
        (dial_bytes, accept_bytes, cause)
    }
}

/// Shared first-cause-wins teardown signal for one relay.
#[derive(Default)]
struct Teardown {
    cause: Mutex<Option<RelayError>>,
    done: CancellationToken,
}

impl Teardown {
    fn finish(&self, cause: RelayError) {
        let mut slot = self.cause.lock().unwrap();
        if slot.is_none() {
            *slot = Some(cause);
            self.done.cancel();
        }
    }

    fn take_cause(&self) -> RelayError {
        self.cause.lock().unwrap().take().unwrap_or(RelayError::Eof)
    }
}

/// One serial pipe of the relay. Every read refreshes the shared idle
/// timer; the first EOF or error tears both directions down.
async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    activity: Arc<Mutex<Instant>>,
    teardown: Arc<Teardown>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut copied = 0u64;
    loop {
        let n = tokio::select! {
            _ = teardown.done.cancelled() => break,
            res = reader.read(&mut buf) => match res {
                Ok(0) => {
                    teardown.finish(RelayError::Eof);
                    break;
                }
                Ok(n) => n,
                Err(err) => {
                    teardown.finish(RelayError::Io(err));
                    break;
                }
            },
        };
        *activity.lock().unwrap() = Instant::now();
        let res = tokio::select! {
            _ = teardown.done.cancelled() => break,
            res = writer.write_all(&buf[..n]) => res,
        };
        match res {
            Ok(()) => copied += n as u64,
            Err(err) => {
                teardown.finish(RelayError::Io(err));
                break;
            }
        }
    }
    let _ = tokio::time::timeout(SHORT_WRITE_TIMEOUT, writer.shutdown()).await;
    copied
}

/// Resolves once no activity has been recorded for `idle`; pends forever
/// without a timeout.
async fn idle_monitor(idle: Option<Duration>, activity: &Mutex<Instant>) {
    let Some(idle) = idle else {
        return std::future::pending().await;
    };
    loop {
        let last = *activity.lock().unwrap();
        tokio::time::sleep_until(last + idle).await;
        let last = *activity.lock().unwrap();
        if last.elapsed() >= idle {
            return;
        }
    }
}
