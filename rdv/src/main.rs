//! Command line tool for relay-assisted TCP peer-to-peer connections.
//!
//! `dial` and `accept` map stdin/stdout to the rdv conn; `serve` runs the
//! rendezvous server.
#![forbid(unsafe_code)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use rdv_client::{Client, ConnPicker, Picker};
use rdv_protocol::{AddrSpace, AddrSpaces, Method};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    operation: Command,

    /// Log verbosity. (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    verbosity: log::LevelFilter,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to a peer as the dialer; stdin/stdout map to the conn.
    Dial {
        /// http(s) address of the rdv server endpoint.
        addr: String,

        /// Token shared out-of-band with the accepting peer.
        token: String,

        #[command(flatten)]
        opts: ClientOpts,
    },

    /// Wait for a peer as the accepter; stdin/stdout map to the conn.
    Accept {
        /// http(s) address of the rdv server endpoint.
        addr: String,

        /// Token shared out-of-band with the dialing peer.
        token: String,

        #[command(flatten)]
        opts: ClientOpts,
    },

    /// Run the rendezvous server.
    Serve(rdv_server::Args),
}

#[derive(clap::Args, Debug)]
struct ClientOpts {
    /// Enabled addr spaces. 'none' forces a relay conn.
    #[arg(short, long, value_enum, default_value = "default")]
    spaces: Spaces,

    /// Wait up to 5s for all p2p conns, for debugging.
    #[arg(short, long)]
    wait: bool,

    /// Overall timeout in seconds for establishing the conn.
    #[arg(short, long, default_value = "30")]
    timeout: u64,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Spaces {
    Default,
    All,
    Public,
    None,
}

impl From<Spaces> for AddrSpaces {
    fn from(spaces: Spaces) -> AddrSpaces {
        match spaces {
            Spaces::Default => AddrSpaces::DEFAULT,
            Spaces::All => AddrSpaces::ALL,
            Spaces::Public => AddrSpaces::PUBLIC,
            Spaces::None => AddrSpaces::NONE,
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    env_logger::builder()
        .format_module_path(false)
        .format_target(false)
        .format_timestamp(None)
        .filter_level(args.verbosity)
        .init();

    if let Err(err) = run(args).await {
        error!("{err}");
        std::process::exit(1);
    }
}

type RunError = Box<dyn std::error::Error + Send + Sync>;

async fn run(args: Args) -> Result<(), RunError> {
    match args.operation {
        Command::Dial { addr, token, opts } => client_cmd(Method::Dial, &addr, &token, opts).await,
        Command::Accept { addr, token, opts } => {
            client_cmd(Method::Accept, &addr, &token, opts).await
        }
        Command::Serve(args) => {
            let (_addrs, _handle, accept_loops) = rdv_server::start_server(args)?;
            accept_loops.await;
            Ok(())
        }
    }
}

async fn client_cmd(
    method: Method,
    addr: &str,
    token: &str,
    opts: ClientOpts,
) -> Result<(), RunError> {
    let client = Client {
        addr_spaces: opts.spaces.into(),
        picker: opts
            .wait
            .then(|| Arc::new(ConnPicker::wait_constant(Duration::from_secs(5))) as Arc<dyn Picker>),
        timeout: Some(Duration::from_secs(opts.timeout)),
        tls: None,
    };

    let ctx = CancellationToken::new();
    let start = std::time::Instant::now();
    let (conn, _resp) = tokio::select! {
        _ = tokio::signal::ctrl_c() => return Err("interrupted".into()),
        res = client.connect(&ctx, method, addr, token, None) => res?,
    };

    // A non-public observed addr usually means a misconfigured server
    let observed_space = conn.observed_addr().and_then(|a| AddrSpace::of(a.ip()));
    if observed_space != Some(AddrSpace::Public4) {
        warn!(
            "expected observed addr to be public ipv4 (check server config): {:?}",
            conn.observed_addr()
        );
    }
    info!(
        "peer connected is_relay={} addr={:?} dur={:?}",
        conn.is_relay(),
        conn.peer_addr().ok(),
        start.elapsed()
    );

    // map stdin/stdout onto the conn
    let (mut conn_read, mut conn_write) = tokio::io::split(conn);
    let to_peer = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let res = tokio::io::copy(&mut stdin, &mut conn_write).await;
        let _ = conn_write.shutdown().await;
        res
    });

    let mut stdout = tokio::io::stdout();
    let res = tokio::select! {
        _ = tokio::signal::ctrl_c() => Ok(0),
        res = tokio::io::copy(&mut conn_read, &mut stdout) => res,
    };
    stdout.flush().await?;
    to_peer.abort();
    res?;
    Ok(())
}
