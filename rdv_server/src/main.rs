#![forbid(unsafe_code)]
#![warn(clippy::all)]
//! Runs a rendezvous server for rdv peers.

use clap::Parser;
use log::error;
use rdv_server::Args;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match rdv_server::start_server(args) {
        Ok((_addrs, _handle, accept_loops)) => {
            accept_loops.await;
            error!("Server crashed.");
        }
        Err(err) => {
            error!("{err}");
        }
    }
}
