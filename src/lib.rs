//! p2pbench -- load-testing tools for a peer-to-peer networking stack.
//!
//! The crate provides a small host layer (identities, QUIC and TCP+TLS
//! transports, multiaddresses, stream negotiation) and the three programs
//! built on it: a connection fan-out client, a download throughput client
//! and an echo/file server.

pub mod cert;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fanout;
pub mod host;
pub mod identity;
pub mod logging;
pub mod multiaddr;
pub mod peer;
pub mod server;
pub mod stats;
pub mod throughput;
pub mod tls;
pub mod wire;

use clap::error::ErrorKind;
use clap::Parser;
use tokio_util::sync::CancellationToken;

/// Protocol echoed by the server and written to by the load-test client.
pub const TEST_PROTOCOL: &str = "/libp2p/test/data";

/// Protocol on which the server streams its data file.
pub const DOWNLOAD_PROTOCOL: &str = "/libp2p/test/data/file";

/// Parse command-line arguments, exiting with status 1 on usage errors.
///
/// `--help` and `--version` still exit 0.
pub fn parse_args<T: Parser>() -> T {
    match T::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    }
}

/// Cancel `token` on Ctrl-C.
pub fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received, shutting down");
                token.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for Ctrl-C"),
        }
    });
}
