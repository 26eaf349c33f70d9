use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use p2pbench::config::BenchConfig;
use p2pbench::host::Host;
use p2pbench::multiaddr::PeerAddr;
use p2pbench::stats::Stats;
use p2pbench::throughput::{self, format_summary};
use p2pbench::{cancel_on_ctrl_c, diagnostics, logging};

#[derive(Parser)]
#[command(
    name = "test-throughput",
    about = "Download the server's data file over one or more streams and report throughput",
    version,
    long_about = None
)]
struct Cli {
    /// Print the bandwidth every 3 seconds (single-stream mode)
    #[arg(short, long)]
    verbose: bool,

    /// Number of parallel download streams [default: 1]
    #[arg(long)]
    streams: Option<usize>,

    /// Configuration file (TOML)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Peer address, e.g. /ip4/127.0.0.1/udp/4001/quic/p2p/<PEER_ID>
    #[arg(value_name = "PEER")]
    peer: PeerAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = p2pbench::parse_args();
    let config = BenchConfig::resolve(cli.config.as_deref())?;
    logging::init(&config.logging);

    let streams = cli.streams.unwrap_or(config.client.streams);
    anyhow::ensure!(streams >= 1, "--streams must be at least 1");

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let stats = Stats::new();
    diagnostics::spawn(&config.diagnostics, "test-throughput", stats.clone(), shutdown.clone());

    let host = Host::builder()
        .no_listen_addrs()
        .transport(config.client.transport)
        .stats(stats)
        .build()
        .await
        .context("failed to construct host")?;

    let timeout = Duration::from_secs(config.client.connect_timeout_sec);
    tokio::time::timeout(timeout, host.connect(&cli.peer))
        .await
        .with_context(|| format!("timed out connecting to {}", cli.peer.id))?
        .with_context(|| format!("failed to connect to {}", cli.peer.id))?;
    info!(peer_id = %cli.peer.id, streams, "connected, starting download");

    let result = if streams == 1 {
        throughput::download_single(&host, &cli.peer.id, cli.verbose, &shutdown).await
    } else {
        throughput::download_multi(&host, &cli.peer.id, streams, &shutdown).await
    };

    shutdown.cancel();
    host.close().await;

    println!("{}", format_summary(&result?));
    Ok(())
}
