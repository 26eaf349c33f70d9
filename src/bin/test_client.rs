use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use p2pbench::config::BenchConfig;
use p2pbench::fanout::{self, HostDialer};
use p2pbench::multiaddr::PeerAddr;
use p2pbench::stats::Stats;
use p2pbench::{cancel_on_ctrl_c, diagnostics, logging};

#[derive(Parser)]
#[command(
    name = "test-client",
    about = "Open many concurrent connections to a peer and stream small messages on each",
    version,
    long_about = None
)]
struct Cli {
    /// Number of connections [default: 10000]
    #[arg(long)]
    num: Option<usize>,

    /// Maximum connection attempts in flight [default: 32]
    #[arg(long)]
    concurrency: Option<usize>,

    /// Timeout for one connection attempt, in seconds [default: 60]
    #[arg(long, value_name = "SECS")]
    connect_timeout: Option<u64>,

    /// Abort the whole run on the first failed connection
    #[arg(long)]
    fail_fast: bool,

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

    let mut client = config.client.clone();
    if let Some(num) = cli.num {
        client.connections = num;
    }
    if let Some(concurrency) = cli.concurrency {
        client.concurrency = concurrency;
    }
    if let Some(secs) = cli.connect_timeout {
        client.connect_timeout_sec = secs;
    }
    client.fail_fast |= cli.fail_fast;

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let stats = Stats::new();
    diagnostics::spawn(&config.diagnostics, "test-client", stats.clone(), shutdown.clone());

    let fan_out = client.fan_out();
    info!(
        peer_id = %cli.peer.id,
        connections = fan_out.attempts,
        concurrency = fan_out.concurrency,
        transport = %client.transport,
        policy = ?fan_out.policy,
        "starting connection fan-out"
    );

    let dialer = Arc::new(HostDialer::new(
        cli.peer,
        client.transport,
        stats,
        shutdown.clone(),
    ));

    let report = match fanout::run(&fan_out, dialer.clone(), &shutdown).await {
        Ok(report) => report,
        Err(e) => {
            shutdown.cancel();
            dialer.close_all().await;
            return Err(e.into());
        }
    };

    println!("{}", report.summary());
    info!(
        established = report.established,
        failed = report.failures.len(),
        cancelled = report.cancelled,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "fan-out finished"
    );

    // Keep the connections and their message loops alive until interrupted.
    shutdown.cancelled().await;
    dialer.close_all().await;
    Ok(())
}
