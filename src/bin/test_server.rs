use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use p2pbench::config::BenchConfig;
use p2pbench::stats::Stats;
use p2pbench::{cancel_on_ctrl_c, diagnostics, logging, server};

#[derive(Parser)]
#[command(
    name = "test-server",
    about = "Echo streams and serve a data file over TCP and QUIC",
    version,
    long_about = None
)]
struct Cli {
    /// Server listen port, shared by TCP and QUIC [default: 4001]
    #[arg(long)]
    port: Option<u16>,

    /// Data file to serve [default: data]
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,

    /// Load or create the server identity from this key file instead of the
    /// built-in seed
    #[arg(long, value_name = "PATH")]
    identity_key: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = p2pbench::parse_args();
    let config = BenchConfig::resolve(cli.config.as_deref())?;
    logging::init(&config.logging);

    let mut server_config = config.server.clone();
    if let Some(port) = cli.port {
        server_config.port = port;
    }
    if let Some(file) = cli.file {
        server_config.data_file = file;
    }
    if let Some(path) = cli.identity_key {
        server_config.identity_key_path = Some(path);
    }

    server::check_data_file(&server_config.data_file)?;

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let stats = Stats::new();
    diagnostics::spawn(&config.diagnostics, "test-server", stats.clone(), shutdown.clone());

    let host = server::start(&server_config, stats).await?;
    for line in server::banner_lines(&host).await {
        println!("{line}");
    }
    info!(peer_id = %host.id(), data_file = %server_config.data_file.display(), "server ready");

    shutdown.cancelled().await;
    host.close().await;
    Ok(())
}
