//! Echo and file server.
//!
//! Listens on the same port over TCP and QUIC with a stable identity, echoes
//! every stream of [`TEST_PROTOCOL`] and streams the configured data file on
//! [`DOWNLOAD_PROTOCOL`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::host::{p2p_addr, Host, Stream};
use crate::identity::Identity;
use crate::multiaddr::{Multiaddr, TransportKind};
use crate::stats::Stats;
use crate::{DOWNLOAD_PROTOCOL, TEST_PROTOCOL};

/// Size of the per-stream echo buffer.
pub const ECHO_BUFFER_SIZE: usize = 100;

/// Copy everything read from `stream` back to it, [`ECHO_BUFFER_SIZE`] bytes
/// at a time, until the peer closes its side.  Returns the bytes echoed.
pub async fn echo<S>(stream: &mut S) -> io::Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; ECHO_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    stream.shutdown().await?;
    Ok(total)
}

async fn handle_echo_stream(mut stream: Stream) {
    let remote = stream.remote_peer();
    match echo(&mut stream).await {
        Ok(bytes) => debug!(peer_id = %remote, bytes, "echo stream closed by peer"),
        Err(e) => debug!(peer_id = %remote, error = %e, "echo stream ended"),
    }
    debug!(peer_id = %remote, "done with connection");
}

/// Write the whole file at `path` to `stream`, then close it.
pub async fn serve_file<S>(stream: &mut S, path: &Path) -> io::Result<u64>
where
    S: AsyncWrite + Unpin,
{
    let mut file = tokio::fs::File::open(path).await?;
    let sent = tokio::io::copy(&mut file, stream).await?;
    stream.shutdown().await?;
    Ok(sent)
}

/// Fail early when the data file is missing or unreadable.
pub fn check_data_file(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("data file {} is not accessible", path.display()))?;
    anyhow::ensure!(meta.is_file(), "data file {} is not a regular file", path.display());
    Ok(())
}

/// The server identity: a key file when configured, the seeded key otherwise.
pub fn server_identity(config: &ServerConfig) -> Result<Identity> {
    match &config.identity_key_path {
        Some(path) => Identity::from_key_file(path),
        None => Ok(Identity::from_seed([config.identity_seed; 32])),
    }
}

/// Bind the listeners, register the protocol handlers and return the host.
pub async fn start(config: &ServerConfig, stats: Arc<Stats>) -> Result<Host> {
    check_data_file(&config.data_file)?;
    let identity = server_identity(config)?;

    let socket = std::net::SocketAddr::new(config.listen_ip, config.port);
    let host = Host::builder()
        .identity(identity)
        .transport(TransportKind::Tcp)
        .transport(TransportKind::Quic)
        .listen_addr(Multiaddr::from_socket_addr(TransportKind::Tcp, socket))
        .listen_addr(Multiaddr::from_socket_addr(TransportKind::Quic, socket))
        .stats(stats)
        .build()
        .await
        .with_context(|| format!("failed to start host on port {}", config.port))?;

    host.set_stream_handler(TEST_PROTOCOL, handle_echo_stream).await;

    let data_file: Arc<PathBuf> = Arc::new(config.data_file.clone());
    host.set_stream_handler(DOWNLOAD_PROTOCOL, move |mut stream: Stream| {
        let data_file = data_file.clone();
        async move {
            let remote = stream.remote_peer();
            match serve_file(&mut stream, &data_file).await {
                Ok(sent) => info!(peer_id = %remote, bytes = sent, "served data file"),
                Err(e) => warn!(peer_id = %remote, error = %e, "failed to serve data file"),
            }
        }
    })
    .await;

    Ok(host)
}

/// `I am <addr>/p2p/<id>` for every bound address.
pub async fn banner_lines(host: &Host) -> Vec<String> {
    host.addrs()
        .await
        .iter()
        .map(|addr| format!("I am {}", p2p_addr(addr, host.id())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiaddr::PeerAddr;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_echo_short_message() {
        let mut mock = tokio_test::io::Builder::new()
            .read(b"message 0")
            .write(b"message 0")
            .build();
        assert_eq!(echo(&mut mock).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_echo_splits_large_write() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let handle = tokio::spawn(async move { echo(&mut server).await.unwrap() });

        let payload: Vec<u8> = (0..250u32).map(|i| (i % 251) as u8).collect();
        client.write_all(&payload).await.unwrap();
        client.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);
        assert_eq!(handle.await.unwrap(), 250);
    }

    #[tokio::test]
    async fn test_echo_reads_at_most_buffer_size() {
        let chunk = [9u8; 250];
        let mut mock = tokio_test::io::Builder::new()
            .read(&chunk)
            .write(&chunk[..100])
            .write(&chunk[100..200])
            .write(&chunk[200..])
            .build();
        assert_eq!(echo(&mut mock).await.unwrap(), 250);
    }

    #[tokio::test]
    async fn test_serve_file_streams_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"payload bytes").unwrap();

        let mut out = Vec::new();
        let sent = serve_file(&mut out, &path).await.unwrap();
        assert_eq!(sent, 13);
        assert_eq!(out, b"payload bytes");
    }

    #[test]
    fn test_check_data_file() {
        let dir = TempDir::new().unwrap();
        assert!(check_data_file(&dir.path().join("missing")).is_err());
        assert!(check_data_file(dir.path()).is_err());

        let path = dir.path().join("data");
        std::fs::write(&path, b"x").unwrap();
        assert!(check_data_file(&path).is_ok());
    }

    #[test]
    fn test_server_identity_sources() {
        let seeded = server_identity(&ServerConfig::default()).unwrap();
        assert_eq!(seeded.peer_id(), Identity::from_seed([1u8; 32]).peer_id());

        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            identity_key_path: Some(dir.path().join("server.key")),
            ..ServerConfig::default()
        };
        let first = server_identity(&config).unwrap();
        let second = server_identity(&config).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
        assert_ne!(first.peer_id(), seeded.peer_id());
    }

    fn loopback_config(dir: &TempDir) -> ServerConfig {
        let data_file = dir.path().join("data");
        std::fs::write(&data_file, vec![3u8; 10_000]).unwrap();
        ServerConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            data_file,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_prints_banner_per_transport() {
        let dir = TempDir::new().unwrap();
        let host = start(&loopback_config(&dir), Stats::new()).await.unwrap();

        let lines = banner_lines(&host).await;
        assert_eq!(lines.len(), 2);
        let suffix = format!("/p2p/{}", host.id());
        assert!(lines.iter().all(|l| l.starts_with("I am /ip4/127.0.0.1/") && l.ends_with(&suffix)));
        assert!(lines.iter().any(|l| l.contains("/tcp/")));
        assert!(lines.iter().any(|l| l.contains("/udp/") && l.contains("/quic/")));

        host.close().await;
    }

    #[tokio::test]
    async fn test_banner_lists_interfaces_for_wildcard_listen() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ..loopback_config(&dir)
        };
        let host = start(&config, Stats::new()).await.unwrap();

        let lines = banner_lines(&host).await;
        assert!(lines.iter().any(|l| l.starts_with("I am /ip4/127.0.0.1/tcp/")));
        assert!(lines.iter().any(|l| l.starts_with("I am /ip4/127.0.0.1/udp/")));
        assert!(lines.iter().all(|l| !l.contains("/0.0.0.0/")));

        host.close().await;
    }

    #[tokio::test]
    async fn test_start_requires_data_file() {
        let config = ServerConfig {
            data_file: PathBuf::from("/nonexistent/data"),
            port: 0,
            ..ServerConfig::default()
        };
        assert!(start(&config, Stats::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_echo_and_download_end_to_end() {
        let dir = TempDir::new().unwrap();
        let server = start(&loopback_config(&dir), Stats::new()).await.unwrap();
        let target = PeerAddr {
            id: server.id(),
            addrs: server.addrs().await,
        };

        for kind in [TransportKind::Quic, TransportKind::Tcp] {
            let client = Host::builder()
                .transport(kind)
                .no_listen_addrs()
                .build()
                .await
                .unwrap();
            client.connect(&target).await.unwrap();

            let mut stream = client.new_stream(&server.id(), TEST_PROTOCOL).await.unwrap();
            stream.write_all(b"message 0").await.unwrap();
            stream.shutdown().await.unwrap();
            let mut echoed = Vec::new();
            stream.read_to_end(&mut echoed).await.unwrap();
            assert_eq!(echoed, b"message 0");

            let mut download = client.new_stream(&server.id(), DOWNLOAD_PROTOCOL).await.unwrap();
            let mut data = Vec::new();
            download.read_to_end(&mut data).await.unwrap();
            assert_eq!(data.len(), 10_000);

            client.close().await;
        }

        server.close().await;
    }
}
