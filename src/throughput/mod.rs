//! Download throughput measurement over the file protocol.
//!
//! Single-stream mode reads one stream to completion, optionally printing a
//! rolling bandwidth estimate.  Multi-stream mode opens all streams up front
//! and drains each on its own task into a shared counter.

pub mod report;

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::host::{Host, Stream, QUIC_MAX_STREAMS};
use crate::peer::PeerId;
use crate::DOWNLOAD_PROTOCOL;

pub use report::{format_summary, TransferReport};

/// Read buffer used by [`drain`].
const DRAIN_BUFFER_SIZE: usize = 64 * 1024;

/// Period of the verbose bandwidth reporter.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(3);

/// Shared byte total, updated with atomics from any number of tasks.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Read `reader` to end-of-stream, adding every chunk to `counter`.
///
/// Returns the number of bytes this call read.  On error the bytes read so
/// far stay counted.
pub async fn drain<R>(reader: &mut R, counter: &ByteCounter) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; DRAIN_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        counter.add(n as u64);
        total += n as u64;
    }
}

/// `delta` bytes over `interval`, in MB/s (10^6 bytes).
pub fn megabytes_per_sec(delta: u64, interval: Duration) -> f64 {
    let secs = interval.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    delta as f64 / (secs * 1e6)
}

/// Print the bandwidth observed on `counter` every `interval` until `stop`.
pub fn spawn_rate_reporter(
    counter: ByteCounter,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        let mut last = counter.get();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let current = counter.get();
            println!("{:.2} MB/s", megabytes_per_sec(current - last, interval));
            last = current;
        }
    })
}

/// Open a download stream and close our write half, since the client never
/// sends anything after negotiation.
async fn open_download(host: &Host, peer: &PeerId) -> Result<Stream> {
    let mut stream = host
        .new_stream(peer, DOWNLOAD_PROTOCOL)
        .await
        .with_context(|| format!("failed to open download stream to {peer}"))?;
    stream
        .shutdown()
        .await
        .with_context(|| format!("failed to close write side of download stream to {peer}"))?;
    Ok(stream)
}

/// Download one stream of [`DOWNLOAD_PROTOCOL`] from `peer`.
pub async fn download_single(
    host: &Host,
    peer: &PeerId,
    verbose: bool,
    shutdown: &CancellationToken,
) -> Result<TransferReport> {
    let start = Instant::now();
    let mut stream = open_download(host, peer).await?;

    let counter = ByteCounter::new();
    let stop = shutdown.child_token();
    let reporter = verbose.then(|| spawn_rate_reporter(counter.clone(), REPORT_INTERVAL, stop.clone()));

    tokio::select! {
        _ = shutdown.cancelled() => info!("download interrupted"),
        result = drain(&mut stream, &counter) => {
            if let Err(e) = result {
                warn!(error = %e, bytes = counter.get(), "download stream failed");
            }
        }
    }

    stop.cancel();
    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }

    Ok(TransferReport {
        bytes: counter.get(),
        elapsed: start.elapsed(),
        streams: 1,
    })
}

/// Open `streams` download streams to `peer`, then drain them in parallel.
///
/// Every stream is open before any is read, so `streams` may not exceed
/// [`QUIC_MAX_STREAMS`]: the peer would never grant credit for one more.
pub async fn download_multi(
    host: &Host,
    peer: &PeerId,
    streams: usize,
    shutdown: &CancellationToken,
) -> Result<TransferReport> {
    anyhow::ensure!(
        streams <= QUIC_MAX_STREAMS as usize,
        "cannot open {streams} streams, at most {QUIC_MAX_STREAMS} are allowed per connection"
    );
    let start = Instant::now();

    let mut opened: Vec<Stream> = Vec::with_capacity(streams);
    for i in 0..streams {
        let stream = open_download(host, peer)
            .await
            .with_context(|| format!("download stream {i}"))?;
        opened.push(stream);
    }
    debug!(streams, "all download streams open");

    let total = ByteCounter::new();
    let workers: Vec<JoinHandle<()>> = opened
        .into_iter()
        .enumerate()
        .map(|(i, mut stream)| {
            let total = total.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    result = drain(&mut stream, &total) => match result {
                        Ok(n) => debug!(stream = i, bytes = n, "download stream finished"),
                        Err(e) => warn!(stream = i, error = %e, "download stream failed"),
                    },
                }
            })
        })
        .collect();

    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "download worker panicked");
        }
    }

    Ok(TransferReport {
        bytes: total.get(),
        elapsed: start.elapsed(),
        streams,
    })
}
