//! Bounded fan-out connection driver.
//!
//! [`run`] launches a fixed number of connection attempts against one peer
//! while never letting more than `concurrency` of them be in flight.  Each
//! attempt ends in an [`AttemptOutcome`]; the driver aggregates them into a
//! [`FanOutReport`] and, under [`FailurePolicy::FailFast`], cancels the rest
//! of the batch after the first failure.
//!
//! [`HostDialer`] is the production [`Dialer`]: one fresh dial-only host per
//! attempt, followed by a periodic `message <n>` writer on the test protocol.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::host::Host;
use crate::multiaddr::{PeerAddr, TransportKind};
use crate::peer::PeerId;
use crate::stats::Stats;
use crate::TEST_PROTOCOL;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What a failed attempt does to the rest of the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure and keep going.
    #[default]
    Continue,
    /// Cancel every remaining attempt and report an error.
    FailFast,
}

#[derive(Debug, Clone)]
pub struct FanOutConfig {
    /// Total number of connection attempts.
    pub attempts: usize,
    /// Maximum attempts in flight at once.
    pub concurrency: usize,
    /// Upper bound for a single attempt.
    pub connect_timeout: Duration,
    pub policy: FailurePolicy,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            attempts: 10_000,
            concurrency: 32,
            connect_timeout: Duration::from_secs(60),
            policy: FailurePolicy::Continue,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Established { attempt: usize, elapsed: Duration },
    Failed { attempt: usize, reason: String },
    TimedOut { attempt: usize },
    Cancelled { attempt: usize },
}

impl AttemptOutcome {
    pub fn attempt(&self) -> usize {
        match self {
            AttemptOutcome::Established { attempt, .. }
            | AttemptOutcome::Failed { attempt, .. }
            | AttemptOutcome::TimedOut { attempt }
            | AttemptOutcome::Cancelled { attempt } => *attempt,
        }
    }

    fn is_failure(&self) -> bool {
        matches!(self, AttemptOutcome::Failed { .. } | AttemptOutcome::TimedOut { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub attempt: usize,
    pub reason: String,
}

/// Aggregate of every attempt that was started.
#[derive(Debug, Clone, Default)]
pub struct FanOutReport {
    pub attempted: usize,
    pub established: usize,
    pub cancelled: usize,
    pub failures: Vec<AttemptFailure>,
    pub elapsed: Duration,
}

impl FanOutReport {
    fn record(&mut self, outcome: AttemptOutcome, timeout: Duration) {
        match outcome {
            AttemptOutcome::Established { attempt, elapsed } => {
                self.established += 1;
                debug!(attempt, elapsed_ms = elapsed.as_millis() as u64, "attempt established");
            }
            AttemptOutcome::Failed { attempt, reason } => {
                warn!(attempt, reason = %reason, "connection attempt failed");
                self.failures.push(AttemptFailure { attempt, reason });
            }
            AttemptOutcome::TimedOut { attempt } => {
                warn!(attempt, timeout_secs = timeout.as_secs(), "connection attempt timed out");
                self.failures.push(AttemptFailure {
                    attempt,
                    reason: format!("timed out after {timeout:?}"),
                });
            }
            AttemptOutcome::Cancelled { .. } => self.cancelled += 1,
        }
    }

    /// Attempts that reached a terminal state.
    pub fn completed(&self) -> usize {
        self.established + self.failures.len() + self.cancelled
    }

    /// Console summary printed once the batch is done.
    pub fn summary(&self) -> String {
        format!("Established {} connections.", self.established)
    }
}

#[derive(Debug, Error)]
pub enum FanOutError {
    #[error("concurrency limit must be at least 1")]
    ZeroConcurrency,

    #[error("attempt {attempt} failed, aborting remaining attempts: {reason}")]
    Aborted {
        attempt: usize,
        reason: String,
        report: FanOutReport,
    },
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// One connection attempt.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, attempt: usize) -> anyhow::Result<()>;
}

/// Run `config.attempts` dials with at most `config.concurrency` in flight.
///
/// Returns once every started attempt is terminal.  Cancelling `shutdown`
/// stops launching new attempts and cancels the in-flight ones.
pub async fn run<D: Dialer>(
    config: &FanOutConfig,
    dialer: Arc<D>,
    shutdown: &CancellationToken,
) -> Result<FanOutReport, FanOutError> {
    if config.concurrency == 0 {
        return Err(FanOutError::ZeroConcurrency);
    }

    let start = Instant::now();
    let semaphore = Arc::new(Semaphore::new(config.concurrency));
    let abort = shutdown.child_token();
    let (tx, mut rx) = mpsc::unbounded_channel::<AttemptOutcome>();
    let mut report = FanOutReport::default();

    let settle = |report: &mut FanOutReport, outcome: AttemptOutcome| {
        if outcome.is_failure() && config.policy == FailurePolicy::FailFast {
            abort.cancel();
        }
        report.record(outcome, config.connect_timeout);
    };

    for attempt in 0..config.attempts {
        let permit = tokio::select! {
            _ = abort.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        while let Ok(outcome) = rx.try_recv() {
            settle(&mut report, outcome);
        }
        if abort.is_cancelled() {
            break;
        }

        report.attempted += 1;
        let dialer = dialer.clone();
        let abort = abort.clone();
        let tx = tx.clone();
        let timeout = config.connect_timeout;

        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = tokio::select! {
                _ = abort.cancelled() => AttemptOutcome::Cancelled { attempt },
                result = tokio::time::timeout(timeout, dialer.dial(attempt)) => match result {
                    Ok(Ok(())) => AttemptOutcome::Established { attempt, elapsed: started.elapsed() },
                    Ok(Err(e)) => AttemptOutcome::Failed { attempt, reason: format!("{e:#}") },
                    Err(_) => AttemptOutcome::TimedOut { attempt },
                },
            };
            // Report before releasing the slot so the driver sees the outcome
            // no later than the freed permit.
            let _ = tx.send(outcome);
            drop(permit);
        });
    }

    drop(tx);
    while let Some(outcome) = rx.recv().await {
        settle(&mut report, outcome);
    }
    report.elapsed = start.elapsed();

    if config.policy == FailurePolicy::FailFast {
        if let Some(first) = report.failures.iter().min_by_key(|f| f.attempt).cloned() {
            return Err(FanOutError::Aborted {
                attempt: first.attempt,
                reason: first.reason,
                report,
            });
        }
    }

    info!(
        attempted = report.attempted,
        established = report.established,
        failed = report.failures.len(),
        cancelled = report.cancelled,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "fan-out finished"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Host dialer and message loop
// ---------------------------------------------------------------------------

/// Interval of the message loop for attempt `attempt`: `rand(0..=attempt) + 1`
/// seconds.
pub fn message_interval<R: Rng + ?Sized>(attempt: usize, rng: &mut R) -> Duration {
    Duration::from_secs(rng.gen_range(0..=attempt as u64) + 1)
}

/// Write one `message <n>` frame.
pub async fn write_message<W>(writer: &mut W, counter: u64) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(format!("message {counter}").as_bytes())
        .await?;
    writer.flush().await
}

/// Write `message 0`, `message 1`, ... every `period` until a write fails or
/// `shutdown` is cancelled.  Returns the number of messages written.
pub async fn message_loop<W>(writer: &mut W, period: Duration, shutdown: &CancellationToken) -> u64
where
    W: AsyncWrite + Unpin,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    let mut counter = 0u64;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = write_message(writer, counter).await {
            debug!(sent = counter, error = %e, "message loop stopped");
            break;
        }
        counter += 1;
    }

    counter
}

/// Open one test-protocol stream to `peer` and run [`message_loop`] on it.
pub fn spawn_messenger(
    host: Host,
    peer: PeerId,
    attempt: usize,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let period = message_interval(attempt, &mut rand::thread_rng());

    tokio::spawn(async move {
        let mut stream = match host.new_stream(&peer, TEST_PROTOCOL).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(host = %host.id(), error = %e, "failed to open message stream");
                return;
            }
        };
        debug!(host = %host.id(), period_secs = period.as_secs(), "message loop started");
        message_loop(&mut stream, period, &shutdown).await;
    })
}

/// Production [`Dialer`]: a fresh dial-only host per attempt.
///
/// Established hosts are kept so [`HostDialer::close_all`] can shut them down.
pub struct HostDialer {
    target: PeerAddr,
    transport: TransportKind,
    stats: Arc<Stats>,
    hosts: Mutex<Vec<Host>>,
    shutdown: CancellationToken,
}

impl HostDialer {
    pub fn new(
        target: PeerAddr,
        transport: TransportKind,
        stats: Arc<Stats>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            target,
            transport,
            stats,
            hosts: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Close every host created by this dialer.
    pub async fn close_all(&self) {
        let hosts: Vec<Host> = self.hosts.lock().await.drain(..).collect();
        for host in hosts {
            host.close().await;
        }
    }
}

#[async_trait]
impl Dialer for HostDialer {
    async fn dial(&self, attempt: usize) -> anyhow::Result<()> {
        let start = Instant::now();

        let host = Host::builder()
            .no_listen_addrs()
            .transport(self.transport)
            .stats(self.stats.clone())
            .build()
            .await
            .context("failed to construct host")?;

        if let Err(e) = host.connect(&self.target).await {
            host.close().await;
            return Err(e).with_context(|| format!("failed to connect to {}", self.target.id));
        }

        println!("Connected {} in {:?}.", host.id(), start.elapsed());

        spawn_messenger(host.clone(), self.target.id, attempt, self.shutdown.child_token());
        self.hosts.lock().await.push(host);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Stream;
    use crate::multiaddr::Multiaddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    /// Dialer that sleeps, tracks in-flight attempts and can fail selected ones.
    struct MockDialer {
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
        fail: fn(usize) -> bool,
    }

    impl MockDialer {
        fn new(delay: Duration, fail: fn(usize) -> bool) -> Arc<Self> {
            Arc::new(Self {
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl Dialer for MockDialer {
        async fn dial(&self, attempt: usize) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if (self.fail)(attempt) {
                anyhow::bail!("mock failure for attempt {attempt}");
            }
            Ok(())
        }
    }

    fn config(attempts: usize, concurrency: usize, policy: FailurePolicy) -> FanOutConfig {
        FanOutConfig {
            attempts,
            concurrency,
            connect_timeout: Duration::from_secs(5),
            policy,
        }
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_and_pacing() {
        let dialer = MockDialer::new(Duration::from_millis(100), |_| false);
        let token = CancellationToken::new();

        let report = run(&config(50, 5, FailurePolicy::Continue), dialer.clone(), &token)
            .await
            .unwrap();

        assert_eq!(report.attempted, 50);
        assert_eq!(report.established, 50);
        assert_eq!(report.completed(), 50);
        assert!(dialer.max_in_flight.load(Ordering::SeqCst) <= 5);
        assert!(report.elapsed >= Duration::from_secs(1), "elapsed {:?}", report.elapsed);
    }

    #[tokio::test]
    async fn test_zero_attempts() {
        let dialer = MockDialer::new(Duration::from_millis(1), |_| false);
        let report = run(
            &config(0, 4, FailurePolicy::Continue),
            dialer.clone(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected() {
        let dialer = MockDialer::new(Duration::from_millis(1), |_| false);
        let err = run(
            &config(3, 0, FailurePolicy::Continue),
            dialer,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FanOutError::ZeroConcurrency));
    }

    #[tokio::test]
    async fn test_continue_policy_keeps_going() {
        let dialer = MockDialer::new(Duration::from_millis(5), |i| i % 3 == 0);
        let report = run(
            &config(9, 2, FailurePolicy::Continue),
            dialer.clone(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.attempted, 9);
        assert_eq!(report.established, 6);
        assert_eq!(report.failures.len(), 3);
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 9);
        assert_eq!(report.summary(), "Established 6 connections.");
    }

    #[tokio::test]
    async fn test_fail_fast_aborts_batch() {
        let dialer = MockDialer::new(Duration::from_millis(20), |i| i == 0);
        let err = run(
            &config(100, 4, FailurePolicy::FailFast),
            dialer.clone(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        match err {
            FanOutError::Aborted { attempt, report, .. } => {
                assert_eq!(attempt, 0);
                assert!(report.attempted < 100);
                assert_eq!(report.completed(), report.attempted);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(dialer.calls.load(Ordering::SeqCst) < 100);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let dialer = MockDialer::new(Duration::from_millis(200), |_| false);
        let cfg = FanOutConfig {
            attempts: 2,
            concurrency: 2,
            connect_timeout: Duration::from_millis(20),
            policy: FailurePolicy::Continue,
        };
        let report = run(&cfg, dialer, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.established, 0);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures[0].reason.contains("timed out"));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight() {
        let dialer = MockDialer::new(Duration::from_secs(30), |_| false);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let report = run(&config(10, 3, FailurePolicy::Continue), dialer, &token)
            .await
            .unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.cancelled, 3);
        assert_eq!(report.completed(), report.attempted);
    }

    #[test]
    fn test_message_interval_range() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            assert_eq!(message_interval(0, &mut rng), Duration::from_secs(1));
            let d = message_interval(4, &mut rng);
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(5));
        }
    }

    #[tokio::test]
    async fn test_message_loop_stops_on_write_error() {
        let mut mock = tokio_test::io::Builder::new()
            .write(b"message 0")
            .write(b"message 1")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            .build();

        let sent = message_loop(&mut mock, Duration::from_millis(5), &CancellationToken::new()).await;
        assert_eq!(sent, 2);
    }

    #[tokio::test]
    async fn test_message_loop_stops_on_shutdown() {
        let token = CancellationToken::new();
        token.cancel();
        let mut sink = tokio::io::sink();
        assert_eq!(message_loop(&mut sink, Duration::from_secs(1), &token).await, 0);
    }

    #[test]
    fn test_failure_policy_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: FailurePolicy,
        }
        let w: Wrapper = toml::from_str("policy = \"fail_fast\"").unwrap();
        assert_eq!(w.policy, FailurePolicy::FailFast);
        assert_eq!(FailurePolicy::default(), FailurePolicy::Continue);
    }

    #[tokio::test]
    async fn test_host_dialer_streams_messages_to_live_host() {
        let server = Host::builder()
            .transport(TransportKind::Quic)
            .listen_addr(Multiaddr::from_socket_addr(
                TransportKind::Quic,
                "127.0.0.1:0".parse().unwrap(),
            ))
            .build()
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        server
            .set_stream_handler(TEST_PROTOCOL, move |mut stream: Stream| {
                let tx = tx.clone();
                async move {
                    let mut first = [0u8; 9];
                    if stream.read_exact(&mut first).await.is_ok() {
                        let _ = tx.send(String::from_utf8_lossy(&first).into_owned());
                    }
                }
            })
            .await;

        let shutdown = CancellationToken::new();
        let target = PeerAddr {
            id: server.id(),
            addrs: server.addrs().await,
        };
        let dialer = Arc::new(HostDialer::new(
            target,
            TransportKind::Quic,
            Stats::new(),
            shutdown.clone(),
        ));

        let report = run(&config(6, 3, FailurePolicy::FailFast), dialer.clone(), &shutdown)
            .await
            .unwrap();
        assert_eq!(report.established, 6);
        assert!(report.failures.is_empty());

        let first = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, "message 0");

        shutdown.cancel();
        dialer.close_all().await;
        server.close().await;
    }
}
