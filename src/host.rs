//! Local networking endpoint.
//!
//! A [`Host`] owns an identity, the enabled transports, its listeners and
//! the connections to remote peers.  Two transports are supported:
//!
//! - **QUIC** (`/udp/<port>/quic`): one connection per peer, one
//!   bidirectional QUIC stream per [`Stream`].
//! - **TCP** (`/tcp/<port>`): TLS 1.3 over TCP.  TCP carries no stream
//!   multiplexer, so every [`Stream`] after the first uses its own TLS
//!   connection to the same address.
//!
//! Both transports use mutual TLS with the self-signed identity certificates
//! from [`crate::cert`]; the remote [`PeerId`] is always derived from the
//! certificate the remote presented, never from anything it claims.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{IdleTimeout, TransportConfig, VarInt};
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cert::peer_id_from_cert;
use crate::error::HostError;
use crate::identity::Identity;
use crate::multiaddr::{Multiaddr, PeerAddr, Protocol, TransportKind};
use crate::peer::PeerId;
use crate::stats::Stats;
use crate::tls::TlsConfigs;
use crate::wire::{self, WireError};

/// Server name sent in the TLS handshake.  Certificates are never checked
/// against it.
const TLS_SERVER_NAME: &str = "p2pbench";

/// QUIC idle timeout in milliseconds.
const QUIC_IDLE_TIMEOUT_MS: u32 = 60_000;

/// QUIC keep-alive interval.
const QUIC_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Maximum concurrent inbound streams per QUIC connection.  A stream only
/// returns its credit once both directions are finished.
pub const QUIC_MAX_STREAMS: u32 = 1024;

type HostResult<T> = Result<T, HostError>;

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// Byte transport underneath a [`Stream`].
trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// A QUIC bidirectional stream as one duplex object.
struct QuicStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl AsyncRead for QuicStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.get_mut().send), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().send), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().send), cx)
    }
}

/// A negotiated, reliable, ordered byte stream to a remote peer.
///
/// Reads and writes are counted into the host's [`Stats`].
pub struct Stream {
    io: Box<dyn StreamIo>,
    remote: PeerId,
    protocol: String,
    stats: Arc<Stats>,
}

impl Stream {
    pub fn remote_peer(&self) -> PeerId {
        self.remote
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("remote", &self.remote)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.io).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            this.stats.add_read((buf.filled().len() - before) as u64);
        }
        poll
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.io).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            this.stats.add_written(n as u64);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// Handler invoked for every inbound stream of a registered protocol.
type StreamHandler = Arc<dyn Fn(Stream) -> BoxFuture<'static, ()> + Send + Sync>;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and binds a [`Host`].
///
/// Without explicit listen addresses the host listens on an ephemeral port
/// of every enabled transport, unless [`HostBuilder::no_listen_addrs`] is
/// set.  Without explicit transports both TCP and QUIC are enabled.
#[derive(Default)]
pub struct HostBuilder {
    identity: Option<Identity>,
    listen_addrs: Vec<Multiaddr>,
    no_listen_addrs: bool,
    transports: Vec<TransportKind>,
    stats: Option<Arc<Stats>>,
}

impl HostBuilder {
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn listen_addr(mut self, addr: Multiaddr) -> Self {
        self.listen_addrs.push(addr);
        self
    }

    /// Dial-only host: bind no listeners at all.
    pub fn no_listen_addrs(mut self) -> Self {
        self.no_listen_addrs = true;
        self
    }

    pub fn transport(mut self, kind: TransportKind) -> Self {
        if !self.transports.contains(&kind) {
            self.transports.push(kind);
        }
        self
    }

    /// Counters to update; a private set is used otherwise.
    pub fn stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Bind every listener and start accepting connections.
    pub async fn build(self) -> HostResult<Host> {
        let identity = self.identity.unwrap_or_else(Identity::generate);
        let id = identity.peer_id();
        let transports = if self.transports.is_empty() {
            vec![TransportKind::Tcp, TransportKind::Quic]
        } else {
            self.transports
        };

        let TlsConfigs {
            server: tls_server,
            client: tls_client,
        } = TlsConfigs::for_identity(&identity).map_err(|e| HostError::Setup(format!("{e:#}")))?;

        let transport_config = Arc::new(quic_transport_config());

        let quic_server_crypto = QuicServerConfig::try_from(tls_server.as_ref().clone())
            .map_err(|e| HostError::Setup(format!("QUIC server crypto: {e}")))?;
        let mut quic_server = quinn::ServerConfig::with_crypto(Arc::new(quic_server_crypto));
        quic_server.transport_config(transport_config.clone());

        let quic_client_crypto = QuicClientConfig::try_from(tls_client.as_ref().clone())
            .map_err(|e| HostError::Setup(format!("QUIC client crypto: {e}")))?;
        let mut quic_client = quinn::ClientConfig::new(Arc::new(quic_client_crypto));
        quic_client.transport_config(transport_config);

        let listen_addrs = if self.no_listen_addrs {
            Vec::new()
        } else if self.listen_addrs.is_empty() {
            transports
                .iter()
                .map(|kind| Multiaddr::from_socket_addr(*kind, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))))
                .collect()
        } else {
            self.listen_addrs
        };

        let inner = Arc::new(HostInner {
            id,
            transports,
            tls_client,
            tls_server,
            quic_client,
            quic_server,
            listen_addrs: RwLock::new(Vec::new()),
            quic_endpoints: Mutex::new(Vec::new()),
            connections: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            stats: self.stats.unwrap_or_default(),
            shutdown: CancellationToken::new(),
        });

        for addr in &listen_addrs {
            let bound = match inner.listen(addr).await {
                Ok(bound) => bound,
                Err(e) => {
                    inner.shutdown.cancel();
                    return Err(e);
                }
            };
            info!(peer_id = %id, addr = %bound, "listening");
            inner.listen_addrs.write().await.push(bound);
        }

        Ok(Host { inner })
    }
}

fn quic_transport_config() -> TransportConfig {
    let mut config = TransportConfig::default();
    config
        .max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(QUIC_IDLE_TIMEOUT_MS))))
        .keep_alive_interval(Some(QUIC_KEEP_ALIVE))
        .max_concurrent_bidi_streams(VarInt::from_u32(QUIC_MAX_STREAMS));
    config
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

enum PeerConnection {
    Quic(quinn::Connection),
    /// TCP connections are per stream; `idle` holds the verified connection
    /// from [`Host::connect`] until the first stream uses it.
    Tcp {
        addr: SocketAddr,
        idle: Option<TlsStream<TcpStream>>,
    },
}

/// How [`Host::new_stream`] reaches a connected peer.
enum Route {
    Quic(quinn::Connection),
    Tcp(SocketAddr, Option<TlsStream<TcpStream>>),
}

struct HostInner {
    id: PeerId,
    transports: Vec<TransportKind>,
    tls_client: Arc<rustls::ClientConfig>,
    tls_server: Arc<rustls::ServerConfig>,
    quic_client: quinn::ClientConfig,
    quic_server: quinn::ServerConfig,
    listen_addrs: RwLock<Vec<Multiaddr>>,
    quic_endpoints: Mutex<Vec<quinn::Endpoint>>,
    connections: Mutex<HashMap<PeerId, PeerConnection>>,
    handlers: RwLock<HashMap<String, StreamHandler>>,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
}

/// Cheaply cloneable handle to a running host.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    pub fn builder() -> HostBuilder {
        HostBuilder::default()
    }

    pub fn id(&self) -> PeerId {
        self.inner.id
    }

    /// Bound listen addresses, with ephemeral ports resolved.
    ///
    /// Wildcard listeners (`0.0.0.0`, `::`) are reported once per local
    /// interface address of the same family, loopback first, so every entry
    /// can be handed to a dialer.
    pub async fn addrs(&self) -> Vec<Multiaddr> {
        let bound = self.inner.listen_addrs.read().await.clone();
        if !bound.iter().any(is_wildcard) {
            return bound;
        }
        let ips = interface_ips();
        bound
            .iter()
            .flat_map(|addr| expand_wildcard(addr, &ips))
            .collect()
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.inner.stats.clone()
    }

    /// Ensure a connection to `peer` exists.
    ///
    /// Addresses are tried in order; the first one whose transport is enabled
    /// and whose remote proves the expected identity wins.
    pub async fn connect(&self, peer: &PeerAddr) -> HostResult<()> {
        if self.is_connected(&peer.id).await {
            return Ok(());
        }
        if peer.addrs.is_empty() {
            return Err(HostError::NoAddresses(peer.id));
        }

        let mut last_err = None;
        for addr in &peer.addrs {
            match self.inner.dial(peer.id, addr).await {
                Ok(conn) => {
                    self.inner.stats.connection_established();
                    debug!(peer_id = %peer.id, addr = %addr, "connected");
                    self.inner.connections.lock().await.insert(peer.id, conn);
                    return Ok(());
                }
                Err(e) => {
                    debug!(peer_id = %peer.id, addr = %addr, error = %e, "dial failed");
                    last_err = Some(e);
                }
            }
        }

        self.inner.stats.connection_failed();
        Err(last_err.unwrap_or(HostError::NoAddresses(peer.id)))
    }

    pub async fn is_connected(&self, peer: &PeerId) -> bool {
        match self.inner.connections.lock().await.get(peer) {
            Some(PeerConnection::Quic(conn)) => conn.close_reason().is_none(),
            Some(PeerConnection::Tcp { .. }) => true,
            None => false,
        }
    }

    /// Open a stream to a connected peer and negotiate `protocol` on it.
    pub async fn new_stream(&self, peer: &PeerId, protocol: &str) -> HostResult<Stream> {
        if self.inner.shutdown.is_cancelled() {
            return Err(HostError::Closed);
        }

        let route = {
            let mut connections = self.inner.connections.lock().await;
            match connections.get_mut(peer) {
                Some(PeerConnection::Quic(conn)) => Route::Quic(conn.clone()),
                Some(PeerConnection::Tcp { addr, idle }) => Route::Tcp(*addr, idle.take()),
                None => return Err(HostError::NotConnected(*peer)),
            }
        };

        let mut io: Box<dyn StreamIo> = match route {
            Route::Quic(conn) => {
                let (send, recv) = conn.open_bi().await?;
                Box::new(QuicStream { send, recv })
            }
            Route::Tcp(_, Some(tls)) => Box::new(tls),
            Route::Tcp(addr, None) => Box::new(self.inner.dial_tcp(*peer, addr).await?),
        };

        wire::propose(&mut io, protocol).await.map_err(|e| match e {
            WireError::Refused(p) => HostError::ProtocolRefused(p),
            other => HostError::Wire(other),
        })?;

        self.inner.stats.stream_opened();
        debug!(peer_id = %peer, protocol, "stream opened");

        Ok(Stream {
            io,
            remote: *peer,
            protocol: protocol.to_string(),
            stats: self.inner.stats.clone(),
        })
    }

    /// Run `handler` on its own task for every inbound stream of `protocol`.
    pub async fn set_stream_handler<F, Fut>(&self, protocol: &str, handler: F)
    where
        F: Fn(Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: StreamHandler =
            Arc::new(move |stream: Stream| -> BoxFuture<'static, ()> { Box::pin(handler(stream)) });
        self.inner
            .handlers
            .write()
            .await
            .insert(protocol.to_string(), handler);
    }

    /// Stop listening, close every connection and endpoint.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();

        let connections: Vec<_> = self.inner.connections.lock().await.drain().collect();
        for (_, conn) in connections {
            if let PeerConnection::Quic(conn) = conn {
                conn.close(VarInt::from_u32(0), b"host closed");
            }
        }

        for endpoint in self.inner.quic_endpoints.lock().await.drain(..) {
            endpoint.close(VarInt::from_u32(0), b"host closed");
        }

        debug!(peer_id = %self.inner.id, "host closed");
    }
}

impl HostInner {
    fn ensure_transport(&self, kind: TransportKind, addr: &Multiaddr) -> HostResult<()> {
        if self.transports.contains(&kind) {
            Ok(())
        } else {
            Err(HostError::UnsupportedAddress(addr.clone()))
        }
    }

    // -- listening ----------------------------------------------------------

    async fn listen(self: &Arc<Self>, addr: &Multiaddr) -> HostResult<Multiaddr> {
        let (kind, socket_addr) = addr.socket_addr()?;
        self.ensure_transport(kind, addr)?;

        match kind {
            TransportKind::Tcp => {
                let listener = TcpListener::bind(socket_addr).await?;
                let bound = listener.local_addr()?;
                tokio::spawn(self.clone().accept_tcp(listener));
                Ok(Multiaddr::from_socket_addr(kind, bound))
            }
            TransportKind::Quic => {
                let mut endpoint = quinn::Endpoint::server(self.quic_server.clone(), socket_addr)?;
                endpoint.set_default_client_config(self.quic_client.clone());
                let bound = endpoint.local_addr()?;
                self.quic_endpoints.lock().await.push(endpoint.clone());
                tokio::spawn(self.clone().accept_quic(endpoint));
                Ok(Multiaddr::from_socket_addr(kind, bound))
            }
        }
    }

    async fn accept_tcp(self: Arc<Self>, listener: TcpListener) {
        let acceptor = TlsAcceptor::from(self.tls_server.clone());
        loop {
            let (tcp, remote_addr) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "failed to accept TCP connection");
                        continue;
                    }
                },
            };

            let acceptor = acceptor.clone();
            let host = self.clone();
            tokio::spawn(async move {
                let tls = match acceptor.accept(tcp).await {
                    Ok(tls) => tls,
                    Err(e) => {
                        debug!(remote_addr = %remote_addr, error = %e, "TLS handshake failed");
                        return;
                    }
                };

                let remote = match tls
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .ok_or_else(|| HostError::Certificate("no peer certificate presented".into()))
                    .and_then(|cert| peer_id_from_cert(cert.as_ref()))
                {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(remote_addr = %remote_addr, error = %e, "rejecting TCP connection");
                        return;
                    }
                };

                debug!(peer_id = %remote, remote_addr = %remote_addr, "inbound TCP connection");
                host.dispatch(Box::new(TlsStream::from(tls)), remote).await;
            });
        }
        debug!("TCP accept loop stopped");
    }

    async fn accept_quic(self: Arc<Self>, endpoint: quinn::Endpoint) {
        loop {
            let incoming = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                incoming = endpoint.accept() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                },
            };

            let host = self.clone();
            tokio::spawn(async move {
                let conn = match incoming.await {
                    Ok(conn) => conn,
                    Err(e) => {
                        debug!(error = %e, "QUIC handshake failed");
                        return;
                    }
                };

                let remote = match quic_peer_id(&conn) {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(remote_addr = %conn.remote_address(), error = %e, "rejecting QUIC connection");
                        conn.close(VarInt::from_u32(1), b"bad certificate");
                        return;
                    }
                };

                debug!(peer_id = %remote, remote_addr = %conn.remote_address(), "inbound QUIC connection");
                host.connections
                    .lock()
                    .await
                    .insert(remote, PeerConnection::Quic(conn.clone()));
                host.accept_streams(conn, remote).await;
            });
        }
        debug!("QUIC accept loop stopped");
    }

    /// Serve inbound streams of one QUIC connection until it closes.
    async fn accept_streams(self: Arc<Self>, conn: quinn::Connection, remote: PeerId) {
        loop {
            let (send, recv) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = conn.accept_bi() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!(peer_id = %remote, reason = %e, "QUIC connection closed");
                        break;
                    }
                },
            };

            let host = self.clone();
            tokio::spawn(async move {
                host.dispatch(Box::new(QuicStream { send, recv }), remote).await;
            });
        }

        let mut connections = self.connections.lock().await;
        if let Some(PeerConnection::Quic(current)) = connections.get(&remote) {
            if current.stable_id() == conn.stable_id() {
                connections.remove(&remote);
            }
        }
    }

    /// Negotiate an inbound stream and hand it to the registered handler.
    async fn dispatch(&self, mut io: Box<dyn StreamIo>, remote: PeerId) {
        let protocol = match wire::read_protocol(&mut io).await {
            Ok(Some(protocol)) => protocol,
            Ok(None) => return,
            Err(e) => {
                debug!(peer_id = %remote, error = %e, "stream negotiation failed");
                return;
            }
        };

        let handler = self.handlers.read().await.get(&protocol).cloned();
        let Some(handler) = handler else {
            debug!(peer_id = %remote, protocol = %protocol, "refusing unknown protocol");
            let _ = wire::refuse(&mut io).await;
            return;
        };

        if let Err(e) = wire::accept(&mut io, &protocol).await {
            debug!(peer_id = %remote, error = %e, "failed to accept stream");
            return;
        }

        self.stats.stream_accepted();
        handler(Stream {
            io,
            remote,
            protocol,
            stats: self.stats.clone(),
        })
        .await;
    }

    // -- dialing ------------------------------------------------------------

    async fn dial(self: &Arc<Self>, expected: PeerId, addr: &Multiaddr) -> HostResult<PeerConnection> {
        let (kind, socket_addr) = addr.resolve().await?;
        self.ensure_transport(kind, addr)?;

        match kind {
            TransportKind::Tcp => {
                let tls = self.dial_tcp(expected, socket_addr).await?;
                Ok(PeerConnection::Tcp {
                    addr: socket_addr,
                    idle: Some(tls),
                })
            }
            TransportKind::Quic => {
                let conn = self.dial_quic(expected, socket_addr).await?;
                tokio::spawn(self.clone().accept_streams(conn.clone(), expected));
                Ok(PeerConnection::Quic(conn))
            }
        }
    }

    async fn dial_tcp(&self, expected: PeerId, addr: SocketAddr) -> HostResult<TlsStream<TcpStream>> {
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;

        let server_name = ServerName::try_from(TLS_SERVER_NAME)
            .map_err(|e| HostError::Setup(format!("invalid TLS server name: {e}")))?;
        let tls = TlsConnector::from(self.tls_client.clone())
            .connect(server_name, tcp)
            .await?;

        let actual = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| HostError::Certificate("no peer certificate presented".into()))
            .and_then(|cert| peer_id_from_cert(cert.as_ref()))?;
        if actual != expected {
            return Err(HostError::PeerIdMismatch { expected, actual });
        }

        Ok(TlsStream::from(tls))
    }

    async fn dial_quic(&self, expected: PeerId, addr: SocketAddr) -> HostResult<quinn::Connection> {
        let endpoint = self.quic_endpoint_for(addr).await?;
        let conn = endpoint
            .connect_with(self.quic_client.clone(), addr, TLS_SERVER_NAME)?
            .await?;

        let actual = match quic_peer_id(&conn) {
            Ok(id) => id,
            Err(e) => {
                conn.close(VarInt::from_u32(1), b"bad certificate");
                return Err(e);
            }
        };
        if actual != expected {
            conn.close(VarInt::from_u32(1), b"unexpected peer");
            return Err(HostError::PeerIdMismatch { expected, actual });
        }

        Ok(conn)
    }

    /// A QUIC endpoint of the right address family, created on first use.
    async fn quic_endpoint_for(&self, remote: SocketAddr) -> HostResult<quinn::Endpoint> {
        if self.shutdown.is_cancelled() {
            return Err(HostError::Closed);
        }

        let mut endpoints = self.quic_endpoints.lock().await;
        let existing = endpoints.iter().find(|endpoint| {
            endpoint
                .local_addr()
                .map(|local| local.is_ipv4() == remote.is_ipv4())
                .unwrap_or(false)
        });
        if let Some(endpoint) = existing {
            return Ok(endpoint.clone());
        }

        let bind: SocketAddr = if remote.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let mut endpoint = quinn::Endpoint::client(bind)?;
        endpoint.set_default_client_config(self.quic_client.clone());
        endpoints.push(endpoint.clone());
        Ok(endpoint)
    }
}

fn quic_peer_id(conn: &quinn::Connection) -> HostResult<PeerId> {
    let certs = conn
        .peer_identity()
        .and_then(|identity| identity.downcast::<Vec<CertificateDer<'static>>>().ok())
        .ok_or_else(|| HostError::Certificate("no peer certificate presented".into()))?;
    let cert = certs
        .first()
        .ok_or_else(|| HostError::Certificate("empty certificate chain".into()))?;
    peer_id_from_cert(cert.as_ref())
}

/// The `/p2p/<id>` address of `host` on `addr`.
pub fn p2p_addr(addr: &Multiaddr, id: PeerId) -> Multiaddr {
    addr.clone().with(Protocol::P2p(id))
}

fn is_wildcard(addr: &Multiaddr) -> bool {
    matches!(addr.socket_addr(), Ok((_, socket)) if socket.ip().is_unspecified())
}

/// IPv6 link-local addresses need a scope id and cannot go in a multiaddr.
fn is_link_local_v6(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V6(v6) if v6.segments()[0] & 0xffc0 == 0xfe80)
}

/// Local interface addresses, loopback first.
fn interface_ips() -> Vec<IpAddr> {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            warn!(error = %e, "cannot list network interfaces");
            return Vec::new();
        }
    };
    let mut ips: Vec<IpAddr> = interfaces
        .iter()
        .map(|iface| iface.ip())
        .filter(|ip| !is_link_local_v6(ip))
        .collect();
    ips.sort_by_key(|ip| !ip.is_loopback());
    ips.dedup();
    ips
}

/// Replace a wildcard listen address with one address per interface IP of
/// the same family.  Anything else, or a family with no interfaces, is kept
/// as is.
fn expand_wildcard(addr: &Multiaddr, ips: &[IpAddr]) -> Vec<Multiaddr> {
    let (kind, socket) = match addr.socket_addr() {
        Ok((kind, socket)) if socket.ip().is_unspecified() => (kind, socket),
        _ => return vec![addr.clone()],
    };
    let expanded: Vec<Multiaddr> = ips
        .iter()
        .filter(|ip| ip.is_ipv4() == socket.is_ipv4())
        .map(|ip| Multiaddr::from_socket_addr(kind, SocketAddr::new(*ip, socket.port())))
        .collect();
    if expanded.is_empty() {
        vec![addr.clone()]
    } else {
        expanded
    }
}
