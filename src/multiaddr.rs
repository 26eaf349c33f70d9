//! Self-describing network addresses.
//!
//! A [`Multiaddr`] is a `/`-separated list of protocol components, e.g.
//! `/ip4/127.0.0.1/udp/4001/quic/p2p/P2...`.  Only the components the
//! benchmark tools can dial are understood: `ip4`, `ip6`, `dns`, `dns4`,
//! `dns6`, `tcp`, `udp`, `quic`, `quic-v1` and `p2p`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::peer::{PeerId, PeerIdError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultiaddrError {
    #[error("multiaddress is empty")]
    Empty,

    #[error("multiaddress must start with '/'")]
    MissingLeadingSlash,

    #[error("unknown protocol \"{0}\"")]
    UnknownProtocol(String),

    #[error("protocol \"{0}\" requires a value")]
    MissingValue(&'static str),

    #[error("invalid {protocol} value \"{value}\"")]
    InvalidValue { protocol: &'static str, value: String },

    #[error("invalid peer id: {0}")]
    InvalidPeerId(#[from] PeerIdError),

    #[error("address {0} has no /p2p/<peer id> component")]
    MissingPeerId(String),

    #[error("address {0} does not describe a TCP or QUIC endpoint")]
    UnsupportedTransport(String),

    #[error("failed to resolve {name}: {reason}")]
    Resolve { name: String, reason: String },
}

// ---------------------------------------------------------------------------
// TransportKind
// ---------------------------------------------------------------------------

/// Transports a host can listen on and dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// TLS 1.3 over TCP, one stream per connection.
    Tcp,
    /// QUIC, many streams per connection.
    Quic,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::Quic => f.write_str("quic"),
        }
    }
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Dns(String),
    Dns4(String),
    Dns6(String),
    Tcp(u16),
    Udp(u16),
    Quic,
    QuicV1,
    P2p(PeerId),
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ip4(addr) => write!(f, "/ip4/{addr}"),
            Protocol::Ip6(addr) => write!(f, "/ip6/{addr}"),
            Protocol::Dns(name) => write!(f, "/dns/{name}"),
            Protocol::Dns4(name) => write!(f, "/dns4/{name}"),
            Protocol::Dns6(name) => write!(f, "/dns6/{name}"),
            Protocol::Tcp(port) => write!(f, "/tcp/{port}"),
            Protocol::Udp(port) => write!(f, "/udp/{port}"),
            Protocol::Quic => f.write_str("/quic"),
            Protocol::QuicV1 => f.write_str("/quic-v1"),
            Protocol::P2p(id) => write!(f, "/p2p/{id}"),
        }
    }
}

fn parse_value<T: FromStr>(protocol: &'static str, value: Option<&str>) -> Result<T, MultiaddrError> {
    let value = value
        .filter(|v| !v.is_empty())
        .ok_or(MultiaddrError::MissingValue(protocol))?;
    value.parse().map_err(|_| MultiaddrError::InvalidValue {
        protocol,
        value: value.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Multiaddr
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Multiaddr(Vec<Protocol>);

/// Host part of a dialable address.
enum Endpoint<'a> {
    Ip(IpAddr),
    Dns { name: &'a str, ipv4: bool, ipv6: bool },
}

impl Multiaddr {
    pub fn with(mut self, protocol: Protocol) -> Self {
        self.0.push(protocol);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Address of a bound socket for the given transport.
    pub fn from_socket_addr(kind: TransportKind, addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => Protocol::Ip4(v4),
            IpAddr::V6(v6) => Protocol::Ip6(v6),
        };
        match kind {
            TransportKind::Tcp => Multiaddr(vec![ip, Protocol::Tcp(addr.port())]),
            TransportKind::Quic => Multiaddr(vec![ip, Protocol::Udp(addr.port()), Protocol::Quic]),
        }
    }

    /// The trailing `/p2p/<id>` component, if present.
    pub fn peer_id(&self) -> Option<PeerId> {
        match self.0.last() {
            Some(Protocol::P2p(id)) => Some(*id),
            _ => None,
        }
    }

    /// A copy of this address with any trailing `/p2p/<id>` removed.
    pub fn without_peer_id(&self) -> Multiaddr {
        let mut protocols = self.0.clone();
        if let Some(Protocol::P2p(_)) = protocols.last() {
            protocols.pop();
        }
        Multiaddr(protocols)
    }

    fn endpoint(&self) -> Result<(TransportKind, Endpoint<'_>, u16), MultiaddrError> {
        let unsupported = || MultiaddrError::UnsupportedTransport(self.to_string());

        let mut parts = self.0.iter();
        let endpoint = match parts.next() {
            Some(Protocol::Ip4(addr)) => Endpoint::Ip(IpAddr::V4(*addr)),
            Some(Protocol::Ip6(addr)) => Endpoint::Ip(IpAddr::V6(*addr)),
            Some(Protocol::Dns(name)) => Endpoint::Dns { name, ipv4: true, ipv6: true },
            Some(Protocol::Dns4(name)) => Endpoint::Dns { name, ipv4: true, ipv6: false },
            Some(Protocol::Dns6(name)) => Endpoint::Dns { name, ipv4: false, ipv6: true },
            _ => return Err(unsupported()),
        };

        let (kind, port) = match (parts.next(), parts.next()) {
            (Some(Protocol::Tcp(port)), None | Some(Protocol::P2p(_))) => (TransportKind::Tcp, *port),
            (Some(Protocol::Udp(port)), Some(Protocol::Quic | Protocol::QuicV1)) => {
                if !matches!(parts.next(), None | Some(Protocol::P2p(_))) {
                    return Err(unsupported());
                }
                (TransportKind::Quic, *port)
            }
            _ => return Err(unsupported()),
        };

        if parts.next().is_some() {
            return Err(unsupported());
        }

        Ok((kind, endpoint, port))
    }

    /// Transport and socket address of an IP-based address, without DNS.
    pub fn socket_addr(&self) -> Result<(TransportKind, SocketAddr), MultiaddrError> {
        match self.endpoint()? {
            (kind, Endpoint::Ip(ip), port) => Ok((kind, SocketAddr::new(ip, port))),
            (_, Endpoint::Dns { .. }, _) => Err(MultiaddrError::UnsupportedTransport(self.to_string())),
        }
    }

    /// Transport and socket address to dial, resolving DNS components.
    pub async fn resolve(&self) -> Result<(TransportKind, SocketAddr), MultiaddrError> {
        let (kind, endpoint, port) = self.endpoint()?;
        match endpoint {
            Endpoint::Ip(ip) => Ok((kind, SocketAddr::new(ip, port))),
            Endpoint::Dns { name, ipv4, ipv6 } => {
                let resolve_err = |reason: String| MultiaddrError::Resolve {
                    name: name.to_string(),
                    reason,
                };
                let mut addrs = tokio::net::lookup_host((name, port))
                    .await
                    .map_err(|e| resolve_err(e.to_string()))?;
                let addr = addrs
                    .find(|a| (a.is_ipv4() && ipv4) || (a.is_ipv6() && ipv6))
                    .ok_or_else(|| resolve_err("no address of the requested family".into()))?;
                Ok((kind, addr))
            }
        }
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for protocol in &self.0 {
            write!(f, "{protocol}")?;
        }
        Ok(())
    }
}

impl FromStr for Multiaddr {
    type Err = MultiaddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let body = s.strip_prefix('/').ok_or(if s.is_empty() {
            MultiaddrError::Empty
        } else {
            MultiaddrError::MissingLeadingSlash
        })?;

        let mut parts = body.split('/').peekable();
        let mut protocols = Vec::new();

        while let Some(name) = parts.next() {
            if name.is_empty() {
                // Tolerate a single trailing slash.
                if parts.peek().is_none() {
                    break;
                }
                return Err(MultiaddrError::UnknownProtocol(String::new()));
            }

            let protocol = match name {
                "ip4" => Protocol::Ip4(parse_value("ip4", parts.next())?),
                "ip6" => Protocol::Ip6(parse_value("ip6", parts.next())?),
                "dns" => Protocol::Dns(parse_value("dns", parts.next())?),
                "dns4" => Protocol::Dns4(parse_value("dns4", parts.next())?),
                "dns6" => Protocol::Dns6(parse_value("dns6", parts.next())?),
                "tcp" => Protocol::Tcp(parse_value("tcp", parts.next())?),
                "udp" => Protocol::Udp(parse_value("udp", parts.next())?),
                "quic" => Protocol::Quic,
                "quic-v1" => Protocol::QuicV1,
                "p2p" | "ipfs" => {
                    let value = parts
                        .next()
                        .filter(|v| !v.is_empty())
                        .ok_or(MultiaddrError::MissingValue("p2p"))?;
                    Protocol::P2p(value.parse()?)
                }
                other => return Err(MultiaddrError::UnknownProtocol(other.to_string())),
            };
            protocols.push(protocol);
        }

        if protocols.is_empty() {
            return Err(MultiaddrError::Empty);
        }
        Ok(Multiaddr(protocols))
    }
}

impl Serialize for Multiaddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Multiaddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// PeerAddr
// ---------------------------------------------------------------------------

/// A peer id together with the transport addresses that reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerAddr {
    /// Split `/.../p2p/<id>` into the peer id and its transport address.
    pub fn from_p2p_addr(addr: &Multiaddr) -> Result<Self, MultiaddrError> {
        let id = addr
            .peer_id()
            .ok_or_else(|| MultiaddrError::MissingPeerId(addr.to_string()))?;
        let transport = addr.without_peer_id();
        let addrs = if transport.is_empty() {
            Vec::new()
        } else {
            vec![transport]
        };
        Ok(PeerAddr { id, addrs })
    }
}

impl FromStr for PeerAddr {
    type Err = MultiaddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PeerAddr::from_p2p_addr(&s.parse()?)
    }
}
