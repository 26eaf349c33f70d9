//! TOML configuration shared by the three programs.
//!
//! Values come from, in order of precedence: command-line flags, the file
//! named by `P2PBENCH_CONFIG` (or `--config`), `./p2pbench.toml`, and the
//! compiled-in defaults below.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::fanout::{FailurePolicy, FanOutConfig};
use crate::multiaddr::TransportKind;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "P2PBENCH_CONFIG";

/// Configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "p2pbench.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BenchConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try, in order: `P2PBENCH_CONFIG`, `./p2pbench.toml`, defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %format!("{e:#}"),
                        "{CONFIG_ENV} set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local_path = Path::new(DEFAULT_CONFIG_FILE);
        if local_path.exists() {
            match Self::load(local_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local_path.display(),
                        error = %format!("{e:#}"),
                        "config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// An explicit `--config` path must load; otherwise fall back as above.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Load-test client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Number of connection attempts.
    pub connections: usize,
    /// Maximum attempts in flight.
    pub concurrency: usize,
    /// Timeout for one connection attempt, in seconds.
    pub connect_timeout_sec: u64,
    /// Abort the batch on the first failed attempt.
    pub fail_fast: bool,
    /// Parallel download streams for the throughput client.
    pub streams: usize,
    /// Transport used by the load-test client.
    pub transport: TransportKind,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connections: 10_000,
            concurrency: 32,
            connect_timeout_sec: 60,
            fail_fast: false,
            streams: 1,
            transport: TransportKind::Quic,
        }
    }
}

impl ClientConfig {
    pub fn fan_out(&self) -> FanOutConfig {
        FanOutConfig {
            attempts: self.connections,
            concurrency: self.concurrency,
            connect_timeout: std::time::Duration::from_secs(self.connect_timeout_sec),
            policy: if self.fail_fast {
                FailurePolicy::FailFast
            } else {
                FailurePolicy::Continue
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Echo/file server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the TCP and QUIC listeners bind to.
    pub listen_ip: IpAddr,
    /// Port shared by the TCP and UDP (QUIC) listeners.
    pub port: u16,
    /// File served on the download protocol.
    pub data_file: PathBuf,
    /// Byte repeated 32 times to seed the server identity.
    pub identity_seed: u8,
    /// Load (or create) the identity from this key file instead of the seed.
    pub identity_key_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 4001,
            data_file: PathBuf::from("data"),
            identity_seed: 1,
            identity_key_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Local HTTP diagnostics endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub enabled: bool,
    pub listen_address: SocketAddr,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 6060)),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = BenchConfig::default();

        assert_eq!(cfg.client.connections, 10_000);
        assert_eq!(cfg.client.concurrency, 32);
        assert_eq!(cfg.client.connect_timeout_sec, 60);
        assert!(!cfg.client.fail_fast);
        assert_eq!(cfg.client.streams, 1);
        assert_eq!(cfg.client.transport, TransportKind::Quic);

        assert_eq!(cfg.server.port, 4001);
        assert_eq!(cfg.server.data_file, PathBuf::from("data"));
        assert_eq!(cfg.server.identity_seed, 1);
        assert!(cfg.server.identity_key_path.is_none());
        assert_eq!(cfg.server.listen_ip.to_string(), "0.0.0.0");

        assert!(cfg.diagnostics.enabled);
        assert_eq!(cfg.diagnostics.listen_address.to_string(), "0.0.0.0:6060");

        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[client]
connections = 500
concurrency = 8
connect_timeout_sec = 5
fail_fast = true
streams = 4
transport = "tcp"

[server]
listen_ip = "127.0.0.1"
port = 5001
data_file = "/srv/blob.bin"
identity_key_path = "/var/lib/p2pbench/server.key"

[diagnostics]
enabled = false
listen_address = "127.0.0.1:7070"

[logging]
level = "debug"
json = true
"#;

        let cfg: BenchConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.client.connections, 500);
        assert_eq!(cfg.client.transport, TransportKind::Tcp);
        assert_eq!(cfg.server.port, 5001);
        assert_eq!(
            cfg.server.identity_key_path,
            Some(PathBuf::from("/var/lib/p2pbench/server.key"))
        );
        assert!(!cfg.diagnostics.enabled);
        assert_eq!(cfg.diagnostics.listen_address.port(), 7070);
        assert!(cfg.logging.json);

        let fan_out = cfg.client.fan_out();
        assert_eq!(fan_out.attempts, 500);
        assert_eq!(fan_out.concurrency, 8);
        assert_eq!(fan_out.connect_timeout, Duration::from_secs(5));
        assert_eq!(fan_out.policy, FailurePolicy::FailFast);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[server]
port = 9000
"#;
        let cfg: BenchConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.data_file, PathBuf::from("data"));
        assert_eq!(cfg.client.concurrency, 32);
        assert_eq!(cfg.client.fan_out().policy, FailurePolicy::Continue);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: BenchConfig = toml::from_str("").unwrap();
        let defaults = BenchConfig::default();
        assert_eq!(cfg.client.connections, defaults.client.connections);
        assert_eq!(cfg.server.port, defaults.server.port);
        assert_eq!(
            cfg.diagnostics.listen_address,
            defaults.diagnostics.listen_address
        );
    }

    #[test]
    fn test_invalid_transport_rejected() {
        let result: Result<BenchConfig, _> = toml::from_str("[client]\ntransport = \"sctp\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("p2pbench.toml");
        std::fs::write(&path, "[client]\nconnections = 3\n").unwrap();

        let cfg = BenchConfig::load(&path).unwrap();
        assert_eq!(cfg.client.connections, 3);

        let resolved = BenchConfig::resolve(Some(&path)).unwrap();
        assert_eq!(resolved.client.connections, 3);
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(BenchConfig::load(Path::new("/nonexistent/p2pbench.toml")).is_err());
        assert!(BenchConfig::resolve(Some(Path::new("/nonexistent/p2pbench.toml"))).is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let cfg = BenchConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let roundtripped: BenchConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(cfg.server.port, roundtripped.server.port);
        assert_eq!(cfg.client.transport, roundtripped.client.transport);
        assert_eq!(
            cfg.diagnostics.listen_address,
            roundtripped.diagnostics.listen_address
        );
    }
}
