//! Ed25519 host identities.
//!
//! Every [`Host`](crate::host::Host) owns one keypair.  Load-test clients
//! generate a fresh random identity per connection, while the echo server
//! uses a fixed seed so its peer id is stable across restarts, or a key file
//! persisted on disk.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use ed25519_dalek::{SigningKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::peer::PeerId;

/// Ed25519 identity of a local host.
#[derive(Clone)]
pub struct Identity {
    key: SigningKey,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn generate() -> Self {
        Identity {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic identity derived from a 32-byte secret seed.
    pub fn from_seed(seed: [u8; SECRET_KEY_LENGTH]) -> Self {
        let seed = Zeroizing::new(seed);
        Identity {
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// Identity stored in `path` as a raw 32-byte secret.
    ///
    /// A missing file is created (mode 0600 on unix) with a fresh key, so the
    /// same path yields the same peer id on every run.
    pub fn from_key_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let secret = read_secret(path)?;
            debug!(path = %path.display(), "loaded identity key");
            return Ok(Self::from_seed(*secret));
        }

        let identity = Self::generate();
        write_secret(path, &Zeroizing::new(identity.key.to_bytes()))?;
        info!(path = %path.display(), peer_id = %identity.peer_id(), "created identity key");
        Ok(identity)
    }

    /// The signing key, needed for certificate generation.
    pub fn signing_key(&self) -> &SigningKey {
        &self.key
    }

    /// Peer id advertised by hosts using this identity.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.key.verifying_key())
    }
}

fn read_secret(path: &Path) -> Result<Zeroizing<[u8; SECRET_KEY_LENGTH]>> {
    let raw = Zeroizing::new(
        fs::read(path).with_context(|| format!("failed to read identity key {}", path.display()))?,
    );
    let secret: [u8; SECRET_KEY_LENGTH] = raw.as_slice().try_into().map_err(|_| {
        anyhow::anyhow!(
            "identity key {} must be exactly {SECRET_KEY_LENGTH} bytes, got {}",
            path.display(),
            raw.len()
        )
    })?;
    Ok(Zeroizing::new(secret))
}

fn write_secret(path: &Path, secret: &[u8; SECRET_KEY_LENGTH]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create identity key {}", path.display()))?;
    file.write_all(secret)
        .with_context(|| format!("failed to write identity key {}", path.display()))?;
    Ok(())
}
