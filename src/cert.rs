//! Self-signed X.509 certificates bound to a host identity.
//!
//! Each host presents a self-signed certificate whose key is its Ed25519
//! identity key.  The remote side does not validate any CA chain; instead it
//! derives the [`PeerId`] from the certificate's public key after the TLS
//! handshake has proven possession of the matching private key.

use anyhow::{Context, Result};
use rcgen::{CertificateParams, KeyPair, PKCS_ED25519};
use rustls_pki_types::PrivatePkcs8KeyDer;
use time::{Duration, OffsetDateTime};
use tracing::debug;
use x509_parser::prelude::{FromDer, X509Certificate};
use zeroize::Zeroizing;

use crate::error::HostError;
use crate::identity::Identity;
use crate::peer::PeerId;

/// Dotted OID of the Ed25519 signature algorithm (RFC 8410).
const ED25519_OID: &str = "1.3.101.112";

/// Prefix of the DNS Subject Alternative Name carrying the peer id.
pub const SAN_PREFIX: &str = "p2p-";

/// The fixed ASN.1 DER prefix for an Ed25519 PKCS#8 v1 private key.
///
/// ```text
/// SEQUENCE {
///   INTEGER 0
///   SEQUENCE { OID 1.3.101.112 }
///   OCTET STRING { OCTET STRING (32 bytes) }
/// }
/// ```
const ED25519_PKCS8_V1_PREFIX: [u8; 16] = [
    0x30, 0x2E, // SEQUENCE, length 46
    0x02, 0x01, 0x00, // INTEGER 0
    0x30, 0x05, // SEQUENCE, length 5
    0x06, 0x03, 0x2B, 0x65, 0x70, // OID 1.3.101.112
    0x04, 0x22, // OCTET STRING, length 34
    0x04, 0x20, // OCTET STRING, length 32  (inner)
];

/// Wrap a raw 32-byte Ed25519 secret key into a PKCS#8 v1 DER encoding.
fn ed25519_to_pkcs8_der(secret: &[u8; 32]) -> Vec<u8> {
    let mut der = Vec::with_capacity(48);
    der.extend_from_slice(&ED25519_PKCS8_V1_PREFIX);
    der.extend_from_slice(secret);
    der
}

/// Generate a self-signed certificate for `identity`.
///
/// Returns `(cert_der, key_der)`.  The peer id is written to the Common Name
/// and to a `p2p-<PEER_ID>` DNS SAN so captures and logs stay readable; the
/// authoritative binding is the certificate key itself.
pub fn generate_self_signed_cert(identity: &Identity) -> Result<(Vec<u8>, Vec<u8>)> {
    let peer_id = identity.peer_id().to_string();

    let secret = Zeroizing::new(identity.signing_key().to_bytes());
    let pkcs8_der = ed25519_to_pkcs8_der(&secret);

    let pkcs8_ref = PrivatePkcs8KeyDer::from(pkcs8_der.as_slice());
    let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8_ref, &PKCS_ED25519)
        .context("failed to create rcgen KeyPair from Ed25519 PKCS#8 DER")?;

    let mut params = CertificateParams::new(vec![format!("{SAN_PREFIX}{peer_id}")])
        .context("failed to create certificate params")?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, peer_id.clone());

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::hours(1);
    params.not_after = now + Duration::days(365);

    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign certificate")?;

    debug!(peer_id = %peer_id, "self-signed certificate generated");
    Ok((cert.der().to_vec(), pkcs8_der))
}

/// Derive the [`PeerId`] of whoever presented `cert_der`.
pub fn peer_id_from_cert(cert_der: &[u8]) -> Result<PeerId, HostError> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| HostError::Certificate(format!("failed to parse X.509 certificate: {e}")))?;

    let spki = cert.public_key();
    let algorithm = spki.algorithm.algorithm.to_id_string();
    if algorithm != ED25519_OID {
        return Err(HostError::Certificate(format!(
            "certificate key algorithm {algorithm} is not Ed25519"
        )));
    }

    let key: [u8; 32] = spki
        .subject_public_key
        .data
        .as_ref()
        .try_into()
        .map_err(|_| HostError::Certificate("Ed25519 public key must be 32 bytes".into()))?;

    PeerId::from_bytes(key).map_err(|e| HostError::Certificate(e.to_string()))
}
