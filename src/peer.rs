//! Peer identifiers.
//!
//! A [`PeerId`] is the raw 32-byte Ed25519 public key of a host.  Its text
//! form is `P2` followed by the Crockford Base32 encoding of the key and a
//! Luhn mod-32 check character, which makes copy/paste mistakes in a
//! multiaddress fail loudly instead of dialing the wrong peer.

use std::fmt;
use std::str::FromStr;

use base32::Alphabet;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Prefix of every textual peer id.
const PEER_ID_PREFIX: &str = "P2";

/// Length of the Base32 body for a 32-byte key (256 bits / 5, rounded up).
const ENCODED_KEY_LEN: usize = 52;

/// Crockford Base32 alphabet (excludes I, L, O, U).
const CROCKFORD_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced when parsing a textual peer id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerIdError {
    #[error("peer id must start with \"{PEER_ID_PREFIX}\"")]
    MissingPrefix,

    #[error("peer id body has {0} characters, expected {ENCODED_KEY_LEN}")]
    InvalidLength(usize),

    #[error("invalid character '{0}' in peer id")]
    InvalidCharacter(char),

    #[error("peer id check character does not match")]
    ChecksumMismatch,

    #[error("peer id does not encode a valid Ed25519 public key")]
    InvalidKey,
}

// ---------------------------------------------------------------------------
// Crockford Base32 + Luhn mod N
// ---------------------------------------------------------------------------

/// Map a Crockford Base32 character to its numeric value (0..31).
fn crockford_value(c: char) -> Option<usize> {
    match c.to_ascii_uppercase() {
        'O' => Some(0),
        'I' | 'L' => Some(1),
        c => CROCKFORD_ALPHABET
            .iter()
            .position(|&symbol| symbol as char == c),
    }
}

/// Luhn mod-N check value over a sequence of symbol values.
fn luhn_mod_n_check(values: &[usize], n: usize) -> usize {
    let mut factor = 2;
    let mut sum = 0;

    for &v in values.iter().rev() {
        let addend = factor * v;
        factor = if factor == 2 { 1 } else { 2 };
        sum += (addend / n) + (addend % n);
    }

    (n - (sum % n)) % n
}

fn check_char(encoded: &str) -> char {
    let values: Vec<usize> = encoded.chars().filter_map(crockford_value).collect();
    CROCKFORD_ALPHABET[luhn_mod_n_check(&values, 32)] as char
}

// ---------------------------------------------------------------------------
// PeerId
// ---------------------------------------------------------------------------

/// Identity of a remote (or local) host: its Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Derive a peer id from an Ed25519 verifying key.
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        PeerId(key.to_bytes())
    }

    /// Build a peer id from raw public key bytes, rejecting points that are
    /// not valid Ed25519 keys.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, PeerIdError> {
        VerifyingKey::from_bytes(&bytes).map_err(|_| PeerIdError::InvalidKey)?;
        Ok(PeerId(bytes))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = base32::encode(Alphabet::Crockford, &self.0);
        let check = check_char(&body);
        write!(f, "{PEER_ID_PREFIX}{body}{check}")
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix(PEER_ID_PREFIX).ok_or(PeerIdError::MissingPrefix)?;

        if rest.len() != ENCODED_KEY_LEN + 1 {
            return Err(PeerIdError::InvalidLength(rest.len().saturating_sub(1)));
        }
        if let Some(bad) = rest.chars().find(|&c| crockford_value(c).is_none()) {
            return Err(PeerIdError::InvalidCharacter(bad));
        }

        let (body, check) = rest.split_at(ENCODED_KEY_LEN);
        // Canonical symbols only; the aliases O, I and L fold to 0 and 1.
        let body: String = body
            .chars()
            .filter_map(crockford_value)
            .map(|v| CROCKFORD_ALPHABET[v] as char)
            .collect();
        if crockford_value(check_char(&body)) != check.chars().next().and_then(crockford_value) {
            return Err(PeerIdError::ChecksumMismatch);
        }

        let decoded = base32::decode(Alphabet::Crockford, &body)
            .ok_or(PeerIdError::InvalidLength(body.len()))?;
        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|v: Vec<u8>| PeerIdError::InvalidLength(v.len()))?;

        PeerId::from_bytes(bytes)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[test]
    fn test_display_format() {
        let id = Identity::generate().peer_id();
        let s = id.to_string();

        assert!(s.starts_with("P2"), "peer id should start with P2: {s}");
        assert_eq!(s.len(), 2 + ENCODED_KEY_LEN + 1);
        for c in s[2..].chars() {
            assert!(crockford_value(c).is_some(), "invalid char '{c}' in {s}");
        }
    }

    #[test]
    fn test_parse_display_round_trip() {
        let id = Identity::generate().peer_id();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_parse_accepts_lowercase_body() {
        let id = Identity::generate().peer_id();
        let s = id.to_string();
        let lowered = format!("P2{}", s[2..].to_ascii_lowercase());
        assert_eq!(lowered.parse::<PeerId>().unwrap(), id);
    }

    #[test]
    fn test_corrupted_character_rejected() {
        let s = Identity::generate().peer_id().to_string();
        let mut chars: Vec<char> = s.chars().collect();
        let current = crockford_value(chars[10]).unwrap();
        chars[10] = CROCKFORD_ALPHABET[(current + 1) % 32] as char;
        let corrupted: String = chars.into_iter().collect();

        assert_eq!(
            corrupted.parse::<PeerId>().unwrap_err(),
            PeerIdError::ChecksumMismatch
        );
    }

    #[test]
    fn test_missing_prefix_rejected() {
        let s = Identity::generate().peer_id().to_string();
        assert_eq!(
            s[2..].parse::<PeerId>().unwrap_err(),
            PeerIdError::MissingPrefix
        );
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(matches!(
            "P2ABCDEF".parse::<PeerId>().unwrap_err(),
            PeerIdError::InvalidLength(_)
        ));
    }

    #[test]
    fn test_invalid_character_rejected() {
        let s = Identity::generate().peer_id().to_string();
        let bad = format!("{}U{}", &s[..5], &s[6..]);
        assert_eq!(
            bad.parse::<PeerId>().unwrap_err(),
            PeerIdError::InvalidCharacter('U')
        );
    }

    #[test]
    fn test_luhn_check_is_deterministic() {
        let values = vec![0, 1, 2, 3, 4, 5];
        let check = luhn_mod_n_check(&values, 32);
        assert!(check < 32);
        assert_eq!(check, luhn_mod_n_check(&values, 32));
    }

    #[test]
    fn test_serde_as_string() {
        let id = Identity::generate().peer_id();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_debug_shows_text_form() {
        let id = Identity::from_seed([1u8; 32]).peer_id();
        assert_eq!(format!("{id:?}"), format!("PeerId({id})"));
    }
}
