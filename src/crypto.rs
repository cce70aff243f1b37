//! Room key derivation and the payload-cipher seam.
//!
//! Announce and signal payloads of a password-protected room are sealed
//! before they reach the store. The cipher algorithm is a collaborator
//! choice behind [`PayloadCipher`]; what this module guarantees is the
//! separation property: a room with a password and a room without (or with
//! a different one) can never open each other's envelopes, because every
//! envelope is bound to the fingerprint of the room key that sealed it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const KEY_DOMAIN: &[u8] = b"meshdoc/room-key/v1";

/// Symmetric room key derived from a password and the room name.
#[derive(Clone, PartialEq, Eq)]
pub struct RoomKey {
    bytes: [u8; 32],
    fingerprint: [u8; 8],
}

impl RoomKey {
    /// Derive a key for `room` from `password`. The room name salts the
    /// derivation so the same password yields distinct keys per room.
    pub fn derive(password: &str, room: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_DOMAIN);
        hasher.update([0u8]);
        hasher.update(room.as_bytes());
        hasher.update([0u8]);
        hasher.update(password.as_bytes());
        let bytes: [u8; 32] = hasher.finalize().into();

        // Fingerprint is a second hash so envelopes never leak key bits.
        let mut fp_hasher = Sha256::new();
        fp_hasher.update(b"meshdoc/key-fp/v1");
        fp_hasher.update(bytes);
        let fp_full: [u8; 32] = fp_hasher.finalize().into();
        let mut fingerprint = [0u8; 8];
        fingerprint.copy_from_slice(&fp_full[..8]);

        Self { bytes, fingerprint }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn fingerprint(&self) -> [u8; 8] {
        self.fingerprint
    }
}

impl fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material.
        write!(f, "RoomKey(fp={:02x?})", self.fingerprint)
    }
}

/// Symmetric cipher collaborator. Implementations must be deterministic in
/// `decrypt(encrypt(x)) == x` and reject ciphertext from another key.
pub trait PayloadCipher: Send + Sync + 'static {
    fn encrypt(&self, key: &RoomKey, plain: &[u8]) -> Vec<u8>;
    fn decrypt(&self, key: &RoomKey, cipher: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Identity cipher: the envelope's fingerprint check is the only
/// protection. Deployments wanting confidentiality inject a real cipher.
pub struct Plaintext;

impl PayloadCipher for Plaintext {
    fn encrypt(&self, _key: &RoomKey, plain: &[u8]) -> Vec<u8> {
        plain.to_vec()
    }

    fn decrypt(&self, _key: &RoomKey, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(cipher.to_vec())
    }
}

/// Stored form of an announce/signal payload: the sealing key's
/// fingerprint (or `None` for an open room) plus the cipher output.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    fp: Option<[u8; 8]>,
    body: Vec<u8>,
}

/// Seals a payload for storage. `key: None` stores plaintext.
pub fn seal(
    key: Option<&RoomKey>,
    cipher: &dyn PayloadCipher,
    plain: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let envelope = match key {
        Some(k) => Envelope {
            fp: Some(k.fingerprint()),
            body: cipher.encrypt(k, plain),
        },
        None => Envelope { fp: None, body: plain.to_vec() },
    };
    bincode::serde::encode_to_vec(&envelope, bincode::config::standard())
        .map_err(|e| CryptoError::Malformed(e.to_string()))
}

/// Opens a stored payload. Fails with [`CryptoError::KeyMismatch`] when the
/// envelope was sealed under a different key (or a key vs. no key).
pub fn open(
    key: Option<&RoomKey>,
    cipher: &dyn PayloadCipher,
    sealed: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let (envelope, _): (Envelope, _) =
        bincode::serde::decode_from_slice(sealed, bincode::config::standard())
            .map_err(|e| CryptoError::Malformed(e.to_string()))?;
    match (key, envelope.fp) {
        (Some(k), Some(fp)) if k.fingerprint() == fp => cipher.decrypt(k, &envelope.body),
        (None, None) => Ok(envelope.body),
        _ => Err(CryptoError::KeyMismatch),
    }
}

/// Crypto errors.
#[derive(Debug, Clone)]
pub enum CryptoError {
    /// The envelope was sealed under a different room key.
    KeyMismatch,
    /// The envelope could not be parsed or the cipher rejected the body.
    Malformed(String),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyMismatch => write!(f, "Payload sealed under a different room key"),
            Self::Malformed(e) => write!(f, "Malformed sealed payload: {e}"),
        }
    }
}

impl std::error::Error for CryptoError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_deterministic() {
        let a = RoomKey::derive("pw", "room");
        let b = RoomKey::derive("pw", "room");
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_derive_room_salts() {
        let a = RoomKey::derive("pw", "room-a");
        let b = RoomKey::derive("pw", "room-b");
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_seal_open_with_key() {
        let key = RoomKey::derive("secret", "room");
        let sealed = seal(Some(&key), &Plaintext, b"hello").unwrap();
        let opened = open(Some(&key), &Plaintext, &sealed).unwrap();
        assert_eq!(opened, b"hello");
    }

    #[test]
    fn test_seal_open_plaintext_room() {
        let sealed = seal(None, &Plaintext, b"open").unwrap();
        let opened = open(None, &Plaintext, &sealed).unwrap();
        assert_eq!(opened, b"open");
    }

    #[test]
    fn test_wrong_password_rejected() {
        let right = RoomKey::derive("right", "room");
        let wrong = RoomKey::derive("wrong", "room");
        let sealed = seal(Some(&right), &Plaintext, b"x").unwrap();
        assert!(matches!(
            open(Some(&wrong), &Plaintext, &sealed),
            Err(CryptoError::KeyMismatch)
        ));
    }

    #[test]
    fn test_keyed_and_open_rooms_disjoint() {
        let key = RoomKey::derive("pw", "room");

        let sealed_keyed = seal(Some(&key), &Plaintext, b"x").unwrap();
        assert!(open(None, &Plaintext, &sealed_keyed).is_err());

        let sealed_open = seal(None, &Plaintext, b"y").unwrap();
        assert!(open(Some(&key), &Plaintext, &sealed_open).is_err());
    }

    #[test]
    fn test_garbage_envelope() {
        assert!(open(None, &Plaintext, &[0xFF; 3]).is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = RoomKey::derive("pw", "room");
        let printed = format!("{key:?}");
        assert!(printed.starts_with("RoomKey(fp="));
    }
}
