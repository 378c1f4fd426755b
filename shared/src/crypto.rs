//! At-rest encryption for stored queue files.
//!
//! A sealed value is `magic(8) | version(4 LE) | key_id(4 LE) | nonce(24) |
//! ciphertext | tag(16)`. The key id lets files sealed under an older key
//! still be opened after a newer one is added.
use std::collections::BTreeMap;

use aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};
use secrecy::{ExposeSecret, Secret};
use thiserror::Error;
use zeroize::Zeroize;

const MAGIC: [u8; 8] = *b"MADADCR1";
const FORMAT_VERSION: u32 = 1;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + 4 + 4 + NONCE_LEN;
const MAX_AAD_FIELD: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("key must be {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("key id 0 is reserved")]
    ReservedKeyId,

    #[error("no key configured")]
    NoPrimaryKey,

    #[error("system randomness unavailable")]
    RandomUnavailable,

    #[error("associated data is required")]
    EmptyAad,

    #[error("associated data field {field} is {size} bytes, max {max}")]
    AadFieldTooLarge {
        field: &'static str,
        size: usize,
        max: usize,
    },

    #[error("malformed sealed value: {0}")]
    Malformed(&'static str),

    #[error("sealed with unknown key id {0}")]
    UnknownKey(u32),

    #[error("sealing failed")]
    SealFailed,

    #[error("authentication failed")]
    AuthenticationFailed,
}

/// Authenticated encryption of stored values. `aad` must be non-empty and
/// identical on both sides.
pub trait CryptoProvider: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// XChaCha20-Poly1305 keys for the queue store. Values are sealed with the
/// most recently added key and can be opened with any key in the ring.
#[derive(Default)]
pub struct KeyRing {
    keys: BTreeMap<u32, Secret<[u8; KEY_LEN]>>,
    primary: Option<u32>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key and makes it the one new values are sealed with.
    pub fn add_key(&mut self, key_id: u32, key_bytes: &[u8]) -> Result<(), CryptoError> {
        if key_id == 0 {
            return Err(CryptoError::ReservedKeyId);
        }
        let mut key: [u8; KEY_LEN] =
            key_bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_LEN,
                    actual: key_bytes.len(),
                })?;

        self.keys.insert(key_id, Secret::new(key));
        self.primary = Some(key_id);
        key.zeroize();
        Ok(())
    }

    pub fn primary_key_id(&self) -> Option<u32> {
        self.primary
    }

    fn cipher_for(&self, key_id: u32) -> Result<XChaCha20Poly1305, CryptoError> {
        let secret = self
            .keys
            .get(&key_id)
            .ok_or(CryptoError::UnknownKey(key_id))?;
        Ok(XChaCha20Poly1305::new(Key::from_slice(secret.expose_secret())))
    }
}

impl CryptoProvider for KeyRing {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if aad.is_empty() {
            return Err(CryptoError::EmptyAad);
        }
        let key_id = self.primary.ok_or(CryptoError::NoPrimaryKey)?;
        let cipher = self.cipher_for(key_id)?;

        let mut nonce = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce).map_err(|_| CryptoError::RandomUnavailable)?;

        let mut sealed = Vec::with_capacity(HEADER_LEN + plaintext.len() + TAG_LEN);
        sealed.extend_from_slice(&MAGIC);
        sealed.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        sealed.extend_from_slice(&key_id.to_le_bytes());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(plaintext);

        let tag = cipher
            .encrypt_in_place_detached(XNonce::from_slice(&nonce), aad, &mut sealed[HEADER_LEN..])
            .map_err(|_| CryptoError::SealFailed)?;
        sealed.extend_from_slice(&tag);

        Ok(sealed)
    }

    fn decrypt(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if aad.is_empty() {
            return Err(CryptoError::EmptyAad);
        }
        if sealed.len() < HEADER_LEN + TAG_LEN {
            return Err(CryptoError::Malformed("truncated"));
        }
        let (header, body) = sealed.split_at(HEADER_LEN);
        let (magic, rest) = header.split_at(MAGIC.len());
        if magic != MAGIC {
            return Err(CryptoError::Malformed("bad magic"));
        }
        let (version, rest) = rest.split_at(4);
        if version != FORMAT_VERSION.to_le_bytes() {
            return Err(CryptoError::Malformed("unsupported version"));
        }
        let (key_id, nonce) = rest.split_at(4);
        let key_id = u32::from_le_bytes([key_id[0], key_id[1], key_id[2], key_id[3]]);

        let cipher = self.cipher_for(key_id)?;
        let (ciphertext, tag) = body.split_at(body.len() - TAG_LEN);
        let mut plaintext = ciphertext.to_vec();

        let opened = cipher.decrypt_in_place_detached(
            XNonce::from_slice(nonce),
            aad,
            &mut plaintext,
            Tag::from_slice(tag),
        );
        if opened.is_err() {
            plaintext.zeroize();
            return Err(CryptoError::AuthenticationFailed);
        }

        Ok(plaintext)
    }
}

/// What a sealed value is bound to. Opening it under any other context fails
/// authentication, so a file copied to another device is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AadContext<'a> {
    pub namespace: &'a str,
    pub store: &'a str,
    pub schema_version: u32,
    pub device_id: &'a str,
}

impl AadContext<'_> {
    /// Length-prefixed encoding, so field boundaries cannot be shifted.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::new();
        push_field(&mut out, "namespace", self.namespace)?;
        push_field(&mut out, "store", self.store)?;
        out.extend_from_slice(&self.schema_version.to_le_bytes());
        push_field(&mut out, "device_id", self.device_id)?;
        Ok(out)
    }
}

fn push_field(out: &mut Vec<u8>, field: &'static str, value: &str) -> Result<(), CryptoError> {
    if value.len() > MAX_AAD_FIELD {
        return Err(CryptoError::AadFieldTooLarge {
            field,
            size: value.len(),
            max: MAX_AAD_FIELD,
        });
    }
    // Bounded by MAX_AAD_FIELD above.
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> KeyRing {
        let mut ring = KeyRing::new();
        ring.add_key(1, &[7u8; KEY_LEN]).unwrap();
        ring
    }

    #[test]
    fn seal_and_open() {
        let ring = ring();
        let sealed = ring.encrypt(b"queued report", b"ctx").unwrap();
        assert_eq!(&sealed[..8], &MAGIC);
        assert_eq!(sealed.len(), HEADER_LEN + 13 + TAG_LEN);
        assert_eq!(ring.decrypt(&sealed, b"ctx").unwrap(), b"queued report");

        let again = ring.encrypt(b"queued report", b"ctx").unwrap();
        assert_ne!(sealed, again);
    }

    #[test]
    fn other_context_cannot_open() {
        let ring = ring();
        let sealed = ring.encrypt(b"queued report", b"device-a").unwrap();
        assert_eq!(
            ring.decrypt(&sealed, b"device-b"),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn tampering_is_detected() {
        let ring = ring();
        let mut sealed = ring.encrypt(b"queued report", b"ctx").unwrap();
        sealed[HEADER_LEN + 2] ^= 0x80;
        assert_eq!(
            ring.decrypt(&sealed, b"ctx"),
            Err(CryptoError::AuthenticationFailed)
        );

        assert_eq!(
            ring.decrypt(&sealed[..HEADER_LEN], b"ctx"),
            Err(CryptoError::Malformed("truncated"))
        );
        let mut bad_magic = ring.encrypt(b"x", b"ctx").unwrap();
        bad_magic[0] = b'X';
        assert_eq!(
            ring.decrypt(&bad_magic, b"ctx"),
            Err(CryptoError::Malformed("bad magic"))
        );
    }

    #[test]
    fn newest_key_seals_and_older_keys_still_open() {
        let mut ring = ring();
        let old = ring.encrypt(b"before", b"ctx").unwrap();

        ring.add_key(2, &[9u8; KEY_LEN]).unwrap();
        assert_eq!(ring.primary_key_id(), Some(2));

        assert_eq!(ring.decrypt(&old, b"ctx").unwrap(), b"before");
        let new = ring.encrypt(b"after", b"ctx").unwrap();
        assert_eq!(&new[12..16], &2u32.to_le_bytes());

        let fresh = KeyRing::new();
        assert_eq!(fresh.decrypt(&new, b"ctx"), Err(CryptoError::UnknownKey(2)));
    }

    #[test]
    fn key_checks() {
        let mut ring = KeyRing::new();
        assert_eq!(ring.encrypt(b"x", b"ctx"), Err(CryptoError::NoPrimaryKey));
        assert_eq!(ring.add_key(0, &[1u8; KEY_LEN]), Err(CryptoError::ReservedKeyId));
        assert_eq!(
            ring.add_key(1, &[1u8; 16]),
            Err(CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: 16
            })
        );
        ring.add_key(1, &[1u8; KEY_LEN]).unwrap();
        assert_eq!(ring.encrypt(b"x", b""), Err(CryptoError::EmptyAad));
    }

    #[test]
    fn aad_context_binds_every_field() {
        let base = AadContext {
            namespace: "madad",
            store: "queue",
            schema_version: 1,
            device_id: "device-a",
        };
        let other_device = AadContext {
            device_id: "device-b",
            ..base.clone()
        };
        let bumped = AadContext {
            schema_version: 2,
            ..base.clone()
        };

        let encoded = base.to_bytes().unwrap();
        for other in [other_device, bumped] {
            assert_ne!(encoded, other.to_bytes().unwrap());
        }

        let long = "x".repeat(MAX_AAD_FIELD + 1);
        let too_long = AadContext {
            namespace: &long,
            ..base
        };
        assert!(matches!(
            too_long.to_bytes(),
            Err(CryptoError::AadFieldTooLarge { field: "namespace", .. })
        ));
    }
}
