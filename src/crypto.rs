// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Encrypted Field Codec
//!
//! Sensitive profile values (banking client ids, credentials, access tokens,
//! account and card numbers) are never persisted in plaintext. Each value is
//! sealed into an [`Envelope`] with AES-256-GCM, binding the owner's
//! identifier as associated data, and stored next to a one-way [`digest`]
//! that allows equality lookups without decrypting anything.
//!
//! ## Envelope Layout
//!
//! ```text
//! {
//!   "nonce":      base64(12 random bytes, fresh per call),
//!   "header":     base64(owner context, authenticated but not encrypted),
//!   "ciphertext": base64(AES-256-GCM ciphertext),
//!   "tag":        base64(16-byte authentication tag)
//! }
//! ```
//!
//! ## Key Material
//!
//! The codec never reads ambient state. A [`KeyProvider`] is handed to
//! [`FieldCipher::new`] once at startup; one static key per deployment.

use std::fmt;

use base64ct::{Base64, Encoding};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// Length of a hex-encoded SHA-384 digest.
pub const DIGEST_HEX_LEN: usize = 96;

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("envelope header mismatch: expected {expected:?}, found {found:?}")]
    HeaderMismatch { expected: String, found: String },

    #[error("authentication tag verification failed")]
    TagMismatch,

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("system random number generator failed")]
    Rng,
}

impl CryptoError {
    /// True when the envelope was tampered with or belongs to another owner.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            CryptoError::HeaderMismatch { .. } | CryptoError::TagMismatch
        )
    }
}

// =============================================================================
// Key Providers
// =============================================================================

/// Source of the process-wide field encryption key.
pub trait KeyProvider: Send + Sync {
    fn field_key(&self) -> Result<[u8; KEY_LEN], CryptoError>;
}

/// Key provider holding a fixed key, typically decoded from configuration.
#[derive(Clone)]
pub struct StaticKeyProvider {
    key: [u8; KEY_LEN],
}

impl StaticKeyProvider {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Decode a standard (padded) base64 key.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = Base64::decode_vec(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("key is not base64: {e}")))?;
        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("expected {KEY_LEN} bytes, got {}", bytes.len()))
        })?;
        Ok(Self { key })
    }
}

impl KeyProvider for StaticKeyProvider {
    fn field_key(&self) -> Result<[u8; KEY_LEN], CryptoError> {
        Ok(self.key)
    }
}

impl fmt::Debug for StaticKeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeyProvider")
            .field("key", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// On-disk representation of one encrypted field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub nonce: String,
    pub header: String,
    pub ciphertext: String,
    pub tag: String,
}

impl Envelope {
    pub fn to_json(&self) -> Result<String, CryptoError> {
        serde_json::to_string(self).map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, CryptoError> {
        serde_json::from_str(json).map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))
    }
}

/// One-way SHA-384 fingerprint used only for equality search.
pub fn digest(plaintext: &str) -> String {
    format!("{:x}", Sha384::digest(plaintext.as_bytes()))
}

// =============================================================================
// FieldCipher
// =============================================================================

/// AES-256-GCM codec for individual profile fields.
pub struct FieldCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}

impl FieldCipher {
    /// Load the key once from the provider.
    pub fn new(provider: &dyn KeyProvider) -> Result<Self, CryptoError> {
        let raw = provider.field_key()?;
        let unbound = UnboundKey::new(&AES_256_GCM, &raw)
            .map_err(|_| CryptoError::InvalidKey("rejected by AES-256-GCM".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Seal `plaintext`, binding `header` as associated data.
    pub fn encrypt(&self, header: &str, plaintext: &str) -> Result<Envelope, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce).map_err(|_| CryptoError::Rng)?;

        let mut in_out = plaintext.as_bytes().to_vec();
        let tag = self
            .key
            .seal_in_place_separate_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(header.as_bytes()),
                &mut in_out,
            )
            .map_err(|_| CryptoError::MalformedEnvelope("plaintext too large to seal".to_string()))?;

        Ok(Envelope {
            nonce: Base64::encode_string(&nonce),
            header: Base64::encode_string(header.as_bytes()),
            ciphertext: Base64::encode_string(&in_out),
            tag: Base64::encode_string(tag.as_ref()),
        })
    }

    /// Open an envelope sealed for `header`.
    ///
    /// The embedded header must equal `header` byte-for-byte before the tag
    /// is even checked.
    pub fn decrypt(&self, header: &str, envelope: &Envelope) -> Result<String, CryptoError> {
        let embedded = decode_component("header", &envelope.header)?;
        if embedded != header.as_bytes() {
            return Err(CryptoError::HeaderMismatch {
                expected: header.to_string(),
                found: String::from_utf8_lossy(&embedded).into_owned(),
            });
        }

        let nonce_bytes = decode_component("nonce", &envelope.nonce)?;
        let nonce = Nonce::try_assume_unique_for_key(&nonce_bytes).map_err(|_| {
            CryptoError::MalformedEnvelope(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce_bytes.len()
            ))
        })?;

        let mut in_out = decode_component("ciphertext", &envelope.ciphertext)?;
        in_out.extend_from_slice(&decode_component("tag", &envelope.tag)?);

        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(embedded.as_slice()), &mut in_out)
            .map_err(|_| CryptoError::TagMismatch)?;

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| CryptoError::MalformedEnvelope("plaintext is not UTF-8".to_string()))
    }

    /// Absent values pass straight through.
    pub fn decrypt_opt(
        &self,
        header: &str,
        envelope: Option<&Envelope>,
    ) -> Result<Option<String>, CryptoError> {
        envelope.map(|env| self.decrypt(header, env)).transpose()
    }
}

fn decode_component(name: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    Base64::decode_vec(value)
        .map_err(|e| CryptoError::MalformedEnvelope(format!("{name} is not base64: {e}")))
}

// =============================================================================
// Tests
// =============================================================================
