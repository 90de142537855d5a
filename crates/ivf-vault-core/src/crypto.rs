//! Cryptographic primitives.
//!
//! AES-256-GCM authenticated encryption, HKDF-SHA256 key derivation, and
//! zeroize-on-drop key newtypes.
//!
//! # Security model
//!
//! - Every encryption generates a fresh 96-bit nonce via `OsRng`.
//! - Ciphertext and nonce are kept apart ([`Sealed`]) because every record
//!   in this crate persists them as separate fields (`encrypted_data`, `iv`).
//! - The 16-byte GCM tag is appended to the ciphertext.
//! - Decrypting under the wrong key fails tag verification and returns
//!   [`CryptoError::Decryption`]; it never yields garbage plaintext.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Nonce length for AES-256-GCM (96 bits).
pub const NONCE_LEN: usize = 12;

/// Key length for AES-256 (256 bits).
pub const KEY_LEN: usize = 32;

/// A 256-bit encryption key that is zeroized on drop.
///
/// Used for the KEK, per-purpose DEKs, and the unseal master key. The inner
/// bytes are never exposed in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Create a key from a slice, checking the length.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] unless `bytes` is 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength { actual: bytes.len() })?;
        Ok(Self(arr))
    }

    /// Decode a base64-encoded 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encoding`] or [`CryptoError::InvalidKeyLength`].
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let mut raw = decode_b64("key", encoded)?;
        let key = Self::from_slice(&raw);
        raw.zeroize();
        key
    }

    /// Generate a new random key using the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    ///
    /// The caller must not log or persist these bytes unwrapped.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Base64 of the raw bytes, for handing to a KMS wrap call.
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Output of [`encrypt`]: ciphertext with appended tag, plus its nonce.
#[derive(Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

impl Sealed {
    /// Base64 of the ciphertext.
    #[must_use]
    pub fn ciphertext_b64(&self) -> String {
        BASE64.encode(&self.ciphertext)
    }

    /// Base64 of the nonce.
    #[must_use]
    pub fn nonce_b64(&self) -> String {
        BASE64.encode(self.nonce)
    }
}

impl fmt::Debug for Sealed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sealed")
            .field("ciphertext_len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

/// Encrypt plaintext using AES-256-GCM with a fresh random nonce.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Sealed, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&nonce);
    Ok(Sealed {
        ciphertext,
        nonce: nonce_bytes,
    })
}

/// Decrypt ciphertext produced by [`encrypt`].
///
/// # Errors
///
/// Returns [`CryptoError::InvalidNonceLength`] if `nonce` is not 12 bytes.
///
/// Returns [`CryptoError::Decryption`] if authentication fails (wrong key,
/// corrupted data, or tampered tag).
pub fn decrypt(key: &EncryptionKey, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::InvalidNonceLength { actual: nonce.len() });
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| CryptoError::Decryption {
            reason: e.to_string(),
        })
}

/// Decrypt base64-encoded ciphertext and nonce.
///
/// # Errors
///
/// Returns [`CryptoError::Encoding`] for bad base64, otherwise as [`decrypt`].
pub fn decrypt_b64(key: &EncryptionKey, ciphertext_b64: &str, nonce_b64: &str) -> Result<Vec<u8>, CryptoError> {
    let ciphertext = decode_b64("ciphertext", ciphertext_b64)?;
    let nonce = decode_b64("iv", nonce_b64)?;
    decrypt(key, &ciphertext, &nonce)
}

/// Derive a key from input keying material using HKDF-SHA256.
///
/// The `info` string must be unique per use (e.g. `b"ivf-vault-unseal-v1"`).
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if HKDF expansion fails.
pub fn derive_key(ikm: &[u8], salt: Option<&[u8]>, info: &[u8]) -> Result<EncryptionKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut derived = [0u8; KEY_LEN];
    hk.expand(info, &mut derived)
        .map_err(|e| CryptoError::KeyDerivation {
            context: String::from_utf8_lossy(info).into_owned(),
            reason: e.to_string(),
        })?;
    Ok(EncryptionKey::from_bytes(derived))
}

/// Fill a buffer of `len` bytes from the OS CSPRNG.
#[must_use]
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Decode standard base64, naming the field on failure.
///
/// # Errors
///
/// Returns [`CryptoError::Encoding`] if the input is not valid base64.
pub fn decode_b64(field: &str, encoded: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64.decode(encoded).map_err(|e| CryptoError::Encoding {
        field: field.to_owned(),
        reason: e.to_string(),
    })
}

/// Encode bytes as standard base64.
#[must_use]
pub fn encode_b64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}
