//! Field-level encryption for persisted secrets and spreadsheet cells.
//!
//! Values are encrypted with AES-256-GCM under a fresh nonce and stored
//! as `ENC:<base64(nonce || ciphertext)>`. The marker prefix lets reads
//! distinguish encrypted values from legacy plaintext, which is passed
//! through verbatim.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::{NeoBaseError, Result};

/// Prefix marking an encrypted value.
pub const ENCRYPTION_MARKER: &str = "ENC:";

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// A cipher bound to one 256-bit key.
///
/// The crate uses two instances: one for connection credentials and one
/// for spreadsheet cell data, so the keys can be rotated independently.
#[derive(Clone)]
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material through Debug.
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}

impl FieldCipher {
    /// Creates a cipher from a base64-encoded 32-byte key.
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(encoded.trim())
            .map_err(|_| NeoBaseError::config("encryption key is not valid base64"))?;

        if key_bytes.len() != 32 {
            return Err(NeoBaseError::config(format!(
                "encryption key must be 32 bytes, got {}",
                key_bytes.len()
            )));
        }

        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypts a value into the marked wire form.
    ///
    /// Empty input stays empty so blank cells remain blank in storage.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| NeoBaseError::internal("encryption failed"))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);

        Ok(format!("{ENCRYPTION_MARKER}{}", BASE64.encode(payload)))
    }

    /// Decrypts a stored value.
    ///
    /// Values without the marker prefix are legacy plaintext and are
    /// returned unchanged.
    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let Some(encoded) = stored.strip_prefix(ENCRYPTION_MARKER) else {
            return Ok(stored.to_string());
        };

        let payload = BASE64
            .decode(encoded)
            .map_err(|_| NeoBaseError::internal("encrypted value is not valid base64"))?;

        if payload.len() < NONCE_LEN {
            return Err(NeoBaseError::internal("encrypted value is truncated"));
        }

        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| NeoBaseError::internal("decryption failed (wrong key or corrupt data)"))?;

        String::from_utf8(plaintext)
            .map_err(|_| NeoBaseError::internal("decrypted value is not valid UTF-8"))
    }

    /// Returns true if a stored value carries the encryption marker.
    pub fn is_encrypted(stored: &str) -> bool {
        stored.starts_with(ENCRYPTION_MARKER)
    }
}
