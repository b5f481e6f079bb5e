//! AES-256-GCM sealing of stored tokens.
//!
//! Every access and refresh token gets its own random nonce. The master key is
//! base64 of 32 bytes and comes from configuration, never from the database.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// A token sealed for storage: base64 ciphertext and base64 nonce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedToken {
    pub ciphertext: String,
    pub nonce: String,
}

/// Cipher bound to the store's master key.
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// Builds a cipher from a base64-encoded 32-byte key.
    pub fn from_base64_key(key_base64: &str) -> Result<Self> {
        let key_bytes = validate_key(key_base64)?;
        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;
        Ok(Self { cipher })
    }

    /// Encrypts a token under a fresh random nonce.
    pub fn seal(&self, token: &str) -> Result<SealedToken> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, token.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        Ok(SealedToken {
            ciphertext: BASE64.encode(&ciphertext),
            nonce: BASE64.encode(nonce),
        })
    }

    /// Decrypts a sealed token. Fails on a wrong key or tampered data.
    pub fn open(&self, ciphertext: &str, nonce: &str) -> Result<String> {
        let ciphertext = BASE64
            .decode(ciphertext)
            .context("Failed to decode ciphertext")?;
        let nonce_bytes = BASE64.decode(nonce).context("Failed to decode nonce")?;

        if nonce_bytes.len() != NONCE_SIZE {
            return Err(anyhow!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            ));
        }

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

        String::from_utf8(plaintext).context("Decrypted token is not valid UTF-8")
    }
}

/// Validates that the master key is exactly 32 bytes when base64 decoded.
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64.trim())
        .context("Failed to decode base64 encryption key")?;

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}
