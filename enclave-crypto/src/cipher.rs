//! Payload encryption using ChaCha20-Poly1305.
//!
//! Encrypted payloads travel as base64 of `nonce || ciphertext`.

use crate::error::{CryptoError, CryptoResult};
use crate::key::ChannelKey;
use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

/// Size of nonce in bytes (96 bits for ChaCha20-Poly1305).
pub const NONCE_SIZE: usize = 12;

/// Size of authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Encrypted data with the nonce needed for decryption.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedData {
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext including the auth tag.
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    /// Encodes as base64(nonce || ciphertext).
    pub fn to_base64(&self) -> String {
        let mut bytes = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        STANDARD.encode(&bytes)
    }

    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::Decryption(format!("invalid base64: {}", e)))?;

        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Decryption("data too short".to_string()));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[..NONCE_SIZE]);
        let ciphertext = bytes[NONCE_SIZE..].to_vec();

        Ok(Self { nonce, ciphertext })
    }
}

/// Encrypts plaintext under a fresh random nonce.
pub fn encrypt(key: &ChannelKey, plaintext: &[u8]) -> CryptoResult<EncryptedData> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok(EncryptedData {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Decrypts and authenticates ciphertext.
pub fn decrypt(key: &ChannelKey, encrypted: &EncryptedData) -> CryptoResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = Nonce::from_slice(&encrypted.nonce);

    cipher
        .decrypt(nonce, encrypted.ciphertext.as_ref())
        .map_err(|_| {
            CryptoError::Decryption("decryption failed (wrong key or tampered data)".to_string())
        })
}

/// Encrypts a string and returns the base64-encoded result.
pub fn encrypt_string(key: &ChannelKey, plaintext: &str) -> CryptoResult<String> {
    Ok(encrypt(key, plaintext.as_bytes())?.to_base64())
}

/// Decrypts a base64-encoded string.
pub fn decrypt_string(key: &ChannelKey, encoded: &str) -> CryptoResult<String> {
    let encrypted = EncryptedData::from_base64(encoded)?;
    let plaintext = decrypt(key, &encrypted)?;
    String::from_utf8(plaintext)
        .map_err(|e| CryptoError::Decryption(format!("invalid UTF-8: {}", e)))
}

/// Encrypts the JSON serialization of `value`; the result is a JSON string.
pub fn encrypt_json(
    key: &ChannelKey,
    value: &serde_json::Value,
) -> CryptoResult<serde_json::Value> {
    let plaintext = serde_json::to_string(value)?;
    Ok(serde_json::Value::String(encrypt_string(key, &plaintext)?))
}

/// Reverses [`encrypt_json`]. Fails unless `value` is a string holding a valid ciphertext.
pub fn decrypt_json(
    key: &ChannelKey,
    value: &serde_json::Value,
) -> CryptoResult<serde_json::Value> {
    let encoded = value
        .as_str()
        .ok_or_else(|| CryptoError::Decryption("encrypted payload must be a string".into()))?;
    let plaintext = decrypt_string(key, encoded)?;
    Ok(serde_json::from_str(&plaintext)?)
}
