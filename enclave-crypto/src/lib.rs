//! Crypto primitives for the Enclave IPC channel and dependency loader.
//!
//! - ChaCha20-Poly1305 payload encryption with random 96-bit nonces
//! - Argon2id passphrase derivation for channel keys
//! - HMAC-SHA256 message signing
//! - Subresource-integrity digest parsing and verification

pub mod cipher;
pub mod error;
pub mod integrity;
pub mod key;
pub mod signing;

pub use cipher::{
    decrypt, decrypt_json, decrypt_string, encrypt, encrypt_json, encrypt_string, EncryptedData,
    NONCE_SIZE, TAG_SIZE,
};
pub use error::{CryptoError, CryptoResult};
pub use integrity::{HashAlgorithm, Integrity};
pub use key::{derive_key, generate_random_key, ChannelKey, KdfParams, Salt, KEY_SIZE, SALT_SIZE};
