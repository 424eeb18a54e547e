//! Client-side secret envelope
//!
//! Secrets are sealed on the client before they reach the store, which only
//! ever sees the base64 text. Layout before base64:
//!
//! ```text
//! | nonce (12) | AES-256-GCM ciphertext + tag | salt (32) |
//! ```
//!
//! The key is derived from the password and salt with Argon2id.

use crate::common::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

/// Size of AES-256 key in bytes
const KEY_SIZE: usize = 32;

/// Size of GCM nonce in bytes
const NONCE_SIZE: usize = 12;

/// Size of GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Size of the key-derivation salt appended at the tail
pub const SALT_SIZE: usize = 32;

fn derive_key(password: &[u8], salt: &[u8]) -> Result<[u8; KEY_SIZE]> {
    let mut key = [0u8; KEY_SIZE];
    Argon2::default()
        .hash_password_into(password, salt, &mut key)
        .map_err(|e| Error::Encryption(format!("key derivation failed: {}", e)))?;
    Ok(key)
}

fn cipher(password: &[u8], salt: &[u8]) -> Result<Aes256Gcm> {
    let key = derive_key(password, salt)?;
    Aes256Gcm::new_from_slice(&key).map_err(|e| Error::Encryption(e.to_string()))
}

/// Encrypt `plaintext` under `password`, returning base64 text.
pub fn seal(plaintext: &[u8], password: &[u8]) -> Result<String> {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher(password, &salt)?
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| Error::Encryption(format!("encryption failed: {}", e)))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len() + SALT_SIZE);
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    sealed.extend_from_slice(&salt);
    Ok(BASE64.encode(sealed))
}

/// Decrypt base64 text produced by [`seal`].
pub fn open(sealed: &str, password: &[u8]) -> Result<Vec<u8>> {
    let data = BASE64
        .decode(sealed.trim())
        .map_err(|e| Error::Encryption(format!("invalid base64: {}", e)))?;
    if data.len() < NONCE_SIZE + TAG_SIZE + SALT_SIZE {
        return Err(Error::Encryption("sealed data too short".into()));
    }

    let (body, salt) = data.split_at(data.len() - SALT_SIZE);
    let (nonce, ciphertext) = body.split_at(NONCE_SIZE);

    cipher(password, salt)?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Encryption("decryption failed: wrong password or corrupted data".into()))
}
