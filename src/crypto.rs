//! Secret encryption for vault entries.
//!
//! The store treats `encrypted_key` as opaque text; this module is the only
//! place that produces or reads it.  Blob format:
//! `base64(nonce[12] || chacha20poly1305 ciphertext)`.

use std::fmt;

use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use sha2::Sha256;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const PBKDF2_ROUNDS: u32 = 100_000;

const VAULT_AAD: &[u8] = b"devlife-vault";

#[derive(Debug)]
pub enum CryptoError {
    InvalidKey(&'static str),
    Encoding(String),
    Aead(chacha20poly1305::aead::Error),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::InvalidKey(msg) => write!(f, "invalid key: {msg}"),
            CryptoError::Encoding(msg) => write!(f, "malformed ciphertext: {msg}"),
            CryptoError::Aead(_) => write!(f, "decryption failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<chacha20poly1305::aead::Error> for CryptoError {
    fn from(error: chacha20poly1305::aead::Error) -> Self {
        CryptoError::Aead(error)
    }
}

/// Opaque encrypt/decrypt capability for vault secrets.
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError>;
    fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError>;
}

pub struct ChaChaCipher {
    key: [u8; KEY_SIZE],
}

impl ChaChaCipher {
    pub fn from_key(key: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_SIZE] = key
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("key must be 32 bytes"))?;
        Ok(Self { key })
    }

    /// Derive the key from a passphrase with PBKDF2-HMAC-SHA256 over
    /// [`PBKDF2_ROUNDS`] rounds.
    pub fn from_passphrase(passphrase: &str, salt: &[u8]) -> Result<Self, CryptoError> {
        if passphrase.is_empty() {
            return Err(CryptoError::InvalidKey("passphrase is empty"));
        }
        Ok(Self {
            key: derive_key(passphrase, salt, PBKDF2_ROUNDS),
        })
    }

    fn aead(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key))
    }
}

fn derive_key(passphrase: &str, salt: &[u8], rounds: u32) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, rounds, &mut key);
    key
}

impl SecretCipher for ChaChaCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = self.aead().encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext.as_bytes(),
                aad: VAULT_AAD,
            },
        )?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(combined))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(ciphertext)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        if combined.len() <= NONCE_SIZE {
            return Err(CryptoError::Encoding("blob shorter than nonce".to_string()));
        }
        let (nonce, body) = combined.split_at(NONCE_SIZE);
        let plaintext = self.aead().decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: body,
                aad: VAULT_AAD,
            },
        )?;
        String::from_utf8(plaintext).map_err(|e| CryptoError::Encoding(e.to_string()))
    }
}
