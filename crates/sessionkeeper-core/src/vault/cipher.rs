//! ChaCha20-Poly1305 encryption for stored credential envelopes.
//!
//! Ciphertext format: base64(NONCE (12) || CIPHERTEXT (N + 16 tag)).
//! The key is supplied by configuration, either as raw bytes or derived from a
//! passphrase with Argon2id. It is never generated or persisted here.

use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::{rngs::OsRng, RngCore};

use crate::error::CipherError;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits)
const NONCE_SIZE: usize = 12;

/// Argon2 rejects salts shorter than this.
const MIN_SALT_SIZE: usize = 8;

/// Symmetric encryption capability used by the vault.
pub trait CredentialCipher: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<String, CipherError>;
    fn open(&self, ciphertext: &str) -> Result<Vec<u8>, CipherError>;
}

pub struct ChaChaCipher {
    cipher: ChaCha20Poly1305,
}

impl ChaChaCipher {
    pub fn from_key(key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != KEY_SIZE {
            return Err(CipherError::InvalidKey(format!(
                "key must be {} bytes, got {}",
                KEY_SIZE,
                key.len()
            )));
        }
        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        })
    }

    /// Key from a base64-encoded 32-byte value.
    pub fn from_base64_key(key_base64: &str) -> Result<Self, CipherError> {
        let key = BASE64
            .decode(key_base64.trim())
            .map_err(|_| CipherError::InvalidKey("key is not valid base64".to_string()))?;
        Self::from_key(&key)
    }

    /// Key derived from a passphrase with Argon2id (default parameters).
    pub fn from_passphrase(passphrase: &str, salt: &[u8]) -> Result<Self, CipherError> {
        if passphrase.is_empty() {
            return Err(CipherError::InvalidKey("passphrase is empty".to_string()));
        }
        if salt.len() < MIN_SALT_SIZE {
            return Err(CipherError::InvalidKey(format!(
                "salt must be at least {} bytes",
                MIN_SALT_SIZE
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| CipherError::InvalidKey(format!("key derivation failed: {}", e)))?;
        let cipher = Self::from_key(&key);
        key.fill(0);
        cipher
    }
}

impl CredentialCipher for ChaChaCipher {
    fn seal(&self, plaintext: &[u8]) -> Result<String, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CipherError::Seal)?;

        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(output))
    }

    fn open(&self, ciphertext: &str) -> Result<Vec<u8>, CipherError> {
        let data = BASE64
            .decode(ciphertext)
            .map_err(|_| CipherError::Malformed("not valid base64".to_string()))?;
        if data.len() <= NONCE_SIZE {
            return Err(CipherError::Malformed("too short".to_string()));
        }
        let (nonce, body) = data.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| CipherError::Open)
    }
}
