//! AES-256-GCM encryption of managed token values.
//!
//! The master key is a base64-encoded 32-byte value read from the variable
//! named by `encryption.key_env` (default `CUTOVER_ENCRYPTION_KEY`). Every
//! value gets a fresh random 12-byte nonce; the 16-byte tag is appended to the
//! ciphertext. Records carry the key version so a later key rotation can tell
//! which key sealed them.

use crate::config::EncryptionConfig;
use crate::errors::{CutoverError, Result};
use crate::secrets::SecretString;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::aead::{self, Aad, BoundKey, Nonce, NonceSequence, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;
use tracing::{debug, error};
use zeroize::Zeroizing;

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Ciphertext and nonce, both base64, as stored on a token record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedValue {
    pub ciphertext: String,
    pub nonce: String,
    pub key_version: String,
}

struct SingleNonce(Option<[u8; NONCE_SIZE]>);

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0.take().map(Nonce::assume_unique_for_key).ok_or(ring::error::Unspecified)
    }
}

#[derive(Clone)]
pub struct TokenCipher {
    key: Arc<Zeroizing<[u8; 32]>>,
    key_version: String,
    rng: Arc<SystemRandom>,
}

impl TokenCipher {
    /// Build from a base64-encoded key
    pub fn from_base64(key_base64: &str, key_version: &str) -> Result<Self> {
        let bytes = Zeroizing::new(STANDARD.decode(key_base64.trim()).map_err(|e| {
            CutoverError::config(format!("encryption key is not valid base64: {e}"))
        })?);

        if bytes.len() != 32 {
            return Err(CutoverError::config(format!(
                "encryption key must be 32 bytes (256 bits), got {} bytes",
                bytes.len()
            )));
        }

        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&bytes);

        debug!(key_version = %key_version, "token cipher initialised");

        Ok(Self {
            key: Arc::new(key),
            key_version: key_version.to_string(),
            rng: Arc::new(SystemRandom::new()),
        })
    }

    /// Build from the environment variable named in the config
    pub fn from_config(config: &EncryptionConfig) -> Result<Self> {
        let key = SecretString::from_env(&[config.key_env.as_str()]).ok_or_else(|| {
            CutoverError::config(format!(
                "{} is not set; generate a key with: openssl rand -base64 32",
                config.key_env
            ))
        })?;
        Self::from_base64(key.expose_secret(), &config.key_version)
    }

    pub fn key_version(&self) -> &str {
        &self.key_version
    }

    pub fn seal(&self, plaintext: &SecretString) -> Result<SealedValue> {
        let mut nonce = [0u8; NONCE_SIZE];
        self.rng.fill(&mut nonce).map_err(|_| {
            error!("failed to generate nonce");
            CutoverError::encryption("failed to generate nonce")
        })?;

        let unbound = UnboundKey::new(&AES_256_GCM, self.key.as_slice())
            .map_err(|_| CutoverError::encryption("failed to create sealing key"))?;
        let mut sealing_key = aead::SealingKey::new(unbound, SingleNonce(Some(nonce)));

        let mut buffer = plaintext.expose_secret().as_bytes().to_vec();
        buffer.reserve(TAG_SIZE);
        sealing_key
            .seal_in_place_append_tag(Aad::from(self.key_version.as_bytes()), &mut buffer)
            .map_err(|_| CutoverError::encryption("failed to encrypt token value"))?;

        Ok(SealedValue {
            ciphertext: STANDARD.encode(&buffer),
            nonce: STANDARD.encode(nonce),
            key_version: self.key_version.clone(),
        })
    }

    pub fn open(&self, ciphertext: &str, nonce: &str, key_version: &str) -> Result<SecretString> {
        if key_version != self.key_version {
            return Err(CutoverError::encryption(format!(
                "value sealed with key version '{key_version}', current key is '{}'",
                self.key_version
            )));
        }

        let nonce_bytes = STANDARD
            .decode(nonce)
            .map_err(|e| CutoverError::encryption(format!("nonce is not valid base64: {e}")))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(CutoverError::encryption(format!(
                "invalid nonce length: expected {NONCE_SIZE} bytes, got {}",
                nonce_bytes.len()
            )));
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&nonce_bytes);

        let mut buffer = STANDARD.decode(ciphertext).map_err(|e| {
            CutoverError::encryption(format!("ciphertext is not valid base64: {e}"))
        })?;
        if buffer.len() < TAG_SIZE {
            return Err(CutoverError::encryption("ciphertext too short"));
        }

        let unbound = UnboundKey::new(&AES_256_GCM, self.key.as_slice())
            .map_err(|_| CutoverError::encryption("failed to create opening key"))?;
        let mut opening_key = aead::OpeningKey::new(unbound, SingleNonce(Some(nonce)));

        let plaintext = opening_key
            .open_in_place(Aad::from(key_version.as_bytes()), &mut buffer)
            .map_err(|_| {
                error!("token decryption failed: wrong key or tampered record");
                CutoverError::encryption("failed to decrypt token value")
            })?;

        let value = String::from_utf8(plaintext.to_vec())
            .map_err(|_| CutoverError::encryption("decrypted token is not UTF-8"))?;
        buffer.iter_mut().for_each(|b| *b = 0);
        Ok(SecretString::new(value))
    }
}

impl TokenCipher {
    /// Fixed all-0x42 key. Never use outside tests.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self::from_base64(&STANDARD.encode([0x42u8; 32]), "test")
            .expect("fixed test key is 32 bytes")
    }
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher")
            .field("key_version", &self.key_version)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> TokenCipher {
        TokenCipher::for_testing()
    }

    #[test]
    fn test_seal_open() {
        let cipher = cipher();
        let sealed = cipher.seal(&SecretString::new("hvs.root")).unwrap();
        assert!(!sealed.ciphertext.contains("hvs.root"));
        assert_eq!(sealed.key_version, "test");

        let opened = cipher.open(&sealed.ciphertext, &sealed.nonce, &sealed.key_version).unwrap();
        assert_eq!(opened.expose_secret(), "hvs.root");
    }

    #[test]
    fn test_nonces_differ() {
        let cipher = cipher();
        let a = cipher.seal(&SecretString::new("same")).unwrap();
        let b = cipher.seal(&SecretString::new("same")).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_tampering_detected() {
        let cipher = cipher();
        let sealed = cipher.seal(&SecretString::new("hvs.root")).unwrap();
        let mut bytes = STANDARD.decode(&sealed.ciphertext).unwrap();
        bytes[0] ^= 0xFF;
        let tampered = STANDARD.encode(bytes);
        assert!(cipher.open(&tampered, &sealed.nonce, "test").is_err());
    }

    #[test]
    fn test_key_version_mismatch() {
        let cipher = cipher();
        let sealed = cipher.seal(&SecretString::new("hvs.root")).unwrap();
        assert!(matches!(
            cipher.open(&sealed.ciphertext, &sealed.nonce, "v0"),
            Err(CutoverError::Encryption { .. })
        ));
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(TokenCipher::from_base64(&STANDARD.encode([0u8; 16]), "v1").is_err());
        assert!(TokenCipher::from_base64("%%%", "v1").is_err());
    }
}
