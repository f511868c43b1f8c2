//! AES-256-GCM implementation of `scheduler_core::Cipher`.
//!
//! Envelopes carry ciphertext, a 12-byte nonce (`iv`), and a 16-byte
//! authentication tag as three separate fields; AES-GCM as implemented by
//! the `aes-gcm` crate expects the tag appended to the ciphertext, so
//! `decrypt` concatenates them before calling through.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use scheduler_core::{Cipher, CipherEnvelope, DecryptKey};
use thiserror::Error;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum AeadCipherError {
    #[error("iv must be {NONCE_LEN} bytes, got {0}")]
    BadNonceLen(usize),
    #[error("tag must be {TAG_LEN} bytes, got {0}")]
    BadTagLen(usize),
    #[error("authenticated decryption failed")]
    Unauthenticated,
}

/// Stateless; holds no key (the key is supplied per-call so a caller can
/// rotate it without reconstructing the cipher).
#[derive(Debug, Clone, Copy, Default)]
pub struct AeadCipher;

impl AeadCipher {
    pub fn new() -> Self {
        Self
    }

    fn decrypt_inner(&self, envelope: &CipherEnvelope, key: &DecryptKey) -> Result<Vec<u8>, AeadCipherError> {
        if envelope.iv.len() != NONCE_LEN {
            return Err(AeadCipherError::BadNonceLen(envelope.iv.len()));
        }
        if envelope.tag.len() != TAG_LEN {
            return Err(AeadCipherError::BadTagLen(envelope.tag.len()));
        }

        let cipher_key = Key::<Aes256Gcm>::from_slice(&key.0);
        let cipher = Aes256Gcm::new(cipher_key);
        let nonce = Nonce::from_slice(&envelope.iv);

        let mut combined = Vec::with_capacity(envelope.ciphertext.len() + envelope.tag.len());
        combined.extend_from_slice(&envelope.ciphertext);
        combined.extend_from_slice(&envelope.tag);

        cipher
            .decrypt(nonce, combined.as_ref())
            .map_err(|_| AeadCipherError::Unauthenticated)
    }
}

impl Cipher for AeadCipher {
    fn decrypt(&self, envelope: &CipherEnvelope, key: &DecryptKey) -> scheduler_core::Result<Vec<u8>> {
        self.decrypt_inner(envelope, key)
            .map_err(|err| scheduler_core::SchedulerError::DecryptFailed(err.to_string()))
    }
}

/// Seals program text into an envelope this crate's [`Cipher`] can later
/// decrypt. Not part of the `Cipher` trait — the worker never encrypts,
/// only whatever creates command records does (an API tier outside this
/// workspace's concern), so this is a free function rather than a port.
pub fn seal(plaintext: &[u8], key: &DecryptKey) -> CipherEnvelope {
    let cipher_key = Key::<Aes256Gcm>::from_slice(&key.0);
    let cipher = Aes256Gcm::new(cipher_key);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let mut sealed = cipher.encrypt(&nonce, plaintext).expect("aes-gcm encryption does not fail");
    let tag = sealed.split_off(sealed.len() - TAG_LEN);
    CipherEnvelope {
        ciphertext: sealed,
        iv: nonce.to_vec(),
        tag,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_program() {
        let key = DecryptKey([7u8; 32]);
        let envelope = seal(b"{\"ops\":[]}", &key);
        let cipher = AeadCipher::new();
        let plaintext = cipher.decrypt(&envelope, &key).unwrap();
        assert_eq!(plaintext, b"{\"ops\":[]}");
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let key = DecryptKey([7u8; 32]);
        let mut envelope = seal(b"hello", &key);
        envelope.ciphertext[0] ^= 0xFF;
        let cipher = AeadCipher::new();
        assert!(cipher.decrypt(&envelope, &key).is_err());
    }

    #[test]
    fn rejects_wrong_key() {
        let key = DecryptKey([7u8; 32]);
        let other = DecryptKey([9u8; 32]);
        let envelope = seal(b"hello", &key);
        let cipher = AeadCipher::new();
        assert!(cipher.decrypt(&envelope, &other).is_err());
    }

    #[test]
    fn rejects_malformed_iv_length() {
        let key = DecryptKey([7u8; 32]);
        let mut envelope = seal(b"hello", &key);
        envelope.iv.push(0);
        let cipher = AeadCipher::new();
        assert!(cipher.decrypt(&envelope, &key).is_err());
    }
}
