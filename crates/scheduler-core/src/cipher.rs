//! `Cipher`: authenticated decryption of command text (spec §4.4).
//! Deterministic, no I/O — the concrete AES-256-GCM implementation lives
//! in the `scheduler-cipher` crate so this crate never depends on an
//! AEAD library directly.

use crate::command::CipherEnvelope;
use crate::error::Result;

/// A 32-byte symmetric key, supplied at startup (spec §6,
/// `decryptKey`). An absent key is a fatal startup error for the caller
/// that constructs the cipher, not something this trait models.
pub struct DecryptKey(pub [u8; 32]);

pub trait Cipher: Send + Sync {
    fn decrypt(&self, envelope: &CipherEnvelope, key: &DecryptKey) -> Result<Vec<u8>>;
}
