//! Encryption adapter capability
//!
//! The engine never touches key material. It only sees this interface, so a
//! platform keystore-backed adapter can replace the default.

use haven_core::{ResilienceError, ResilienceResult};

use crate::{random_key, random_nonce, AeadCipher, Checksum, KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Encrypt/decrypt/hash capability
pub trait EncryptionAdapter: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> ResilienceResult<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> ResilienceResult<Vec<u8>>;
    fn hash(&self, data: &[u8]) -> Checksum;
}

/// Prefix of every blob produced by [`ChaChaAdapter`]
pub const ENVELOPE_MAGIC: &[u8; 4] = b"HVN1";

/// Default adapter: ChaCha20-Poly1305 with a random nonce per payload
///
/// Layout: `magic(4) || nonce(12) || ciphertext+tag`. The magic is bound as
/// associated data.
pub struct ChaChaAdapter {
    cipher: AeadCipher,
}

impl ChaChaAdapter {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        ChaChaAdapter {
            cipher: AeadCipher::new(key),
        }
    }

    /// Adapter with a fresh random key (memory-only engines, tests)
    pub fn generate() -> Self {
        Self::new(&random_key())
    }
}

impl EncryptionAdapter for ChaChaAdapter {
    fn encrypt(&self, plaintext: &[u8]) -> ResilienceResult<Vec<u8>> {
        let nonce = random_nonce();
        let ciphertext = self.cipher.encrypt(&nonce, ENVELOPE_MAGIC, plaintext)?;

        let mut out = Vec::with_capacity(ENVELOPE_MAGIC.len() + NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(ENVELOPE_MAGIC);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, blob: &[u8]) -> ResilienceResult<Vec<u8>> {
        if !blob.starts_with(ENVELOPE_MAGIC) {
            return Err(ResilienceError::Encryption("unknown payload format".into()));
        }
        if blob.len() < ENVELOPE_MAGIC.len() + NONCE_SIZE + TAG_SIZE {
            return Err(ResilienceError::Encryption("payload too short".into()));
        }

        let nonce_start = ENVELOPE_MAGIC.len();
        let nonce_end = nonce_start + NONCE_SIZE;
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&blob[nonce_start..nonce_end]);

        self.cipher.decrypt(&nonce, ENVELOPE_MAGIC, &blob[nonce_end..])
    }

    fn hash(&self, data: &[u8]) -> Checksum {
        Checksum::of(data)
    }
}
