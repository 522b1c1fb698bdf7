//! AEAD encryption using ChaCha20-Poly1305

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;

use haven_core::{ResilienceError, ResilienceResult};

/// Key size for ChaCha20-Poly1305
pub const KEY_SIZE: usize = 32;

/// Nonce size for ChaCha20-Poly1305
pub const NONCE_SIZE: usize = 12;

/// Tag size for ChaCha20-Poly1305
pub const TAG_SIZE: usize = 16;

/// AEAD cipher wrapper
pub struct AeadCipher {
    cipher: ChaCha20Poly1305,
}

impl AeadCipher {
    /// Create a new cipher from key bytes
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        AeadCipher {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Encrypt plaintext with associated data
    /// Returns ciphertext with appended auth tag
    pub fn encrypt(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
    ) -> ResilienceResult<Vec<u8>> {
        self.cipher
            .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
            .map_err(|_| ResilienceError::Encryption("encrypt failed".into()))
    }

    /// Decrypt ciphertext with associated data
    /// Ciphertext should include the auth tag at the end
    pub fn decrypt(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> ResilienceResult<Vec<u8>> {
        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| ResilienceError::Encryption("decryption failed".into()))
    }
}

/// Fresh random nonce. Payload keys are long-lived, so nonces are never derived.
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Fresh random key
pub fn random_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = AeadCipher::new(&[0x42u8; KEY_SIZE]);
        let nonce = random_nonce();
        let plaintext = b"{\"tier\":\"premium\"}";

        let ciphertext = cipher.encrypt(&nonce, b"aad", plaintext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_SIZE);

        let decrypted = cipher.decrypt(&nonce, b"aad", &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher1 = AeadCipher::new(&[0x42u8; KEY_SIZE]);
        let cipher2 = AeadCipher::new(&[0x43u8; KEY_SIZE]);
        let nonce = random_nonce();

        let ciphertext = cipher1.encrypt(&nonce, b"", b"secret").unwrap();
        assert!(cipher2.decrypt(&nonce, b"", &ciphertext).is_err());
    }

    #[test]
    fn test_wrong_aad_fails() {
        let cipher = AeadCipher::new(&[0x42u8; KEY_SIZE]);
        let nonce = random_nonce();

        let ciphertext = cipher.encrypt(&nonce, b"correct aad", b"secret").unwrap();
        assert!(cipher.decrypt(&nonce, b"wrong aad", &ciphertext).is_err());
    }

    #[test]
    fn test_nonce_uniqueness() {
        assert_ne!(random_nonce(), random_nonce());
    }
}
