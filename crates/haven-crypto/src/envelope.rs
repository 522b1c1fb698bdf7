//! Sealed payload envelopes
//!
//! A sealed payload is `encrypt(checksum(body) || body)` where `body` is the
//! JSON serialization of the value. The checksum travels inside the
//! ciphertext and is recomputed on every open before the body is trusted.

use serde::{de::DeserializeOwned, Serialize};

use haven_core::{ResilienceError, ResilienceResult};

use crate::{Checksum, EncryptionAdapter};

const CHECKSUM_SIZE: usize = 32;

/// Encrypted, checksummed payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedPayload {
    blob: Vec<u8>,
    checksum: Checksum,
}

impl SealedPayload {
    /// Serialize, checksum and encrypt a value
    pub fn seal<T: Serialize>(adapter: &dyn EncryptionAdapter, value: &T) -> ResilienceResult<Self> {
        let body =
            serde_json::to_vec(value).map_err(|e| ResilienceError::Serialization(e.to_string()))?;
        let checksum = adapter.hash(&body);

        let mut plaintext = Vec::with_capacity(CHECKSUM_SIZE + body.len());
        plaintext.extend_from_slice(checksum.as_bytes());
        plaintext.extend_from_slice(&body);

        let blob = adapter.encrypt(&plaintext)?;
        Ok(SealedPayload { blob, checksum })
    }

    /// Rebuild from a blob read back from durable storage.
    /// Decrypts once to learn and verify the embedded checksum.
    pub fn from_blob(adapter: &dyn EncryptionAdapter, blob: Vec<u8>) -> ResilienceResult<Self> {
        let plaintext = adapter.decrypt(&blob)?;
        let (embedded, body) = split(&plaintext)?;
        if adapter.hash(body) != embedded {
            return Err(ResilienceError::ChecksumMismatch);
        }
        Ok(SealedPayload {
            blob,
            checksum: embedded,
        })
    }

    /// Decrypt, verify and deserialize
    pub fn open<T: DeserializeOwned>(&self, adapter: &dyn EncryptionAdapter) -> ResilienceResult<T> {
        let plaintext = adapter.decrypt(&self.blob)?;
        let (embedded, body) = split(&plaintext)?;

        let recomputed = adapter.hash(body);
        if recomputed != embedded || recomputed != self.checksum {
            tracing::warn!(expected = %self.checksum, "sealed payload checksum mismatch");
            return Err(ResilienceError::ChecksumMismatch);
        }

        serde_json::from_slice(body).map_err(|e| ResilienceError::Serialization(e.to_string()))
    }

    pub fn checksum(&self) -> Checksum {
        self.checksum
    }

    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    pub fn size(&self) -> usize {
        self.blob.len()
    }

    /// Test hook: corrupt the ciphertext in place
    #[doc(hidden)]
    pub fn blob_mut(&mut self) -> &mut Vec<u8> {
        &mut self.blob
    }
}

fn split(plaintext: &[u8]) -> ResilienceResult<(Checksum, &[u8])> {
    if plaintext.len() < CHECKSUM_SIZE {
        return Err(ResilienceError::ChecksumMismatch);
    }
    let mut embedded = [0u8; CHECKSUM_SIZE];
    embedded.copy_from_slice(&plaintext[..CHECKSUM_SIZE]);
    Ok((Checksum(embedded), &plaintext[CHECKSUM_SIZE..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChaChaAdapter;
    use haven_core::AccountState;
    use proptest::prelude::*;

    #[test]
    fn test_seal_open_account_state() {
        let adapter = ChaChaAdapter::generate();
        let state = AccountState::for_user("u-1", "premium");

        let sealed = SealedPayload::seal(&adapter, &state).unwrap();
        let opened: AccountState = sealed.open(&adapter).unwrap();
        assert_eq!(opened, state);
    }

    #[test]
    fn test_plaintext_not_visible_in_blob() {
        let adapter = ChaChaAdapter::generate();
        let state = AccountState::for_user("needle-user", "premium");
        let sealed = SealedPayload::seal(&adapter, &state).unwrap();

        let needle = b"needle-user";
        assert!(!sealed.blob().windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn test_from_blob_recovers_checksum() {
        let adapter = ChaChaAdapter::generate();
        let sealed = SealedPayload::seal(&adapter, &"journal").unwrap();

        let reloaded = SealedPayload::from_blob(&adapter, sealed.blob().to_vec()).unwrap();
        assert_eq!(reloaded.checksum(), sealed.checksum());
    }

    #[test]
    fn test_tampered_blob_rejected() {
        let adapter = ChaChaAdapter::generate();
        let mut sealed = SealedPayload::seal(&adapter, &"journal").unwrap();
        let idx = sealed.blob().len() / 2;
        sealed.blob_mut()[idx] ^= 0xff;

        assert!(sealed.open::<String>(&adapter).is_err());
    }

    proptest! {
        #[test]
        fn prop_seal_open_roundtrip(tier in "[a-z]{1,12}", user in "[a-z0-9-]{1,24}") {
            let adapter = ChaChaAdapter::new(&[7u8; 32]);
            let state = AccountState::for_user(&user, &tier);
            let sealed = SealedPayload::seal(&adapter, &state).unwrap();
            let opened: AccountState = sealed.open(&adapter).unwrap();
            prop_assert_eq!(opened, state);
        }
    }
}
