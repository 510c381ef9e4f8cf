use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use scrypt::Params;
use zeroize::Zeroizing;

use crate::{errors::Error, Result};

/// Nonce size for AES-256-GCM. Written as a fixed-size header in front of
/// every sealed payload so decryption is self-describing.
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag size; the minimum trailing overhead of any sealed
/// payload.
pub const TAG_LEN: usize = 16;

/// Application-wide KDF salt. A per-process random salt would make archives
/// written by one process unreadable by the next.
const KDF_SALT: &[u8] = b"bunker.kdf.v1";

// scrypt cost: N = 2^15, r = 8, p = 1.
const SCRYPT_LOG_N: u8 = 15;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// Authenticated symmetric cipher holding the single process-lifetime key.
///
/// The key is derived from a passphrase with scrypt, so any input length
/// yields a full 256-bit key. Every `seal` draws a fresh random nonce;
/// `open` rejects anything whose tag does not verify.
pub struct Cipher {
    inner: Aes256Gcm,
}

impl Cipher {
    pub fn new(passphrase: &str) -> Result<Self> {
        let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, 32)
            .map_err(|e| Error::Config(format!("invalid scrypt parameters: {e}")))?;

        let mut key = Zeroizing::new([0u8; 32]);
        scrypt::scrypt(passphrase.as_bytes(), KDF_SALT, &params, key.as_mut())
            .map_err(|e| Error::Config(format!("key derivation failed: {e}")))?;

        let inner = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));
        Ok(Self { inner })
    }

    /// Encrypt `plaintext`, returning `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .inner
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::Integrity("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a payload produced by [`seal`](Self::seal).
    ///
    /// Fails with [`Error::Integrity`] on truncation, tampering, or a wrong
    /// key; callers must never interpret partially-decrypted output.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Integrity(format!(
                "sealed payload too short: {} bytes",
                sealed.len()
            )));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        self.inner
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Integrity("authentication tag mismatch".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let cipher = Cipher::new("correct horse battery staple").unwrap();
        let payloads: [&[u8]; 4] = [b"", b"x", b"hello world", &[0u8; 4096]];
        for payload in payloads {
            let sealed = cipher.seal(payload).unwrap();
            assert_eq!(cipher.open(&sealed).unwrap(), payload);
        }
    }

    #[test]
    fn fresh_nonce_per_seal() {
        let cipher = Cipher::new("k").unwrap();
        let a = cipher.seal(b"same input").unwrap();
        let b = cipher.seal(b"same input").unwrap();
        assert_ne!(a, b);
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn single_bit_flip_is_detected() {
        let cipher = Cipher::new("k").unwrap();
        let sealed = cipher.seal(b"long-lived secret material").unwrap();

        // Flip one bit in the nonce header, the ciphertext body, and the tag.
        for idx in [0, NONCE_LEN + 3, sealed.len() - 1] {
            let mut tampered = sealed.clone();
            tampered[idx] ^= 0x01;
            let err = cipher.open(&tampered).unwrap_err();
            assert!(matches!(err, Error::Integrity(_)), "index {idx}");
        }
    }

    #[test]
    fn wrong_key_is_detected() {
        let sealed = Cipher::new("key-one").unwrap().seal(b"secret").unwrap();
        let err = Cipher::new("key-two").unwrap().open(&sealed).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let cipher = Cipher::new("k").unwrap();
        let sealed = cipher.seal(b"secret").unwrap();
        let err = cipher.open(&sealed[..NONCE_LEN + TAG_LEN - 1]).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }
}
