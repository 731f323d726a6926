//! AES-256-GCM helpers
//!
//! Sealed blobs are laid out as `nonce (12 bytes) || ciphertext || tag`.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use crate::crypto::errors::{CryptoError, CryptoResult};

pub const NONCE_LEN: usize = 12;

/// Encrypt with a random nonce
pub fn seal(key: &[u8; 32], plaintext: &[u8], associated_data: &[u8]) -> CryptoResult<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = seal_with_nonce(key, &nonce, plaintext, associated_data)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a blob produced by [`seal`]
pub fn open(key: &[u8; 32], sealed: &[u8], associated_data: &[u8]) -> CryptoResult<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(CryptoError::DecryptionError("Ciphertext too short".to_string()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce: [u8; NONCE_LEN] = nonce
        .try_into()
        .map_err(|_| CryptoError::DecryptionError("Invalid nonce".to_string()))?;
    open_with_nonce(key, &nonce, ciphertext, associated_data)
}

/// Encrypt under a caller-provided nonce; the key must never see the same nonce twice
pub fn seal_with_nonce(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    associated_data: &[u8],
) -> CryptoResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionError(format!("Invalid key: {}", e)))?;
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| CryptoError::EncryptionError("AES-GCM encryption failed".to_string()))
}

pub fn open_with_nonce(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> CryptoResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::DecryptionError(format!("Invalid key: {}", e)))?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| CryptoError::DecryptionError("AES-GCM authentication failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tampering_detected() {
        let key = [9u8; 32];
        let mut sealed = seal(&key, b"hello", b"header").unwrap();
        assert_eq!(open(&key, &sealed, b"header").unwrap(), b"hello");
        assert!(open(&key, &sealed, b"other header").is_err());

        let last = sealed.len() - 1;
        sealed[last] ^= 0x80;
        assert!(open(&key, &sealed, b"header").is_err());
        assert!(open(&key, &[1, 2, 3], b"").is_err());
    }
}
