//! Key manager capability
//!
//! The long-term identity key and the at-rest encryption key belong to the
//! host's key manager. The core signs, seals and runs chat-identity DH only
//! through this trait.

use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypto::aead;
use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::keys::{Curve25519KeyPair, IdentityKeyPair};

pub trait KeyManager: Send + Sync {
    /// Ed25519 signature with the long-term identity key
    fn identity_sign(&self, message: &[u8]) -> Vec<u8>;

    /// Ed25519 public identity key
    fn identity_public_key(&self) -> [u8; 32];

    fn identity_public_key_hex(&self) -> String {
        hex::encode(self.identity_public_key())
    }

    /// Seal bytes with the local at-rest key
    fn aes_encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Open bytes sealed by [`KeyManager::aes_encrypt`]
    fn aes_decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Curve25519 chat identity used for X3DH
    fn chat_id_key_pair(&self) -> Curve25519KeyPair;
}

/// In-process key manager holding its keys in memory
pub struct LocalKeyManager {
    identity: IdentityKeyPair,
    chat_identity: Curve25519KeyPair,
    storage_key: Zeroizing<[u8; 32]>,
}

impl LocalKeyManager {
    pub fn new(identity: IdentityKeyPair, chat_identity: Curve25519KeyPair, storage_key: [u8; 32]) -> Self {
        Self {
            identity,
            chat_identity,
            storage_key: Zeroizing::new(storage_key),
        }
    }

    /// Fresh identity, chat identity and storage key
    pub fn generate() -> Self {
        Self::new(
            IdentityKeyPair::generate(),
            Curve25519KeyPair::generate(),
            generate_storage_key(),
        )
    }

    /// Restore from persisted secret halves and a local master secret
    pub fn restore(
        identity_secret: &[u8],
        chat_identity_secret: &[u8],
        master_secret: &[u8],
        salt: &[u8],
    ) -> CryptoResult<Self> {
        Ok(Self::new(
            IdentityKeyPair::from_secret_bytes(identity_secret)?,
            Curve25519KeyPair::from_secret_bytes(chat_identity_secret)?,
            derive_storage_key(master_secret, salt)?,
        ))
    }
}

impl KeyManager for LocalKeyManager {
    fn identity_sign(&self, message: &[u8]) -> Vec<u8> {
        self.identity.sign(message)
    }

    fn identity_public_key(&self) -> [u8; 32] {
        self.identity.public_key_bytes()
    }

    fn aes_encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        aead::seal(&self.storage_key, plaintext, &[])
    }

    fn aes_decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        aead::open(&self.storage_key, ciphertext, &[])
    }

    fn chat_id_key_pair(&self) -> Curve25519KeyPair {
        self.chat_identity.clone()
    }
}

/// Derive the at-rest encryption key from a master secret
pub fn derive_storage_key(master_secret: &[u8], salt: &[u8]) -> CryptoResult<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), master_secret);
    let mut key = [0u8; 32];
    hkdf.expand(b"SealChat Storage Key v1", &mut key)
        .map_err(|e| CryptoError::KeyExchangeFailed(format!("HKDF expansion failed: {}", e)))?;
    Ok(key)
}

/// Generate a random storage key
pub fn generate_storage_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
}
