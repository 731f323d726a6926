//! Key types used by the chat protocol
//!
//! - Identity keys (Ed25519) for long-term identity and signing
//! - Curve25519 keys for Diffie-Hellman (chat identity, ephemeral, ratchet, pre-keys)
//! - Signed pre-keys and one-time pre-keys as published to the backend

use serde::{Deserialize, Serialize};
use vodozemac::{Curve25519PublicKey, Curve25519SecretKey, Ed25519PublicKey, Ed25519SecretKey};

use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::key_manager::KeyManager;

/// Long-term identity key pair (Ed25519)
///
/// Only the key manager holds one of these; the rest of the crate signs
/// through [`KeyManager::identity_sign`].
pub struct IdentityKeyPair {
    /// Public key (safe to share)
    pub public: Ed25519PublicKey,
    /// Secret key (never leaves device)
    secret: Ed25519SecretKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair
    pub fn generate() -> Self {
        let secret = Ed25519SecretKey::new();
        let public = secret.public_key();
        Self { public, secret }
    }

    /// Restore from the 32 byte secret seed
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> CryptoResult<Self> {
        let secret_arr: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Secret key must be 32 bytes".to_string()))?;

        let secret = Ed25519SecretKey::from_slice(&secret_arr);
        let public = secret.public_key();
        Ok(Self { public, secret })
    }

    /// Sign a message with this identity key
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.secret.sign(message).to_bytes().to_vec()
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }
}

/// Curve25519 key pair for Diffie-Hellman key exchange
pub struct Curve25519KeyPair {
    /// Public key (safe to share)
    pub public: Curve25519PublicKey,
    /// Secret key (never leaves device)
    secret: Curve25519SecretKey,
}

impl Curve25519KeyPair {
    /// Generate a new random Curve25519 key pair
    pub fn generate() -> Self {
        let secret = Curve25519SecretKey::new();
        let public = Curve25519PublicKey::from(&secret);
        Self { public, secret }
    }

    /// Restore from the secret half, recomputing the public key
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> CryptoResult<Self> {
        let secret_arr: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Secret key must be 32 bytes".to_string()))?;

        let secret = Curve25519SecretKey::from_slice(&secret_arr);
        let public = Curve25519PublicKey::from(&secret);
        Ok(Self { public, secret })
    }

    /// Perform Diffie-Hellman key exchange
    pub fn diffie_hellman(&self, their_public: &Curve25519PublicKey) -> [u8; 32] {
        self.secret.diffie_hellman(their_public).to_bytes()
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Get the secret key bytes (for sealed storage)
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        *self.secret.to_bytes()
    }
}

impl Clone for Curve25519KeyPair {
    fn clone(&self) -> Self {
        let secret = Curve25519SecretKey::from_slice(&self.secret.to_bytes());
        Self {
            public: self.public,
            secret,
        }
    }
}

/// Parse a 32 byte Ed25519 public key
pub fn ed25519_public(bytes: &[u8]) -> CryptoResult<Ed25519PublicKey> {
    if bytes.len() != 32 {
        return Err(CryptoError::InvalidKey(format!(
            "Ed25519 key must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    let arr: &[u8; 32] = bytes.try_into().expect("length checked above");
    Ok(Ed25519PublicKey::from_slice(arr)?)
}

/// Parse a 32 byte Curve25519 public key
pub fn curve25519_public(bytes: &[u8]) -> CryptoResult<Curve25519PublicKey> {
    let arr: [u8; 32] = bytes.try_into().map_err(|_| {
        CryptoError::InvalidKey(format!("Curve25519 key must be 32 bytes, got {}", bytes.len()))
    })?;
    Ok(Curve25519PublicKey::from_bytes(arr))
}

/// Verify an Ed25519 signature made by `identity`
pub fn verify_signature(identity: &[u8], message: &[u8], signature: &[u8]) -> CryptoResult<()> {
    let identity = ed25519_public(identity)?;
    let signature = vodozemac::Ed25519Signature::from_slice(signature)
        .map_err(|e| CryptoError::SignatureError(format!("Invalid signature format: {}", e)))?;

    identity
        .verify(message, &signature)
        .map_err(|e| CryptoError::SignatureError(format!("Signature verification failed: {}", e)))
}

/// Signed pre-key (rotated periodically, typically every ~7 days)
///
/// A Curve25519 public key with a signature from the owner's identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKey {
    /// Identifier chosen by the owner
    pub key_id: u32,
    /// The Curve25519 public key
    pub public_key: Vec<u8>,
    /// Ed25519 signature of the public key
    pub signature: Vec<u8>,
    /// Unix timestamp (seconds) when this pre-key was created
    pub created_at: i64,
}

impl SignedPreKey {
    /// Create a new signed pre-key, signing through the key manager
    pub fn sign(key_id: u32, key_pair: &Curve25519KeyPair, key_manager: &dyn KeyManager) -> Self {
        let public_key = key_pair.public_key_bytes().to_vec();
        let signature = key_manager.identity_sign(&public_key);

        Self {
            key_id,
            public_key,
            signature,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Verify the signature with the owner's identity public key
    pub fn verify(&self, identity: &[u8]) -> CryptoResult<()> {
        verify_signature(identity, &self.public_key, &self.signature)
    }

    /// Check if this pre-key has expired (older than max_age_days)
    pub fn is_expired(&self, max_age_days: i64) -> bool {
        let now = chrono::Utc::now().timestamp();
        let age_seconds = now - self.created_at;
        let max_age_seconds = max_age_days * 24 * 60 * 60;
        age_seconds > max_age_seconds
    }

    /// Get the Curve25519 public key
    pub fn get_public_key(&self) -> CryptoResult<Curve25519PublicKey> {
        curve25519_public(&self.public_key)
    }
}

/// One-time pre-key (single use)
///
/// Consumed by exactly one initiator. The owner signs the public half when
/// handing a fresh batch to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePreKey {
    /// Identifier chosen by the owner
    pub key_id: u32,
    /// The Curve25519 public key
    pub public_key: Vec<u8>,
    /// Ed25519 signature of the public key
    #[serde(default)]
    pub signature: Vec<u8>,
}

impl OneTimePreKey {
    /// Create a signed one-time pre-key
    pub fn sign(key_id: u32, key_pair: &Curve25519KeyPair, key_manager: &dyn KeyManager) -> Self {
        let public_key = key_pair.public_key_bytes().to_vec();
        let signature = key_manager.identity_sign(&public_key);
        Self {
            key_id,
            public_key,
            signature,
        }
    }

    /// Get the Curve25519 public key
    pub fn get_public_key(&self) -> CryptoResult<Curve25519PublicKey> {
        curve25519_public(&self.public_key)
    }
}
