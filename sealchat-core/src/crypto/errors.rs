//! Cryptographic error types
//!
//! Failures raised by the key agreement, the ratchet and the AEAD helpers.

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Failed to parse or decode a key
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    /// Failed to derive a shared secret
    #[error("Key exchange failed: {0}")]
    KeyExchangeFailed(String),

    /// Handshake proof did not open under the derived secret
    #[error("X3DH error: {0}")]
    X3dhError(String),

    /// Double Ratchet protocol error
    #[error("Ratchet error: {0}")]
    RatchetError(String),

    /// Signature verification failed
    #[error("Signature verification failed: {0}")]
    SignatureError(String),

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionError(String),

    /// Decryption failed
    #[error("Decryption failed: {0}")]
    DecryptionError(String),

    /// Ratchet state could not be encoded or decoded
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<vodozemac::KeyError> for CryptoError {
    fn from(e: vodozemac::KeyError) -> Self {
        CryptoError::InvalidKey(e.to_string())
    }
}

impl From<vodozemac::SignatureError> for CryptoError {
    fn from(e: vodozemac::SignatureError) -> Self {
        CryptoError::SignatureError(e.to_string())
    }
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
