//! Cryptography for private chats
//!
//! ## Components
//!
//! - **keys**: identity, chat identity and pre-key pairs, pre-key signatures
//! - **key_manager**: the device's long-term keys and its storage key
//! - **x3dh**: handshake that establishes a shared secret with a partner
//! - **ratchet**: Double Ratchet over a shared secret
//! - **key_store**: where skipped ratchet message keys live
//! - **aead**: AES-256-GCM helpers shared by the above

pub mod aead;
pub mod errors;
pub mod key_manager;
pub mod key_store;
pub mod keys;
pub mod ratchet;
pub mod x3dh;

// Re-export commonly used types
pub use errors::{CryptoError, CryptoResult};
pub use key_manager::{KeyManager, LocalKeyManager};
pub use key_store::{KeyStore, MessageKey, SessionKey};
pub use keys::{Curve25519KeyPair, IdentityKeyPair, OneTimePreKey, SignedPreKey};
pub use ratchet::{MessageHeader, RatchetSession, RatchetState};
pub use x3dh::{accept_session, initiate_session, Handshake, LocalPreKeyBundle, PreKeyBundle, X3dhResult};
