//! Storage capability for skipped Double Ratchet message keys
//!
//! Keys are indexed by the sending chain's ratchet public key and the
//! message number within that chain.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::CoreResult;

/// Ratchet public key naming a sending chain
pub type SessionKey = [u8; 32];

pub type MessageKey = [u8; 32];

#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get(&self, session_key: &SessionKey, msg_num: u32) -> CoreResult<Option<MessageKey>>;

    async fn put(&self, session_key: &SessionKey, msg_num: u32, message_key: &MessageKey) -> CoreResult<()>;

    async fn delete_message_key(&self, session_key: &SessionKey, msg_num: u32) -> CoreResult<()>;

    async fn delete_session_keys(&self, session_key: &SessionKey) -> CoreResult<()>;

    /// Number of keys stored for a chain
    async fn count(&self, session_key: &SessionKey) -> CoreResult<u64>;

    /// Every stored key; stores that refuse bulk dumps return an empty map
    async fn all(&self) -> CoreResult<HashMap<SessionKey, HashMap<u32, MessageKey>>>;
}
