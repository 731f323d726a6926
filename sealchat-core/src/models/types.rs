//! Shared data types for persistence and host notifications

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::x3dh::X3dhResult;
use crate::error::{CoreError, CoreResult};

/// Current stored message version
pub const MESSAGE_VERSION: u32 = 1;

/// Current typed extension payload version
pub const DAPP_MESSAGE_VERSION: u32 = 1;

/// Required length of a shared secret base id
pub const BASE_ID_LEN: usize = 32;

// ============================================================================
// Message Types
// ============================================================================

/// Delivery status of a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Status {
    Sent,
    FailedToSend,
    Delivered,
    FailedToHandle,
    Persisted,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Sent => 100,
            Status::FailedToSend => 200,
            Status::Delivered => 300,
            Status::FailedToHandle => 400,
            Status::Persisted => 500,
        }
    }

    /// Whether a stored message may move from `self` to `next`
    ///
    /// Statuses only move forward; rewriting the current status is a no-op.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (Persisted, Sent | FailedToSend | Delivered | FailedToHandle)
                | (FailedToSend, Sent)
                | (Sent, Delivered)
        ) || self == next
    }
}

impl TryFrom<u16> for Status {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            100 => Ok(Status::Sent),
            200 => Ok(Status::FailedToSend),
            300 => Ok(Status::Delivered),
            400 => Ok(Status::FailedToHandle),
            500 => Ok(Status::Persisted),
            other => Err(format!("unregistered message status {}", other)),
        }
    }
}

impl From<Status> for u16 {
    fn from(status: Status) -> u16 {
        status.code()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Sent => "sent",
            Status::FailedToSend => "failed_to_send",
            Status::Delivered => "delivered",
            Status::FailedToHandle => "failed_to_handle",
            Status::Persisted => "persisted",
        };
        f.write_str(name)
    }
}

/// Typed extension payload addressed to a DApp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DAppMessage {
    pub dapp_public_key: Vec<u8>,
    pub message_type: String,
    #[serde(default)]
    pub payload: Vec<u8>,
    pub version: u32,
}

/// A message as kept in the local store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub version: u32,
    pub status: Status,
    pub received: bool,
    /// Plaintext body
    #[serde(default)]
    pub message: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dapp_message: Option<DAppMessage>,
    /// Unix nanoseconds
    pub created_at: i64,
    #[serde(default)]
    pub sender: Vec<u8>,
    /// Assigned by the store on write
    #[serde(default)]
    pub database_id: u64,
    /// Undecodable wire message kept for diagnostics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

impl StoredMessage {
    /// Structural checks run before every write
    pub fn validate(&self) -> CoreResult<()> {
        if self.id.is_empty() {
            return Err(CoreError::Validation("message id is empty".to_string()));
        }
        if self.version < 1 {
            return Err(CoreError::Validation(format!(
                "message version {} is invalid",
                self.version
            )));
        }
        if self.message.is_empty() && self.dapp_message.is_none() && self.raw.is_none() {
            return Err(CoreError::Validation("message has no payload".to_string()));
        }
        if let Some(dapp) = &self.dapp_message {
            if dapp.dapp_public_key.len() != 32 {
                return Err(CoreError::Validation(
                    "dapp public key must be 32 bytes".to_string(),
                ));
            }
            if dapp.version < 1 {
                return Err(CoreError::Validation("dapp message version is invalid".to_string()));
            }
        }
        // second-resolution timestamps fit in an i32
        if self.created_at <= i64::from(i32::MAX) {
            return Err(CoreError::Validation(
                "created_at must be a unix nanosecond timestamp".to_string(),
            ));
        }
        if self.dapp_message.is_none() && self.sender.len() != 32 {
            return Err(CoreError::Validation("sender must be 32 bytes".to_string()));
        }
        Ok(())
    }
}

/// Plaintext carried inside a ratchet ciphertext
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatchetPayload {
    pub id: String,
    pub created_at: i64,
    #[serde(default)]
    pub message: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dapp_message: Option<DAppMessage>,
}

/// Notification delivered to commit listeners
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub partner: [u8; 32],
    pub message: StoredMessage,
}

// ============================================================================
// Session Types
// ============================================================================

/// X3DH secret negotiated with a partner
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret {
    pub id: String,
    /// Random 32 byte id naming the negotiation
    pub base_id: Vec<u8>,
    pub secret: [u8; 32],
    pub accepted: bool,
    /// Unix nanoseconds
    pub created_at: i64,
    pub used_one_time_pre_key: Option<Vec<u8>>,
    pub used_signed_pre_key: Vec<u8>,
    pub ephemeral_key: Vec<u8>,
    pub ephemeral_key_signature: Vec<u8>,
    pub negotiation_params_id: String,
}

impl SharedSecret {
    /// Unaccepted secret for a session we initiated
    pub fn from_x3dh(result: &X3dhResult, base_id: [u8; BASE_ID_LEN]) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            base_id: base_id.to_vec(),
            secret: result.shared_secret,
            accepted: false,
            created_at: now_nanos(),
            used_one_time_pre_key: result.used_one_time_pre_key.clone(),
            used_signed_pre_key: result.used_signed_pre_key.clone(),
            ephemeral_key: result.ephemeral_public.clone(),
            ephemeral_key_signature: result.ephemeral_signature.clone(),
            negotiation_params_id: result.negotiation_id.clone(),
        }
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecret")
            .field("id", &self.id)
            .field("base_id", &hex::encode(&self.base_id))
            .field("accepted", &self.accepted)
            .field("created_at", &self.created_at)
            .field("negotiation_params_id", &self.negotiation_params_id)
            .finish_non_exhaustive()
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.secret);
    }
}

/// Current time in unix nanoseconds
pub fn now_nanos() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| chrono::Utc::now().timestamp_micros().saturating_mul(1000))
}
