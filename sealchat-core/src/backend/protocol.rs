//! Private chat backend wire format
//!
//! Every frame is a JSON [`BackendMessage`]. Requests and responses are
//! adjacently tagged enums (`{"type": ..., "payload": ...}`).

use serde::{Deserialize, Serialize};

use crate::crypto::{Handshake, MessageHeader, OneTimePreKey, PreKeyBundle, SignedPreKey};
use crate::error::{CoreError, CoreResult};

/// Envelope carrying exactly one of a request or a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendMessage {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Request>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackendMessage {
    pub fn request(request_id: String, request: Request) -> Self {
        Self {
            request_id,
            request: Some(request),
            response: None,
            error: None,
        }
    }

    pub fn response(request_id: String, response: Response) -> Self {
        Self {
            request_id,
            request: None,
            response: Some(response),
            error: None,
        }
    }

    pub fn error(request_id: String, error: String) -> Self {
        Self {
            request_id,
            request: None,
            response: None,
            error: Some(error),
        }
    }

    pub fn to_json(&self) -> CoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::Transport(format!("malformed backend message: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Request {
    /// Challenge the client signs to authenticate the connection
    Auth(Vec<u8>),
    /// Batch of inbound chat messages
    Messages(Vec<ChatMessage>),
    /// Backend asks for this many fresh one-time pre-keys
    NewOneTimePreKeys(u32),
    /// Fetch a partner's pre-key bundle by identity key
    PreKeyBundle(Vec<u8>),
    /// Fetch a partner's current signed pre-key by identity key
    SignedPreKey(Vec<u8>),
    SubmitMessage(Box<ChatMessage>),
    PublishSignedPreKey(PublishedKeys),
    KeyStoreGet(KeyIndex),
    KeyStorePut(KeyEntry),
    KeyStoreDeleteMessageKey(KeyIndex),
    /// Hex encoded session key
    KeyStoreDeleteSessionKeys(String),
    /// Hex encoded session key
    KeyStoreCount(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Response {
    Ack,
    Auth(AuthProof),
    OneTimePreKeys(Vec<OneTimePreKey>),
    PreKeyBundle(Box<PreKeyBundle>),
    SignedPreKey(SignedPreKey),
    /// Base64 of the sealed message key, if the store has one
    MessageKey(Option<String>),
    KeyCount(u64),
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Ack => "ack",
            Response::Auth(_) => "auth",
            Response::OneTimePreKeys(_) => "oneTimePreKeys",
            Response::PreKeyBundle(_) => "preKeyBundle",
            Response::SignedPreKey(_) => "signedPreKey",
            Response::MessageKey(_) => "messageKey",
            Response::KeyCount(_) => "keyCount",
        }
    }
}

/// Signed answer to an auth challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthProof {
    pub identity_key: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedKeys {
    pub signed_pre_key: SignedPreKey,
    pub chat_identity_key: Vec<u8>,
    pub chat_identity_key_signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyIndex {
    pub session_key: String,
    pub msg_num: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEntry {
    pub session_key: String,
    pub msg_num: u32,
    pub message_key: String,
}

/// Ratchet header plus ciphertext
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoubleRatchetMessage {
    pub ratchet_public_key: Vec<u8>,
    pub n: u32,
    pub pn: u32,
    pub ciphertext: Vec<u8>,
}

impl DoubleRatchetMessage {
    pub fn new(header: &MessageHeader, ciphertext: Vec<u8>) -> Self {
        Self {
            ratchet_public_key: header.ratchet_public_key.to_vec(),
            n: header.n,
            pn: header.pn,
            ciphertext,
        }
    }

    pub fn header(&self) -> CoreResult<MessageHeader> {
        let ratchet_public_key = self
            .ratchet_public_key
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::Validation("ratchet public key must be 32 bytes".to_string()))?;
        Ok(MessageHeader {
            ratchet_public_key,
            n: self.n,
            pn: self.pn,
        })
    }
}

/// A private chat message as the backend relays it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub message_id: String,
    /// Sender identity key
    pub sender: Vec<u8>,
    /// Receiver identity key
    pub receiver: Vec<u8>,
    pub double_ratchet_message: DoubleRatchetMessage,
    /// Present until the receiver has accepted the shared secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake: Option<Handshake>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_secret_base_id: Option<Vec<u8>>,
    /// Unix nanoseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_secret_creation_time: Option<i64>,
}
