//! Inbound request handlers
//!
//! Handlers form an ordered chain. The first handler whose `accepts` returns
//! true handles the request and the chain stops there.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::backend::protocol::{AuthProof, Request, Response};
use crate::crypto::KeyManager;
use crate::error::CoreError;

/// Prefix of every signed auth challenge
pub const AUTH_CONTEXT: &[u8] = b"SealChat-auth-v1";

const GENERIC_FAILURE: &str = "request could not be handled";

#[derive(Error, Debug)]
pub enum HandlerError {
    /// Safe to send to the backend as is
    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Internal(CoreError),
}

impl HandlerError {
    /// Text sent back to the backend
    pub fn sanitized(&self) -> String {
        match self {
            HandlerError::Rejected(message) => message.clone(),
            HandlerError::Internal(err) => sanitize(err),
        }
    }
}

impl From<CoreError> for HandlerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(message) => HandlerError::Rejected(message),
            other => HandlerError::Internal(other),
        }
    }
}

/// Strip internal detail from an error before it leaves the process
pub fn sanitize(err: &CoreError) -> String {
    match err {
        CoreError::Validation(message) => message.clone(),
        _ => GENERIC_FAILURE.to_string(),
    }
}

#[async_trait]
pub trait RequestHandler: Send + Sync {
    fn accepts(&self, request: &Request) -> bool;

    async fn handle(&self, request: &Request) -> Result<Response, HandlerError>;
}

/// Answers the backend's auth challenge with an identity signature
pub struct AuthHandler {
    key_manager: Arc<dyn KeyManager>,
}

impl AuthHandler {
    pub fn new(key_manager: Arc<dyn KeyManager>) -> Self {
        Self { key_manager }
    }
}

#[async_trait]
impl RequestHandler for AuthHandler {
    fn accepts(&self, request: &Request) -> bool {
        matches!(request, Request::Auth(_))
    }

    async fn handle(&self, request: &Request) -> Result<Response, HandlerError> {
        let Request::Auth(challenge) = request else {
            return Err(HandlerError::Rejected("not an auth request".to_string()));
        };
        if challenge.is_empty() {
            return Err(HandlerError::Rejected("empty auth challenge".to_string()));
        }

        let mut signed = AUTH_CONTEXT.to_vec();
        signed.extend_from_slice(challenge);

        Ok(Response::Auth(AuthProof {
            identity_key: self.key_manager.identity_public_key().to_vec(),
            signature: self.key_manager.identity_sign(&signed),
        }))
    }
}
