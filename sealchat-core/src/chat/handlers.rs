//! Backend request handlers owned by the session coordinator

use std::sync::Weak;

use async_trait::async_trait;

use crate::backend::{HandlerError, Request, RequestHandler, Response};
use crate::chat::coordinator::SessionCoordinator;
use crate::error::CoreError;

fn coordinator_gone() -> HandlerError {
    HandlerError::Internal(CoreError::Transport("session coordinator was shut down".to_string()))
}

/// Inbound message batches
///
/// The batch is acknowledged once every message was handled, whether or not
/// it could be decrypted.
pub struct MessagesHandler {
    coordinator: Weak<SessionCoordinator>,
}

impl MessagesHandler {
    pub fn new(coordinator: Weak<SessionCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl RequestHandler for MessagesHandler {
    fn accepts(&self, request: &Request) -> bool {
        matches!(request, Request::Messages(_))
    }

    async fn handle(&self, request: &Request) -> Result<Response, HandlerError> {
        let Request::Messages(batch) = request else {
            return Err(HandlerError::Rejected("not a message batch".to_string()));
        };
        let coordinator = self.coordinator.upgrade().ok_or_else(coordinator_gone)?;

        let total = batch.len();
        let results = coordinator.handle_batch(batch.clone()).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            tracing::warn!("{} of {} messages in batch could not be handled", failed, total);
        } else {
            tracing::debug!("Handled batch of {} messages", total);
        }

        Ok(Response::Ack)
    }
}

/// Backend requests for fresh one-time pre-keys
pub struct OneTimePreKeysHandler {
    coordinator: Weak<SessionCoordinator>,
}

impl OneTimePreKeysHandler {
    pub fn new(coordinator: Weak<SessionCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl RequestHandler for OneTimePreKeysHandler {
    fn accepts(&self, request: &Request) -> bool {
        matches!(request, Request::NewOneTimePreKeys(_))
    }

    async fn handle(&self, request: &Request) -> Result<Response, HandlerError> {
        let Request::NewOneTimePreKeys(count) = request else {
            return Err(HandlerError::Rejected("not a one-time pre-key request".to_string()));
        };
        let coordinator = self.coordinator.upgrade().ok_or_else(coordinator_gone)?;

        let keys = coordinator.replenish_one_time_pre_keys(*count).await?;
        tracing::info!("Handed {} one-time pre-keys to the backend", keys.len());
        Ok(Response::OneTimePreKeys(keys))
    }
}
