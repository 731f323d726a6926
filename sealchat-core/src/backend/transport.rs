//! Message-oriented connection to the private chat backend

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::backend::protocol::BackendMessage;
use crate::error::{CoreError, CoreResult};

/// Outbound half of a backend connection
///
/// Inbound frames are delivered on the `mpsc::Receiver` handed out by the
/// transport's constructor.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &BackendMessage) -> CoreResult<()>;

    async fn close(&self) -> CoreResult<()>;
}

/// In-process transport; the other end is a [`RemoteEnd`]
pub struct ChannelTransport {
    outbound: Mutex<Option<mpsc::Sender<BackendMessage>>>,
}

/// The backend's side of a [`ChannelTransport`]
pub struct RemoteEnd {
    to_client: mpsc::Sender<BackendMessage>,
    from_client: mpsc::Receiver<BackendMessage>,
}

impl ChannelTransport {
    /// Connected transport, its inbound stream and the remote end
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<BackendMessage>, RemoteEnd) {
        let (to_remote, from_client) = mpsc::channel(capacity);
        let (to_client, inbound) = mpsc::channel(capacity);

        let transport = Self {
            outbound: Mutex::new(Some(to_remote)),
        };
        (transport, inbound, RemoteEnd { to_client, from_client })
    }

    fn sender(&self) -> Option<mpsc::Sender<BackendMessage>> {
        match self.outbound.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: &BackendMessage) -> CoreResult<()> {
        let sender = self
            .sender()
            .ok_or_else(|| CoreError::Transport("connection closed".to_string()))?;
        sender
            .send(message.clone())
            .await
            .map_err(|_| CoreError::Transport("remote end went away".to_string()))
    }

    async fn close(&self) -> CoreResult<()> {
        match self.outbound.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        Ok(())
    }
}

impl RemoteEnd {
    pub async fn send(&self, message: BackendMessage) -> CoreResult<()> {
        self.to_client
            .send(message)
            .await
            .map_err(|_| CoreError::Transport("client went away".to_string()))
    }

    /// Next frame written by the client, `None` once it closed
    pub async fn recv(&mut self) -> Option<BackendMessage> {
        self.from_client.recv().await
    }

    /// Frame already written by the client, if any
    pub fn try_recv(&mut self) -> Option<BackendMessage> {
        self.from_client.try_recv().ok()
    }

    /// Handle for writing to the client from other tasks
    pub fn sender(&self) -> mpsc::Sender<BackendMessage> {
        self.to_client.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::protocol::{Request, Response};

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (transport, mut inbound, mut remote) = ChannelTransport::pair(4);

        transport
            .send(&BackendMessage::request("a".to_string(), Request::NewOneTimePreKeys(1)))
            .await
            .unwrap();
        assert_eq!(remote.recv().await.unwrap().request_id, "a");

        remote
            .send(BackendMessage::response("b".to_string(), Response::Ack))
            .await
            .unwrap();
        assert_eq!(inbound.recv().await.unwrap().request_id, "b");
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (transport, _inbound, mut remote) = ChannelTransport::pair(4);
        transport.close().await.unwrap();

        let err = transport
            .send(&BackendMessage::response("a".to_string(), Response::Ack))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);
        assert!(remote.recv().await.is_none());
    }
}
