//! Websocket transport
//!
//! JSON text frames over tokio-tungstenite. The bearer token, when set, is
//! sent in the `Authorization` header of the upgrade request.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::backend::protocol::BackendMessage;
use crate::backend::transport::Transport;
use crate::error::{CoreError, CoreResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const INBOUND_BUFFER: usize = 64;

pub struct WsTransport {
    sink: Mutex<SplitSink<WsStream, Message>>,
    reader: JoinHandle<()>,
}

impl WsTransport {
    /// Connect and start forwarding inbound frames
    pub async fn connect(
        endpoint: &str,
        bearer_token: Option<&str>,
    ) -> CoreResult<(Self, mpsc::Receiver<BackendMessage>)> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| CoreError::Validation(format!("invalid backend endpoint: {}", e)))?;

        if let Some(token) = bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| CoreError::Validation("bearer token is not a valid header value".to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| CoreError::Transport(format!("websocket connection failed: {}", e)))?;
        tracing::info!("Connected to private chat backend");

        let (sink, stream) = stream.split();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let reader = tokio::spawn(read_frames(stream, inbound_tx));

        Ok((
            Self {
                sink: Mutex::new(sink),
                reader,
            },
            inbound_rx,
        ))
    }
}

async fn read_frames(mut stream: SplitStream<WsStream>, inbound: mpsc::Sender<BackendMessage>) {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("Websocket read failed: {}", e);
                break;
            }
        };

        match BackendMessage::from_json(&text) {
            Ok(message) => {
                if inbound.send(message).await.is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!("Dropping frame: {}", e),
        }
    }
    tracing::info!("Websocket reader stopped");
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, message: &BackendMessage) -> CoreResult<()> {
        let json = message.to_json()?;
        self.sink
            .lock()
            .await
            .send(Message::Text(json))
            .await
            .map_err(|e| CoreError::Transport(format!("websocket send failed: {}", e)))
    }

    async fn close(&self) -> CoreResult<()> {
        let result = self.sink.lock().await.close().await;
        self.reader.abort();
        result.map_err(|e| CoreError::Transport(format!("websocket close failed: {}", e)))
    }
}
