//! Authenticated request/response channel to the private chat backend
//!
//! ## Flow
//!
//! - `send` registers a correlation entry and queues the request on a bounded
//!   queue (a full queue makes `send` wait)
//! - the send loop only drains the queue once the connection is
//!   authenticated, transmitting every request on its own task
//! - the receive loop dispatches each inbound frame: requests go through the
//!   handler chain, responses are matched to their entry by request id
//!
//! Every `send` resolves exactly once: with the response, the backend's error
//! or a transport error.

mod handler;
mod key_store;
mod protocol;
mod transport;
mod websocket;

pub use handler::{sanitize, AuthHandler, HandlerError, RequestHandler, AUTH_CONTEXT};
pub use key_store::RemoteKeyStore;
pub use protocol::{
    AuthProof, BackendMessage, ChatMessage, DoubleRatchetMessage, KeyEntry, KeyIndex, PublishedKeys, Request,
    Response,
};
pub use transport::{ChannelTransport, RemoteEnd, Transport};
pub use websocket::WsTransport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Notify};

use crate::config::CoreConfig;
use crate::crypto::{KeyManager, PreKeyBundle, SignedPreKey};
use crate::error::{CoreError, CoreResult};

type Outcome = CoreResult<Response>;

/// Request waiting for the send loop
struct Outgoing {
    request_id: String,
    request: Request,
}

/// Guarded by one lock: who is waiting and whether we may send
#[derive(Default)]
struct Correlation {
    pending: HashMap<String, oneshot::Sender<Outcome>>,
    authenticated: bool,
}

struct Inner {
    transport: Arc<dyn Transport>,
    correlation: Mutex<Correlation>,
    handlers: RwLock<Vec<Arc<dyn RequestHandler>>>,
    queue: mpsc::Sender<Outgoing>,
    closer: watch::Sender<bool>,
    authenticated: Notify,
    closed: AtomicBool,
    auth_poll_interval: Duration,
    request_timeout: Duration,
}

/// Handle to the backend channel; clones share one connection
#[derive(Clone)]
pub struct Backend {
    inner: Arc<Inner>,
}

/// Receiving side of a sent request
pub struct PendingResponse {
    request_id: String,
    receiver: oneshot::Receiver<Outcome>,
    inner: Arc<Inner>,
}

impl PendingResponse {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the outcome with no deadline
    pub async fn wait(self) -> Outcome {
        self.receiver
            .await
            .map_err(|_| CoreError::Transport("backend closed before responding".to_string()))?
    }

    /// Wait at most `timeout`; on expiry the correlation entry is dropped
    pub async fn wait_timeout(self, timeout: Duration) -> Outcome {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(outcome) => {
                outcome.map_err(|_| CoreError::Transport("backend closed before responding".to_string()))?
            }
            Err(_) => {
                self.inner.cut(&self.request_id);
                tracing::warn!("Request {} timed out after {:?}", self.request_id, timeout);
                Err(CoreError::Transport(format!(
                    "request {} timed out after {:?}",
                    self.request_id, timeout
                )))
            }
        }
    }
}

impl Backend {
    /// Start the send and receive loops; the auth handler is registered first
    pub fn new(
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<BackendMessage>,
        key_manager: Arc<dyn KeyManager>,
        config: &CoreConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.outgoing_queue_capacity.max(1));
        let (closer, closer_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            transport,
            correlation: Mutex::new(Correlation::default()),
            handlers: RwLock::new(Vec::new()),
            queue: queue_tx,
            closer,
            authenticated: Notify::new(),
            closed: AtomicBool::new(false),
            auth_poll_interval: config.auth_poll_interval(),
            request_timeout: config.request_timeout(),
        });

        let backend = Self { inner };
        backend.add_request_handler(Arc::new(AuthHandler::new(key_manager)));

        tokio::spawn(send_loop(backend.inner.clone(), queue_rx, closer_rx));
        tokio::spawn(receive_loop(backend.inner.clone(), inbound));

        backend
    }

    /// Append a handler to the chain
    pub fn add_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        match self.inner.handlers.write() {
            Ok(mut handlers) => handlers.push(handler),
            Err(poisoned) => poisoned.into_inner().push(handler),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.lock().authenticated
    }

    /// Number of requests still waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Default deadline used by the typed helpers
    pub fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    /// Queue a request; the returned handle resolves exactly once
    pub async fn send(&self, request: Request) -> CoreResult<PendingResponse> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            // Checked under the lock so shutdown either sees this entry or we see it closed
            let mut correlation = self.inner.lock();
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(CoreError::Transport("backend is closed".to_string()));
            }
            correlation.pending.insert(request_id.clone(), tx);
        }

        let outgoing = Outgoing {
            request_id: request_id.clone(),
            request,
        };
        if self.inner.queue.send(outgoing).await.is_err() {
            self.inner.cut(&request_id);
            return Err(CoreError::Transport("send loop stopped".to_string()));
        }

        Ok(PendingResponse {
            request_id,
            receiver: rx,
            inner: self.inner.clone(),
        })
    }

    /// Send and wait at most `timeout` for the outcome
    pub async fn request(&self, request: Request, timeout: Duration) -> Outcome {
        self.send(request).await?.wait_timeout(timeout).await
    }

    /// Handle one inbound frame
    pub async fn dispatch(&self, message: BackendMessage) -> CoreResult<()> {
        self.inner.dispatch(message).await
    }

    /// Stop the send loop, close the connection and fail every waiting request
    pub async fn close(&self) -> CoreResult<()> {
        if !self.inner.shutdown("backend closed") {
            return Ok(());
        }
        self.inner.transport.close().await
    }

    // ========================================================================
    // Typed requests
    // ========================================================================

    pub async fn fetch_pre_key_bundle(&self, identity_key: &[u8]) -> CoreResult<PreKeyBundle> {
        match self
            .request(Request::PreKeyBundle(identity_key.to_vec()), self.inner.request_timeout)
            .await?
        {
            Response::PreKeyBundle(bundle) => Ok(*bundle),
            other => Err(unexpected("preKeyBundle", &other)),
        }
    }

    pub async fn fetch_signed_pre_key(&self, identity_key: &[u8]) -> CoreResult<SignedPreKey> {
        match self
            .request(Request::SignedPreKey(identity_key.to_vec()), self.inner.request_timeout)
            .await?
        {
            Response::SignedPreKey(key) => Ok(key),
            other => Err(unexpected("signedPreKey", &other)),
        }
    }

    pub async fn submit_message(&self, message: ChatMessage) -> CoreResult<()> {
        match self
            .request(Request::SubmitMessage(Box::new(message)), self.inner.request_timeout)
            .await?
        {
            Response::Ack => Ok(()),
            other => Err(unexpected("ack", &other)),
        }
    }

    pub async fn publish_signed_pre_key(&self, keys: PublishedKeys) -> CoreResult<()> {
        match self
            .request(Request::PublishSignedPreKey(keys), self.inner.request_timeout)
            .await?
        {
            Response::Ack => Ok(()),
            other => Err(unexpected("ack", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &Response) -> CoreError {
    CoreError::Transport(format!("expected a {} response, got {}", expected, got.kind()))
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Correlation> {
        match self.correlation.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Remove and return the waiting entry for `request_id`
    fn cut(&self, request_id: &str) -> Option<oneshot::Sender<Outcome>> {
        self.lock().pending.remove(request_id)
    }

    fn handlers(&self) -> Vec<Arc<dyn RequestHandler>> {
        match self.handlers.read() {
            Ok(handlers) => handlers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Returns false if already shut down
    fn shutdown(&self, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.closer.send(true);

        let pending = {
            let mut correlation = self.lock();
            correlation.authenticated = false;
            std::mem::take(&mut correlation.pending)
        };
        if !pending.is_empty() {
            tracing::info!("Failing {} pending requests: {}", pending.len(), reason);
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(CoreError::Transport(reason.to_string())));
        }
        true
    }

    async fn transmit(&self, outgoing: Outgoing) {
        let message = BackendMessage::request(outgoing.request_id.clone(), outgoing.request);
        if let Err(e) = self.transport.send(&message).await {
            tracing::error!("Failed to send request {}: {}", outgoing.request_id, e);
            if let Some(tx) = self.cut(&outgoing.request_id) {
                let _ = tx.send(Err(e));
            }
        }
    }

    async fn dispatch(&self, message: BackendMessage) -> CoreResult<()> {
        let BackendMessage {
            request_id,
            request,
            response,
            error,
        } = message;

        match (request, response) {
            (Some(_), Some(_)) => Err(CoreError::Transport(format!(
                "message {} carries both a request and a response",
                request_id
            ))),
            (Some(request), None) => self.handle_request(request_id, request).await,
            (None, response) => {
                let tx = self
                    .cut(&request_id)
                    .ok_or_else(|| CoreError::Transport(format!("no pending request with id {}", request_id)))?;

                let outcome = match (error, response) {
                    (Some(error), _) if !error.is_empty() => Err(CoreError::Remote(error)),
                    (_, Some(response)) => Ok(response),
                    (_, None) => Err(CoreError::Transport(format!(
                        "response {} carries no payload",
                        request_id
                    ))),
                };
                let _ = tx.send(outcome);
                Ok(())
            }
        }
    }

    async fn handle_request(&self, request_id: String, request: Request) -> CoreResult<()> {
        for handler in self.handlers() {
            if !handler.accepts(&request) {
                continue;
            }

            return match handler.handle(&request).await {
                Ok(response) => {
                    let is_auth = matches!(response, Response::Auth(_));
                    self.transport
                        .send(&BackendMessage::response(request_id, response))
                        .await?;
                    if is_auth {
                        self.lock().authenticated = true;
                        self.authenticated.notify_waiters();
                        tracing::info!("Backend connection authenticated");
                    }
                    Ok(())
                }
                Err(err) => {
                    tracing::error!("Handler failed for request {}: {}", request_id, err);
                    self.transport
                        .send(&BackendMessage::error(request_id, err.sanitized()))
                        .await
                }
            };
        }

        tracing::warn!("No handler accepted request {}", request_id);
        Ok(())
    }
}

async fn send_loop(inner: Arc<Inner>, mut queue: mpsc::Receiver<Outgoing>, mut closer: watch::Receiver<bool>) {
    loop {
        if *closer.borrow() {
            return;
        }

        if !inner.lock().authenticated {
            tokio::select! {
                _ = closer.changed() => return,
                _ = inner.authenticated.notified() => {}
                _ = tokio::time::sleep(inner.auth_poll_interval) => {}
            }
            continue;
        }

        tokio::select! {
            _ = closer.changed() => return,
            next = queue.recv() => match next {
                Some(outgoing) => {
                    let inner = inner.clone();
                    tokio::spawn(async move { inner.transmit(outgoing).await });
                }
                None => return,
            },
        }
    }
}

async fn receive_loop(inner: Arc<Inner>, mut inbound: mpsc::Receiver<BackendMessage>) {
    while let Some(message) = inbound.recv().await {
        let inner = inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.dispatch(message).await {
                tracing::warn!("Dropped inbound message: {}", e);
            }
        });
    }

    if inner.shutdown("connection closed") {
        tracing::info!("Backend connection closed by remote");
    }
}
