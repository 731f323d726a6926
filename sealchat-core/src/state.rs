//! Host handle
//!
//! A [`ChatCore`] owns the database, the backend connection and the session
//! coordinator. Hosts create one per account and close it when done; there
//! is no process-wide instance.

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::mpsc;

use crate::backend::{Backend, BackendMessage, RemoteKeyStore, Transport, WsTransport};
use crate::chat::SessionCoordinator;
use crate::config::{CoreConfig, KeyStoreMode};
use crate::crypto::{KeyManager, KeyStore, SignedPreKey};
use crate::db::{open_pool, LocalKeyStore, MessageListener, MessageStore};
use crate::error::{CoreError, CoreResult};
use crate::models::{DAppMessage, StoredMessage};

pub struct ChatCore {
    config: CoreConfig,
    db: SqlitePool,
    backend: Backend,
    coordinator: Arc<SessionCoordinator>,
}

impl ChatCore {
    /// Open storage and start talking to the backend over `transport`
    pub async fn start(
        config: CoreConfig,
        key_manager: Arc<dyn KeyManager>,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<BackendMessage>,
    ) -> CoreResult<Self> {
        config.validate()?;
        crate::init_logging(config.log_filter());

        let db = open_pool(&config.database_path).await?;
        let backend = Backend::new(transport, inbound, key_manager.clone(), &config);

        let key_store: Arc<dyn KeyStore> = match config.key_store {
            KeyStoreMode::Local => Arc::new(LocalKeyStore::new(db.clone(), key_manager.clone())),
            KeyStoreMode::Remote => Arc::new(RemoteKeyStore::new(
                backend.clone(),
                key_manager.clone(),
                config.key_store_timeout(),
            )),
        };

        let messages = MessageStore::new(db.clone(), key_manager.clone());
        let identity = key_manager.identity_public_key_hex();
        let coordinator = SessionCoordinator::start(
            db.clone(),
            key_manager,
            backend.clone(),
            key_store,
            messages,
            &config,
        );

        tracing::info!(
            "Chat core started for {} ({:?} key store)",
            &identity[..8],
            config.key_store
        );

        Ok(Self {
            config,
            db,
            backend,
            coordinator,
        })
    }

    /// Connect to the configured websocket endpoint and start
    pub async fn connect(config: CoreConfig, key_manager: Arc<dyn KeyManager>) -> CoreResult<Self> {
        let endpoint = config
            .private_chat_endpoint
            .clone()
            .ok_or_else(|| CoreError::Validation("no private chat endpoint configured".to_string()))?;

        let (transport, inbound) =
            WsTransport::connect(&endpoint, config.private_chat_bearer_token.as_deref()).await?;
        Self::start(config, key_manager, Arc::new(transport), inbound).await
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    pub fn is_authenticated(&self) -> bool {
        self.backend.is_authenticated()
    }

    pub async fn send_message(&self, recipient: &[u8; 32], message: Vec<u8>) -> CoreResult<StoredMessage> {
        self.coordinator.send_message(recipient, message).await
    }

    pub async fn send_dapp_message(&self, recipient: &[u8; 32], dapp_message: DAppMessage) -> CoreResult<StoredMessage> {
        self.coordinator.send_dapp_message(recipient, dapp_message).await
    }

    /// Page of history with `partner`, oldest first
    pub async fn messages(&self, partner: &[u8; 32], start: u64, amount: u32) -> CoreResult<Vec<StoredMessage>> {
        self.coordinator.messages().messages(partner, start, amount).await
    }

    pub async fn all_chats(&self) -> CoreResult<Vec<[u8; 32]>> {
        self.coordinator.messages().all_chats().await
    }

    pub fn add_listener(&self, listener: MessageListener) {
        self.coordinator.messages().add_listener(listener);
    }

    pub async fn publish_signed_pre_key(&self) -> CoreResult<SignedPreKey> {
        self.coordinator.publish_signed_pre_key().await
    }

    pub async fn rotate_signed_pre_key(&self) -> CoreResult<SignedPreKey> {
        self.coordinator.rotate_signed_pre_key().await
    }

    /// Close the connection, failing requests still in flight, then the database
    pub async fn close(self) -> CoreResult<()> {
        let result = self.backend.close().await;
        self.db.close().await;
        tracing::info!("Chat core closed");
        result
    }
}

/// Parse a hex encoded identity key
pub fn parse_identity(hex_key: &str) -> CoreResult<[u8; 32]> {
    let bytes = hex::decode(hex_key)
        .map_err(|e| CoreError::Validation(format!("identity key is not hex: {}", e)))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CoreError::Validation(format!("identity key must be 32 bytes, got {}", bytes.len())))
}
