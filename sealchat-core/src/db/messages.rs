//! Private chat message log
//!
//! Messages are grouped per 32 byte partner key and keyed by an 8 byte
//! big-endian nanosecond timestamp, which doubles as the message's database
//! id. Every row is sealed JSON; nothing is stored in clear.

use std::sync::{Arc, RwLock};

use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::crypto::KeyManager;
use crate::db::shared_secrets::short_hex;
use crate::error::{CoreError, CoreResult};
use crate::models::{
    now_nanos, DAppMessage, MessageEvent, RatchetPayload, Status, StoredMessage, MESSAGE_VERSION,
};

/// Attempts at finding a free timestamp key before a write gives up
pub const MAX_KEY_COLLISIONS: u32 = 1000;

/// Called after a message is committed
pub type MessageListener = Arc<dyn Fn(MessageEvent) + Send + Sync>;

#[derive(Clone)]
pub struct MessageStore {
    db: SqlitePool,
    key_manager: Arc<dyn KeyManager>,
    listeners: Arc<RwLock<Vec<MessageListener>>>,
    /// Serializes read-modify-write status updates
    update_lock: Arc<Mutex<()>>,
}

impl MessageStore {
    pub fn new(db: SqlitePool, key_manager: Arc<dyn KeyManager>) -> Self {
        Self {
            db,
            key_manager,
            listeners: Arc::new(RwLock::new(Vec::new())),
            update_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn add_listener(&self, listener: MessageListener) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Store a plaintext message we are about to send
    pub async fn persist_message_to_send(&self, partner: &[u8; 32], message: Vec<u8>) -> CoreResult<StoredMessage> {
        let stored = StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            version: MESSAGE_VERSION,
            status: Status::Persisted,
            received: false,
            message,
            dapp_message: None,
            created_at: now_nanos(),
            sender: self.key_manager.identity_public_key().to_vec(),
            database_id: 0,
            raw: None,
            error_reason: None,
        };
        self.write(partner, stored, now_nanos()).await
    }

    /// Store a message decrypted from `partner`
    pub async fn persist_received_message(&self, partner: &[u8; 32], payload: RatchetPayload) -> CoreResult<StoredMessage> {
        let stored = StoredMessage {
            id: payload.id,
            version: MESSAGE_VERSION,
            status: Status::Persisted,
            received: true,
            message: payload.message,
            dapp_message: payload.dapp_message,
            created_at: payload.created_at,
            sender: partner.to_vec(),
            database_id: 0,
            raw: None,
            error_reason: None,
        };
        self.write(partner, stored, now_nanos()).await
    }

    /// Store a typed extension payload
    pub async fn persist_dapp_message(
        &self,
        partner: &[u8; 32],
        dapp_message: DAppMessage,
        received: bool,
    ) -> CoreResult<StoredMessage> {
        let stored = StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            version: MESSAGE_VERSION,
            status: Status::Persisted,
            received,
            message: Vec::new(),
            dapp_message: Some(dapp_message),
            created_at: now_nanos(),
            sender: Vec::new(),
            database_id: 0,
            raw: None,
            error_reason: None,
        };
        self.write(partner, stored, now_nanos()).await
    }

    /// Keep an inbound message that could not be handled
    pub async fn persist_failed_message(
        &self,
        partner: &[u8; 32],
        message_id: &str,
        raw: Vec<u8>,
        reason: &str,
    ) -> CoreResult<StoredMessage> {
        let id = if message_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            message_id.to_string()
        };
        let stored = StoredMessage {
            id,
            version: MESSAGE_VERSION,
            status: Status::FailedToHandle,
            received: true,
            message: Vec::new(),
            dapp_message: None,
            created_at: now_nanos(),
            sender: partner.to_vec(),
            database_id: 0,
            raw: Some(raw),
            error_reason: Some(reason.to_string()),
        };
        self.write(partner, stored, now_nanos()).await
    }

    /// Validate, pick a free key at or after `timestamp` and insert
    async fn write(&self, partner: &[u8; 32], mut message: StoredMessage, timestamp: i64) -> CoreResult<StoredMessage> {
        message.validate()?;

        let mut key = u64::try_from(timestamp)
            .map_err(|_| CoreError::Validation("message timestamp is negative".to_string()))?;

        for _ in 0..MAX_KEY_COLLISIONS {
            message.database_id = key;
            let sealed = self.seal(&message)?;

            let result = sqlx::query(
                r#"
                INSERT INTO private_chat_messages (partner, message_key, payload)
                VALUES (?, ?, ?)
                ON CONFLICT(partner, message_key) DO NOTHING
                "#,
            )
            .bind(&partner[..])
            .bind(&key.to_be_bytes()[..])
            .bind(&sealed)
            .execute(&self.db)
            .await?;

            if result.rows_affected() == 1 {
                tracing::debug!(
                    "Persisted message {} for {} (status {})",
                    message.id,
                    short_hex(partner),
                    message.status
                );
                self.notify(partner, &message);
                return Ok(message);
            }
            key = key.checked_add(1).ok_or_else(|| {
                CoreError::Persistence("message key space exhausted".to_string())
            })?;
        }

        Err(CoreError::Persistence(format!(
            "no free message key after {} attempts",
            MAX_KEY_COLLISIONS
        )))
    }

    /// Move a message's status forward
    pub async fn update_status(&self, partner: &[u8; 32], database_id: u64, status: Status) -> CoreResult<StoredMessage> {
        let _guard = self.update_lock.lock().await;

        let mut message = self
            .get_message(partner, database_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("message {} for {}", database_id, short_hex(partner))))?;

        if !message.status.can_transition_to(status) {
            return Err(CoreError::Validation(format!(
                "message status cannot move from {} to {}",
                message.status, status
            )));
        }
        if message.status == status {
            return Ok(message);
        }
        message.status = status;
        let sealed = self.seal(&message)?;

        let mut tx = self.db.begin().await?;
        sqlx::query(r#"UPDATE private_chat_messages SET payload = ? WHERE partner = ? AND message_key = ?"#)
            .bind(&sealed)
            .bind(&partner[..])
            .bind(&database_id.to_be_bytes()[..])
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!("Message {} is now {}", message.id, status);
        self.notify(partner, &message);
        Ok(message)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Up to `amount` messages at or before `start` (0 = newest), oldest first
    ///
    /// `start` is an inclusive upper bound. A `start` that falls between two
    /// keys never pulls in the newer neighbour; cursor-style stores that seek
    /// to the first key >= `start` and walk back would include it.
    pub async fn messages(&self, partner: &[u8; 32], start: u64, amount: u32) -> CoreResult<Vec<StoredMessage>> {
        if amount < 1 {
            return Err(CoreError::Validation("amount must be at least 1".to_string()));
        }

        let rows = if start == 0 {
            sqlx::query(
                r#"
                SELECT payload FROM private_chat_messages
                WHERE partner = ?
                ORDER BY message_key DESC
                LIMIT ?
                "#,
            )
            .bind(&partner[..])
            .bind(i64::from(amount))
            .fetch_all(&self.db)
            .await?
        } else {
            sqlx::query(
                r#"
                SELECT payload FROM private_chat_messages
                WHERE partner = ? AND message_key <= ?
                ORDER BY message_key DESC
                LIMIT ?
                "#,
            )
            .bind(&partner[..])
            .bind(&start.to_be_bytes()[..])
            .bind(i64::from(amount))
            .fetch_all(&self.db)
            .await?
        };

        let mut messages = rows
            .iter()
            .map(|row| self.open(&row.get::<Vec<u8>, _>("payload")))
            .collect::<CoreResult<Vec<_>>>()?;
        messages.sort_by_key(|m| m.database_id);
        Ok(messages)
    }

    pub async fn get_message(&self, partner: &[u8; 32], database_id: u64) -> CoreResult<Option<StoredMessage>> {
        let row = sqlx::query(
            r#"SELECT payload FROM private_chat_messages WHERE partner = ? AND message_key = ?"#,
        )
        .bind(&partner[..])
        .bind(&database_id.to_be_bytes()[..])
        .fetch_optional(&self.db)
        .await?;

        row.map(|row| self.open(&row.get::<Vec<u8>, _>("payload")))
            .transpose()
    }

    /// Every partner we hold messages for
    pub async fn all_chats(&self) -> CoreResult<Vec<[u8; 32]>> {
        let partners: Vec<Vec<u8>> =
            sqlx::query_scalar(r#"SELECT DISTINCT partner FROM private_chat_messages ORDER BY partner"#)
                .fetch_all(&self.db)
                .await?;

        partners
            .into_iter()
            .map(|p| {
                p.as_slice()
                    .try_into()
                    .map_err(|_| CoreError::Persistence("stored partner key has the wrong length".to_string()))
            })
            .collect()
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn seal(&self, message: &StoredMessage) -> CoreResult<Vec<u8>> {
        let encoded = Zeroizing::new(serde_json::to_vec(message)?);
        Ok(self.key_manager.aes_encrypt(&encoded)?)
    }

    fn open(&self, sealed: &[u8]) -> CoreResult<StoredMessage> {
        let encoded = Zeroizing::new(self.key_manager.aes_decrypt(sealed)?);
        Ok(serde_json::from_slice(&encoded)?)
    }

    /// Fire-and-forget delivery to listeners
    fn notify(&self, partner: &[u8; 32], message: &StoredMessage) {
        let listeners = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        for listener in listeners {
            let event = MessageEvent {
                partner: *partner,
                message: message.clone(),
            };
            tokio::spawn(async move { listener(event) });
        }
    }
}
