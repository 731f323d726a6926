//! Ratchet state storage
//!
//! One sealed ratchet state per (partner, shared secret base id).

use std::sync::Arc;

use sqlx::{Row, SqlitePool};
use zeroize::Zeroizing;

use crate::crypto::{CryptoError, KeyManager, RatchetState};
use crate::error::CoreResult;

#[derive(Clone)]
pub struct RatchetStateStore {
    db: SqlitePool,
    key_manager: Arc<dyn KeyManager>,
}

impl RatchetStateStore {
    pub fn new(db: SqlitePool, key_manager: Arc<dyn KeyManager>) -> Self {
        Self { db, key_manager }
    }

    /// Save or replace the state for a session
    pub async fn save(&self, partner: &[u8; 32], base_id: &[u8], state: &RatchetState) -> CoreResult<()> {
        let encoded = Zeroizing::new(serde_json::to_vec(state)?);
        let sealed = self.key_manager.aes_encrypt(&encoded)?;

        sqlx::query(
            r#"
            INSERT INTO ratchet_states (partner, base_id, state, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(partner, base_id) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&partner[..])
        .bind(base_id)
        .bind(&sealed)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.db)
        .await?;

        Ok(())
    }

    pub async fn load(&self, partner: &[u8; 32], base_id: &[u8]) -> CoreResult<Option<RatchetState>> {
        let row = sqlx::query(r#"SELECT state FROM ratchet_states WHERE partner = ? AND base_id = ?"#)
            .bind(&partner[..])
            .bind(base_id)
            .fetch_optional(&self.db)
            .await?;

        match row {
            Some(row) => {
                let sealed: Vec<u8> = row.get("state");
                let encoded = Zeroizing::new(self.key_manager.aes_decrypt(&sealed)?);
                let state = serde_json::from_slice(&encoded)
                    .map_err(|e| CryptoError::SerializationError(format!("Corrupted ratchet state: {}", e)))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }
}
