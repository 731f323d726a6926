//! Shared secret storage
//!
//! One row per X3DH negotiation. Multiple unaccepted secrets may coexist for a
//! partner; the youngest is used for sending, a specific negotiation is found
//! by its id. Rows are never deleted, only promoted to accepted.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use zeroize::Zeroizing;

use crate::crypto::KeyManager;
use crate::error::{CoreError, CoreResult};
use crate::models::{SharedSecret, BASE_ID_LEN};

/// Sealed part of a shared secret row
#[derive(Serialize, Deserialize)]
struct SecretPayload {
    secret: Vec<u8>,
    used_one_time_pre_key: Option<Vec<u8>>,
    used_signed_pre_key: Vec<u8>,
    ephemeral_key: Vec<u8>,
    ephemeral_key_signature: Vec<u8>,
}

#[derive(Clone)]
pub struct SharedSecretStore {
    db: SqlitePool,
    key_manager: Arc<dyn KeyManager>,
}

impl SharedSecretStore {
    pub fn new(db: SqlitePool, key_manager: Arc<dyn KeyManager>) -> Self {
        Self { db, key_manager }
    }

    /// Store a secret
    ///
    /// A base id stays bound to the negotiation that first stored it: a re-put
    /// from the same negotiation can only promote it to accepted, one from a
    /// different negotiation is rejected.
    pub async fn put(&self, partner: &[u8; 32], secret: &SharedSecret) -> CoreResult<()> {
        if secret.base_id.len() != BASE_ID_LEN {
            return Err(CoreError::Validation(format!(
                "shared secret base id must be {} bytes, got {}",
                BASE_ID_LEN,
                secret.base_id.len()
            )));
        }

        let payload = Zeroizing::new(serde_json::to_vec(&SecretPayload {
            secret: secret.secret.to_vec(),
            used_one_time_pre_key: secret.used_one_time_pre_key.clone(),
            used_signed_pre_key: secret.used_signed_pre_key.clone(),
            ephemeral_key: secret.ephemeral_key.clone(),
            ephemeral_key_signature: secret.ephemeral_key_signature.clone(),
        })?);
        let sealed = self.key_manager.aes_encrypt(&payload)?;

        let mut tx = self.db.begin().await?;
        let owner: Option<String> = sqlx::query_scalar(
            r#"SELECT negotiation_id FROM shared_secrets WHERE partner = ? AND base_id = ?"#,
        )
        .bind(&partner[..])
        .bind(&secret.base_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(owner) = owner {
            if owner != secret.negotiation_params_id {
                return Err(CoreError::Validation(format!(
                    "base id {} already belongs to negotiation {}",
                    short_hex(&secret.base_id),
                    owner
                )));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO shared_secrets (id, partner, base_id, negotiation_id, created_at, accepted, payload)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(partner, base_id) DO UPDATE SET
                accepted = MAX(shared_secrets.accepted, excluded.accepted)
            "#,
        )
        .bind(&secret.id)
        .bind(&partner[..])
        .bind(&secret.base_id)
        .bind(&secret.negotiation_params_id)
        .bind(secret.created_at)
        .bind(secret.accepted)
        .bind(&sealed)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::debug!(
            "Stored shared secret {} for partner {} (accepted: {})",
            secret.id,
            short_hex(partner),
            secret.accepted
        );
        Ok(())
    }

    pub async fn get(&self, partner: &[u8; 32], base_id: &[u8]) -> CoreResult<Option<SharedSecret>> {
        let row = sqlx::query(
            r#"
            SELECT id, base_id, negotiation_id, created_at, accepted, payload
            FROM shared_secrets
            WHERE partner = ? AND base_id = ?
            "#,
        )
        .bind(&partner[..])
        .bind(base_id)
        .fetch_optional(&self.db)
        .await?;

        row.map(|row| self.from_row(&row)).transpose()
    }

    /// The secret with the greatest creation time
    pub async fn get_youngest(&self, partner: &[u8; 32]) -> CoreResult<Option<SharedSecret>> {
        let row = sqlx::query(
            r#"
            SELECT id, base_id, negotiation_id, created_at, accepted, payload
            FROM shared_secrets
            WHERE partner = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(&partner[..])
        .fetch_optional(&self.db)
        .await?;

        row.map(|row| self.from_row(&row)).transpose()
    }

    /// Mark the secret accepted; repeated calls are no-ops
    pub async fn accept(&self, partner: &[u8; 32], secret: &SharedSecret) -> CoreResult<()> {
        let mut tx = self.db.begin().await?;
        let result = sqlx::query(
            r#"UPDATE shared_secrets SET accepted = 1 WHERE partner = ? AND base_id = ?"#,
        )
        .bind(&partner[..])
        .bind(&secret.base_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!(
                "shared secret {} for partner {}",
                hex::encode(&secret.base_id),
                short_hex(partner)
            )));
        }
        tx.commit().await?;

        tracing::info!("Accepted shared secret {} with {}", secret.id, short_hex(partner));
        Ok(())
    }

    pub async fn has_any(&self, partner: &[u8; 32]) -> CoreResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"SELECT EXISTS(SELECT 1 FROM shared_secrets WHERE partner = ?)"#,
        )
        .bind(&partner[..])
        .fetch_one(&self.db)
        .await?;

        Ok(exists)
    }

    /// Resolve the secret a received handshake refers to
    pub async fn secret_for_chat_init_msg(
        &self,
        partner: &[u8; 32],
        negotiation_id: &str,
    ) -> CoreResult<Option<SharedSecret>> {
        let row = sqlx::query(
            r#"
            SELECT id, base_id, negotiation_id, created_at, accepted, payload
            FROM shared_secrets
            WHERE partner = ? AND negotiation_id = ?
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(&partner[..])
        .bind(negotiation_id)
        .fetch_optional(&self.db)
        .await?;

        row.map(|row| self.from_row(&row)).transpose()
    }

    fn from_row(&self, row: &SqliteRow) -> CoreResult<SharedSecret> {
        let sealed: Vec<u8> = row.get("payload");
        let plain = Zeroizing::new(self.key_manager.aes_decrypt(&sealed)?);
        let payload: SecretPayload = serde_json::from_slice(&plain)?;

        let secret: [u8; 32] = payload.secret.as_slice().try_into().map_err(|_| {
            CoreError::Persistence("stored shared secret has the wrong length".to_string())
        })?;

        Ok(SharedSecret {
            id: row.get("id"),
            base_id: row.get("base_id"),
            secret,
            accepted: row.get("accepted"),
            created_at: row.get("created_at"),
            used_one_time_pre_key: payload.used_one_time_pre_key,
            used_signed_pre_key: payload.used_signed_pre_key,
            ephemeral_key: payload.ephemeral_key,
            ephemeral_key_signature: payload.ephemeral_key_signature,
            negotiation_params_id: row.get("negotiation_id"),
        })
    }
}

pub(crate) fn short_hex(key: &[u8]) -> String {
    hex::encode(&key[..key.len().min(4)])
}
