//! Partner signed pre-key cache

use sqlx::{Row, SqlitePool};

use crate::crypto::SignedPreKey;
use crate::error::CoreResult;

#[derive(Clone)]
pub struct UserStorage {
    db: SqlitePool,
}

impl UserStorage {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Replace the cached signed pre-key of `partner`
    ///
    /// Callers verify the signature before storing.
    pub async fn put_signed_pre_key(&self, partner: &[u8; 32], key: &SignedPreKey) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO partner_signed_pre_keys (partner, key_id, public_key, signature, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(partner) DO UPDATE SET
                key_id = excluded.key_id,
                public_key = excluded.public_key,
                signature = excluded.signature,
                created_at = excluded.created_at
            "#,
        )
        .bind(&partner[..])
        .bind(i64::from(key.key_id))
        .bind(&key.public_key)
        .bind(&key.signature)
        .bind(key.created_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    pub async fn get_signed_pre_key(&self, partner: &[u8; 32]) -> CoreResult<Option<SignedPreKey>> {
        let row = sqlx::query(
            r#"
            SELECT key_id, public_key, signature, created_at
            FROM partner_signed_pre_keys
            WHERE partner = ?
            "#,
        )
        .bind(&partner[..])
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|row| SignedPreKey {
            key_id: row.get::<i64, _>("key_id") as u32,
            public_key: row.get("public_key"),
            signature: row.get("signature"),
            created_at: row.get("created_at"),
        }))
    }

    pub async fn has_signed_pre_key(&self, partner: &[u8; 32]) -> CoreResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"SELECT EXISTS(SELECT 1 FROM partner_signed_pre_keys WHERE partner = ?)"#,
        )
        .bind(&partner[..])
        .fetch_one(&self.db)
        .await?;

        Ok(exists)
    }
}
