//! Our own pre-keys
//!
//! Signed pre-keys are kept after rotation so that late handshakes naming an
//! older key still resolve. One-time pre-keys are deleted the moment a
//! handshake consumes them.

use std::sync::Arc;

use sqlx::{Row, SqlitePool};
use zeroize::Zeroizing;

use crate::crypto::{Curve25519KeyPair, KeyManager, SignedPreKey};
use crate::error::CoreResult;

#[derive(Clone)]
pub struct PreKeyStore {
    db: SqlitePool,
    key_manager: Arc<dyn KeyManager>,
}

impl PreKeyStore {
    pub fn new(db: SqlitePool, key_manager: Arc<dyn KeyManager>) -> Self {
        Self { db, key_manager }
    }

    // ========================================================================
    // One-time pre-key pool
    // ========================================================================

    /// Add freshly generated one-time pre-keys, all or nothing
    pub async fn put_one_time_pre_keys(&self, keys: &[(u32, Curve25519KeyPair)]) -> CoreResult<()> {
        let now = chrono::Utc::now().timestamp();
        let mut sealed = Vec::with_capacity(keys.len());
        for (key_id, pair) in keys {
            let secret = Zeroizing::new(pair.secret_key_bytes());
            sealed.push((*key_id, pair.public_key_bytes(), self.key_manager.aes_encrypt(&secret[..])?));
        }

        let mut tx = self.db.begin().await?;
        for (key_id, public_key, secret_key) in &sealed {
            sqlx::query(
                r#"
                INSERT INTO one_time_pre_keys (public_key, key_id, secret_key, created_at)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&public_key[..])
            .bind(i64::from(*key_id))
            .bind(secret_key)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::info!("Stored {} one-time pre-keys", keys.len());
        Ok(())
    }

    /// Remove and return the one-time pre-key with this public half
    ///
    /// A key can be taken at most once.
    pub async fn take_one_time_pre_key(&self, public_key: &[u8]) -> CoreResult<Option<Curve25519KeyPair>> {
        let row = sqlx::query(r#"DELETE FROM one_time_pre_keys WHERE public_key = ? RETURNING secret_key"#)
            .bind(public_key)
            .fetch_optional(&self.db)
            .await?;

        match row {
            Some(row) => {
                let sealed: Vec<u8> = row.get("secret_key");
                let secret = Zeroizing::new(self.key_manager.aes_decrypt(&sealed)?);
                Ok(Some(Curve25519KeyPair::from_secret_bytes(&secret)?))
            }
            None => Ok(None),
        }
    }

    pub async fn count_one_time_pre_keys(&self) -> CoreResult<i64> {
        let count: i64 = sqlx::query_scalar(r#"SELECT COUNT(*) FROM one_time_pre_keys"#)
            .fetch_one(&self.db)
            .await?;
        Ok(count)
    }

    // ========================================================================
    // Signed pre-keys
    // ========================================================================

    pub async fn save_signed_pre_key(&self, pair: &Curve25519KeyPair, signed: &SignedPreKey) -> CoreResult<()> {
        let secret = Zeroizing::new(pair.secret_key_bytes());
        let sealed = self.key_manager.aes_encrypt(&secret[..])?;

        sqlx::query(
            r#"
            INSERT INTO signed_pre_keys (public_key, key_id, secret_key, signature, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&signed.public_key)
        .bind(i64::from(signed.key_id))
        .bind(&sealed)
        .bind(&signed.signature)
        .bind(signed.created_at)
        .execute(&self.db)
        .await?;

        tracing::info!("Stored signed pre-key {}", signed.key_id);
        Ok(())
    }

    /// Private half of the signed pre-key with this public half
    pub async fn signed_pre_key_pair(&self, public_key: &[u8]) -> CoreResult<Option<Curve25519KeyPair>> {
        let row = sqlx::query(r#"SELECT secret_key FROM signed_pre_keys WHERE public_key = ?"#)
            .bind(public_key)
            .fetch_optional(&self.db)
            .await?;

        match row {
            Some(row) => {
                let sealed: Vec<u8> = row.get("secret_key");
                let secret = Zeroizing::new(self.key_manager.aes_decrypt(&sealed)?);
                Ok(Some(Curve25519KeyPair::from_secret_bytes(&secret)?))
            }
            None => Ok(None),
        }
    }

    /// Most recently created signed pre-key
    pub async fn current_signed_pre_key(&self) -> CoreResult<Option<SignedPreKey>> {
        let row = sqlx::query(
            r#"
            SELECT key_id, public_key, signature, created_at
            FROM signed_pre_keys
            ORDER BY created_at DESC, key_id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|row| SignedPreKey {
            key_id: row.get::<i64, _>("key_id") as u32,
            public_key: row.get("public_key"),
            signature: row.get("signature"),
            created_at: row.get("created_at"),
        }))
    }

    pub async fn next_signed_pre_key_id(&self) -> CoreResult<u32> {
        let max: Option<i64> = sqlx::query_scalar(r#"SELECT MAX(key_id) FROM signed_pre_keys"#)
            .fetch_one(&self.db)
            .await?;
        Ok(max.map(|id| id as u32 + 1).unwrap_or(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalKeyManager;
    use crate::db::test_pool;

    async fn store() -> (PreKeyStore, Arc<LocalKeyManager>) {
        let km = Arc::new(LocalKeyManager::generate());
        (PreKeyStore::new(test_pool().await, km.clone()), km)
    }

    #[tokio::test]
    async fn test_one_time_pre_key_taken_once() {
        let (store, _) = store().await;
        let keys: Vec<_> = (0..3).map(|i| (i, Curve25519KeyPair::generate())).collect();
        store.put_one_time_pre_keys(&keys).await.unwrap();
        assert_eq!(store.count_one_time_pre_keys().await.unwrap(), 3);

        let public = keys[1].1.public_key_bytes();
        let taken = store.take_one_time_pre_key(&public).await.unwrap().unwrap();
        assert_eq!(taken.public_key_bytes(), public);

        assert!(store.take_one_time_pre_key(&public).await.unwrap().is_none());
        assert_eq!(store.count_one_time_pre_keys().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_signed_pre_key_rotation_keeps_old_keys() {
        let (store, km) = store().await;
        assert!(store.current_signed_pre_key().await.unwrap().is_none());
        assert_eq!(store.next_signed_pre_key_id().await.unwrap(), 1);

        let old_pair = Curve25519KeyPair::generate();
        let old = SignedPreKey::sign(1, &old_pair, km.as_ref());
        store.save_signed_pre_key(&old_pair, &old).await.unwrap();

        let new_pair = Curve25519KeyPair::generate();
        let mut new = SignedPreKey::sign(2, &new_pair, km.as_ref());
        new.created_at += 1;
        store.save_signed_pre_key(&new_pair, &new).await.unwrap();

        assert_eq!(store.current_signed_pre_key().await.unwrap().unwrap(), new);
        assert_eq!(store.next_signed_pre_key_id().await.unwrap(), 3);

        let restored = store.signed_pre_key_pair(&old.public_key).await.unwrap().unwrap();
        assert_eq!(restored.public_key_bytes(), old_pair.public_key_bytes());
    }
}
