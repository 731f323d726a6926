//! Local key store for skipped ratchet message keys

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use zeroize::Zeroizing;

use crate::crypto::{KeyManager, KeyStore, MessageKey, SessionKey};
use crate::error::{CoreError, CoreResult};

/// SQLite backed [`KeyStore`]; message keys are sealed at rest
#[derive(Clone)]
pub struct LocalKeyStore {
    db: SqlitePool,
    key_manager: Arc<dyn KeyManager>,
}

impl LocalKeyStore {
    pub fn new(db: SqlitePool, key_manager: Arc<dyn KeyManager>) -> Self {
        Self { db, key_manager }
    }

    fn open_key(&self, sealed: &[u8]) -> CoreResult<MessageKey> {
        let plain = Zeroizing::new(self.key_manager.aes_decrypt(sealed)?);
        plain
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::Persistence("stored message key has the wrong length".to_string()))
    }
}

#[async_trait]
impl KeyStore for LocalKeyStore {
    async fn get(&self, session_key: &SessionKey, msg_num: u32) -> CoreResult<Option<MessageKey>> {
        let row = sqlx::query(
            r#"SELECT message_key FROM ratchet_message_keys WHERE session_key = ? AND msg_num = ?"#,
        )
        .bind(&session_key[..])
        .bind(i64::from(msg_num))
        .fetch_optional(&self.db)
        .await?;

        row.map(|row| self.open_key(&row.get::<Vec<u8>, _>("message_key")))
            .transpose()
    }

    async fn put(&self, session_key: &SessionKey, msg_num: u32, message_key: &MessageKey) -> CoreResult<()> {
        let sealed = self.key_manager.aes_encrypt(message_key)?;

        sqlx::query(
            r#"
            INSERT INTO ratchet_message_keys (session_key, msg_num, message_key)
            VALUES (?, ?, ?)
            ON CONFLICT(session_key, msg_num) DO UPDATE SET message_key = excluded.message_key
            "#,
        )
        .bind(&session_key[..])
        .bind(i64::from(msg_num))
        .bind(&sealed)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn delete_message_key(&self, session_key: &SessionKey, msg_num: u32) -> CoreResult<()> {
        sqlx::query(r#"DELETE FROM ratchet_message_keys WHERE session_key = ? AND msg_num = ?"#)
            .bind(&session_key[..])
            .bind(i64::from(msg_num))
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn delete_session_keys(&self, session_key: &SessionKey) -> CoreResult<()> {
        let result = sqlx::query(r#"DELETE FROM ratchet_message_keys WHERE session_key = ?"#)
            .bind(&session_key[..])
            .execute(&self.db)
            .await?;

        tracing::debug!("Dropped {} skipped message keys", result.rows_affected());
        Ok(())
    }

    async fn count(&self, session_key: &SessionKey) -> CoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM ratchet_message_keys WHERE session_key = ?"#,
        )
        .bind(&session_key[..])
        .fetch_one(&self.db)
        .await?;
        Ok(count as u64)
    }

    async fn all(&self) -> CoreResult<HashMap<SessionKey, HashMap<u32, MessageKey>>> {
        let rows = sqlx::query(r#"SELECT session_key, msg_num, message_key FROM ratchet_message_keys"#)
            .fetch_all(&self.db)
            .await?;

        let mut all: HashMap<SessionKey, HashMap<u32, MessageKey>> = HashMap::new();
        for row in rows {
            let session_key: Vec<u8> = row.get("session_key");
            let session_key: SessionKey = session_key.as_slice().try_into().map_err(|_| {
                CoreError::Persistence("stored session key has the wrong length".to_string())
            })?;
            let msg_num = row.get::<i64, _>("msg_num") as u32;
            let message_key = self.open_key(&row.get::<Vec<u8>, _>("message_key"))?;
            all.entry(session_key).or_default().insert(msg_num, message_key);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalKeyManager;
    use crate::db::test_pool;

    #[tokio::test]
    async fn test_key_lifecycle() {
        let store = LocalKeyStore::new(test_pool().await, Arc::new(LocalKeyManager::generate()));
        let chain = [1u8; 32];
        let other = [2u8; 32];

        assert!(store.get(&chain, 0).await.unwrap().is_none());

        store.put(&chain, 0, &[10u8; 32]).await.unwrap();
        store.put(&chain, 1, &[11u8; 32]).await.unwrap();
        store.put(&other, 0, &[20u8; 32]).await.unwrap();
        assert_eq!(store.count(&chain).await.unwrap(), 2);
        assert_eq!(store.get(&chain, 1).await.unwrap(), Some([11u8; 32]));

        store.delete_message_key(&chain, 1).await.unwrap();
        assert!(store.get(&chain, 1).await.unwrap().is_none());

        let all = store.all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[&other][&0], [20u8; 32]);

        store.delete_session_keys(&chain).await.unwrap();
        assert_eq!(store.count(&chain).await.unwrap(), 0);
        assert_eq!(store.count(&other).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_keys_sealed_at_rest() {
        let store = LocalKeyStore::new(test_pool().await, Arc::new(LocalKeyManager::generate()));
        store.put(&[1u8; 32], 0, &[0xAB; 32]).await.unwrap();

        let raw: Vec<u8> = sqlx::query_scalar("SELECT message_key FROM ratchet_message_keys")
            .fetch_one(&store.db)
            .await
            .unwrap();
        assert!(!raw.windows(32).any(|w| w == [0xAB; 32]));
    }
}
