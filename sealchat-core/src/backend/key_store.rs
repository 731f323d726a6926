//! Ratchet key store kept by the backend
//!
//! Indices travel hex encoded; message keys are sealed with the key manager
//! before they leave the process. Every failure is logged and treated as a
//! miss so the ratchet pipeline never aborts on a remote hiccup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use zeroize::Zeroizing;

use crate::backend::protocol::{KeyEntry, KeyIndex, Request, Response};
use crate::backend::Backend;
use crate::crypto::{KeyManager, KeyStore, MessageKey, SessionKey};
use crate::error::{CoreError, CoreResult};

pub struct RemoteKeyStore {
    backend: Backend,
    key_manager: Arc<dyn KeyManager>,
    timeout: Duration,
}

impl RemoteKeyStore {
    pub fn new(backend: Backend, key_manager: Arc<dyn KeyManager>, timeout: Duration) -> Self {
        Self {
            backend,
            key_manager,
            timeout,
        }
    }

    async fn call(&self, request: Request) -> CoreResult<Response> {
        self.backend.request(request, self.timeout).await
    }

    fn open_key(&self, encoded: &str) -> CoreResult<MessageKey> {
        let sealed = STANDARD
            .decode(encoded)
            .map_err(|e| CoreError::Validation(format!("message key is not base64: {}", e)))?;
        let plain = Zeroizing::new(self.key_manager.aes_decrypt(&sealed)?);
        plain
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::Validation("a decrypted message key must have exactly 32 bytes".to_string()))
    }

    async fn fetch(&self, session_key: &SessionKey, msg_num: u32) -> CoreResult<Option<MessageKey>> {
        let request = Request::KeyStoreGet(KeyIndex {
            session_key: hex::encode(session_key),
            msg_num,
        });
        match self.call(request).await? {
            Response::MessageKey(Some(encoded)) => self.open_key(&encoded).map(Some),
            Response::MessageKey(None) => Ok(None),
            other => Err(CoreError::Transport(format!("unexpected {} response", other.kind()))),
        }
    }

    async fn expect_ack(&self, request: Request) -> CoreResult<()> {
        match self.call(request).await? {
            Response::Ack => Ok(()),
            other => Err(CoreError::Transport(format!("unexpected {} response", other.kind()))),
        }
    }
}

#[async_trait]
impl KeyStore for RemoteKeyStore {
    async fn get(&self, session_key: &SessionKey, msg_num: u32) -> CoreResult<Option<MessageKey>> {
        match self.fetch(session_key, msg_num).await {
            Ok(key) => Ok(key),
            Err(e) => {
                tracing::warn!("Remote key store get failed, treating as miss: {}", e);
                Ok(None)
            }
        }
    }

    async fn put(&self, session_key: &SessionKey, msg_num: u32, message_key: &MessageKey) -> CoreResult<()> {
        let sealed = match self.key_manager.aes_encrypt(message_key) {
            Ok(sealed) => sealed,
            Err(e) => {
                tracing::error!("Could not seal message key for the remote store: {}", e);
                return Ok(());
            }
        };
        let request = Request::KeyStorePut(KeyEntry {
            session_key: hex::encode(session_key),
            msg_num,
            message_key: STANDARD.encode(sealed),
        });
        if let Err(e) = self.expect_ack(request).await {
            tracing::warn!("Remote key store put failed: {}", e);
        }
        Ok(())
    }

    async fn delete_message_key(&self, session_key: &SessionKey, msg_num: u32) -> CoreResult<()> {
        let request = Request::KeyStoreDeleteMessageKey(KeyIndex {
            session_key: hex::encode(session_key),
            msg_num,
        });
        if let Err(e) = self.expect_ack(request).await {
            tracing::warn!("Remote key store delete failed: {}", e);
        }
        Ok(())
    }

    async fn delete_session_keys(&self, session_key: &SessionKey) -> CoreResult<()> {
        let request = Request::KeyStoreDeleteSessionKeys(hex::encode(session_key));
        if let Err(e) = self.expect_ack(request).await {
            tracing::warn!("Remote key store session delete failed: {}", e);
        }
        Ok(())
    }

    async fn count(&self, session_key: &SessionKey) -> CoreResult<u64> {
        match self.call(Request::KeyStoreCount(hex::encode(session_key))).await {
            Ok(Response::KeyCount(count)) => Ok(count),
            Ok(other) => {
                tracing::warn!("Remote key store count got a {} response", other.kind());
                Ok(0)
            }
            Err(e) => {
                tracing::warn!("Remote key store count failed: {}", e);
                Ok(0)
            }
        }
    }

    /// The backend never hands out every key at once
    async fn all(&self) -> CoreResult<HashMap<SessionKey, HashMap<u32, MessageKey>>> {
        Ok(HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendMessage, ChannelTransport, RemoteEnd};
    use crate::config::CoreConfig;
    use crate::crypto::LocalKeyManager;

    type Keys = HashMap<(String, u32), String>;

    /// Requests for this chain are never answered
    const SILENT_CHAIN: SessionKey = [0xEE; 32];

    /// Backend side that keeps sealed keys in a map
    async fn serve(mut remote: RemoteEnd, mut keys: Keys, seen: tokio::sync::mpsc::UnboundedSender<Request>) {
        remote
            .send(BackendMessage::request("auth".to_string(), Request::Auth(vec![9; 16])))
            .await
            .unwrap();
        let silent = hex::encode(SILENT_CHAIN);

        while let Some(message) = remote.recv().await {
            let Some(request) = message.request else { continue };
            let _ = seen.send(request.clone());
            let response = match request {
                Request::KeyStorePut(entry) if entry.session_key != silent => {
                    keys.insert((entry.session_key, entry.msg_num), entry.message_key);
                    Response::Ack
                }
                Request::KeyStoreGet(index) if index.session_key != silent => {
                    Response::MessageKey(keys.get(&(index.session_key, index.msg_num)).cloned())
                }
                Request::KeyStoreDeleteMessageKey(index) => {
                    keys.remove(&(index.session_key, index.msg_num));
                    Response::Ack
                }
                Request::KeyStoreCount(session_key) => {
                    Response::KeyCount(keys.keys().filter(|(s, _)| *s == session_key).count() as u64)
                }
                // Never answered, to exercise the timeout
                _ => continue,
            };
            remote
                .send(BackendMessage::response(message.request_id, response))
                .await
                .unwrap();
        }
    }

    fn store_with(
        km: Arc<LocalKeyManager>,
        keys: Keys,
    ) -> (RemoteKeyStore, tokio::sync::mpsc::UnboundedReceiver<Request>) {
        let (transport, inbound, remote) = ChannelTransport::pair(64);
        let config = CoreConfig {
            auth_poll_interval_ms: 10,
            ..CoreConfig::default()
        };
        let backend = Backend::new(Arc::new(transport), inbound, km.clone(), &config);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(serve(remote, keys, tx));
        (RemoteKeyStore::new(backend, km, Duration::from_millis(300)), rx)
    }

    fn store() -> (RemoteKeyStore, tokio::sync::mpsc::UnboundedReceiver<Request>) {
        store_with(Arc::new(LocalKeyManager::generate()), Keys::new())
    }

    #[tokio::test]
    async fn test_round_trip_through_backend() {
        let (store, mut seen) = store();
        let chain = [3u8; 32];

        store.put(&chain, 4, &[0x55; 32]).await.unwrap();
        assert_eq!(store.get(&chain, 4).await.unwrap(), Some([0x55; 32]));
        assert_eq!(store.count(&chain).await.unwrap(), 1);

        store.delete_message_key(&chain, 4).await.unwrap();
        assert_eq!(store.get(&chain, 4).await.unwrap(), None);
        assert!(store.all().await.unwrap().is_empty());

        // Plaintext key bytes never cross the wire
        while let Ok(request) = seen.try_recv() {
            if let Request::KeyStorePut(entry) = request {
                assert_eq!(entry.session_key, hex::encode(chain));
                let sealed = STANDARD.decode(&entry.message_key).unwrap();
                assert!(!sealed.windows(32).any(|w| w == [0x55; 32]));
            }
        }
    }

    #[tokio::test]
    async fn test_timeout_is_not_fatal() {
        let (store, _seen) = store();
        store.delete_session_keys(&[1u8; 32]).await.unwrap();
        assert_eq!(store.backend.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_silent_backend_reads_as_miss() {
        let (store, _seen) = store();

        assert_eq!(store.get(&SILENT_CHAIN, 0).await.unwrap(), None);
        store.put(&SILENT_CHAIN, 0, &[0x11; 32]).await.unwrap();
        assert_eq!(store.backend.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_bad_key_reads_as_miss() {
        let km = Arc::new(LocalKeyManager::generate());
        let chain = [6u8; 32];
        let mut keys = Keys::new();
        // Opens cleanly but is only 16 bytes long
        keys.insert(
            (hex::encode(chain), 1),
            STANDARD.encode(km.aes_encrypt(&[0x22; 16]).unwrap()),
        );
        keys.insert((hex::encode(chain), 2), "not base64!".to_string());
        // Sealed under a different storage key
        let stranger = LocalKeyManager::generate();
        keys.insert(
            (hex::encode(chain), 3),
            STANDARD.encode(stranger.aes_encrypt(&[0x33; 32]).unwrap()),
        );

        let (store, _seen) = store_with(km, keys);
        for msg_num in 1..=3 {
            assert_eq!(store.get(&chain, msg_num).await.unwrap(), None);
        }
    }
}
