//! Session coordination
//!
//! Ties key agreement, the ratchet, the stores and the backend together.
//!
//! ## Sending
//!
//! 1. Negotiate a shared secret if we have none for the recipient
//! 2. Pick the youngest secret
//! 3. Make sure a fresh, verified signed pre-key of the recipient is cached
//! 4. Resume or create the ratchet session
//! 5. Piggy-back the handshake while the secret is unaccepted
//! 6. Encrypt and submit
//!
//! The message is persisted first and ends up `Sent` or `FailedToSend`.
//!
//! ## Receiving
//!
//! Every message of a batch is handled on its own task; a failure is recorded
//! as a `FailedToHandle` message and never affects its siblings.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sqlx::SqlitePool;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinSet;
use zeroize::Zeroizing;

use crate::backend::{Backend, ChatMessage, DoubleRatchetMessage, PublishedKeys};
use crate::chat::handlers::{MessagesHandler, OneTimePreKeysHandler};
use crate::config::CoreConfig;
use crate::crypto::{
    accept_session, initiate_session, Curve25519KeyPair, Handshake, KeyManager, KeyStore, LocalPreKeyBundle,
    OneTimePreKey, RatchetSession, SignedPreKey,
};
use crate::db::{MessageStore, PreKeyStore, RatchetStateStore, SharedSecretStore, UserStorage};
use crate::error::{CoreError, CoreResult};
use crate::models::{
    now_nanos, DAppMessage, RatchetPayload, SharedSecret, Status, StoredMessage, BASE_ID_LEN,
};

type PartnerKey = [u8; 32];

pub struct SessionCoordinator {
    key_manager: Arc<dyn KeyManager>,
    backend: Backend,
    key_store: Arc<dyn KeyStore>,
    shared_secrets: SharedSecretStore,
    ratchet_states: RatchetStateStore,
    pre_keys: PreKeyStore,
    users: UserStorage,
    messages: MessageStore,
    /// Serializes ratchet use per partner
    partner_locks: Mutex<HashMap<PartnerKey, Arc<tokio::sync::Mutex<()>>>>,
    signed_pre_key_max_age_days: i64,
    max_one_time_pre_keys: u32,
}

impl SessionCoordinator {
    /// Build the coordinator and register its backend handlers
    pub fn start(
        db: SqlitePool,
        key_manager: Arc<dyn KeyManager>,
        backend: Backend,
        key_store: Arc<dyn KeyStore>,
        messages: MessageStore,
        config: &CoreConfig,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            shared_secrets: SharedSecretStore::new(db.clone(), key_manager.clone()),
            ratchet_states: RatchetStateStore::new(db.clone(), key_manager.clone()),
            pre_keys: PreKeyStore::new(db.clone(), key_manager.clone()),
            users: UserStorage::new(db),
            messages,
            key_manager,
            backend: backend.clone(),
            key_store,
            partner_locks: Mutex::new(HashMap::new()),
            signed_pre_key_max_age_days: config.signed_pre_key_max_age_days,
            max_one_time_pre_keys: config.max_one_time_pre_keys,
        });

        backend.add_request_handler(Arc::new(MessagesHandler::new(Arc::downgrade(&coordinator))));
        backend.add_request_handler(Arc::new(OneTimePreKeysHandler::new(Arc::downgrade(&coordinator))));
        coordinator
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    pub fn shared_secrets(&self) -> &SharedSecretStore {
        &self.shared_secrets
    }

    pub fn pre_keys(&self) -> &PreKeyStore {
        &self.pre_keys
    }

    async fn lock_partner(&self, partner: &PartnerKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.partner_locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks.entry(*partner).or_default().clone()
        };
        lock.lock_owned().await
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Encrypt and submit a plaintext message
    pub async fn send_message(&self, recipient: &[u8; 32], message: Vec<u8>) -> CoreResult<StoredMessage> {
        let stored = self.messages.persist_message_to_send(recipient, message).await?;
        self.deliver(recipient, stored).await
    }

    /// Encrypt and submit a typed extension payload
    pub async fn send_dapp_message(&self, recipient: &[u8; 32], dapp_message: DAppMessage) -> CoreResult<StoredMessage> {
        let stored = self
            .messages
            .persist_dapp_message(recipient, dapp_message, false)
            .await?;
        self.deliver(recipient, stored).await
    }

    async fn deliver(&self, recipient: &[u8; 32], stored: StoredMessage) -> CoreResult<StoredMessage> {
        let _guard = self.lock_partner(recipient).await;

        match self.encrypt_and_submit(recipient, &stored).await {
            Ok(()) => {
                self.messages
                    .update_status(recipient, stored.database_id, Status::Sent)
                    .await
            }
            Err(err) => {
                tracing::error!("Failed to send message {}: {}", stored.id, err);
                match self
                    .messages
                    .update_status(recipient, stored.database_id, Status::FailedToSend)
                    .await
                {
                    Ok(_) => Err(err),
                    Err(status_err) => Err(err.with_status_error(status_err)),
                }
            }
        }
    }

    async fn encrypt_and_submit(&self, recipient: &[u8; 32], stored: &StoredMessage) -> CoreResult<()> {
        if !self.shared_secrets.has_any(recipient).await? {
            self.negotiate(recipient).await?;
        }

        let secret = self.shared_secrets.get_youngest(recipient).await?.ok_or_else(|| {
            CoreError::NotFound(format!("shared secret for {}", hex::encode(recipient)))
        })?;

        self.partner_signed_pre_key(recipient).await?;

        let payload = RatchetPayload {
            id: stored.id.clone(),
            created_at: stored.created_at,
            message: stored.message.clone(),
            dapp_message: stored.dapp_message.clone(),
        };
        let message = self.seal(recipient, &secret, &payload).await?;
        self.backend.submit_message(message).await
    }

    /// Encrypt `payload` under the ratchet for `secret` and advance it
    async fn seal(
        &self,
        recipient: &[u8; 32],
        secret: &SharedSecret,
        payload: &RatchetPayload,
    ) -> CoreResult<ChatMessage> {
        let mut session = self.session_for(recipient, secret).await?;

        let handshake = if secret.accepted {
            None
        } else {
            Some(Handshake::piggyback(self.key_manager.as_ref(), secret)?)
        };

        let plaintext = Zeroizing::new(serde_json::to_vec(payload)?);
        let (header, ciphertext) = session.encrypt(&plaintext)?;
        self.ratchet_states
            .save(recipient, &secret.base_id, session.state())
            .await?;

        Ok(ChatMessage {
            message_id: payload.id.clone(),
            sender: self.key_manager.identity_public_key().to_vec(),
            receiver: recipient.to_vec(),
            double_ratchet_message: DoubleRatchetMessage::new(&header, ciphertext),
            handshake,
            shared_secret_base_id: Some(secret.base_id.clone()),
            shared_secret_creation_time: Some(secret.created_at),
        })
    }

    /// Run X3DH against the recipient's published bundle and keep the secret
    async fn negotiate(&self, recipient: &[u8; 32]) -> CoreResult<()> {
        let bundle = self.backend.fetch_pre_key_bundle(recipient).await?;
        if bundle.identity_key != recipient[..] {
            return Err(CoreError::Validation(
                "pre-key bundle belongs to a different identity".to_string(),
            ));
        }

        let (_, result) = initiate_session(self.key_manager.as_ref(), &bundle)?;
        self.users
            .put_signed_pre_key(recipient, &bundle.signed_pre_key)
            .await?;

        let mut base_id = [0u8; BASE_ID_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut base_id);
        let secret = SharedSecret::from_x3dh(&result, base_id);
        self.shared_secrets.put(recipient, &secret).await?;

        tracing::info!(
            "Negotiated shared secret {} with {}",
            secret.id,
            hex::encode(&recipient[..4])
        );
        Ok(())
    }

    /// Cached signed pre-key of a partner, refreshed once it is too old
    async fn partner_signed_pre_key(&self, partner: &[u8; 32]) -> CoreResult<SignedPreKey> {
        if let Some(cached) = self.users.get_signed_pre_key(partner).await? {
            if !cached.is_expired(self.signed_pre_key_max_age_days) {
                return Ok(cached);
            }
        }

        let fresh = self.backend.fetch_signed_pre_key(partner).await?;
        fresh.verify(partner)?;
        self.users.put_signed_pre_key(partner, &fresh).await?;
        tracing::info!("Refreshed signed pre-key of {}", hex::encode(&partner[..4]));
        Ok(fresh)
    }

    /// Stored ratchet for this secret, or a new one
    ///
    /// A secret whose signed pre-key is one of ours was negotiated by the
    /// partner, so we are the responder.
    async fn session_for(&self, partner: &[u8; 32], secret: &SharedSecret) -> CoreResult<RatchetSession> {
        if let Some(state) = self.ratchet_states.load(partner, &secret.base_id).await? {
            return Ok(RatchetSession::resume(state, self.key_store.clone()));
        }

        match self.pre_keys.signed_pre_key_pair(&secret.used_signed_pre_key).await? {
            Some(own) => Ok(RatchetSession::responder(&secret.secret, &own, self.key_store.clone())),
            None => Ok(RatchetSession::initiator(
                &secret.secret,
                &secret.used_signed_pre_key,
                self.key_store.clone(),
            )?),
        }
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    /// Handle a batch, one task per message; results keep batch order
    pub async fn handle_batch(self: &Arc<Self>, batch: Vec<ChatMessage>) -> Vec<CoreResult<StoredMessage>> {
        let count = batch.len();
        let mut tasks = JoinSet::new();
        for (index, message) in batch.into_iter().enumerate() {
            let coordinator = self.clone();
            tasks.spawn(async move { (index, coordinator.handle_received(message).await) });
        }

        let mut results: Vec<Option<CoreResult<StoredMessage>>> = (0..count).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => tracing::error!("Message task failed: {}", e),
            }
        }

        results
            .into_iter()
            .map(|result| {
                result.unwrap_or_else(|| Err(CoreError::Persistence("message task aborted".to_string())))
            })
            .collect()
    }

    /// Decrypt and persist one inbound message
    pub async fn handle_received(&self, message: ChatMessage) -> CoreResult<StoredMessage> {
        let partner: PartnerKey = message
            .sender
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::Validation("sender must be 32 bytes".to_string()))?;

        let _guard = self.lock_partner(&partner).await;

        // Store rejections are recorded like decrypt failures
        let outcome = match self.open_received(&partner, &message).await {
            Ok(payload) => self.messages.persist_received_message(&partner, payload).await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(stored) => Ok(stored),
            Err(err) => {
                tracing::error!(
                    "Failed to handle message {} from {}: {}",
                    message.message_id,
                    hex::encode(&partner[..4]),
                    err
                );
                let raw = serde_json::to_vec(&message)?;
                match self
                    .messages
                    .persist_failed_message(&partner, &message.message_id, raw, &err.to_string())
                    .await
                {
                    Ok(_) => Err(err),
                    Err(status_err) => Err(err.with_status_error(status_err)),
                }
            }
        }
    }

    async fn open_received(&self, partner: &[u8; 32], message: &ChatMessage) -> CoreResult<RatchetPayload> {
        if message.receiver != self.key_manager.identity_public_key()[..] {
            return Err(CoreError::Validation("message is addressed to someone else".to_string()));
        }
        let header = message.double_ratchet_message.header()?;

        let secret = match &message.handshake {
            Some(handshake) => self.accept_handshake(partner, message, handshake).await?,
            None => self.resolve_secret(partner, message).await?,
        };

        let mut session = self.session_for(partner, &secret).await?;
        let plaintext = Zeroizing::new(
            session
                .decrypt(&header, &message.double_ratchet_message.ciphertext)
                .await?,
        );
        self.ratchet_states
            .save(partner, &secret.base_id, session.state())
            .await?;

        if !secret.accepted {
            self.shared_secrets.accept(partner, &secret).await?;
        }

        serde_json::from_slice(&plaintext)
            .map_err(|e| CoreError::Validation(format!("malformed message payload: {}", e)))
    }

    async fn resolve_secret(&self, partner: &[u8; 32], message: &ChatMessage) -> CoreResult<SharedSecret> {
        let secret = match &message.shared_secret_base_id {
            Some(base_id) => self.shared_secrets.get(partner, base_id).await?,
            None => self.shared_secrets.get_youngest(partner).await?,
        };
        secret.ok_or_else(|| CoreError::NotFound(format!("shared secret for {}", hex::encode(partner))))
    }

    /// Secret named by a piggy-backed handshake, accepting it on first sight
    async fn accept_handshake(
        &self,
        partner: &[u8; 32],
        message: &ChatMessage,
        handshake: &Handshake,
    ) -> CoreResult<SharedSecret> {
        if handshake.identity_key != partner[..] {
            return Err(CoreError::Validation("handshake identity does not match the sender".to_string()));
        }
        if let Some(known) = self
            .shared_secrets
            .secret_for_chat_init_msg(partner, &handshake.negotiation_id)
            .await?
        {
            return Ok(known);
        }

        let base_id = match &message.shared_secret_base_id {
            Some(base_id) if base_id.len() == BASE_ID_LEN => base_id.clone(),
            _ => return Err(CoreError::Validation("handshake without a valid base id".to_string())),
        };
        // Checked before a one-time pre-key is spent
        if self.shared_secrets.get(partner, &base_id).await?.is_some() {
            return Err(CoreError::Validation(
                "handshake reuses the base id of another negotiation".to_string(),
            ));
        }

        let signed_pre_key = self
            .pre_keys
            .signed_pre_key_pair(&handshake.signed_pre_key)
            .await?
            .ok_or_else(|| CoreError::NotFound("signed pre-key named by the handshake".to_string()))?;
        let one_time_pre_key = match &handshake.one_time_pre_key {
            Some(public_key) => Some(
                self.pre_keys
                    .take_one_time_pre_key(public_key)
                    .await?
                    .ok_or_else(|| CoreError::NotFound("one-time pre-key named by the handshake".to_string()))?,
            ),
            None => None,
        };

        let local = LocalPreKeyBundle {
            chat_identity: self.key_manager.chat_id_key_pair(),
            signed_pre_key,
            one_time_pre_key,
        };
        let derived = accept_session(handshake, &local)?;

        let secret = SharedSecret {
            id: uuid::Uuid::new_v4().to_string(),
            base_id,
            secret: derived,
            accepted: true,
            created_at: message.shared_secret_creation_time.unwrap_or_else(now_nanos),
            used_one_time_pre_key: handshake.one_time_pre_key.clone(),
            used_signed_pre_key: handshake.signed_pre_key.clone(),
            ephemeral_key: handshake.ephemeral_key.clone(),
            ephemeral_key_signature: handshake.ephemeral_key_signature.clone(),
            negotiation_params_id: handshake.negotiation_id.clone(),
        };
        self.shared_secrets.put(partner, &secret).await?;

        tracing::info!(
            "Accepted handshake {} from {}",
            handshake.negotiation_id,
            hex::encode(&partner[..4])
        );
        Ok(secret)
    }

    // ========================================================================
    // Pre-keys
    // ========================================================================

    /// Generate, store and sign `count` one-time pre-keys
    pub async fn replenish_one_time_pre_keys(&self, count: u32) -> CoreResult<Vec<OneTimePreKey>> {
        if count > self.max_one_time_pre_keys {
            return Err(CoreError::Validation(format!(
                "can't generate more than {} one-time pre-keys at once",
                self.max_one_time_pre_keys
            )));
        }

        let pairs: Vec<(u32, Curve25519KeyPair)> = (0..count)
            .map(|_| (rand::random::<u32>(), Curve25519KeyPair::generate()))
            .collect();
        self.pre_keys.put_one_time_pre_keys(&pairs).await?;

        Ok(pairs
            .iter()
            .map(|(key_id, pair)| OneTimePreKey::sign(*key_id, pair, self.key_manager.as_ref()))
            .collect())
    }

    /// Upload the current signed pre-key, creating one if we have none
    pub async fn publish_signed_pre_key(&self) -> CoreResult<SignedPreKey> {
        let signed = match self.pre_keys.current_signed_pre_key().await? {
            Some(signed) => signed,
            None => self.create_signed_pre_key().await?,
        };
        self.upload(&signed).await?;
        Ok(signed)
    }

    /// Replace the signed pre-key; issued one-time pre-keys stay valid
    pub async fn rotate_signed_pre_key(&self) -> CoreResult<SignedPreKey> {
        let signed = self.create_signed_pre_key().await?;
        self.upload(&signed).await?;
        tracing::info!("Rotated signed pre-key to {}", signed.key_id);
        Ok(signed)
    }

    async fn create_signed_pre_key(&self) -> CoreResult<SignedPreKey> {
        let key_id = self.pre_keys.next_signed_pre_key_id().await?;
        let pair = Curve25519KeyPair::generate();
        let signed = SignedPreKey::sign(key_id, &pair, self.key_manager.as_ref());
        self.pre_keys.save_signed_pre_key(&pair, &signed).await?;
        Ok(signed)
    }

    async fn upload(&self, signed: &SignedPreKey) -> CoreResult<()> {
        let chat_identity_key = self.key_manager.chat_id_key_pair().public_key_bytes().to_vec();
        let chat_identity_key_signature = self.key_manager.identity_sign(&chat_identity_key);
        self.backend
            .publish_signed_pre_key(PublishedKeys {
                signed_pre_key: signed.clone(),
                chat_identity_key,
                chat_identity_key_signature,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendMessage, ChannelTransport, RemoteEnd, Request, Response};
    use crate::crypto::{LocalKeyManager, PreKeyBundle};
    use crate::db::{test_pool, LocalKeyStore};
    use crate::error::ErrorKind;
    use crate::models::MessageEvent;
    use tokio::sync::mpsc;

    fn config() -> CoreConfig {
        CoreConfig {
            auth_poll_interval_ms: 10,
            request_timeout_secs: 5,
            ..CoreConfig::default()
        }
    }

    struct Party {
        coordinator: Arc<SessionCoordinator>,
        identity: [u8; 32],
        events: mpsc::UnboundedReceiver<MessageEvent>,
    }

    async fn party() -> (Party, RemoteEnd) {
        let db = test_pool().await;
        let km: Arc<dyn KeyManager> = Arc::new(LocalKeyManager::generate());
        let (transport, inbound, remote) = ChannelTransport::pair(64);
        let backend = Backend::new(Arc::new(transport), inbound, km.clone(), &config());
        let key_store = Arc::new(LocalKeyStore::new(db.clone(), km.clone()));
        let messages = MessageStore::new(db.clone(), km.clone());

        let (tx, events) = mpsc::unbounded_channel();
        messages.add_listener(Arc::new(move |event: MessageEvent| {
            let _ = tx.send(event);
        }));

        let coordinator = SessionCoordinator::start(db, km.clone(), backend, key_store, messages, &config());
        let party = Party {
            coordinator,
            identity: km.identity_public_key(),
            events,
        };
        (party, remote)
    }

    /// Next event for a received message
    async fn next_received(events: &mut mpsc::UnboundedReceiver<MessageEvent>) -> MessageEvent {
        loop {
            let event = events.recv().await.unwrap();
            if event.message.received {
                return event;
            }
        }
    }

    /// Relays between two clients and serves published keys
    #[derive(Default)]
    struct Directory {
        published: HashMap<Vec<u8>, PublishedKeys>,
        one_time: HashMap<Vec<u8>, Vec<OneTimePreKey>>,
        forward: bool,
        submitted: Vec<ChatMessage>,
    }

    fn answer(directory: &Mutex<Directory>, from: &[u8; 32], request: Request) -> Option<(Response, Option<ChatMessage>)> {
        let mut dir = directory.lock().unwrap();
        match request {
            Request::PublishSignedPreKey(keys) => {
                dir.published.insert(from.to_vec(), keys);
                Some((Response::Ack, None))
            }
            Request::PreKeyBundle(identity) => {
                let keys = dir.published.get(&identity)?.clone();
                let one_time_pre_key = dir.one_time.get_mut(&identity).and_then(|keys| keys.pop());
                Some((
                    Response::PreKeyBundle(Box::new(PreKeyBundle {
                        identity_key: identity,
                        chat_identity_key: keys.chat_identity_key,
                        chat_identity_key_signature: keys.chat_identity_key_signature,
                        signed_pre_key: keys.signed_pre_key,
                        one_time_pre_key,
                    })),
                    None,
                ))
            }
            Request::SignedPreKey(identity) => {
                let keys = dir.published.get(&identity)?;
                Some((Response::SignedPreKey(keys.signed_pre_key.clone()), None))
            }
            Request::SubmitMessage(message) => {
                dir.submitted.push((*message).clone());
                let relay = if dir.forward { Some(*message) } else { None };
                Some((Response::Ack, relay))
            }
            _ => None,
        }
    }

    async fn serve(
        directory: Arc<Mutex<Directory>>,
        mut a: RemoteEnd,
        a_id: [u8; 32],
        mut b: RemoteEnd,
        b_id: [u8; 32],
    ) {
        a.send(BackendMessage::request("auth-a".to_string(), Request::Auth(vec![1; 32])))
            .await
            .unwrap();
        b.send(BackendMessage::request("auth-b".to_string(), Request::Auth(vec![2; 32])))
            .await
            .unwrap();
        let (to_a, to_b) = (a.sender(), b.sender());

        loop {
            let (from, message) = tokio::select! {
                Some(m) = a.recv() => (a_id, m),
                Some(m) = b.recv() => (b_id, m),
                else => return,
            };
            let Some(request) = message.request else { continue };
            let Some((response, relay)) = answer(&directory, &from, request) else {
                continue;
            };

            let (reply_to, other) = if from == a_id { (&to_a, &to_b) } else { (&to_b, &to_a) };
            let _ = reply_to
                .send(BackendMessage::response(message.request_id, response))
                .await;
            if let Some(chat) = relay {
                let _ = other
                    .send(BackendMessage::request(
                        uuid::Uuid::new_v4().to_string(),
                        Request::Messages(vec![chat]),
                    ))
                    .await;
            }
        }
    }

    async fn pair_up() -> (Party, Party, Arc<Mutex<Directory>>) {
        let (alice, alice_remote) = party().await;
        let (bob, bob_remote) = party().await;
        let directory = Arc::new(Mutex::new(Directory {
            forward: true,
            ..Directory::default()
        }));
        tokio::spawn(serve(
            directory.clone(),
            alice_remote,
            alice.identity,
            bob_remote,
            bob.identity,
        ));

        alice.coordinator.publish_signed_pre_key().await.unwrap();
        bob.coordinator.publish_signed_pre_key().await.unwrap();
        let otks = bob.coordinator.replenish_one_time_pre_keys(2).await.unwrap();
        directory.lock().unwrap().one_time.insert(bob.identity.to_vec(), otks);

        (alice, bob, directory)
    }

    #[tokio::test]
    async fn test_two_party_exchange() {
        let (alice, mut bob, _directory) = pair_up().await;

        let sent = alice
            .coordinator
            .send_message(&bob.identity, b"hello bob".to_vec())
            .await
            .unwrap();
        assert_eq!(sent.status, Status::Sent);

        let event = next_received(&mut bob.events).await;
        assert_eq!(event.partner, alice.identity);
        assert_eq!(event.message.message, b"hello bob");
        assert_eq!(event.message.id, sent.id);
        assert_eq!(bob.coordinator.pre_keys().count_one_time_pre_keys().await.unwrap(), 1);

        let alice_secret = alice
            .coordinator
            .shared_secrets()
            .get_youngest(&bob.identity)
            .await
            .unwrap()
            .unwrap();
        assert!(!alice_secret.accepted);

        let mut alice = alice;
        bob.coordinator
            .send_message(&alice.identity, b"hi alice".to_vec())
            .await
            .unwrap();
        let event = next_received(&mut alice.events).await;
        assert_eq!(event.message.message, b"hi alice");

        let alice_secret = alice
            .coordinator
            .shared_secrets()
            .get_youngest(&bob.identity)
            .await
            .unwrap()
            .unwrap();
        assert!(alice_secret.accepted);

        // No handshake once accepted
        alice
            .coordinator
            .send_message(&bob.identity, b"again".to_vec())
            .await
            .unwrap();
        let event = next_received(&mut bob.events).await;
        assert_eq!(event.message.message, b"again");

        let history = alice.coordinator.messages().messages(&bob.identity, 0, 10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.windows(2).all(|w| w[0].database_id < w[1].database_id));
    }

    #[tokio::test]
    async fn test_batch_failure_isolation() {
        let (alice, bob, directory) = pair_up().await;
        directory.lock().unwrap().forward = false;

        alice
            .coordinator
            .send_message(&bob.identity, b"first".to_vec())
            .await
            .unwrap();
        let genuine = directory.lock().unwrap().submitted[0].clone();
        let mut tampered = genuine.clone();
        tampered.message_id = "tampered".to_string();
        if let Some(byte) = tampered.double_ratchet_message.ciphertext.last_mut() {
            *byte ^= 0x01;
        }

        let results = bob
            .coordinator
            .handle_batch(vec![tampered, genuine.clone()])
            .await;
        assert!(results[0].is_err());
        assert_eq!(results[1].as_ref().unwrap().message, b"first");

        let history = bob.coordinator.messages().messages(&alice.identity, 0, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        let failed: Vec<_> = history.iter().filter(|m| m.status == Status::FailedToHandle).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "tampered");
        assert!(failed[0].raw.is_some());
    }

    #[tokio::test]
    async fn test_rejected_payload_marked_failed_to_handle() {
        let (alice, bob, directory) = pair_up().await;
        directory.lock().unwrap().forward = false;

        alice
            .coordinator
            .send_message(&bob.identity, b"first".to_vec())
            .await
            .unwrap();
        let genuine = directory.lock().unwrap().submitted[0].clone();
        bob.coordinator.handle_received(genuine).await.unwrap();

        let secret = alice
            .coordinator
            .shared_secrets()
            .get_youngest(&bob.identity)
            .await
            .unwrap()
            .unwrap();
        // Seconds instead of nanoseconds: decrypts fine, fails message validation
        let stale_clock = RatchetPayload {
            id: "stale-clock".to_string(),
            created_at: 1_700_000_000,
            message: b"hi".to_vec(),
            dapp_message: None,
        };
        let sealed = alice
            .coordinator
            .seal(&bob.identity, &secret, &stale_clock)
            .await
            .unwrap();

        let err = bob.coordinator.handle_received(sealed).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let history = bob.coordinator.messages().messages(&alice.identity, 0, 10).await.unwrap();
        let failed: Vec<_> = history.iter().filter(|m| m.status == Status::FailedToHandle).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "stale-clock");
        assert!(failed[0].raw.is_some());

        // The ratchet moved past the rejected message
        let next = RatchetPayload {
            id: "after".to_string(),
            created_at: now_nanos(),
            message: b"still here".to_vec(),
            dapp_message: None,
        };
        let sealed = alice.coordinator.seal(&bob.identity, &secret, &next).await.unwrap();
        let stored = bob.coordinator.handle_received(sealed).await.unwrap();
        assert_eq!(stored.message, b"still here");
    }

    #[tokio::test]
    async fn test_handshake_reusing_base_id_rejected() {
        let (alice, bob, directory) = pair_up().await;
        directory.lock().unwrap().forward = false;

        alice
            .coordinator
            .send_message(&bob.identity, b"first".to_vec())
            .await
            .unwrap();
        let genuine = directory.lock().unwrap().submitted[0].clone();
        bob.coordinator.handle_received(genuine.clone()).await.unwrap();

        let base_id = genuine.shared_secret_base_id.clone().unwrap();
        let original = bob
            .coordinator
            .shared_secrets()
            .get(&alice.identity, &base_id)
            .await
            .unwrap()
            .unwrap();
        let one_time_left = bob.coordinator.pre_keys().count_one_time_pre_keys().await.unwrap();

        let mut replayed = genuine;
        replayed.message_id = "replayed".to_string();
        if let Some(handshake) = replayed.handshake.as_mut() {
            handshake.negotiation_id = "ffffffffffffffffffffffffffffffff".to_string();
        }

        let err = bob.coordinator.handle_received(replayed).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let kept = bob
            .coordinator
            .shared_secrets()
            .get(&alice.identity, &base_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept, original);
        assert_eq!(
            bob.coordinator.pre_keys().count_one_time_pre_keys().await.unwrap(),
            one_time_left
        );
    }

    #[tokio::test]
    async fn test_send_failure_recorded() {
        let (alice, _remote) = party().await;
        alice.coordinator.backend.close().await.unwrap();

        let err = alice
            .coordinator
            .send_message(&[7u8; 32], b"nobody home".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);

        let history = alice.coordinator.messages().messages(&[7u8; 32], 0, 1).await.unwrap();
        assert_eq!(history[0].status, Status::FailedToSend);
    }

    #[tokio::test]
    async fn test_invalid_partner_signed_pre_key_rejected() {
        let (alice, bob, directory) = pair_up().await;

        let mut stale = directory.lock().unwrap().published[&bob.identity.to_vec()]
            .signed_pre_key
            .clone();
        stale.created_at -= 30 * 24 * 60 * 60;
        alice
            .coordinator
            .users
            .put_signed_pre_key(&bob.identity, &stale)
            .await
            .unwrap();

        // The refresh returns a key whose signature no longer verifies
        directory
            .lock()
            .unwrap()
            .published
            .get_mut(&bob.identity.to_vec())
            .unwrap()
            .signed_pre_key
            .signature[0] ^= 0xFF;

        let err = alice
            .coordinator
            .partner_signed_pre_key(&bob.identity)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crypto);

        let cached = alice.coordinator.users.get_signed_pre_key(&bob.identity).await.unwrap();
        assert_eq!(cached, Some(stale));
    }

    #[tokio::test]
    async fn test_one_time_pre_key_limit() {
        let (bob, mut remote) = party().await;
        remote
            .send(BackendMessage::request("auth".to_string(), Request::Auth(vec![3; 32])))
            .await
            .unwrap();
        remote.recv().await.unwrap();

        remote
            .send(BackendMessage::request("too-many".to_string(), Request::NewOneTimePreKeys(101)))
            .await
            .unwrap();
        let reply = remote.recv().await.unwrap();
        assert_eq!(reply.request_id, "too-many");
        assert!(reply.response.is_none());
        assert!(reply.error.unwrap().contains("100"));

        remote
            .send(BackendMessage::request("ok".to_string(), Request::NewOneTimePreKeys(100)))
            .await
            .unwrap();
        let reply = remote.recv().await.unwrap();
        let Some(Response::OneTimePreKeys(keys)) = reply.response else {
            panic!("expected one-time pre-keys");
        };
        assert_eq!(keys.len(), 100);
        for key in &keys {
            crate::crypto::keys::verify_signature(&bob.identity, &key.public_key, &key.signature).unwrap();
        }
        assert_eq!(bob.coordinator.pre_keys().count_one_time_pre_keys().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_rotation_keeps_one_time_pre_keys() {
        let (alice, bob, directory) = pair_up().await;
        let first = directory.lock().unwrap().published[&bob.identity.to_vec()].signed_pre_key.clone();
        let second = bob.coordinator.rotate_signed_pre_key().await.unwrap();
        assert_ne!(first.public_key, second.public_key);
        assert_eq!(bob.coordinator.pre_keys().count_one_time_pre_keys().await.unwrap(), 2);

        let mut bob = bob;
        alice
            .coordinator
            .send_message(&bob.identity, b"after rotation".to_vec())
            .await
            .unwrap();
        let event = next_received(&mut bob.events).await;
        assert_eq!(event.message.message, b"after rotation");
    }
}
