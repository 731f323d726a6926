//! Double Ratchet
//!
//! Per-session message encryption with forward secrecy:
//! - root KDF: HKDF-SHA256 over the root key and a fresh DH output
//! - chain KDF: HMAC-SHA256, one step per message
//! - message AEAD: AES-256-GCM with the encoded header as associated data
//!
//! Keys for messages that arrive out of order are parked in a [`KeyStore`]
//! and erased as soon as they are used.

use std::collections::VecDeque;
use std::sync::Arc;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::crypto::aead;
use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::key_store::{KeyStore, MessageKey, SessionKey};
use crate::crypto::keys::{curve25519_public, Curve25519KeyPair};
use crate::error::CoreResult;

type HmacSha256 = Hmac<Sha256>;

/// Maximum number of message keys skipped in one step
pub const MAX_SKIP: u32 = 1000;

/// Receiving chains whose skipped keys are kept
const MAX_RETAINED_CHAINS: usize = 20;

/// Header sent in clear with each ratchet message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    /// Sender's current ratchet public key
    pub ratchet_public_key: [u8; 32],
    /// Message number in the sending chain
    pub n: u32,
    /// Length of the sender's previous sending chain
    pub pn: u32,
}

impl MessageHeader {
    pub fn encode(&self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[..32].copy_from_slice(&self.ratchet_public_key);
        out[32..36].copy_from_slice(&self.n.to_be_bytes());
        out[36..].copy_from_slice(&self.pn.to_be_bytes());
        out
    }
}

/// Serializable ratchet state
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    root_key: [u8; 32],
    self_secret: [u8; 32],
    self_public: [u8; 32],
    remote_public: Option<[u8; 32]>,
    send_chain_key: Option<[u8; 32]>,
    recv_chain_key: Option<[u8; 32]>,
    send_n: u32,
    recv_n: u32,
    prev_send_n: u32,
    #[serde(default)]
    retained_chains: VecDeque<[u8; 32]>,
}

impl RatchetState {
    fn initiator(shared_secret: &[u8; 32], remote_ratchet_key: &[u8]) -> CryptoResult<Self> {
        let remote = curve25519_public(remote_ratchet_key)?;
        let own = Curve25519KeyPair::generate();

        let dh = own.diffie_hellman(&remote);
        let (root_key, send_chain_key) = kdf_rk(shared_secret, &dh)?;

        Ok(Self {
            root_key,
            self_secret: own.secret_key_bytes(),
            self_public: own.public_key_bytes(),
            remote_public: Some(remote.to_bytes()),
            send_chain_key: Some(send_chain_key),
            recv_chain_key: None,
            send_n: 0,
            recv_n: 0,
            prev_send_n: 0,
            retained_chains: VecDeque::new(),
        })
    }

    fn responder(shared_secret: &[u8; 32], own: &Curve25519KeyPair) -> Self {
        Self {
            root_key: *shared_secret,
            self_secret: own.secret_key_bytes(),
            self_public: own.public_key_bytes(),
            remote_public: None,
            send_chain_key: None,
            recv_chain_key: None,
            send_n: 0,
            recv_n: 0,
            prev_send_n: 0,
            retained_chains: VecDeque::new(),
        }
    }

    /// Advance the receiving chain to `until`, collecting the skipped keys
    fn skip_until(&mut self, until: u32, skipped: &mut Vec<(SessionKey, u32, MessageKey)>) -> CryptoResult<()> {
        let (Some(mut chain_key), Some(remote)) = (self.recv_chain_key, self.remote_public) else {
            return Ok(());
        };
        if until.saturating_sub(self.recv_n) > MAX_SKIP {
            return Err(CryptoError::RatchetError(format!(
                "refusing to skip {} message keys",
                until - self.recv_n
            )));
        }

        while self.recv_n < until {
            let (next, message_key) = kdf_ck(&chain_key)?;
            skipped.push((remote, self.recv_n, message_key));
            chain_key = next;
            self.recv_n += 1;
        }
        self.recv_chain_key = Some(chain_key);
        Ok(())
    }

    /// DH ratchet step on a new remote ratchet key; returns chains to forget
    fn dh_ratchet(&mut self, remote_key: &[u8; 32]) -> CryptoResult<Vec<SessionKey>> {
        let remote = curve25519_public(remote_key)?;

        self.prev_send_n = self.send_n;
        self.send_n = 0;
        self.recv_n = 0;
        self.remote_public = Some(*remote_key);

        let own = Curve25519KeyPair::from_secret_bytes(&self.self_secret)?;
        let (root_key, recv_chain_key) = kdf_rk(&self.root_key, &own.diffie_hellman(&remote))?;
        self.root_key = root_key;
        self.recv_chain_key = Some(recv_chain_key);

        let next = Curve25519KeyPair::generate();
        let (root_key, send_chain_key) = kdf_rk(&self.root_key, &next.diffie_hellman(&remote))?;
        self.root_key = root_key;
        self.send_chain_key = Some(send_chain_key);
        self.self_secret.zeroize();
        self.self_secret = next.secret_key_bytes();
        self.self_public = next.public_key_bytes();

        self.retained_chains.push_back(*remote_key);
        let mut evicted = Vec::new();
        while self.retained_chains.len() > MAX_RETAINED_CHAINS {
            if let Some(old) = self.retained_chains.pop_front() {
                evicted.push(old);
            }
        }
        Ok(evicted)
    }
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.self_secret.zeroize();
        if let Some(ref mut k) = self.send_chain_key {
            k.zeroize();
        }
        if let Some(ref mut k) = self.recv_chain_key {
            k.zeroize();
        }
    }
}

/// A Double Ratchet session backed by a key store
pub struct RatchetSession {
    state: RatchetState,
    key_store: Arc<dyn KeyStore>,
}

impl RatchetSession {
    /// Session for the party that ran X3DH; it can send immediately
    pub fn initiator(
        shared_secret: &[u8; 32],
        remote_ratchet_key: &[u8],
        key_store: Arc<dyn KeyStore>,
    ) -> CryptoResult<Self> {
        Ok(Self {
            state: RatchetState::initiator(shared_secret, remote_ratchet_key)?,
            key_store,
        })
    }

    /// Session for the responder; `own` is the signed pre-key the initiator used
    pub fn responder(shared_secret: &[u8; 32], own: &Curve25519KeyPair, key_store: Arc<dyn KeyStore>) -> Self {
        Self {
            state: RatchetState::responder(shared_secret, own),
            key_store,
        }
    }

    pub fn resume(state: RatchetState, key_store: Arc<dyn KeyStore>) -> Self {
        Self { state, key_store }
    }

    pub fn state(&self) -> &RatchetState {
        &self.state
    }

    /// Encrypt and advance the sending chain
    pub fn encrypt(&mut self, plaintext: &[u8]) -> CryptoResult<(MessageHeader, Vec<u8>)> {
        let chain_key = self.state.send_chain_key.ok_or_else(|| {
            CryptoError::RatchetError("session has no sending chain yet".to_string())
        })?;
        let (next, message_key) = kdf_ck(&chain_key)?;

        let header = MessageHeader {
            ratchet_public_key: self.state.self_public,
            n: self.state.send_n,
            pn: self.state.prev_send_n,
        };
        let ciphertext = seal_message(&message_key, &header, plaintext)?;

        self.state.send_chain_key = Some(next);
        self.state.send_n += 1;
        Ok((header, ciphertext))
    }

    /// Decrypt, ratcheting forward as needed
    ///
    /// On failure neither the state nor the key store changes.
    pub async fn decrypt(&mut self, header: &MessageHeader, ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
        if let Some(message_key) = self.key_store.get(&header.ratchet_public_key, header.n).await? {
            let plaintext = open_message(&message_key, header, ciphertext)?;
            self.key_store
                .delete_message_key(&header.ratchet_public_key, header.n)
                .await?;
            return Ok(plaintext);
        }

        let mut working = self.state.clone();
        let mut skipped = Vec::new();
        let mut evicted = Vec::new();

        if working.remote_public != Some(header.ratchet_public_key) {
            working.skip_until(header.pn, &mut skipped)?;
            evicted = working.dh_ratchet(&header.ratchet_public_key)?;
        } else if header.n < working.recv_n {
            return Err(CryptoError::RatchetError(format!(
                "message key {} was already used",
                header.n
            ))
            .into());
        }

        working.skip_until(header.n, &mut skipped)?;

        let chain_key = working.recv_chain_key.ok_or_else(|| {
            CryptoError::RatchetError("session has no receiving chain".to_string())
        })?;
        let (next, message_key) = kdf_ck(&chain_key)?;
        working.recv_chain_key = Some(next);
        working.recv_n += 1;

        let plaintext = open_message(&message_key, header, ciphertext)?;

        for (session_key, msg_num, message_key) in &skipped {
            self.key_store.put(session_key, *msg_num, message_key).await?;
        }
        for session_key in &evicted {
            self.key_store.delete_session_keys(session_key).await?;
        }

        self.state = working;
        Ok(plaintext)
    }
}

fn kdf_rk(root_key: &[u8; 32], dh_output: &[u8; 32]) -> CryptoResult<([u8; 32], [u8; 32])> {
    let hkdf = Hkdf::<Sha256>::new(Some(root_key), dh_output);
    let mut okm = [0u8; 64];
    hkdf.expand(b"SealChat Ratchet v1", &mut okm)
        .map_err(|e| CryptoError::RatchetError(format!("HKDF expansion failed: {}", e)))?;

    let mut root = [0u8; 32];
    let mut chain = [0u8; 32];
    root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((root, chain))
}

/// Returns (next chain key, message key)
fn kdf_ck(chain_key: &[u8; 32]) -> CryptoResult<([u8; 32], [u8; 32])> {
    let step = |constant: u8| -> CryptoResult<[u8; 32]> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(chain_key)
            .map_err(|e| CryptoError::RatchetError(format!("HMAC init failed: {}", e)))?;
        mac.update(&[constant]);
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        Ok(out)
    };

    Ok((step(0x02)?, step(0x01)?))
}

fn message_cipher_key(message_key: &[u8; 32]) -> CryptoResult<([u8; 32], [u8; aead::NONCE_LEN])> {
    let hkdf = Hkdf::<Sha256>::new(None, message_key);
    let mut okm = [0u8; 32 + aead::NONCE_LEN];
    hkdf.expand(b"SealChat Message Keys v1", &mut okm)
        .map_err(|e| CryptoError::RatchetError(format!("HKDF expansion failed: {}", e)))?;

    let mut key = [0u8; 32];
    let mut nonce = [0u8; aead::NONCE_LEN];
    key.copy_from_slice(&okm[..32]);
    nonce.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((key, nonce))
}

fn seal_message(message_key: &[u8; 32], header: &MessageHeader, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let (mut key, nonce) = message_cipher_key(message_key)?;
    let sealed = aead::seal_with_nonce(&key, &nonce, plaintext, &header.encode());
    key.zeroize();
    sealed
}

fn open_message(message_key: &[u8; 32], header: &MessageHeader, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
    let (mut key, nonce) = message_cipher_key(message_key)?;
    let opened = aead::open_with_nonce(&key, &nonce, ciphertext, &header.encode());
    key.zeroize();
    opened
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MemoryKeyStore {
        keys: Mutex<HashMap<SessionKey, HashMap<u32, MessageKey>>>,
    }

    #[async_trait]
    impl KeyStore for MemoryKeyStore {
        async fn get(&self, session_key: &SessionKey, msg_num: u32) -> CoreResult<Option<MessageKey>> {
            let keys = self.keys.lock().await;
            Ok(keys.get(session_key).and_then(|chain| chain.get(&msg_num)).copied())
        }

        async fn put(&self, session_key: &SessionKey, msg_num: u32, message_key: &MessageKey) -> CoreResult<()> {
            let mut keys = self.keys.lock().await;
            keys.entry(*session_key).or_default().insert(msg_num, *message_key);
            Ok(())
        }

        async fn delete_message_key(&self, session_key: &SessionKey, msg_num: u32) -> CoreResult<()> {
            let mut keys = self.keys.lock().await;
            if let Some(chain) = keys.get_mut(session_key) {
                chain.remove(&msg_num);
            }
            Ok(())
        }

        async fn delete_session_keys(&self, session_key: &SessionKey) -> CoreResult<()> {
            self.keys.lock().await.remove(session_key);
            Ok(())
        }

        async fn count(&self, session_key: &SessionKey) -> CoreResult<u64> {
            let keys = self.keys.lock().await;
            Ok(keys.get(session_key).map(|chain| chain.len() as u64).unwrap_or(0))
        }

        async fn all(&self) -> CoreResult<HashMap<SessionKey, HashMap<u32, MessageKey>>> {
            Ok(self.keys.lock().await.clone())
        }
    }

    fn pair() -> (RatchetSession, RatchetSession, Arc<MemoryKeyStore>) {
        let secret = [42u8; 32];
        let bob_spk = Curve25519KeyPair::generate();
        let bob_store = Arc::new(MemoryKeyStore::default());

        let alice = RatchetSession::initiator(
            &secret,
            &bob_spk.public_key_bytes(),
            Arc::new(MemoryKeyStore::default()),
        )
        .unwrap();
        let bob = RatchetSession::responder(&secret, &bob_spk, bob_store.clone());
        (alice, bob, bob_store)
    }

    #[tokio::test]
    async fn test_round_trip_both_directions() {
        let (mut alice, mut bob, _) = pair();

        let (header, ct) = alice.encrypt(b"hello bob").unwrap();
        assert_eq!(bob.decrypt(&header, &ct).await.unwrap(), b"hello bob");

        let (header, ct) = bob.encrypt(b"hello alice").unwrap();
        assert_eq!(alice.decrypt(&header, &ct).await.unwrap(), b"hello alice");

        let (header, ct) = alice.encrypt(b"again").unwrap();
        assert_eq!(header.pn, 1);
        assert_eq!(bob.decrypt(&header, &ct).await.unwrap(), b"again");
    }

    #[tokio::test]
    async fn test_responder_cannot_send_first() {
        let (_, mut bob, _) = pair();
        assert!(bob.encrypt(b"too early").is_err());
    }

    #[tokio::test]
    async fn test_out_of_order_keys_are_single_use() {
        let (mut alice, mut bob, store) = pair();

        let m0 = alice.encrypt(b"zero").unwrap();
        let m1 = alice.encrypt(b"one").unwrap();
        let m2 = alice.encrypt(b"two").unwrap();
        let chain = m0.0.ratchet_public_key;

        assert_eq!(bob.decrypt(&m2.0, &m2.1).await.unwrap(), b"two");
        assert_eq!(store.count(&chain).await.unwrap(), 2);

        assert_eq!(bob.decrypt(&m0.0, &m0.1).await.unwrap(), b"zero");
        assert_eq!(bob.decrypt(&m1.0, &m1.1).await.unwrap(), b"one");
        assert_eq!(store.count(&chain).await.unwrap(), 0);

        // replay after the key was consumed
        assert!(bob.decrypt(&m0.0, &m0.1).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_decrypt_leaves_state_untouched() {
        let (mut alice, mut bob, store) = pair();

        let m0 = alice.encrypt(b"zero").unwrap();
        let m1 = alice.encrypt(b"one").unwrap();

        let mut tampered = m1.1.clone();
        tampered[0] ^= 0x01;
        assert!(bob.decrypt(&m1.0, &tampered).await.is_err());
        assert_eq!(store.count(&m0.0.ratchet_public_key).await.unwrap(), 0);

        assert_eq!(bob.decrypt(&m0.0, &m0.1).await.unwrap(), b"zero");
        assert_eq!(bob.decrypt(&m1.0, &m1.1).await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_too_many_skipped_rejected() {
        let (mut alice, mut bob, _) = pair();
        let (mut header, ct) = alice.encrypt(b"far ahead").unwrap();
        header.n = MAX_SKIP + 1;
        assert!(bob.decrypt(&header, &ct).await.is_err());
    }

    #[tokio::test]
    async fn test_state_survives_serialization() {
        let (mut alice, mut bob, store) = pair();
        let (header, ct) = alice.encrypt(b"first").unwrap();
        bob.decrypt(&header, &ct).await.unwrap();

        let encoded = serde_json::to_vec(bob.state()).unwrap();
        let state: RatchetState = serde_json::from_slice(&encoded).unwrap();
        let mut restored = RatchetSession::resume(state, store);

        let (header, ct) = alice.encrypt(b"second").unwrap();
        assert_eq!(restored.decrypt(&header, &ct).await.unwrap(), b"second");
    }
}
