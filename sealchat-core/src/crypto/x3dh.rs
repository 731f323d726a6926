//! X3DH (Extended Triple Diffie-Hellman) Key Agreement
//!
//! Allows two parties to establish a shared secret while one of them is offline.
//!
//! ## Protocol Overview
//!
//! 1. Bob publishes his pre-key bundle (identity key, chat identity key,
//!    signed pre-key, one-time pre-key)
//! 2. Alice fetches Bob's bundle from the backend
//! 3. Alice performs X3DH calculations:
//!    - DH1 = DH(CK_A, SPK_B)
//!    - DH2 = DH(EK_A, CK_B)
//!    - DH3 = DH(EK_A, SPK_B)
//!    - DH4 = DH(EK_A, OPK_B) [optional, if one-time pre-key available]
//! 4. Alice derives shared secret: SK = KDF(DH1 || DH2 || DH3 || DH4)
//! 5. Alice piggy-backs a signed [`Handshake`] on her first ratchet message
//! 6. Bob performs the same DH calculations to derive the same shared secret
//!
//! CK is the Curve25519 chat identity held by the key manager; the Ed25519
//! identity key only signs.

use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::crypto::aead;
use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::key_manager::KeyManager;
use crate::crypto::keys::{curve25519_public, verify_signature, Curve25519KeyPair, OneTimePreKey, SignedPreKey};
use crate::error::{CoreError, CoreResult};
use crate::models::SharedSecret;

/// Message type every handshake must carry
pub const PROTOCOL_INITIALISATION: &str = "PROTOCOL_INITIALISATION";

const PROOF_PAYLOAD: &[u8] = b"hi";
const NEGOTIATION_ID_LEN: usize = 16;

/// Result of X3DH key agreement (initiator side)
pub struct X3dhResult {
    /// The derived shared secret (32 bytes)
    pub shared_secret: [u8; 32],
    /// Hex encoded random negotiation id
    pub negotiation_id: String,
    pub ephemeral_public: Vec<u8>,
    pub ephemeral_signature: Vec<u8>,
    pub used_signed_pre_key: Vec<u8>,
    pub used_one_time_pre_key: Option<Vec<u8>>,
}

/// Pre-key bundle fetched from the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    /// The responder's identity public key (Ed25519)
    pub identity_key: Vec<u8>,
    /// The responder's chat identity key (Curve25519)
    pub chat_identity_key: Vec<u8>,
    pub chat_identity_key_signature: Vec<u8>,
    pub signed_pre_key: SignedPreKey,
    /// Optional one-time pre-key (consumed after use)
    #[serde(default)]
    pub one_time_pre_key: Option<OneTimePreKey>,
}

impl PreKeyBundle {
    /// Verify every published key against the identity key
    pub fn verify(&self) -> CryptoResult<()> {
        self.signed_pre_key.verify(&self.identity_key)?;
        verify_signature(
            &self.identity_key,
            &self.chat_identity_key,
            &self.chat_identity_key_signature,
        )?;
        if let Some(otk) = &self.one_time_pre_key {
            if !otk.signature.is_empty() {
                verify_signature(&self.identity_key, &otk.public_key, &otk.signature)?;
            }
        }
        Ok(())
    }
}

/// Private halves the responder needs to answer a handshake
pub struct LocalPreKeyBundle {
    pub chat_identity: Curve25519KeyPair,
    pub signed_pre_key: Curve25519KeyPair,
    pub one_time_pre_key: Option<Curve25519KeyPair>,
}

/// Handshake metadata sent along with the first messages of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub message_type: String,
    pub negotiation_id: String,
    /// Initiator's Ed25519 identity key
    pub identity_key: Vec<u8>,
    pub chat_identity_key: Vec<u8>,
    pub chat_identity_key_signature: Vec<u8>,
    pub ephemeral_key: Vec<u8>,
    pub ephemeral_key_signature: Vec<u8>,
    pub signed_pre_key: Vec<u8>,
    #[serde(default)]
    pub one_time_pre_key: Option<Vec<u8>>,
    /// Constant payload sealed under the derived secret
    #[serde(default)]
    pub proof: Option<Vec<u8>>,
    /// Unix nanoseconds
    pub sent_at: i64,
    #[serde(default)]
    pub signature: Vec<u8>,
}

impl Handshake {
    /// Rebuild the handshake for a persisted, not yet accepted secret
    pub fn piggyback(key_manager: &dyn KeyManager, secret: &SharedSecret) -> CryptoResult<Self> {
        build_handshake(
            key_manager,
            secret.negotiation_params_id.clone(),
            secret.ephemeral_key.clone(),
            secret.ephemeral_key_signature.clone(),
            secret.used_signed_pre_key.clone(),
            secret.used_one_time_pre_key.clone(),
            &secret.secret,
        )
    }

    /// Canonical bytes covered by `signature`
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(512);
        push_field(&mut out, self.message_type.as_bytes());
        push_field(&mut out, self.negotiation_id.as_bytes());
        push_field(&mut out, &self.identity_key);
        push_field(&mut out, &self.chat_identity_key);
        push_field(&mut out, &self.chat_identity_key_signature);
        push_field(&mut out, &self.ephemeral_key);
        push_field(&mut out, &self.ephemeral_key_signature);
        push_field(&mut out, &self.signed_pre_key);
        push_field(&mut out, self.one_time_pre_key.as_deref().unwrap_or_default());
        push_field(&mut out, self.proof.as_deref().unwrap_or_default());
        push_field(&mut out, &self.sent_at.to_be_bytes());
        out
    }
}

/// Run X3DH against a peer's published bundle
///
/// Nothing is persisted here; the caller stores the resulting secret.
pub fn initiate_session(
    key_manager: &dyn KeyManager,
    their_bundle: &PreKeyBundle,
) -> CoreResult<(Handshake, X3dhResult)> {
    their_bundle.verify()?;

    let their_chat_identity = curve25519_public(&their_bundle.chat_identity_key)?;
    let their_signed_pre_key = their_bundle.signed_pre_key.get_public_key()?;
    let their_one_time_pre_key = their_bundle
        .one_time_pre_key
        .as_ref()
        .map(|otk| otk.get_public_key())
        .transpose()?;

    let ephemeral = Curve25519KeyPair::generate();
    let chat_identity = key_manager.chat_id_key_pair();

    let dh1 = chat_identity.diffie_hellman(&their_signed_pre_key);
    let dh2 = ephemeral.diffie_hellman(&their_chat_identity);
    let dh3 = ephemeral.diffie_hellman(&their_signed_pre_key);
    let dh4 = their_one_time_pre_key.map(|otk| ephemeral.diffie_hellman(&otk));

    let shared_secret = kdf_x3dh(&dh1, &dh2, &dh3, dh4.as_ref())?;

    let mut negotiation_id = [0u8; NEGOTIATION_ID_LEN];
    rand::thread_rng().fill_bytes(&mut negotiation_id);

    let ephemeral_public = ephemeral.public_key_bytes().to_vec();
    let ephemeral_signature = key_manager.identity_sign(&ephemeral_public);
    let used_one_time_pre_key = their_bundle
        .one_time_pre_key
        .as_ref()
        .map(|otk| otk.public_key.clone());

    let result = X3dhResult {
        shared_secret,
        negotiation_id: hex::encode(negotiation_id),
        ephemeral_public,
        ephemeral_signature,
        used_signed_pre_key: their_bundle.signed_pre_key.public_key.clone(),
        used_one_time_pre_key,
    };

    let handshake = build_handshake(
        key_manager,
        result.negotiation_id.clone(),
        result.ephemeral_public.clone(),
        result.ephemeral_signature.clone(),
        result.used_signed_pre_key.clone(),
        result.used_one_time_pre_key.clone(),
        &result.shared_secret,
    )?;

    Ok((handshake, result))
}

/// Derive the initiator's secret from a received handshake
pub fn accept_session(handshake: &Handshake, local: &LocalPreKeyBundle) -> CoreResult<[u8; 32]> {
    if handshake.message_type != PROTOCOL_INITIALISATION {
        return Err(CoreError::Validation(format!(
            "invalid handshake message type: {}",
            handshake.message_type
        )));
    }
    if handshake.ephemeral_key.is_empty() {
        return Err(CoreError::Validation("handshake is missing the ephemeral key".to_string()));
    }
    if handshake.identity_key.is_empty() || handshake.chat_identity_key.is_empty() {
        return Err(CoreError::Validation("handshake is missing the remote identity".to_string()));
    }

    verify_signature(&handshake.identity_key, &handshake.signing_bytes(), &handshake.signature)?;
    verify_signature(
        &handshake.identity_key,
        &handshake.ephemeral_key,
        &handshake.ephemeral_key_signature,
    )?;
    verify_signature(
        &handshake.identity_key,
        &handshake.chat_identity_key,
        &handshake.chat_identity_key_signature,
    )?;

    if local.signed_pre_key.public_key_bytes()[..] != handshake.signed_pre_key[..] {
        return Err(CoreError::Validation(
            "handshake references an unknown signed pre-key".to_string(),
        ));
    }
    let one_time_pre_key = match (&handshake.one_time_pre_key, &local.one_time_pre_key) {
        (None, None) => None,
        (Some(referenced), Some(pair)) if pair.public_key_bytes()[..] == referenced[..] => Some(pair),
        (Some(_), None) => {
            return Err(CoreError::NotFound("one-time pre-key for handshake".to_string()));
        }
        _ => {
            return Err(CoreError::Validation(
                "handshake one-time pre-key does not match".to_string(),
            ));
        }
    };

    let their_chat_identity = curve25519_public(&handshake.chat_identity_key)?;
    let their_ephemeral = curve25519_public(&handshake.ephemeral_key)?;

    let dh1 = local.signed_pre_key.diffie_hellman(&their_chat_identity);
    let dh2 = local.chat_identity.diffie_hellman(&their_ephemeral);
    let dh3 = local.signed_pre_key.diffie_hellman(&their_ephemeral);
    let dh4 = one_time_pre_key.map(|otk| otk.diffie_hellman(&their_ephemeral));

    let shared_secret = kdf_x3dh(&dh1, &dh2, &dh3, dh4.as_ref())?;

    if let Some(proof) = &handshake.proof {
        let key = proof_key(&shared_secret)?;
        let opened = aead::open(&key, proof, handshake.negotiation_id.as_bytes())
            .map_err(|_| CryptoError::X3dhError("handshake proof does not match".to_string()))?;
        if opened != PROOF_PAYLOAD {
            return Err(CryptoError::X3dhError("handshake proof does not match".to_string()).into());
        }
    }

    Ok(shared_secret)
}

fn build_handshake(
    key_manager: &dyn KeyManager,
    negotiation_id: String,
    ephemeral_key: Vec<u8>,
    ephemeral_key_signature: Vec<u8>,
    signed_pre_key: Vec<u8>,
    one_time_pre_key: Option<Vec<u8>>,
    shared_secret: &[u8; 32],
) -> CryptoResult<Handshake> {
    let chat_identity_key = key_manager.chat_id_key_pair().public_key_bytes().to_vec();
    let proof = aead::seal(&proof_key(shared_secret)?, PROOF_PAYLOAD, negotiation_id.as_bytes())?;

    let mut handshake = Handshake {
        message_type: PROTOCOL_INITIALISATION.to_string(),
        negotiation_id,
        identity_key: key_manager.identity_public_key().to_vec(),
        chat_identity_key_signature: key_manager.identity_sign(&chat_identity_key),
        chat_identity_key,
        ephemeral_key,
        ephemeral_key_signature,
        signed_pre_key,
        one_time_pre_key,
        proof: Some(proof),
        sent_at: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        signature: Vec::new(),
    };
    handshake.signature = key_manager.identity_sign(&handshake.signing_bytes());
    Ok(handshake)
}

fn push_field(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn proof_key(shared_secret: &[u8; 32]) -> CryptoResult<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(b"SealChat X3DH proof v1", &mut key)
        .map_err(|e| CryptoError::KeyExchangeFailed(format!("HKDF expansion failed: {}", e)))?;
    Ok(key)
}

/// KDF for combining X3DH DH outputs into a shared secret
fn kdf_x3dh(
    dh1: &[u8; 32],
    dh2: &[u8; 32],
    dh3: &[u8; 32],
    dh4: Option<&[u8; 32]>,
) -> CryptoResult<[u8; 32]> {
    let mut input = zeroize::Zeroizing::new(Vec::with_capacity(if dh4.is_some() { 160 } else { 128 }));

    // 32 bytes of 0xFF domain separation
    input.extend_from_slice(&[0xFF; 32]);
    input.extend_from_slice(dh1);
    input.extend_from_slice(dh2);
    input.extend_from_slice(dh3);

    if let Some(dh4_bytes) = dh4 {
        input.extend_from_slice(dh4_bytes);
    }

    let hkdf = Hkdf::<Sha256>::new(None, &input);
    let mut output = [0u8; 32];
    hkdf.expand(b"SealChat X3DH v1", &mut output)
        .map_err(|e| CryptoError::KeyExchangeFailed(format!("HKDF expansion failed: {}", e)))?;

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_manager::LocalKeyManager;
    use crate::error::ErrorKind;

    struct Responder {
        km: LocalKeyManager,
        signed_pre_key: Curve25519KeyPair,
        one_time_pre_key: Curve25519KeyPair,
    }

    impl Responder {
        fn new() -> Self {
            Self {
                km: LocalKeyManager::generate(),
                signed_pre_key: Curve25519KeyPair::generate(),
                one_time_pre_key: Curve25519KeyPair::generate(),
            }
        }

        fn bundle(&self, with_otk: bool) -> PreKeyBundle {
            let chat_identity_key = self.km.chat_id_key_pair().public_key_bytes().to_vec();
            PreKeyBundle {
                identity_key: self.km.identity_public_key().to_vec(),
                chat_identity_key_signature: self.km.identity_sign(&chat_identity_key),
                chat_identity_key,
                signed_pre_key: SignedPreKey::sign(1, &self.signed_pre_key, &self.km),
                one_time_pre_key: with_otk
                    .then(|| OneTimePreKey::sign(7, &self.one_time_pre_key, &self.km)),
            }
        }

        fn private(&self, with_otk: bool) -> LocalPreKeyBundle {
            LocalPreKeyBundle {
                chat_identity: self.km.chat_id_key_pair(),
                signed_pre_key: self.signed_pre_key.clone(),
                one_time_pre_key: with_otk.then(|| self.one_time_pre_key.clone()),
            }
        }
    }

    #[test]
    fn test_x3dh_key_agreement() {
        let alice = LocalKeyManager::generate();
        let bob = Responder::new();

        let (handshake, result) = initiate_session(&alice, &bob.bundle(true)).unwrap();
        let secret = accept_session(&handshake, &bob.private(true)).unwrap();

        assert_eq!(result.shared_secret, secret);
        assert_eq!(result.negotiation_id.len(), 32);
        assert_eq!(
            result.used_one_time_pre_key,
            Some(bob.one_time_pre_key.public_key_bytes().to_vec())
        );
    }

    #[test]
    fn test_x3dh_without_one_time_prekey() {
        let alice = LocalKeyManager::generate();
        let bob = Responder::new();

        let (handshake, result) = initiate_session(&alice, &bob.bundle(false)).unwrap();
        let secret = accept_session(&handshake, &bob.private(false)).unwrap();

        assert_eq!(result.shared_secret, secret);
        assert!(result.used_one_time_pre_key.is_none());
    }

    #[test]
    fn test_flipped_signature_bytes_rejected() {
        let alice = LocalKeyManager::generate();
        let bob = Responder::new();
        let (handshake, _) = initiate_session(&alice, &bob.bundle(true)).unwrap();

        let mut tampered = handshake.clone();
        tampered.signature[10] ^= 0x01;
        assert!(accept_session(&tampered, &bob.private(true)).is_err());

        let mut tampered = handshake.clone();
        tampered.ephemeral_key_signature[0] ^= 0x01;
        assert!(accept_session(&tampered, &bob.private(true)).is_err());

        let mut tampered = handshake;
        tampered.chat_identity_key_signature[63] ^= 0x01;
        let err = accept_session(&tampered, &bob.private(true)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crypto);
    }

    #[test]
    fn test_wrong_type_and_missing_fields() {
        let alice = LocalKeyManager::generate();
        let bob = Responder::new();
        let (handshake, _) = initiate_session(&alice, &bob.bundle(true)).unwrap();

        let mut wrong_type = handshake.clone();
        wrong_type.message_type = "HELLO".to_string();
        let err = accept_session(&wrong_type, &bob.private(true)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let mut missing = handshake;
        missing.ephemeral_key.clear();
        let err = accept_session(&missing, &bob.private(true)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_bundle_verification() {
        let alice = LocalKeyManager::generate();
        let bob = Responder::new();
        let bundle = bob.bundle(true);
        assert!(bundle.verify().is_ok());

        let mut bad_bundle = bundle.clone();
        bad_bundle.signed_pre_key.signature[0] ^= 0xFF;
        let err = initiate_session(&alice, &bad_bundle).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Crypto);

        let mut short_key = bundle;
        short_key.chat_identity_key.truncate(31);
        short_key.chat_identity_key_signature = bob.km.identity_sign(&short_key.chat_identity_key);
        let err = initiate_session(&alice, &short_key).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Crypto);
    }

    #[test]
    fn test_missing_local_one_time_prekey() {
        let alice = LocalKeyManager::generate();
        let bob = Responder::new();
        let (handshake, _) = initiate_session(&alice, &bob.bundle(true)).unwrap();

        let err = accept_session(&handshake, &bob.private(false)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_piggyback_handshake_accepted() {
        let alice = LocalKeyManager::generate();
        let bob = Responder::new();
        let (_, result) = initiate_session(&alice, &bob.bundle(true)).unwrap();

        let secret = SharedSecret::from_x3dh(&result, [3u8; 32]);
        let handshake = Handshake::piggyback(&alice, &secret).unwrap();

        assert_eq!(accept_session(&handshake, &bob.private(true)).unwrap(), result.shared_secret);
    }
}
