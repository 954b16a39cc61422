//! In-process Signal Protocol Engine
//!
//! `SoftwareEngine` implements [`ProtocolEngine`] on top of the dalek
//! curves. Pre-key private halves live in its stores; sessions are
//! symmetric HMAC chains keyed from the identity agreement, one per remote
//! identity, with AES-256-GCM per message.
//!
//! Ciphertext layout: `version (1) || counter (4, BE) || nonce (12) || sealed`.

use super::keys::{IdentityKeyPair, IdentityPublicKey, KeyPair, PrivateKey, PublicKey, Signature};
use super::traits::{EngineError, EngineResult, IdentityKind, ProtocolEngine, ServiceId};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use zeroize::Zeroizing;

const SESSION_VERSION: u8 = 1;
const HEADER_LEN: usize = 5;
const NONCE_LEN: usize = 12;

/// Furthest a receiving chain may be advanced for one message.
const MAX_SKIP: u32 = 2000;

const SESSION_INFO: &[u8] = b"bridgehead-session-chains-v1";

type HmacSha256 = Hmac<Sha256>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
struct Chain {
    key: Zeroizing<[u8; 32]>,
    index: u32,
}

impl Chain {
    fn new(key: [u8; 32]) -> Self {
        Self {
            key: Zeroizing::new(key),
            index: 0,
        }
    }

    fn derive(&self, tag: u8) -> EngineResult<[u8; 32]> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key[..])
            .map_err(|e| EngineError::Crypto(e.to_string()))?;
        mac.update(&[tag]);
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        Ok(out)
    }

    /// Advance one step; returns the index used and its message key.
    fn next(&mut self) -> EngineResult<(u32, Zeroizing<[u8; 32]>)> {
        let message_key = Zeroizing::new(self.derive(0x01)?);
        let next_key = self.derive(0x02)?;
        let index = self.index;
        self.key = Zeroizing::new(next_key);
        self.index = self
            .index
            .checked_add(1)
            .ok_or_else(|| EngineError::Crypto("chain exhausted".to_string()))?;
        Ok((index, message_key))
    }
}

#[derive(Clone)]
struct Session {
    sending: Chain,
    receiving: Chain,
    skipped: HashMap<u32, Zeroizing<[u8; 32]>>,
}

impl Session {
    fn new(local: &IdentityKeyPair, remote: &IdentityPublicKey) -> EngineResult<Self> {
        let shared = local.private_key().agree(remote.agreement_key());
        let hk = Hkdf::<Sha256>::new(None, &shared[..]);
        let mut okm = Zeroizing::new([0u8; 64]);
        hk.expand(SESSION_INFO, &mut okm[..])
            .map_err(|e| EngineError::Crypto(e.to_string()))?;

        let mut low = [0u8; 32];
        let mut high = [0u8; 32];
        low.copy_from_slice(&okm[..32]);
        high.copy_from_slice(&okm[32..]);

        // The side with the smaller public key sends on the low chain.
        let (sending, receiving) =
            if local.public_key().serialize() <= remote.serialize() {
                (low, high)
            } else {
                (high, low)
            };

        Ok(Self {
            sending: Chain::new(sending),
            receiving: Chain::new(receiving),
            skipped: HashMap::new(),
        })
    }

    fn message_key_for(&mut self, counter: u32) -> EngineResult<Zeroizing<[u8; 32]>> {
        if counter < self.receiving.index {
            return self.skipped.remove(&counter).ok_or_else(|| {
                EngineError::Malformed(format!("message {} already received", counter))
            });
        }
        if counter - self.receiving.index > MAX_SKIP {
            return Err(EngineError::Malformed(format!(
                "message {} too far ahead of chain",
                counter
            )));
        }
        loop {
            let (index, key) = self.receiving.next()?;
            if index == counter {
                return Ok(key);
            }
            self.skipped.insert(index, key);
        }
    }
}

fn seal(key: &[u8; 32], header: &[u8], plaintext: &[u8]) -> EngineResult<Vec<u8>> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| EngineError::Crypto(e.to_string()))?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: header,
            },
        )
        .map_err(|e| EngineError::Crypto(e.to_string()))?;

    let mut out = Vec::with_capacity(header.len() + NONCE_LEN + sealed.len());
    out.extend_from_slice(header);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn open(key: &[u8; 32], header: &[u8], nonce: &[u8], sealed: &[u8]) -> EngineResult<Vec<u8>> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| EngineError::Crypto(e.to_string()))?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: sealed,
                aad: header,
            },
        )
        .map_err(|_| EngineError::BadMac)
}

/// Default engine: dalek curves, in-memory stores.
#[derive(Default)]
pub struct SoftwareEngine {
    pre_keys: Mutex<HashMap<(IdentityKind, u32), PrivateKey>>,
    signed_pre_keys: Mutex<HashMap<(IdentityKind, u32), PrivateKey>>,
    sessions: Mutex<HashMap<ServiceId, Session>>,
}

impl SoftwareEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of one-time pre-keys held for `kind`.
    pub fn pre_key_count(&self, kind: IdentityKind) -> usize {
        lock(&self.pre_keys).keys().filter(|(k, _)| *k == kind).count()
    }

    pub fn has_signed_pre_key(&self, kind: IdentityKind, id: u32) -> bool {
        lock(&self.signed_pre_keys).contains_key(&(kind, id))
    }

    pub fn has_session(&self, remote: &ServiceId) -> bool {
        lock(&self.sessions).contains_key(remote)
    }
}

impl ProtocolEngine for SoftwareEngine {
    fn generate_identity(&self) -> EngineResult<IdentityKeyPair> {
        Ok(IdentityKeyPair::generate())
    }

    fn generate_key_pair(&self) -> EngineResult<KeyPair> {
        Ok(KeyPair::generate())
    }

    fn generate_pre_key(&self, kind: IdentityKind, id: u32) -> EngineResult<PublicKey> {
        let mut store = lock(&self.pre_keys);
        if store.contains_key(&(kind, id)) {
            return Err(EngineError::DuplicatePreKey(id));
        }
        let private = PrivateKey::generate();
        let public = private.public_key();
        store.insert((kind, id), private);
        Ok(public)
    }

    fn generate_signed_pre_key(
        &self,
        identity: &IdentityKeyPair,
        kind: IdentityKind,
        id: u32,
    ) -> EngineResult<(PublicKey, Signature)> {
        let private = PrivateKey::generate();
        let public = private.public_key();
        let signature = self.sign(identity, &public.serialize())?;
        lock(&self.signed_pre_keys).insert((kind, id), private);
        Ok((public, signature))
    }

    fn sign(&self, identity: &IdentityKeyPair, message: &[u8]) -> EngineResult<Signature> {
        Ok(identity.sign(message))
    }

    fn agree(&self, private: &PrivateKey, public: &PublicKey) -> EngineResult<[u8; 32]> {
        let shared = private.agree(public);
        if shared.iter().all(|b| *b == 0) {
            return Err(EngineError::Crypto("low-order public key".to_string()));
        }
        Ok(*shared)
    }

    fn establish_session(
        &self,
        local: &IdentityKeyPair,
        remote: &ServiceId,
        remote_identity: &IdentityPublicKey,
    ) -> EngineResult<()> {
        let session = Session::new(local, remote_identity)?;
        lock(&self.sessions).insert(remote.clone(), session);
        Ok(())
    }

    fn encrypt_session(&self, remote: &ServiceId, plaintext: &[u8]) -> EngineResult<Vec<u8>> {
        let mut sessions = lock(&self.sessions);
        let session = sessions
            .get_mut(remote)
            .ok_or_else(|| EngineError::NoSession(remote.clone()))?;

        let (counter, key) = session.sending.next()?;
        let mut header = [0u8; HEADER_LEN];
        header[0] = SESSION_VERSION;
        header[1..].copy_from_slice(&counter.to_be_bytes());
        seal(&key, &header, plaintext)
    }

    fn decrypt_session(&self, remote: &ServiceId, ciphertext: &[u8]) -> EngineResult<Vec<u8>> {
        if ciphertext.len() < HEADER_LEN + NONCE_LEN {
            return Err(EngineError::Malformed("ciphertext too short".to_string()));
        }
        let (header, rest) = ciphertext.split_at(HEADER_LEN);
        if header[0] != SESSION_VERSION {
            return Err(EngineError::Malformed(format!(
                "unsupported session version {}",
                header[0]
            )));
        }
        let mut counter_bytes = [0u8; 4];
        counter_bytes.copy_from_slice(&header[1..]);
        let counter = u32::from_be_bytes(counter_bytes);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);

        let mut sessions = lock(&self.sessions);
        let session = sessions
            .get_mut(remote)
            .ok_or_else(|| EngineError::NoSession(remote.clone()))?;

        // Work on a copy so a forged message cannot advance the chain.
        let mut candidate = session.clone();
        let key = candidate.message_key_for(counter)?;
        let plaintext = open(&key, header, nonce, sealed)?;
        *session = candidate;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired() -> (SoftwareEngine, SoftwareEngine, ServiceId, ServiceId) {
        let alice_id = IdentityKeyPair::generate();
        let bob_id = IdentityKeyPair::generate();
        let alice = ServiceId::from("alice");
        let bob = ServiceId::from("bob");

        let alice_engine = SoftwareEngine::new();
        let bob_engine = SoftwareEngine::new();
        alice_engine
            .establish_session(&alice_id, &bob, &bob_id.public_key())
            .unwrap();
        bob_engine
            .establish_session(&bob_id, &alice, &alice_id.public_key())
            .unwrap();
        (alice_engine, bob_engine, alice, bob)
    }

    #[test]
    fn test_session_round_trip_both_directions() {
        let (alice_engine, bob_engine, alice, bob) = paired();

        let to_bob = alice_engine.encrypt_session(&bob, b"hi bob").unwrap();
        assert_eq!(bob_engine.decrypt_session(&alice, &to_bob).unwrap(), b"hi bob");

        let to_alice = bob_engine.encrypt_session(&alice, b"hi alice").unwrap();
        assert_eq!(
            alice_engine.decrypt_session(&bob, &to_alice).unwrap(),
            b"hi alice"
        );
    }

    #[test]
    fn test_out_of_order_delivery() {
        let (alice_engine, bob_engine, alice, bob) = paired();

        let first = alice_engine.encrypt_session(&bob, b"one").unwrap();
        let second = alice_engine.encrypt_session(&bob, b"two").unwrap();

        assert_eq!(bob_engine.decrypt_session(&alice, &second).unwrap(), b"two");
        assert_eq!(bob_engine.decrypt_session(&alice, &first).unwrap(), b"one");
        assert!(bob_engine.decrypt_session(&alice, &first).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_does_not_advance_chain() {
        let (alice_engine, bob_engine, alice, bob) = paired();

        let message = alice_engine.encrypt_session(&bob, b"payload").unwrap();
        let mut forged = message.clone();
        let last = forged.len() - 1;
        forged[last] ^= 0x01;

        assert_eq!(
            bob_engine.decrypt_session(&alice, &forged),
            Err(EngineError::BadMac)
        );
        assert_eq!(bob_engine.decrypt_session(&alice, &message).unwrap(), b"payload");
    }

    #[test]
    fn test_encrypt_without_session_fails() {
        let engine = SoftwareEngine::new();
        let nobody = ServiceId::from("nobody");
        assert_eq!(
            engine.encrypt_session(&nobody, b"x"),
            Err(EngineError::NoSession(nobody))
        );
    }

    #[test]
    fn test_pre_key_ids_are_unique_per_namespace() {
        let engine = SoftwareEngine::new();
        engine.generate_pre_key(IdentityKind::Aci, 7).unwrap();
        engine.generate_pre_key(IdentityKind::Pni, 7).unwrap();

        assert_eq!(
            engine.generate_pre_key(IdentityKind::Aci, 7),
            Err(EngineError::DuplicatePreKey(7))
        );
        assert_eq!(engine.pre_key_count(IdentityKind::Aci), 1);
        assert_eq!(engine.pre_key_count(IdentityKind::Pni), 1);
    }

    #[test]
    fn test_signed_pre_key_signature_covers_serialized_key() {
        let engine = SoftwareEngine::new();
        let identity = engine.generate_identity().unwrap();

        let (public, signature) = engine
            .generate_signed_pre_key(&identity, IdentityKind::Aci, 1)
            .unwrap();

        assert!(identity
            .public_key()
            .verify(&public.serialize(), &signature)
            .is_ok());
        assert!(engine.has_signed_pre_key(IdentityKind::Aci, 1));
    }
}
