//! Pre-key batches
//!
//! A batch holds `count` one-time pre-keys with contiguous IDs from a
//! caller-supplied offset plus one signed pre-key, for one identity
//! namespace. Private halves stay inside the engine; the batch carries
//! only what the key directory needs.

use super::keys::{IdentityKeyPair, IdentityPublicKey, PublicKey, Signature};
use super::traits::{EngineError, IdentityKind, ProtocolEngine};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of one-time pre-keys uploaded per registration cycle.
pub const DEFAULT_PRE_KEY_COUNT: u32 = 100;

/// Pre-key IDs are 24-bit on the server.
pub const MAX_PRE_KEY_ID: u32 = 0x00FF_FFFF;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PreKeyError {
    #[error("Pre-key range {start}+{count} exceeds the maximum ID {max}")]
    RangeExhausted { start: u32, count: u32, max: u32 },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyEntry {
    pub id: u32,
    pub public_key: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPreKeyEntry {
    pub id: u32,
    pub public_key: PublicKey,
    pub signature: Signature,
    /// Milliseconds since the epoch
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct PreKeyBatch {
    pub ordinary: Vec<PreKeyEntry>,
    pub signed: SignedPreKeyEntry,
    pub identity_key: IdentityPublicKey,
}

impl PreKeyBatch {
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.ordinary.iter().map(|k| k.id)
    }

    /// Whether the signed pre-key's signature verifies against the
    /// identity key.
    pub fn verify_signed(&self) -> bool {
        self.identity_key
            .verify(&self.signed.public_key.serialize(), &self.signed.signature)
            .is_ok()
    }

    /// JSON body for `PUT /v2/keys`.
    pub fn to_upload(&self) -> PreKeyUpload {
        PreKeyUpload {
            pre_keys: self
                .ordinary
                .iter()
                .map(|k| PreKeyJson {
                    key_id: k.id,
                    public_key: BASE64.encode(k.public_key.serialize()),
                })
                .collect(),
            signed_pre_key: SignedPreKeyJson {
                key_id: self.signed.id,
                public_key: BASE64.encode(self.signed.public_key.serialize()),
                signature: BASE64.encode(self.signed.signature.as_bytes()),
            },
            identity_key: BASE64.encode(self.identity_key.serialize()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyJson {
    pub key_id: u32,
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyJson {
    pub key_id: u32,
    pub public_key: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyUpload {
    pub pre_keys: Vec<PreKeyJson>,
    pub signed_pre_key: SignedPreKeyJson,
    pub identity_key: String,
}

fn id_range(start: u32, count: u32) -> Result<Range<u32>, PreKeyError> {
    let exhausted = PreKeyError::RangeExhausted {
        start,
        count,
        max: MAX_PRE_KEY_ID,
    };
    let end = start.checked_add(count).ok_or(exhausted.clone())?;
    if count > 0 && end - 1 > MAX_PRE_KEY_ID {
        return Err(exhausted);
    }
    Ok(start..end)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Generate one batch for `kind`.
///
/// One-time IDs are exactly `start..start + count`. The signed pre-key uses
/// `signed_id`.
pub fn generate_pre_keys(
    engine: &dyn ProtocolEngine,
    identity: &IdentityKeyPair,
    kind: IdentityKind,
    start: u32,
    signed_id: u32,
    count: u32,
) -> Result<PreKeyBatch, PreKeyError> {
    let range = id_range(start, count)?;
    if signed_id > MAX_PRE_KEY_ID {
        return Err(PreKeyError::RangeExhausted {
            start: signed_id,
            count: 1,
            max: MAX_PRE_KEY_ID,
        });
    }

    let ordinary = range
        .map(|id| {
            engine
                .generate_pre_key(kind, id)
                .map(|public_key| PreKeyEntry { id, public_key })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let (public_key, signature) = engine.generate_signed_pre_key(identity, kind, signed_id)?;

    Ok(PreKeyBatch {
        ordinary,
        signed: SignedPreKeyEntry {
            id: signed_id,
            public_key,
            signature,
            timestamp: now_millis(),
        },
        identity_key: identity.public_key(),
    })
}

/// Hands out disjoint ID ranges within one identity namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyIdAllocator {
    next_one_time: u32,
    next_signed: u32,
}

impl PreKeyIdAllocator {
    pub fn new(next_one_time: u32, next_signed: u32) -> Self {
        Self {
            next_one_time,
            next_signed,
        }
    }

    /// Reserve `count` one-time IDs and one signed ID.
    pub fn reserve(&mut self, count: u32) -> Result<(Range<u32>, u32), PreKeyError> {
        let range = id_range(self.next_one_time, count)?;
        let signed = self.next_signed;
        if signed > MAX_PRE_KEY_ID {
            return Err(PreKeyError::RangeExhausted {
                start: signed,
                count: 1,
                max: MAX_PRE_KEY_ID,
            });
        }
        self.next_one_time = range.end;
        self.next_signed = signed + 1;
        Ok((range, signed))
    }

    /// Reserve IDs and generate the batch in one step.
    pub fn next_batch(
        &mut self,
        engine: &dyn ProtocolEngine,
        identity: &IdentityKeyPair,
        kind: IdentityKind,
        count: u32,
    ) -> Result<PreKeyBatch, PreKeyError> {
        let mut reserved = self.clone();
        let (range, signed) = reserved.reserve(count)?;
        let batch = generate_pre_keys(engine, identity, kind, range.start, signed, count)?;
        *self = reserved;
        Ok(batch)
    }
}

/// Allocation state for both namespaces of one device. Persisted with the
/// device so later uploads never reuse an issued ID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyIds {
    pub aci: PreKeyIdAllocator,
    pub pni: PreKeyIdAllocator,
}

impl PreKeyIds {
    pub fn for_kind(&mut self, kind: IdentityKind) -> &mut PreKeyIdAllocator {
        match kind {
            IdentityKind::Aci => &mut self.aci,
            IdentityKind::Pni => &mut self.pni,
        }
    }
}
