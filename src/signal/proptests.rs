//! Property-based tests for the signal side
//!
//! Tests for:
//! - Pre-keys: contiguous IDs, disjoint allocations, signed pre-key signatures
//! - Provisioning cipher: any tampered tag is an integrity failure
//! - Framing: codec round trip for arbitrary requests

use super::engine::SoftwareEngine;
use super::keys::IdentityKeyPair;
use super::prekeys::{generate_pre_keys, PreKeyIdAllocator, MAX_PRE_KEY_ID};
use super::provisioning::{seal_provision_message, CipherError, ProvisioningCipher};
use super::traits::IdentityKind;
use super::transport::{decode_frame, encode_frame, Frame, RequestEnvelope};
use crate::proto::ProvisionMessage;
use proptest::prelude::*;
use std::collections::HashSet;

// ============================================================================
// PRE-KEY PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: a batch from offset `s` with count `n` holds exactly
    /// `s..s+n`, pairwise distinct.
    #[test]
    fn batch_ids_are_contiguous_from_offset(
        start in 0u32..(MAX_PRE_KEY_ID - 200),
        count in 1u32..150,
    ) {
        let engine = SoftwareEngine::new();
        let identity = IdentityKeyPair::generate();

        let batch = generate_pre_keys(&engine, &identity, IdentityKind::Aci, start, 0, count).unwrap();
        let ids: Vec<u32> = batch.ids().collect();

        prop_assert_eq!(ids.clone(), (start..start + count).collect::<Vec<_>>());
        prop_assert_eq!(ids.iter().collect::<HashSet<_>>().len(), count as usize);
    }

    /// Property: successive allocations never overlap
    #[test]
    fn allocator_batches_are_disjoint(
        start in 0u32..1000,
        counts in prop::collection::vec(1u32..40, 1..6),
    ) {
        let engine = SoftwareEngine::new();
        let identity = IdentityKeyPair::generate();
        let mut allocator = PreKeyIdAllocator::new(start, 0);

        let mut seen = HashSet::new();
        let mut signed = HashSet::new();
        for count in counts {
            let batch = allocator
                .next_batch(&engine, &identity, IdentityKind::Pni, count)
                .unwrap();
            for id in batch.ids() {
                prop_assert!(seen.insert(id), "id {} issued twice", id);
            }
            prop_assert!(signed.insert(batch.signed.id));
        }
    }

    /// Property: the signed pre-key signature verifies against the identity
    /// key over the serialized signed pre-key public key
    #[test]
    fn signed_pre_key_signature_verifies(signed_id in 0u32..MAX_PRE_KEY_ID) {
        let engine = SoftwareEngine::new();
        let identity = IdentityKeyPair::generate();

        let batch = generate_pre_keys(&engine, &identity, IdentityKind::Aci, 0, signed_id, 1).unwrap();

        prop_assert!(batch.verify_signed());
        prop_assert!(identity
            .public_key()
            .verify(&batch.signed.public_key.serialize(), &batch.signed.signature)
            .is_ok());

        let other = IdentityKeyPair::generate();
        prop_assert!(other
            .public_key()
            .verify(&batch.signed.public_key.serialize(), &batch.signed.signature)
            .is_err());
    }
}

// ============================================================================
// PROVISIONING CIPHER PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: flipping any bit of the trailing tag yields `Integrity`,
    /// never a decoded message
    #[test]
    fn tampered_tag_is_integrity_error(
        number in "\\+[0-9]{8,14}",
        tag_byte in 0usize..32,
        bit in 0u8..8,
    ) {
        let engine = SoftwareEngine::new();
        let cipher = ProvisioningCipher::new(&engine).unwrap();
        let message = ProvisionMessage {
            number,
            provisioning_code: "code".to_string(),
            ..Default::default()
        };

        let mut envelope = seal_provision_message(cipher.public_key(), &message).unwrap();
        let index = envelope.body.len() - 32 + tag_byte;
        envelope.body[index] ^= 1 << bit;

        prop_assert!(matches!(cipher.decrypt(&envelope), Err(CipherError::Integrity)));
    }
}

// ============================================================================
// FRAMING PROPERTY TESTS
// ============================================================================

proptest! {
    /// Property: any request survives the frame codec unchanged
    #[test]
    fn request_frames_survive_codec(
        id in any::<u64>(),
        verb in "[A-Z]{3,6}",
        path in "/[a-z0-9/]{0,40}",
        body in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let frame = Frame::Request(RequestEnvelope::new(id, verb, path).with_body(body));
        prop_assert_eq!(decode_frame(&encode_frame(frame.clone())).unwrap(), frame);
    }
}
