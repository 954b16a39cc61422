//! Key material
//!
//! Curve25519 key types shared by the provisioning cipher, pre-key
//! generation and the protocol engine.
//!
//! Public keys travel type-prefixed (`0x05 || 32 bytes`). Identity keys are
//! plain Curve25519 pairs that sign with XEdDSA, matching what the primary
//! device provisions.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::{clamp_integer, Scalar};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};
use std::fmt;
use x25519_dalek::StaticSecret;
use zeroize::Zeroizing;

/// Type byte prepended to serialized Curve25519 public keys.
pub const KEY_TYPE_DJB: u8 = 0x05;

/// Key parsing and verification errors
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Unknown key type byte: {0:#04x}")]
    BadKeyType(u8),

    #[error("Signature verification failed")]
    InvalidSignature,
}

fn to_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N], KeyError> {
    bytes.try_into().map_err(|_| KeyError::InvalidLength {
        expected: N,
        actual: bytes.len(),
    })
}

/// X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(x25519_dalek::PublicKey);

impl PublicKey {
    /// Parse a type-prefixed key. A bare 32-byte key is accepted as well.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, KeyError> {
        match bytes.len() {
            33 if bytes[0] == KEY_TYPE_DJB => Ok(Self::from_raw(to_array(&bytes[1..])?)),
            33 => Err(KeyError::BadKeyType(bytes[0])),
            32 => Ok(Self::from_raw(to_array(bytes)?)),
            actual => Err(KeyError::InvalidLength {
                expected: 33,
                actual,
            }),
        }
    }

    pub fn from_raw(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    /// `0x05 || key`
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(33);
        out.push(KEY_TYPE_DJB);
        out.extend_from_slice(self.0.as_bytes());
        out
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0.as_bytes()))
    }
}

/// X25519 private key. Zeroized on drop.
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, KeyError> {
        let raw = Zeroizing::new(to_array::<32>(bytes)?);
        Ok(Self(StaticSecret::from(*raw)))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0))
    }

    /// Diffie-Hellman agreement with a peer's public key.
    pub fn agree(&self, their_public: &PublicKey) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.0.diffie_hellman(&their_public.0).to_bytes())
    }

    pub fn serialize(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.0.to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_key: PrivateKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from(PrivateKey::generate())
    }
}

impl From<PrivateKey> for KeyPair {
    fn from(private_key: PrivateKey) -> Self {
        let public_key = private_key.public_key();
        Self {
            private_key,
            public_key,
        }
    }
}

/// 64-byte XEdDSA signature
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        Ok(Self(to_array(bytes)?))
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(self.0))
    }
}

// Domain separator for the XEdDSA nonce hash.
const XEDDSA_HASH_PREFIX: [u8; 32] = [
    0xfe, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

fn scalar_from_hash(hash: Sha512) -> Scalar {
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&hash.finalize());
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// XEdDSA over a clamped Curve25519 private key. The sign bit of the
/// Edwards public key rides in the top bit of the last signature byte.
fn xeddsa_sign(private: &[u8; 32], message: &[u8]) -> Signature {
    let a = Zeroizing::new(Scalar::from_bytes_mod_order(*private));
    let public = (&*a * ED25519_BASEPOINT_TABLE).compress();
    let sign_bit = public.as_bytes()[31] & 0x80;

    let mut random = Zeroizing::new([0u8; 64]);
    OsRng.fill_bytes(&mut random[..]);

    let mut nonce_hash = Sha512::new();
    nonce_hash.update(XEDDSA_HASH_PREFIX);
    nonce_hash.update(private);
    nonce_hash.update(message);
    nonce_hash.update(&random[..]);
    let r = Zeroizing::new(scalar_from_hash(nonce_hash));
    let cap_r = (&*r * ED25519_BASEPOINT_TABLE).compress();

    let mut challenge = Sha512::new();
    challenge.update(cap_r.as_bytes());
    challenge.update(public.as_bytes());
    challenge.update(message);
    let h = scalar_from_hash(challenge);
    let s = h * *a + *r;

    let mut out = [0u8; 64];
    out[..32].copy_from_slice(cap_r.as_bytes());
    out[32..].copy_from_slice(s.as_bytes());
    out[63] &= 0x7f;
    out[63] |= sign_bit;
    Signature(out)
}

fn xeddsa_verify(public: &PublicKey, message: &[u8], signature: &Signature) -> bool {
    let bytes = signature.as_bytes();
    let Some(edwards) = MontgomeryPoint(*public.as_bytes()).to_edwards((bytes[63] & 0x80) >> 7)
    else {
        return false;
    };

    let mut cap_r = [0u8; 32];
    cap_r.copy_from_slice(&bytes[..32]);
    let mut s = [0u8; 32];
    s.copy_from_slice(&bytes[32..]);
    s[31] &= 0x7f;
    let Some(s) = Option::<Scalar>::from(Scalar::from_canonical_bytes(s)) else {
        return false;
    };

    let mut challenge = Sha512::new();
    challenge.update(cap_r);
    challenge.update(edwards.compress().as_bytes());
    challenge.update(message);
    let h = scalar_from_hash(challenge);

    let expected = EdwardsPoint::vartime_double_scalar_mul_basepoint(&h, &-edwards, &s);
    expected.compress().as_bytes() == &cap_r
}

/// Public half of an identity key pair: a type-prefixed Curve25519 key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IdentityPublicKey(PublicKey);

impl IdentityPublicKey {
    /// Serialized length: type byte plus key.
    pub const SERIALIZED_LEN: usize = 33;

    pub fn deserialize(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != Self::SERIALIZED_LEN {
            return Err(KeyError::InvalidLength {
                expected: Self::SERIALIZED_LEN,
                actual: bytes.len(),
            });
        }
        PublicKey::deserialize(bytes).map(Self)
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.0.serialize()
    }

    pub fn agreement_key(&self) -> &PublicKey {
        &self.0
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), KeyError> {
        if xeddsa_verify(&self.0, message, signature) {
            Ok(())
        } else {
            Err(KeyError::InvalidSignature)
        }
    }
}

impl fmt::Debug for IdentityPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityPublicKey({})", hex::encode(self.0.as_bytes()))
    }
}

/// Long-term identity key pair (ACI or PNI).
///
/// The same Curve25519 key serves agreement and, through XEdDSA, signing,
/// so the pair the primary device provisions can be used as is.
#[derive(Clone)]
pub struct IdentityKeyPair {
    secret: Zeroizing<[u8; 32]>,
    private: PrivateKey,
    public: IdentityPublicKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let mut secret = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut secret[..]);
        Self::from_secret(secret)
    }

    /// Rebuild a key pair from its 32-byte Curve25519 private key.
    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        Ok(Self::from_secret(Zeroizing::new(to_array(bytes)?)))
    }

    fn from_secret(secret: Zeroizing<[u8; 32]>) -> Self {
        let secret = Zeroizing::new(clamp_integer(*secret));
        let private = PrivateKey(StaticSecret::from(*secret));
        let public = IdentityPublicKey(private.public_key());
        Self {
            secret,
            private,
            public,
        }
    }

    pub fn public_key(&self) -> IdentityPublicKey {
        self.public
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private
    }

    /// Clamped private key bytes.
    pub fn private_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        xeddsa_sign(&self.secret, message)
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl PartialEq for IdentityKeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public
    }
}

impl Eq for IdentityKeyPair {}

// Stored as the base64 private key.
impl Serialize for IdentityKeyPair {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(BASE64.encode(&self.secret[..]));
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for IdentityKeyPair {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        let bytes = Zeroizing::new(
            BASE64
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom)?,
        );
        Self::from_private_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_is_type_prefixed() {
        let pair = KeyPair::generate();
        let serialized = pair.public_key.serialize();

        assert_eq!(serialized.len(), 33);
        assert_eq!(serialized[0], KEY_TYPE_DJB);
        assert_eq!(PublicKey::deserialize(&serialized).unwrap(), pair.public_key);
        assert_eq!(
            PublicKey::deserialize(&serialized[1..]).unwrap(),
            pair.public_key
        );
    }

    #[test]
    fn test_public_key_rejects_wrong_type_byte() {
        let mut serialized = KeyPair::generate().public_key.serialize();
        serialized[0] = 0x06;
        assert_eq!(
            PublicKey::deserialize(&serialized),
            Err(KeyError::BadKeyType(0x06))
        );
    }

    #[test]
    fn test_agreement_is_symmetric() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let ab = alice.private_key.agree(&bob.public_key);
        let ba = bob.private_key.agree(&alice.public_key);
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn test_identity_signature_verifies_against_public_half() {
        let identity = IdentityKeyPair::generate();
        let signature = identity.sign(b"signed pre-key");

        let public = IdentityPublicKey::deserialize(&identity.public_key().serialize()).unwrap();
        assert!(public.verify(b"signed pre-key", &signature).is_ok());
        assert_eq!(
            public.verify(b"other", &signature),
            Err(KeyError::InvalidSignature)
        );
    }

    #[test]
    fn test_identity_accepts_plain_curve25519_pair() {
        // What a primary device provisions: 32-byte private, 33-byte public.
        let private = PrivateKey::generate();
        let identity = IdentityKeyPair::from_private_bytes(&private.serialize()[..]).unwrap();

        let public = IdentityPublicKey::deserialize(&private.public_key().serialize()).unwrap();
        assert_eq!(identity.public_key(), public);
        assert_eq!(public.serialize().len(), IdentityPublicKey::SERIALIZED_LEN);

        let signature = identity.sign(b"signed pre-key");
        assert!(public.verify(b"signed pre-key", &signature).is_ok());
    }

    #[test]
    fn test_identity_public_key_rejects_other_lengths() {
        let mut long = IdentityKeyPair::generate().public_key().serialize();
        long.extend_from_slice(&[0u8; 32]);
        assert_eq!(
            IdentityPublicKey::deserialize(&long),
            Err(KeyError::InvalidLength {
                expected: 33,
                actual: 65
            })
        );
    }

    #[test]
    fn test_tampered_signature_is_rejected() {
        let identity = IdentityKeyPair::generate();
        let public = identity.public_key();
        let signature = identity.sign(b"message");

        for index in [0, 31, 32, 63] {
            let mut bytes = *signature.as_bytes();
            bytes[index] ^= 0x80;
            assert_eq!(
                public.verify(b"message", &Signature(bytes)),
                Err(KeyError::InvalidSignature),
                "byte {} flipped",
                index
            );
        }
        assert!(IdentityKeyPair::generate()
            .public_key()
            .verify(b"message", &signature)
            .is_err());
    }

    #[test]
    fn test_identity_agreement_matches_public_key() {
        let alice = IdentityKeyPair::generate();
        let bob = KeyPair::generate();

        let ab = alice.private_key().agree(&bob.public_key);
        let ba = bob.private_key.agree(alice.public_key().agreement_key());
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn test_identity_rebuilds_from_private_bytes() {
        let identity = IdentityKeyPair::generate();
        let rebuilt = IdentityKeyPair::from_private_bytes(identity.private_bytes()).unwrap();
        assert_eq!(rebuilt, identity);
    }

    #[test]
    fn test_identity_serde_round_trip() {
        let identity = IdentityKeyPair::generate();
        let json = serde_json::to_string(&identity).unwrap();
        let back: IdentityKeyPair = serde_json::from_str(&json).unwrap();
        assert_eq!(back, identity);
    }

    #[test]
    fn test_identity_debug_hides_secret() {
        let identity = IdentityKeyPair::generate();
        let debug = format!("{:?}", identity);
        assert!(!debug.contains(&hex::encode(identity.private_bytes())));
    }
}
