//! Provisioning Cipher
//!
//! Decrypts the `ProvisionEnvelope` the primary device sends through the
//! provisioning socket. The sealing side is here too; the primary device
//! role is what tests and the scripted server play.
//!
//! Body layout: `version (1) || iv (16) || AES-256-CBC ciphertext || HMAC-SHA256 (32)`.

use super::keys::{KeyError, KeyPair, PublicKey};
use super::traits::{EngineError, ProtocolEngine};
use crate::proto::{ProvisionEnvelope, ProvisionMessage};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use prost::Message;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const PROVISIONING_VERSION: u8 = 1;
const PROVISIONING_INFO: &[u8] = b"TextSecure Provisioning Message";
const IV_LEN: usize = 16;
const MAC_LEN: usize = 32;
const BLOCK_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    /// Authentication tag mismatch. Never retried.
    #[error("Provisioning envelope failed authentication")]
    Integrity,

    #[error("Malformed provisioning envelope: {0}")]
    Malformed(String),

    #[error("Invalid public key in envelope: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("Failed to decode provisioning message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

struct DerivedKeys {
    cipher_key: Zeroizing<[u8; 32]>,
    mac_key: Zeroizing<[u8; 32]>,
}

fn derive_keys(shared: &[u8; 32]) -> Result<DerivedKeys, CipherError> {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut okm = Zeroizing::new([0u8; 64]);
    hk.expand(PROVISIONING_INFO, &mut okm[..])
        .map_err(|e| CipherError::Malformed(e.to_string()))?;

    let mut cipher_key = Zeroizing::new([0u8; 32]);
    let mut mac_key = Zeroizing::new([0u8; 32]);
    cipher_key.copy_from_slice(&okm[..32]);
    mac_key.copy_from_slice(&okm[32..]);
    Ok(DerivedKeys {
        cipher_key,
        mac_key,
    })
}

fn mac_for(mac_key: &[u8; 32]) -> Result<HmacSha256, CipherError> {
    <HmacSha256 as Mac>::new_from_slice(mac_key).map_err(|e| CipherError::Malformed(e.to_string()))
}

/// Holds the ephemeral key pair for one provisioning attempt.
pub struct ProvisioningCipher<'a> {
    engine: &'a dyn ProtocolEngine,
    key_pair: KeyPair,
}

impl<'a> ProvisioningCipher<'a> {
    /// Generate a fresh ephemeral key pair.
    pub fn new(engine: &'a dyn ProtocolEngine) -> Result<Self, CipherError> {
        let key_pair = engine.generate_key_pair()?;
        Ok(Self { engine, key_pair })
    }

    /// Ephemeral public key, as embedded in the link URL.
    pub fn public_key(&self) -> &PublicKey {
        &self.key_pair.public_key
    }

    pub fn decrypt(&self, envelope: &ProvisionEnvelope) -> Result<ProvisionMessage, CipherError> {
        let server_key = PublicKey::deserialize(&envelope.public_key)?;
        let body = envelope.body.as_slice();

        if body.len() < 1 + IV_LEN + BLOCK_LEN + MAC_LEN {
            return Err(CipherError::Malformed(format!(
                "body too short ({} bytes)",
                body.len()
            )));
        }
        if body[0] != PROVISIONING_VERSION {
            return Err(CipherError::Malformed(format!(
                "unsupported version {}",
                body[0]
            )));
        }

        let shared = Zeroizing::new(self.engine.agree(&self.key_pair.private_key, &server_key)?);
        let keys = derive_keys(&shared)?;

        let (signed, tag) = body.split_at(body.len() - MAC_LEN);
        let mut mac = mac_for(&keys.mac_key)?;
        mac.update(signed);
        // Constant-time comparison.
        mac.verify_slice(tag).map_err(|_| CipherError::Integrity)?;

        let iv = &signed[1..1 + IV_LEN];
        let ciphertext = &signed[1 + IV_LEN..];
        let plaintext = Zeroizing::new(
            Aes256CbcDec::new_from_slices(&keys.cipher_key[..], iv)
                .map_err(|e| CipherError::Malformed(e.to_string()))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| CipherError::Malformed("bad padding".to_string()))?,
        );

        Ok(ProvisionMessage::decode(plaintext.as_slice())?)
    }
}

/// Encrypt `message` for the holder of `recipient`'s private key.
pub fn seal_provision_message(
    recipient: &PublicKey,
    message: &ProvisionMessage,
) -> Result<ProvisionEnvelope, CipherError> {
    let ephemeral = KeyPair::generate();
    let shared = ephemeral.private_key.agree(recipient);
    let keys = derive_keys(&shared)?;

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let plaintext = Zeroizing::new(message.encode_to_vec());
    let ciphertext = Aes256CbcEnc::new_from_slices(&keys.cipher_key[..], &iv)
        .map_err(|e| CipherError::Malformed(e.to_string()))?
        .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

    let mut body = Vec::with_capacity(1 + IV_LEN + ciphertext.len() + MAC_LEN);
    body.push(PROVISIONING_VERSION);
    body.extend_from_slice(&iv);
    body.extend_from_slice(&ciphertext);

    let mut mac = mac_for(&keys.mac_key)?;
    mac.update(&body);
    body.extend_from_slice(&mac.finalize().into_bytes());

    Ok(ProvisionEnvelope {
        public_key: ephemeral.public_key.serialize(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::engine::SoftwareEngine;

    fn sample_message() -> ProvisionMessage {
        ProvisionMessage {
            number: "+15551234567".to_string(),
            provisioning_code: "123456".to_string(),
            aci_identity_key_private: vec![7u8; 32],
            ..Default::default()
        }
    }

    #[test]
    fn test_decrypts_sealed_envelope() {
        let engine = SoftwareEngine::new();
        let cipher = ProvisioningCipher::new(&engine).unwrap();

        let envelope = seal_provision_message(cipher.public_key(), &sample_message()).unwrap();
        let message = cipher.decrypt(&envelope).unwrap();

        assert_eq!(message, sample_message());
    }

    #[test]
    fn test_tampered_tag_is_integrity_error() {
        let engine = SoftwareEngine::new();
        let cipher = ProvisioningCipher::new(&engine).unwrap();

        let mut envelope = seal_provision_message(cipher.public_key(), &sample_message()).unwrap();
        let last = envelope.body.len() - 1;
        envelope.body[last] ^= 0x80;

        assert!(matches!(
            cipher.decrypt(&envelope),
            Err(CipherError::Integrity)
        ));
    }

    #[test]
    fn test_envelope_for_other_recipient_is_integrity_error() {
        let engine = SoftwareEngine::new();
        let cipher = ProvisioningCipher::new(&engine).unwrap();
        let stranger = KeyPair::generate();

        let envelope = seal_provision_message(&stranger.public_key, &sample_message()).unwrap();
        assert!(matches!(
            cipher.decrypt(&envelope),
            Err(CipherError::Integrity)
        ));
    }

    #[test]
    fn test_wrong_version_is_malformed() {
        let engine = SoftwareEngine::new();
        let cipher = ProvisioningCipher::new(&engine).unwrap();

        let mut envelope = seal_provision_message(cipher.public_key(), &sample_message()).unwrap();
        envelope.body[0] = 2;
        assert!(matches!(
            cipher.decrypt(&envelope),
            Err(CipherError::Malformed(_))
        ));
    }

    #[test]
    fn test_short_body_is_malformed() {
        let engine = SoftwareEngine::new();
        let cipher = ProvisioningCipher::new(&engine).unwrap();

        let envelope = ProvisionEnvelope {
            public_key: KeyPair::generate().public_key.serialize(),
            body: vec![PROVISIONING_VERSION; 40],
        };
        assert!(matches!(
            cipher.decrypt(&envelope),
            Err(CipherError::Malformed(_))
        ));
    }
}
