//! Encrypted-network Trait Abstractions
//!
//! Every collaborator the linking pipeline and the routing actors talk to
//! sits behind one of these traits, so tests can swap in the mocks from
//! `signal::mock`.

use super::keys::{IdentityKeyPair, IdentityPublicKey, KeyError, KeyPair, PrivateKey, PublicKey, Signature};
use super::prekeys::PreKeyBatch;
use super::store::{Credentials, DeviceCredential};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Signal service identifier (ACI or PNI)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(pub String);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Signal group identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct GroupId(pub Vec<u8>);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl GroupId {
    /// Parse the hex form produced by `Display`.
    pub fn parse(value: &str) -> Option<Self> {
        hex::decode(value).ok().filter(|b| !b.is_empty()).map(Self)
    }
}

/// The two identity namespaces of one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    Aci,
    Pni,
}

impl IdentityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityKind::Aci => "aci",
            IdentityKind::Pni => "pni",
        }
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type for Signal operations
pub type SignalResult<T> = Result<T, SignalError>;

/// Signal collaborator errors
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Server returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Unauthorized operation")]
    Unauthorized,

    #[error("Crypto engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Result type for protocol engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Opaque failures reported by the protocol engine.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("No session with {0}")]
    NoSession(ServiceId),

    #[error("Pre-key {0} already exists")]
    DuplicatePreKey(u32),

    #[error("Message authentication failed")]
    BadMac,

    #[error("Malformed ciphertext: {0}")]
    Malformed(String),

    #[error("Crypto failure: {0}")]
    Crypto(String),
}

/// Signal Protocol Engine capability interface
///
/// Private key material generated here never leaves the engine except
/// inside the owned key types, which zeroize themselves on drop. Session
/// state is shared by every caller addressing the same remote identity, so
/// implementations serialize their own mutation.
pub trait ProtocolEngine: Send + Sync {
    /// Fresh identity key pair.
    fn generate_identity(&self) -> EngineResult<IdentityKeyPair>;

    /// Fresh ephemeral key pair (provisioning, session setup).
    fn generate_key_pair(&self) -> EngineResult<KeyPair>;

    /// One-time pre-key. The private half stays in the engine's store.
    fn generate_pre_key(&self, kind: IdentityKind, id: u32) -> EngineResult<PublicKey>;

    /// Signed pre-key. The signature covers the serialized public key.
    fn generate_signed_pre_key(
        &self,
        identity: &IdentityKeyPair,
        kind: IdentityKind,
        id: u32,
    ) -> EngineResult<(PublicKey, Signature)>;

    fn sign(&self, identity: &IdentityKeyPair, message: &[u8]) -> EngineResult<Signature>;

    fn agree(&self, private: &PrivateKey, public: &PublicKey) -> EngineResult<[u8; 32]>;

    /// Establish (or replace) the session with `remote`.
    fn establish_session(
        &self,
        local: &IdentityKeyPair,
        remote: &ServiceId,
        remote_identity: &IdentityPublicKey,
    ) -> EngineResult<()>;

    fn encrypt_session(&self, remote: &ServiceId, plaintext: &[u8]) -> EngineResult<Vec<u8>>;

    fn decrypt_session(&self, remote: &ServiceId, ciphertext: &[u8]) -> EngineResult<Vec<u8>>;
}

/// Durable device credential persistence
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get_all_devices(&self) -> SignalResult<Vec<DeviceCredential>>;

    /// Store `device`, replacing any credential already held.
    async fn insert_device(&self, device: DeviceCredential) -> SignalResult<()>;
}

/// Remote pre-key directory (`PUT /v2/keys`)
#[async_trait]
pub trait KeyRegistrar: Send + Sync {
    async fn register_pre_keys(
        &self,
        credentials: &Credentials,
        kind: IdentityKind,
        batch: &PreKeyBatch,
    ) -> SignalResult<()>;
}

/// Outcome of a fan-out group send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupSendResult {
    pub successfully_sent_to: Vec<ServiceId>,
    pub failed_to_send_to: Vec<(ServiceId, SignalError)>,
}

/// Outbound messaging on the encrypted network
#[async_trait]
pub trait SignalSender: Send + Sync {
    /// Send text to one recipient. Returns the message timestamp.
    async fn send_message(
        &self,
        account: &DeviceCredential,
        recipient: &ServiceId,
        text: &str,
        timestamp: u64,
    ) -> SignalResult<u64>;

    /// Send text to every member of a group. Per-member failures are
    /// reported in the result, not as an `Err`.
    async fn send_group_message(
        &self,
        account: &DeviceCredential,
        group: &GroupId,
        text: &str,
        timestamp: u64,
    ) -> SignalResult<GroupSendResult>;
}

/// Group membership lookup
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn members(&self, group: &GroupId) -> SignalResult<Vec<ServiceId>>;
}

/// Delivery of one encrypted payload to one recipient.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(
        &self,
        credentials: &Credentials,
        destination: &ServiceId,
        content: &[u8],
        timestamp: u64,
    ) -> SignalResult<()>;
}
