//! Signal Device Linking
//!
//! Links this installation as a secondary device of an existing account.
//! The handshake runs as an explicit state machine:
//!
//! ```text
//! Init → AwaitingUrl → UrlIssued → AwaitingLinkConfirmation → DataReceived
//!      → RegisteringKeys → PreKeysRegistered → Done
//! ```
//!
//! with `Error` reachable from every non-terminal state. Each stage is
//! reported to a [`ProvisioningObserver`]. The flow is one-shot: any error
//! ends the attempt and nothing is resumed.
//!
//! If pre-key upload still fails after retries, the device credential is
//! kept and persisted (the server already knows the device) and the
//! pipeline ends in `Error`. `refresh_pre_keys` re-uploads later.

use super::keys::{IdentityKeyPair, IdentityPublicKey, KeyError};
use super::prekeys::{PreKeyBatch, PreKeyError, PreKeyIdAllocator, PreKeyIds, DEFAULT_PRE_KEY_COUNT};
use super::provisioning::{CipherError, ProvisioningCipher};
use super::registration::{
    confirmation_request, generate_password, generate_registration_id, parse_confirmation,
    ConfirmDeviceRequest, ConfirmDeviceResponse,
};
use super::retry::{is_signal_error_retryable, retry_with_backoff, RetryPolicy};
use super::store::{AccountId, Credentials, DeviceCredential};
use super::traits::*;
use super::transport::{
    exchange, Connector, Frame, FrameTransport, RequestEnvelope, ResponseEnvelope, TransportError,
    PROVISIONING_PATH, WEBSOCKET_PATH,
};
use crate::proto::{ProvisionEnvelope, ProvisionMessage, ProvisioningUuid};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use prost::Message;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

/// Device linking configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkingConfig {
    /// Scheme of the emitted deep link (`sgnl://linkdevice?...`)
    pub link_scheme: String,

    /// Bound on connecting and both provisioning rounds
    pub handshake_timeout: Duration,

    /// Bound on the device-confirmation exchange
    pub confirmation_timeout: Duration,

    /// Bound on each pre-key upload attempt
    pub registration_timeout: Duration,

    /// One-time pre-keys per identity
    pub pre_key_count: u32,

    /// First IDs issued to a newly linked device. Later uploads continue
    /// from the device's stored counters.
    pub aci_pre_key_offset: u32,
    pub pni_pre_key_offset: u32,
    pub aci_signed_pre_key_id: u32,
    pub pni_signed_pre_key_id: u32,

    /// Retries for transient pre-key upload failures
    pub registration_retry: RetryPolicy,
}

impl LinkingConfig {
    pub fn initial_pre_key_ids(&self) -> PreKeyIds {
        PreKeyIds {
            aci: PreKeyIdAllocator::new(self.aci_pre_key_offset, self.aci_signed_pre_key_id),
            pni: PreKeyIdAllocator::new(self.pni_pre_key_offset, self.pni_signed_pre_key_id),
        }
    }
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self {
            link_scheme: "sgnl".to_string(),
            handshake_timeout: Duration::from_secs(60),
            confirmation_timeout: Duration::from_secs(60),
            registration_timeout: Duration::from_secs(30),
            pre_key_count: DEFAULT_PRE_KEY_COUNT,
            aci_pre_key_offset: 0,
            pni_pre_key_offset: 0,
            aci_signed_pre_key_id: 0,
            pni_signed_pre_key_id: 0,
            registration_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisioningState {
    Init,
    AwaitingUrl,
    UrlIssued,
    AwaitingLinkConfirmation,
    DataReceived,
    RegisteringKeys,
    PreKeysRegistered,
    Done,
    Error,
}

impl ProvisioningState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProvisioningState::Done | ProvisioningState::Error)
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Envelope authentication failed. Never retried.
    #[error("Provisioning envelope failed integrity check")]
    Integrity,

    #[error("Crypto engine error: {0}")]
    CryptoEngine(#[from] EngineError),

    #[error("Timed out in state {0}")]
    Timeout(ProvisioningState),

    #[error("Device confirmation failed: {0}")]
    DeviceConfirmation(SignalError),

    #[error("Pre-key generation failed: {0}")]
    PreKeys(#[from] PreKeyError),

    #[error("{kind} pre-key registration failed: {error}")]
    KeyRegistration {
        kind: IdentityKind,
        error: SignalError,
    },

    #[error("Device store error: {0}")]
    Store(SignalError),
}

impl From<CipherError> for ProvisioningError {
    fn from(e: CipherError) -> Self {
        match e {
            CipherError::Integrity => ProvisioningError::Integrity,
            CipherError::Engine(e) => ProvisioningError::CryptoEngine(e),
            other => ProvisioningError::ProtocolViolation(other.to_string()),
        }
    }
}

impl From<KeyError> for ProvisioningError {
    fn from(e: KeyError) -> Self {
        ProvisioningError::ProtocolViolation(format!("bad identity key: {}", e))
    }
}

/// Staged progress notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningEvent {
    StateChanged(ProvisioningState),
    /// Deep link to render for the primary device
    UrlAvailable(String),
    DataReceived {
        phone_number: String,
    },
    KeysRegistered {
        account: AccountId,
        device_id: u32,
    },
    Error(ProvisioningError),
}

pub trait ProvisioningObserver: Send + Sync {
    fn on_event(&self, event: ProvisioningEvent);
}

impl ProvisioningObserver for mpsc::UnboundedSender<ProvisioningEvent> {
    fn on_event(&self, event: ProvisioningEvent) {
        // The caller may have stopped listening; linking carries on.
        let _ = self.send(event);
    }
}

/// Build the `scheme://linkdevice?uuid=…&pub_key=…` deep link.
pub fn link_url(scheme: &str, uuid: &str, public_key: &[u8]) -> String {
    let escape = |s: &str| url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>();
    format!(
        "{}://linkdevice?uuid={}&pub_key={}",
        scheme,
        escape(uuid),
        escape(&BASE64.encode(public_key))
    )
}

/// Receive one frame that must be `verb path`. Anything else is answered
/// `400` (so the peer does not stall) and reported as a violation.
async fn expect_request(
    transport: &mut dyn FrameTransport,
    verb: &str,
    path: &str,
) -> Result<RequestEnvelope, ProvisioningError> {
    match transport.receive().await? {
        Frame::Request(request) if request.is(verb, path) => Ok(request),
        Frame::Request(request) => {
            transport
                .send(Frame::Response(ResponseEnvelope::bad_request(request.id)))
                .await?;
            Err(ProvisioningError::ProtocolViolation(format!(
                "expected {} {}, got {} {}",
                verb, path, request.verb, request.path
            )))
        }
        Frame::Response(response) => Err(ProvisioningError::ProtocolViolation(format!(
            "expected {} {}, got response {}",
            verb, path, response.id
        ))),
    }
}

fn identity_from(
    private: &[u8],
    public: &[u8],
    label: &str,
) -> Result<IdentityKeyPair, ProvisioningError> {
    let identity = IdentityKeyPair::from_private_bytes(private)?;
    if !public.is_empty() && IdentityPublicKey::deserialize(public)? != identity.public_key() {
        return Err(ProvisioningError::ProtocolViolation(format!(
            "{} identity public key does not match its private key",
            label
        )));
    }
    Ok(identity)
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Upload one fresh batch per identity with the device's permanent
/// credentials. Transient failures are retried under `config`'s policy.
///
/// IDs come from the device's own counters, which advance as soon as a
/// batch is generated. Callers persist `device` afterwards, whatever the
/// outcome.
pub async fn refresh_pre_keys(
    engine: &dyn ProtocolEngine,
    registrar: &dyn KeyRegistrar,
    device: &mut DeviceCredential,
    config: &LinkingConfig,
) -> Result<(), ProvisioningError> {
    let credentials = device.credentials();

    for kind in [IdentityKind::Aci, IdentityKind::Pni] {
        let identity = match kind {
            IdentityKind::Aci => &device.aci_identity,
            IdentityKind::Pni => &device.pni_identity,
        };
        let batch = device.pre_key_ids.for_kind(kind).next_batch(
            engine,
            identity,
            kind,
            config.pre_key_count,
        )?;
        debug!(
            "Uploading {} {} pre-keys from id {} (signed {})",
            batch.ordinary.len(),
            kind,
            batch.ids().next().unwrap_or_default(),
            batch.signed.id
        );
        upload(registrar, &credentials, kind, &batch, config)
            .await
            .map_err(|error| ProvisioningError::KeyRegistration { kind, error })?;
    }
    Ok(())
}

async fn upload(
    registrar: &dyn KeyRegistrar,
    credentials: &Credentials,
    kind: IdentityKind,
    batch: &PreKeyBatch,
    config: &LinkingConfig,
) -> SignalResult<()> {
    retry_with_backoff(
        config.registration_retry,
        move || async move {
            match timeout(
                config.registration_timeout,
                registrar.register_pre_keys(credentials, kind, batch),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SignalError::Network(format!(
                    "pre-key upload timed out after {:?}",
                    config.registration_timeout
                ))),
            }
        },
        is_signal_error_retryable,
    )
    .await
}

/// One linking attempt.
pub struct ProvisioningPipeline {
    config: LinkingConfig,
    engine: Arc<dyn ProtocolEngine>,
    connector: Arc<dyn Connector>,
    registrar: Arc<dyn KeyRegistrar>,
    store: Arc<dyn DeviceStore>,
    observer: Arc<dyn ProvisioningObserver>,
    state: ProvisioningState,
}

impl ProvisioningPipeline {
    pub fn new(
        config: LinkingConfig,
        engine: Arc<dyn ProtocolEngine>,
        connector: Arc<dyn Connector>,
        registrar: Arc<dyn KeyRegistrar>,
        store: Arc<dyn DeviceStore>,
        observer: Arc<dyn ProvisioningObserver>,
    ) -> Self {
        Self {
            config,
            engine,
            connector,
            registrar,
            store,
            observer,
            state: ProvisioningState::Init,
        }
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    /// Run to `Done` or `Error`. Errors are also sent to the observer.
    pub async fn run(mut self) -> Result<DeviceCredential, ProvisioningError> {
        match self.drive().await {
            Ok(device) => Ok(device),
            Err(error) => {
                warn!("Device linking failed in state {}: {}", self.state, error);
                self.transition(ProvisioningState::Error);
                self.observer.on_event(ProvisioningEvent::Error(error.clone()));
                Err(error)
            }
        }
    }

    fn transition(&mut self, next: ProvisioningState) {
        debug!("Linking: {} -> {}", self.state, next);
        self.state = next;
        self.observer.on_event(ProvisioningEvent::StateChanged(next));
    }

    async fn drive(&mut self) -> Result<DeviceCredential, ProvisioningError> {
        let engine = self.engine.clone();
        let cipher = ProvisioningCipher::new(engine.as_ref())?;

        let handshake = timeout(self.config.handshake_timeout, self.handshake(&cipher)).await;
        let mut message = match handshake {
            Ok(result) => result?,
            Err(_) => return Err(ProvisioningError::Timeout(self.state)),
        };

        self.transition(ProvisioningState::DataReceived);
        self.observer.on_event(ProvisioningEvent::DataReceived {
            phone_number: message.number.clone(),
        });
        info!("Received provisioning data");

        let identities = identity_from(
            &message.aci_identity_key_private,
            &message.aci_identity_key_public,
            "ACI",
        )
        .and_then(|aci| {
            identity_from(
                &message.pni_identity_key_private,
                &message.pni_identity_key_public,
                "PNI",
            )
            .map(|pni| (aci, pni))
        });
        message.aci_identity_key_private.zeroize();
        message.pni_identity_key_private.zeroize();
        let (aci_identity, pni_identity) = identities?;

        if message.number.is_empty() || message.provisioning_code.is_empty() {
            return Err(ProvisioningError::ProtocolViolation(
                "provisioning message lacks number or code".to_string(),
            ));
        }

        let password = Zeroizing::new(generate_password());
        let registration_id = generate_registration_id();
        let pni_registration_id = generate_registration_id();
        let temporary = Credentials::new(message.number.clone(), password.as_str());

        let confirmed = self
            .confirm_device(
                &message.provisioning_code,
                &temporary,
                &ConfirmDeviceRequest {
                    registration_id,
                    pni_registration_id,
                    supports_sms: true,
                },
            )
            .await?;

        let mut device = DeviceCredential {
            account: AccountId {
                aci: confirmed
                    .uuid
                    .or_else(|| non_empty(&message.aci))
                    .unwrap_or_else(|| message.number.clone()),
                pni: confirmed
                    .pni
                    .or_else(|| non_empty(&message.pni))
                    .unwrap_or_default(),
            },
            phone_number: message.number.clone(),
            device_id: confirmed.device_id.filter(|id| *id != 0).unwrap_or(1),
            password,
            registration_id,
            pni_registration_id,
            aci_identity,
            pni_identity,
            pre_key_ids: self.config.initial_pre_key_ids(),
        };
        info!("Device confirmed as {}", device.username());
        self.transition(ProvisioningState::RegisteringKeys);

        if let Err(error) = refresh_pre_keys(
            self.engine.as_ref(),
            self.registrar.as_ref(),
            &mut device,
            &self.config,
        )
        .await
        {
            warn!("Keeping device credential without registered pre-keys");
            self.store
                .insert_device(device)
                .await
                .map_err(ProvisioningError::Store)?;
            return Err(error);
        }

        self.transition(ProvisioningState::PreKeysRegistered);
        self.observer.on_event(ProvisioningEvent::KeysRegistered {
            account: device.account.clone(),
            device_id: device.device_id,
        });

        self.store
            .insert_device(device.clone())
            .await
            .map_err(ProvisioningError::Store)?;
        self.transition(ProvisioningState::Done);
        Ok(device)
    }

    async fn handshake(
        &mut self,
        cipher: &ProvisioningCipher<'_>,
    ) -> Result<ProvisionMessage, ProvisioningError> {
        self.transition(ProvisioningState::AwaitingUrl);
        let mut transport = self.connector.connect(PROVISIONING_PATH).await?;
        let result = self.provision_over(transport.as_mut(), cipher).await;
        if let Err(e) = transport.close().await {
            debug!("Closing provisioning socket: {}", e);
        }
        result
    }

    async fn provision_over(
        &mut self,
        transport: &mut dyn FrameTransport,
        cipher: &ProvisioningCipher<'_>,
    ) -> Result<ProvisionMessage, ProvisioningError> {
        let request = expect_request(transport, "PUT", "/v1/address").await?;
        let address = ProvisioningUuid::decode(request.body.as_slice()).map_err(|e| {
            ProvisioningError::ProtocolViolation(format!("bad provisioning address: {}", e))
        })?;
        if address.uuid.is_empty() {
            return Err(ProvisioningError::ProtocolViolation(
                "empty provisioning address".to_string(),
            ));
        }

        let url = link_url(
            &self.config.link_scheme,
            &address.uuid,
            &cipher.public_key().serialize(),
        );
        transport
            .send(Frame::Response(ResponseEnvelope::ok(request.id)))
            .await?;
        self.transition(ProvisioningState::UrlIssued);
        self.observer.on_event(ProvisioningEvent::UrlAvailable(url));

        self.transition(ProvisioningState::AwaitingLinkConfirmation);
        let request = expect_request(transport, "PUT", "/v1/message").await?;
        let envelope = ProvisionEnvelope::decode(request.body.as_slice()).map_err(|e| {
            ProvisioningError::ProtocolViolation(format!("bad provisioning envelope: {}", e))
        })?;
        transport
            .send(Frame::Response(ResponseEnvelope::ok(request.id)))
            .await?;

        Ok(cipher.decrypt(&envelope)?)
    }

    async fn confirm_device(
        &self,
        code: &str,
        credentials: &Credentials,
        body: &ConfirmDeviceRequest,
    ) -> Result<ConfirmDeviceResponse, ProvisioningError> {
        let request = confirmation_request(code, credentials, body)
            .map_err(ProvisioningError::DeviceConfirmation)?;

        let exchanged = timeout(self.config.confirmation_timeout, async {
            let mut transport = self.connector.connect(WEBSOCKET_PATH).await?;
            let response = exchange(transport.as_mut(), request).await;
            if let Err(e) = transport.close().await {
                debug!("Closing confirmation socket: {}", e);
            }
            response
        })
        .await
        .map_err(|_| ProvisioningError::Timeout(self.state))??;

        parse_confirmation(&exchanged).map_err(ProvisioningError::DeviceConfirmation)
    }
}
