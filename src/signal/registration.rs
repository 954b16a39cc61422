//! Device confirmation and pre-key registration
//!
//! Device confirmation is a websocket request (`PUT /v1/devices/{code}`)
//! authenticated with the temporary credentials. Pre-key registration is
//! plain HTTPS (`PUT /v2/keys?identity=…`) with the permanent ones.

use super::prekeys::PreKeyBatch;
use super::store::Credentials;
use super::traits::{IdentityKind, KeyRegistrar, SignalError, SignalResult};
use super::transport::{RequestEnvelope, ResponseEnvelope};
use async_trait::async_trait;
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Length of the generated device password.
pub const PASSWORD_LEN: usize = 24;

/// Registration IDs are drawn uniformly from `1..=MAX_REGISTRATION_ID`.
pub const MAX_REGISTRATION_ID: u32 = 16383;

/// Request id used for the confirmation exchange.
pub const CONFIRMATION_REQUEST_ID: u64 = 1;

pub fn generate_password() -> String {
    Alphanumeric.sample_string(&mut OsRng, PASSWORD_LEN)
}

pub fn generate_registration_id() -> u32 {
    OsRng.gen_range(1..=MAX_REGISTRATION_ID)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmDeviceRequest {
    pub registration_id: u32,
    pub pni_registration_id: u32,
    pub supports_sms: bool,
}

/// Server answer to device confirmation. Every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfirmDeviceResponse {
    pub uuid: Option<String>,
    pub pni: Option<String>,
    pub device_id: Option<u32>,
}

pub fn confirmation_request(
    code: &str,
    credentials: &Credentials,
    body: &ConfirmDeviceRequest,
) -> SignalResult<RequestEnvelope> {
    let json = serde_json::to_vec(body)
        .map_err(|e| SignalError::InvalidMessage(format!("Failed to encode body: {}", e)))?;

    Ok(
        RequestEnvelope::new(CONFIRMATION_REQUEST_ID, "PUT", format!("/v1/devices/{}", code))
            .with_body(json)
            .with_header("Content-Type", "application/json")
            .with_header("Authorization", &credentials.basic_auth()),
    )
}

pub fn parse_confirmation(response: &ResponseEnvelope) -> SignalResult<ConfirmDeviceResponse> {
    if !response.is_success() {
        return Err(SignalError::Http {
            status: u16::try_from(response.status).unwrap_or(u16::MAX),
            message: response.message.clone(),
        });
    }
    if response.body.is_empty() {
        return Ok(ConfirmDeviceResponse::default());
    }
    serde_json::from_slice(&response.body)
        .map_err(|e| SignalError::Protocol(format!("Malformed confirmation response: {}", e)))
}

pub(crate) fn map_reqwest_error(e: reqwest::Error) -> SignalError {
    match e.status() {
        Some(status) => SignalError::Http {
            status: status.as_u16(),
            message: status.canonical_reason().unwrap_or_default().to_string(),
        },
        None => SignalError::Network(e.to_string()),
    }
}

/// `KeyRegistrar` over HTTPS with reqwest.
#[derive(Debug, Clone)]
pub struct HttpKeyRegistrar {
    client: reqwest::Client,
    base: Url,
}

impl HttpKeyRegistrar {
    pub fn new(base: Url, timeout: Duration) -> SignalResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SignalError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, base })
    }

    pub fn keys_url(&self, kind: IdentityKind) -> SignalResult<Url> {
        let mut url = self
            .base
            .join("/v2/keys")
            .map_err(|e| SignalError::Protocol(format!("Bad service URL: {}", e)))?;
        url.query_pairs_mut().append_pair("identity", kind.as_str());
        Ok(url)
    }
}

#[async_trait]
impl KeyRegistrar for HttpKeyRegistrar {
    async fn register_pre_keys(
        &self,
        credentials: &Credentials,
        kind: IdentityKind,
        batch: &PreKeyBatch,
    ) -> SignalResult<()> {
        let url = self.keys_url(kind)?;
        debug!(
            "Uploading {} {} pre-keys to {}",
            batch.ordinary.len(),
            kind,
            url.path()
        );

        self.client
            .put(url)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .json(&batch.to_upload())
            .send()
            .await
            .map_err(map_reqwest_error)?
            .error_for_status()
            .map_err(map_reqwest_error)?;

        info!("Registered {} pre-keys", kind);
        Ok(())
    }
}
