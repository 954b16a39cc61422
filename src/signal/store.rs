//! Device credential storage
//!
//! A linked installation holds exactly one `DeviceCredential`. Inserting a
//! new one replaces whatever was there.

use super::keys::IdentityKeyPair;
use super::prekeys::PreKeyIds;
use super::traits::{DeviceStore, SignalError, SignalResult};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const STORE_FILE: &str = "devices.json";

/// HTTP Basic credentials.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Value for an `Authorization` header.
    pub fn basic_auth(&self) -> String {
        let pair = Zeroizing::new(format!("{}:{}", self.username, self.password));
        format!("Basic {}", BASE64.encode(pair.as_bytes()))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Both identity namespaces of the linked account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountId {
    pub aci: String,
    pub pni: String,
}

/// Everything needed to act as the linked device.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCredential {
    pub account: AccountId,
    pub phone_number: String,
    pub device_id: u32,
    pub password: Zeroizing<String>,
    pub registration_id: u32,
    pub pni_registration_id: u32,
    pub aci_identity: IdentityKeyPair,
    pub pni_identity: IdentityKeyPair,
    /// Next pre-key IDs to issue per identity
    #[serde(default)]
    pub pre_key_ids: PreKeyIds,
}

impl DeviceCredential {
    /// `{aci}.{deviceId}`
    pub fn username(&self) -> String {
        format!("{}.{}", self.account.aci, self.device_id)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.username(), self.password.as_str())
    }
}

impl fmt::Debug for DeviceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCredential")
            .field("account", &self.account)
            .field("device_id", &self.device_id)
            .field("registration_id", &self.registration_id)
            .field("pni_registration_id", &self.pni_registration_id)
            .finish_non_exhaustive()
    }
}

/// In-memory store for tests and short-lived runs.
#[derive(Clone, Default)]
pub struct MemoryDeviceStore {
    device: Arc<Mutex<Option<DeviceCredential>>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn get_all_devices(&self) -> SignalResult<Vec<DeviceCredential>> {
        Ok(self.device.lock().await.iter().cloned().collect())
    }

    async fn insert_device(&self, device: DeviceCredential) -> SignalResult<()> {
        *self.device.lock().await = Some(device);
        Ok(())
    }
}

/// JSON file under the store directory, written atomically.
pub struct FileDeviceStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileDeviceStore {
    pub fn open(dir: impl AsRef<Path>) -> SignalResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| {
            SignalError::Store(format!("Failed to create {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            path: dir.join(STORE_FILE),
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeviceStore for FileDeviceStore {
    async fn get_all_devices(&self) -> SignalResult<Vec<DeviceCredential>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                SignalError::Store(format!("Corrupt store {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(SignalError::Store(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn insert_device(&self, device: DeviceCredential) -> SignalResult<()> {
        let _guard = self.lock.lock().await;
        let json = serde_json::to_vec_pretty(&[device])
            .map_err(|e| SignalError::Store(format!("Failed to serialize device: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| SignalError::Store(format!("Failed to write {}: {}", tmp.display(), e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| SignalError::Store(format!("Failed to restrict store: {}", e)))?;
        }

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SignalError::Store(format!("Failed to replace store: {}", e)))
    }
}

#[cfg(test)]
pub(crate) fn sample_device() -> DeviceCredential {
    DeviceCredential {
        account: AccountId {
            aci: "9d0652a3-dcc3-4d11-975f-74d61598733f".to_string(),
            pni: "5d4f5b2f-0c8f-4d1b-9b8e-2f1a2b3c4d5e".to_string(),
        },
        phone_number: "+15551234567".to_string(),
        device_id: 2,
        password: Zeroizing::new("abcdefghijklmnopqrstuvwx".to_string()),
        registration_id: 42,
        pni_registration_id: 43,
        aci_identity: IdentityKeyPair::generate(),
        pni_identity: IdentityKeyPair::generate(),
        pre_key_ids: PreKeyIds::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_username_and_basic_auth() {
        let device = sample_device();
        assert_eq!(device.username(), "9d0652a3-dcc3-4d11-975f-74d61598733f.2");

        let credentials = Credentials::new("user", "pass");
        assert_eq!(credentials.basic_auth(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn test_debug_hides_secrets() {
        let device = sample_device();
        let debug = format!("{:?} {:?}", device, device.credentials());
        assert!(!debug.contains(device.password.as_str()));
    }

    #[tokio::test]
    async fn test_memory_store_keeps_one_device() {
        let store = MemoryDeviceStore::new();
        assert!(store.get_all_devices().await.unwrap().is_empty());

        store.insert_device(sample_device()).await.unwrap();
        let second = sample_device();
        store.insert_device(second.clone()).await.unwrap();

        assert_eq!(store.get_all_devices().await.unwrap(), vec![second]);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let device = sample_device();

        {
            let store = FileDeviceStore::open(dir.path()).unwrap();
            assert!(store.get_all_devices().await.unwrap().is_empty());
            store.insert_device(device.clone()).await.unwrap();
        }

        let reopened = FileDeviceStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get_all_devices().await.unwrap(), vec![device]);
    }

    #[test]
    fn test_stored_json_keeps_password_and_pre_key_ids() {
        let mut device = sample_device();
        device.pre_key_ids.aci = crate::signal::prekeys::PreKeyIdAllocator::new(200, 2);

        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["password"], "abcdefghijklmnopqrstuvwx");
        assert_eq!(json["pre_key_ids"]["aci"]["nextOneTime"], 200);

        let back: DeviceCredential = serde_json::from_value(json).unwrap();
        assert_eq!(back, device);
        assert_eq!(
            back.credentials().basic_auth(),
            device.credentials().basic_auth()
        );
    }

    #[test]
    fn test_store_written_before_pre_key_ids_still_loads() {
        let mut json = serde_json::to_value(sample_device()).unwrap();
        json.as_object_mut().unwrap().remove("pre_key_ids");

        let device: DeviceCredential = serde_json::from_value(json).unwrap();
        assert_eq!(device.pre_key_ids, PreKeyIds::default());
    }

    #[tokio::test]
    async fn test_file_store_reports_corruption() {
        let dir = TempDir::new().unwrap();
        let store = FileDeviceStore::open(dir.path()).unwrap();
        std::fs::write(store.path(), b"{not json").unwrap();

        assert!(matches!(
            store.get_all_devices().await,
            Err(SignalError::Store(_))
        ));
    }
}
