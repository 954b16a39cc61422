//! Bridgehead configuration file handling
//!
//! Provides default configuration generation and loading. Configuration
//! files are TOML and stored adjacent to the device store. Durations are
//! written in human form ("30s", "2m") and parsed with humantime. Linking
//! timeouts must be non-zero.

use bridgehead::signal::prekeys::DEFAULT_PRE_KEY_COUNT;
use bridgehead::signal::retry::RetryPolicy;
use bridgehead::signal::LinkingConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_WEBSOCKET_URL: &str = "wss://chat.signal.org";
const DEFAULT_SERVICE_URL: &str = "https://chat.signal.org";

/// `serde(with)` adapter for humantime durations.
mod human_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub signal: SignalConfig,

    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Directory holding the device store
    pub store_path: PathBuf,

    /// Chat service websocket base URL
    #[serde(default = "default_websocket_url")]
    pub websocket_url: String,

    /// Chat service HTTPS base URL (key registration, sending)
    #[serde(default = "default_service_url")]
    pub service_url: String,

    /// Scheme of the device-link URL
    #[serde(default = "default_link_scheme")]
    pub link_scheme: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub pre_key_count: u32,
    pub aci_pre_key_offset: u32,
    pub pni_pre_key_offset: u32,

    #[serde(with = "human_duration")]
    pub handshake_timeout: Duration,

    #[serde(with = "human_duration")]
    pub confirmation_timeout: Duration,

    #[serde(with = "human_duration")]
    pub registration_timeout: Duration,

    /// Retries after a transient pre-key upload failure
    pub registration_retries: u32,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        let linking = LinkingConfig::default();
        Self {
            pre_key_count: DEFAULT_PRE_KEY_COUNT,
            aci_pre_key_offset: linking.aci_pre_key_offset,
            pni_pre_key_offset: linking.pni_pre_key_offset,
            handshake_timeout: linking.handshake_timeout,
            confirmation_timeout: linking.confirmation_timeout,
            registration_timeout: linking.registration_timeout,
            registration_retries: linking.registration_retry.max_retries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_websocket_url() -> String {
    DEFAULT_WEBSOCKET_URL.to_string()
}

fn default_service_url() -> String {
    DEFAULT_SERVICE_URL.to_string()
}

fn default_link_scheme() -> String {
    LinkingConfig::default().link_scheme
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl BridgeConfig {
    pub fn new(store_path: PathBuf) -> Self {
        Self {
            signal: SignalConfig {
                store_path,
                websocket_url: default_websocket_url(),
                service_url: default_service_url(),
                link_scheme: default_link_scheme(),
            },
            provisioning: ProvisioningConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;

        let config: BridgeConfig = toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;
        config
            .validate()
            .map_err(|e| format!("Invalid config file '{}': {}", path.display(), e))?;

        Ok(config)
    }

    /// A zero linking timeout would fail every attempt at once.
    pub fn validate(&self) -> Result<(), String> {
        let p = &self.provisioning;
        for (name, value) in [
            ("handshake_timeout", p.handshake_timeout),
            ("confirmation_timeout", p.confirmation_timeout),
            ("registration_timeout", p.registration_timeout),
        ] {
            if value.is_zero() {
                return Err(format!("provisioning.{} must be greater than zero", name));
            }
        }
        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        fs::write(path, contents)
            .map_err(|e| format!("Failed to write config file '{}': {}", path.display(), e))?;

        Ok(())
    }

    /// Resolve the config for a command: explicit `--config`, else the file
    /// next to the store, created with defaults if missing. `--store-path`
    /// overrides the configured store.
    pub fn resolve(
        config_path: Option<String>,
        store_path: Option<String>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let store_override = store_path.map(PathBuf::from);

        let path = match config_path {
            Some(path) => PathBuf::from(path),
            None => {
                let store = store_override.clone().unwrap_or_else(default_store_path);
                let path = default_config_path(&store);
                if !path.exists() {
                    Self::create_default(&path, &store)?;
                }
                path
            }
        };

        let mut config = Self::load(&path)?;
        if let Some(store) = store_override {
            config.signal.store_path = store;
        }
        Ok(config)
    }

    pub fn linking_config(&self) -> LinkingConfig {
        let p = &self.provisioning;
        LinkingConfig {
            link_scheme: self.signal.link_scheme.clone(),
            handshake_timeout: p.handshake_timeout,
            confirmation_timeout: p.confirmation_timeout,
            registration_timeout: p.registration_timeout,
            pre_key_count: p.pre_key_count,
            aci_pre_key_offset: p.aci_pre_key_offset,
            pni_pre_key_offset: p.pni_pre_key_offset,
            registration_retry: RetryPolicy {
                max_retries: p.registration_retries,
                ..RetryPolicy::default()
            },
            ..LinkingConfig::default()
        }
    }

    /// Generate default configuration content as a string with comments
    pub fn generate_default_toml(store_path: &Path) -> String {
        format!(
            r#"# Bridgehead Configuration
#
# Durations use human form: "30s", "2m", "1h".

[signal]
# Directory holding the linked device credential
store_path = "{store_path}"

# Chat service endpoints
websocket_url = "{websocket_url}"
service_url = "{service_url}"

# Scheme of the device-link URL shown as a QR code
link_scheme = "sgnl"

[provisioning]
# One-time pre-keys uploaded per identity (ACI and PNI)
pre_key_count = {pre_key_count}
aci_pre_key_offset = 0
pni_pre_key_offset = 0

handshake_timeout = "1m"
confirmation_timeout = "1m"
registration_timeout = "30s"

# Retries after a transient pre-key upload failure
registration_retries = 3

[logging]
# Log level: trace, debug, info, warn, error (RUST_LOG takes precedence)
level = "info"
"#,
            store_path = store_path.display(),
            websocket_url = DEFAULT_WEBSOCKET_URL,
            service_url = DEFAULT_SERVICE_URL,
            pre_key_count = DEFAULT_PRE_KEY_COUNT,
        )
    }

    /// Create and save a default configuration file
    pub fn create_default(
        config_path: &Path,
        store_path: &Path,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let contents = Self::generate_default_toml(store_path);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        fs::write(config_path, contents).map_err(|e| {
            format!(
                "Failed to write config file '{}': {}",
                config_path.display(),
                e
            )
        })?;

        Ok(())
    }
}

/// The config file sits in the parent directory of the store:
/// - Store: ~/.local/share/bridgehead/signal-store/
/// - Config: ~/.local/share/bridgehead/config.toml
pub fn default_config_path(store_path: &Path) -> PathBuf {
    store_path
        .parent()
        .unwrap_or(store_path)
        .join("config.toml")
}

pub fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bridgehead")
        .join("signal-store")
}
