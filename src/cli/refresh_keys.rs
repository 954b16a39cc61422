use super::config::BridgeConfig;
use bridgehead::signal::linking::refresh_pre_keys;
use bridgehead::signal::registration::HttpKeyRegistrar;
use bridgehead::signal::{DeviceStore, FileDeviceStore, SoftwareEngine};
use tracing::info;
use url::Url;

/// Upload a fresh pre-key batch for each identity of the linked device.
///
/// Recovery path for a link whose key registration failed.
pub async fn execute(config: &BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileDeviceStore::open(&config.signal.store_path)?;
    let mut device = store
        .get_all_devices()
        .await?
        .into_iter()
        .next()
        .ok_or("No linked device. Run 'bridgehead link-device' first.")?;

    let linking = config.linking_config();
    let registrar = HttpKeyRegistrar::new(
        Url::parse(&config.signal.service_url)?,
        linking.registration_timeout,
    )?;

    println!("🔑 Uploading pre-keys for {}...", device.username());
    let result = refresh_pre_keys(&SoftwareEngine::new(), &registrar, &mut device, &linking).await;

    // Issued IDs are spent even when an upload failed.
    store.insert_device(device.clone()).await?;
    result?;
    info!(device_id = device.device_id, "Pre-keys refreshed");

    println!("✅ Pre-keys registered for ACI and PNI");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_refresh_without_device_fails() {
        let temp_dir = TempDir::new().unwrap();
        let config = BridgeConfig::new(temp_dir.path().join("signal-store"));

        let err = execute(&config).await.unwrap_err();
        assert!(err.to_string().contains("No linked device"));
    }
}
