use super::config::BridgeConfig;
use bridgehead::signal::{DeviceCredential, DeviceStore, FileDeviceStore};

/// One line per linked device. Passwords and keys are never shown.
pub fn describe(device: &DeviceCredential) -> String {
    format!(
        "{}  phone={}  pni={}  registration_id={}",
        device.username(),
        device.phone_number,
        device.account.pni,
        device.registration_id
    )
}

/// List the linked devices in the store
pub async fn execute(config: &BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileDeviceStore::open(&config.signal.store_path)?;
    let devices = store.get_all_devices().await?;

    if devices.is_empty() {
        println!("No linked devices in {}", config.signal.store_path.display());
        return Ok(());
    }

    for device in &devices {
        println!("{}", describe(device));
    }
    Ok(())
}
