use super::config::BridgeConfig;
use bridgehead::signal::registration::HttpKeyRegistrar;
use bridgehead::signal::{
    DeviceStore, FileDeviceStore, ProvisioningEvent, ProvisioningPipeline, ProvisioningState,
    SoftwareEngine, WebSocketConnector,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

/// Link the bridge as a secondary device
///
/// Displays a QR code that the operator scans with the Signal app on their
/// phone, then confirms the device and registers its pre-keys.
pub async fn execute(config: &BridgeConfig, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔗 Linking Bridgehead as secondary device...");
    println!();
    println!("Store Path: {}", config.signal.store_path.display());
    println!("Service: {}", config.signal.service_url);
    println!();

    let store = Arc::new(FileDeviceStore::open(&config.signal.store_path)?);
    if let Some(existing) = store.get_all_devices().await?.first() {
        if !force {
            return Err(format!(
                "A device is already linked ({}). Use --force to replace it.",
                existing.username()
            )
            .into());
        }
        println!("⚠️  Replacing linked device {}", existing.username());
        println!();
    }

    let linking = config.linking_config();
    let connector = Arc::new(WebSocketConnector::new(Url::parse(
        &config.signal.websocket_url,
    )?));
    let registrar = Arc::new(HttpKeyRegistrar::new(
        Url::parse(&config.signal.service_url)?,
        linking.registration_timeout,
    )?);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let pipeline = ProvisioningPipeline::new(
        linking,
        Arc::new(SoftwareEngine::new()),
        connector,
        registrar,
        store,
        Arc::new(events_tx),
    );

    // The renderer ends when the pipeline drops its sender.
    let (result, ()) = tokio::join!(pipeline.run(), render_events(events_rx));

    match result {
        Ok(device) => {
            println!();
            println!("✅ Device linked successfully!");
            println!("   ACI: {}", device.account.aci);
            println!("   PNI: {}", device.account.pni);
            println!("   Phone: {}", device.phone_number);
            println!("   Device ID: {}", device.device_id);
            Ok(())
        }
        Err(e) => Err(format!("Device linking failed: {}", e).into()),
    }
}

async fn render_events(mut events: mpsc::UnboundedReceiver<ProvisioningEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ProvisioningEvent::UrlAvailable(url) => {
                println!("📱 Please scan this QR code with Signal on your phone:");
                println!("   Signal → Settings → Linked Devices → Link New Device");
                println!();

                if let Err(e) = qr2term::print_qr(&url) {
                    eprintln!("⚠️  Failed to render QR code: {}", e);
                }

                println!();
                println!("Or use this URL: {}", url);
                println!();
                println!("⏳ Waiting for you to scan the code...");
            }
            ProvisioningEvent::DataReceived { phone_number } => {
                println!("📨 Received account data for {}", phone_number);
            }
            ProvisioningEvent::StateChanged(ProvisioningState::RegisteringKeys) => {
                println!("🔑 Registering pre-keys...");
            }
            ProvisioningEvent::KeysRegistered { device_id, .. } => {
                println!("🔑 Pre-keys registered for device {}", device_id);
            }
            ProvisioningEvent::Error(e) => {
                eprintln!("❌ {}", e);
                if matches!(e, bridgehead::signal::ProvisioningError::KeyRegistration { .. }) {
                    eprintln!("   The device was saved. Run 'bridgehead refresh-keys' to retry.");
                }
            }
            ProvisioningEvent::StateChanged(_) => {}
        }
    }
}
