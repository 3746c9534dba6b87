use anyhow::Context;
use rangefinder_link::domain::models::{RegisterValue, SessionEvent};
use rangefinder_link::domain::settings::SettingsService;
use rangefinder_link::infrastructure::bluetooth::loopback::LoopbackTransport;
use rangefinder_link::infrastructure::bluetooth::DeviceSession;
use rangefinder_link::infrastructure::logging;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

const LOOPBACK_ADDRESS: &str = "LOOPBACK";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings_service = SettingsService::new()?;
    let _log_guard = logging::init_logger(&settings_service.get().log_settings)?;
    info!("Starting rangefinder link demo");

    let config = settings_service.get().session_config()?;
    let (device, transport_events) = LoopbackTransport::new(config.connection.clone());
    let device = Arc::new(device);

    let (event_sender, mut events) = mpsc::unbounded_channel();
    let session = Arc::new(DeviceSession::new(
        LOOPBACK_ADDRESS,
        device.clone(),
        config,
        event_sender,
    ));

    let driver = session.clone();
    tokio::spawn(async move { driver.drive(transport_events).await });
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::PairingCode(code) => info!("Device shows code {}", code),
                SessionEvent::SecurityFailure { attempts, error } => {
                    warn!("Security failure after {} attempt(s): {}", attempts, error)
                }
                other => info!("Session event: {:?}", other),
            }
        }
    });

    session.connect().await.context("Connect failed")?;
    session.start_notifying(&session.read_target()).await?;

    // Pair: the user reads the 3-digit code off the device display
    let alpha = session.begin_pairing().await?;
    info!("Pairing code on device: {} {}", alpha, device.display_code());
    let token = session.complete_pairing(device.display_code()).await?;
    info!("Access token {}", token);

    session.authorize(&token).await?;

    session
        .write_registers(&[RegisterValue::new(10, 42), RegisterValue::new(11, 100_000)])
        .await?;
    for reading in session.read_registers(&[10, 11, 12]).await? {
        info!(
            "Register {} = {} (return code {})",
            reading.register, reading.value, reading.return_code
        );
    }
    session.keep_alive().await?;

    session.disconnect().await?;
    if let Err(e) = settings_service.remember_address(LOOPBACK_ADDRESS) {
        warn!("Could not save settings: {:#}", e);
    }

    info!("Done");
    Ok(())
}
