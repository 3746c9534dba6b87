use rangefinder_link::domain::models::{ConnectionStatus, DeviceMode, RegisterValue, SessionEvent};
use rangefinder_link::error::{LinkError, SecurityError};
use rangefinder_link::infrastructure::bluetooth::loopback::{
    LoopbackTransport, DEFAULT_ACCESS_TOKEN, UNKNOWN_REGISTER,
};
use rangefinder_link::infrastructure::bluetooth::{DeviceSession, SessionConfig};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Rig {
    session: Arc<DeviceSession>,
    device: Arc<LoopbackTransport>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

async fn connected_rig() -> Rig {
    let config = SessionConfig::default();
    let (device, transport_events) = LoopbackTransport::new(config.connection.clone());
    let device = Arc::new(device);
    let (tx, events) = mpsc::unbounded_channel();
    let session = Arc::new(DeviceSession::new("AA:BB:CC:DD:EE:FF", device.clone(), config, tx));

    let driver = session.clone();
    tokio::spawn(async move { driver.drive(transport_events).await });

    session.connect().await.unwrap();
    session
        .start_notifying(&session.read_target())
        .await
        .unwrap();
    Rig {
        session,
        device,
        events,
    }
}

fn drain(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn test_pair_then_authorize() {
    let mut rig = connected_rig().await;

    let code = rig.session.begin_pairing().await.unwrap();
    assert_eq!(code, "PS");
    assert_eq!(rig.session.device_state().mode, DeviceMode::Pairing);
    assert_eq!(
        rig.session.device_state().security.device_code(),
        Some("PS")
    );

    let token = rig
        .session
        .complete_pairing(rig.device.display_code())
        .await
        .unwrap();
    assert_eq!(token, DEFAULT_ACCESS_TOKEN);
    assert_eq!(rig.session.device_state().mode, DeviceMode::Default);
    assert!(rig.session.device_state().security.access_code.is_some());

    rig.session.authorize(&token).await.unwrap();
    assert!(rig.device.is_authorized());

    let events = drain(&mut rig.events);
    assert!(events.contains(&SessionEvent::PairingCode("PS".to_string())));
    assert!(events.contains(&SessionEvent::Paired));
    assert!(events.contains(&SessionEvent::Authorized));
}

#[tokio::test]
async fn test_wrong_display_code_is_rejected() {
    let mut rig = connected_rig().await;
    rig.session.begin_pairing().await.unwrap();

    assert_eq!(
        rig.session.complete_pairing(456).await,
        Err(LinkError::Security(SecurityError::Rejected { return_code: 1 }))
    );
    assert_eq!(
        rig.session.complete_pairing(42).await,
        Err(LinkError::Security(SecurityError::InvalidPassword(42)))
    );
    assert_eq!(rig.session.device_state().security.attempts(), 1);

    let events = drain(&mut rig.events);
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::SecurityFailure { attempts: 1, .. }
    )));

    // the right code still works afterwards
    let token = rig
        .session
        .complete_pairing(rig.device.display_code())
        .await
        .unwrap();
    assert_eq!(token, DEFAULT_ACCESS_TOKEN);
}

#[tokio::test]
async fn test_register_access() {
    let rig = connected_rig().await;
    rig.device.set_register(300, 0xDEAD_BEEF);

    let readings = rig.session.read_registers(&[300, 301]).await.unwrap();
    assert_eq!(readings[0].value, 0xDEAD_BEEF);
    assert_eq!(readings[0].return_code, 0);
    assert_eq!(readings[1].return_code, UNKNOWN_REGISTER);

    assert_eq!(
        rig.session.read_register(301).await,
        Err(LinkError::DeviceRejected {
            register: 301,
            return_code: UNKNOWN_REGISTER
        })
    );

    rig.session.write_register(301, 9).await.unwrap();
    assert_eq!(rig.session.read_register(301).await.unwrap(), 9);
}

#[tokio::test]
async fn test_sequence_wraps_across_requests() {
    let rig = connected_rig().await;
    for _ in 0..62 {
        rig.session.touch_sequence();
    }
    rig.session
        .write_registers(&[RegisterValue::new(1, 1)])
        .await
        .unwrap();
    rig.session.read_registers(&[1]).await.unwrap();
    assert_eq!(rig.session.device_state().current_sequence_number(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_busy_device_is_retried() {
    let rig = connected_rig().await;
    rig.device.inject(|faults| faults.busy_sends = 4);
    rig.session.read_registers(&[1]).await.unwrap();

    rig.device.inject(|faults| faults.busy_sends = 5);
    assert!(matches!(
        rig.session.read_registers(&[1]).await,
        Err(LinkError::Transport(_))
    ));
    // busy is not terminal
    assert_eq!(rig.session.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_raw_characteristic_access() {
    let rig = connected_rig().await;
    let write_target = rig.session.write_target();
    let read_target = rig.session.read_target();

    rig.session
        .write(&write_target, b"$R400w?", true)
        .await
        .unwrap();
    assert_eq!(rig.session.read(&read_target).await.unwrap(), b"$R4=00w");

    rig.session.stop_notifying(&read_target).await.unwrap();
    rig.session.disconnect().await.unwrap();
    assert_eq!(
        rig.session.read(&read_target).await,
        Err(LinkError::NotConnected(ConnectionStatus::Disconnected))
    );
}
