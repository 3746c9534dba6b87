//! Loopback Rangefinder
//!
//! An in-process [`Transport`] with a simulated rangefinder behind it. It
//! answers register frames from a register file, runs the device side of
//! pairing and authorization, and reports everything back as
//! [`TransportEvent`]s on the channel returned by [`LoopbackTransport::new`].
//!
//! Faults can be injected to exercise busy retries, lost acknowledgments,
//! silent devices and dropped links.

use crate::domain::security::{self, ACCESS_CODE_REGISTER, CHALLENGE_REGISTER};
use crate::error::{FrameError, TransportError};
use crate::infrastructure::bluetooth::connection::ConnectionConfig;
use crate::infrastructure::bluetooth::protocol::{self, Op};
use crate::infrastructure::bluetooth::transport::{
    CharacteristicId, LinkSignal, Transport, TransportEvent, GATT_BUSY, GATT_SUCCESS,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Code shown on the simulated display
pub const DEFAULT_DISPLAY_CODE: u32 = 123;

/// Token the simulated device hands out after pairing
pub const DEFAULT_ACCESS_TOKEN: Uuid = Uuid::from_u128(0x04030201_0605_0807_090a_0b0c0d0e0f10);

pub const DEFAULT_PAIRING_CHALLENGE: u32 = 0x1122_3367;
pub const DEFAULT_AUTH_CHALLENGE: u32 = 12_345_678;

/// Return code for a register the device does not know
pub const UNKNOWN_REGISTER: u8 = 2;

/// Return code for a handshake response that does not match
pub const WRONG_RESPONSE: u8 = 1;

/// Misbehaviour to inject into the next operations
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Answer this many sends with a busy status before accepting one
    pub busy_sends: u32,
    /// Never acknowledge writes
    pub drop_acks: bool,
    /// Accept requests but never answer them
    pub mute_responses: bool,
    /// Fail every send with a terminal error
    pub fail_sends: bool,
    /// Added to the sequence number of every response
    pub sequence_skew: u8,
    /// Accept the pairing code but never send the `$K=` frame
    pub withhold_token: bool,
}

/// Device side of the link
#[derive(Debug, Clone)]
pub struct SimulatedRangefinder {
    registers: HashMap<u16, u32>,
    display_code: u32,
    access_token: Uuid,
    pairing_challenge: u32,
    auth_challenge: u32,
    authorized: bool,
}

impl Default for SimulatedRangefinder {
    fn default() -> Self {
        Self {
            registers: HashMap::new(),
            display_code: DEFAULT_DISPLAY_CODE,
            access_token: DEFAULT_ACCESS_TOKEN,
            pairing_challenge: DEFAULT_PAIRING_CHALLENGE,
            auth_challenge: DEFAULT_AUTH_CHALLENGE,
            authorized: false,
        }
    }
}

impl SimulatedRangefinder {
    /// Handle one request frame, returning the frames to notify
    fn process(&mut self, frame: &[u8], sequence_skew: u8) -> Vec<String> {
        let op = frame.get(1).copied().map(Op::from_code);
        let result = match op {
            Some(Ok(Op::Read)) => self.process_read(frame, sequence_skew),
            Some(Ok(Op::Write)) => self.process_write(frame, sequence_skew),
            _ => {
                debug!("Loopback ignoring frame {:?}", String::from_utf8_lossy(frame));
                return Vec::new();
            }
        };
        match result {
            Ok(frames) => frames,
            Err(err) => {
                debug!("Loopback dropping bad request: {}", err);
                Vec::new()
            }
        }
    }

    fn process_read(
        &mut self,
        frame: &[u8],
        sequence_skew: u8,
    ) -> Result<Vec<String>, FrameError> {
        let request = protocol::parse_read_request(frame)?;
        let (values, codes): (Vec<u32>, Vec<u8>) = request
            .registers
            .iter()
            .map(|&register| match register {
                ACCESS_CODE_REGISTER => (self.pairing_challenge, 0),
                CHALLENGE_REGISTER => (self.auth_challenge, 0),
                _ => match self.registers.get(&register) {
                    Some(&value) => (value, 0),
                    None => (0, UNKNOWN_REGISTER),
                },
            })
            .unzip();

        let response = protocol::assemble_read_response(
            request.sequence.wrapping_add(sequence_skew),
            request.width,
            &values,
            &codes,
        )?;
        Ok(vec![response])
    }

    fn process_write(
        &mut self,
        frame: &[u8],
        sequence_skew: u8,
    ) -> Result<Vec<String>, FrameError> {
        let request = protocol::parse_write_request(frame)?;
        let mut paired = false;

        let codes: Vec<u8> = request
            .registers
            .iter()
            .zip(&request.values)
            .map(|(&register, &value)| match register {
                ACCESS_CODE_REGISTER => {
                    let expected =
                        security::encrypt_password(self.display_code, self.pairing_challenge);
                    if expected.ok() == Some(value) {
                        paired = true;
                        0
                    } else {
                        WRONG_RESPONSE
                    }
                }
                CHALLENGE_REGISTER => {
                    let expected =
                        security::encrypt_challenge(self.auth_challenge, &self.access_token);
                    self.authorized = expected == value;
                    if self.authorized {
                        0
                    } else {
                        WRONG_RESPONSE
                    }
                }
                _ => {
                    self.registers.insert(register, value);
                    0
                }
            })
            .collect();

        let mut frames = vec![protocol::assemble_write_response(
            request.sequence.wrapping_add(sequence_skew),
            request.width,
            &codes,
        )?];
        if paired {
            // same XOR transform the client uses to decode
            let encoded = security::decrypt_token(&self.access_token, self.display_code);
            frames.push(protocol::assemble_token_notification(&encoded));
        }
        Ok(frames)
    }
}

/// In-process transport wired to a [`SimulatedRangefinder`]
pub struct LoopbackTransport {
    config: ConnectionConfig,
    device: Mutex<SimulatedRangefinder>,
    faults: Mutex<Faults>,
    link: Mutex<LinkState>,
    sent: Mutex<Vec<String>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Debug, Default)]
struct LinkState {
    connected: bool,
    subscribed: bool,
    last_notification: Vec<u8>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LoopbackTransport {
    pub fn new(config: ConnectionConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        Self::with_device(config, SimulatedRangefinder::default())
    }

    pub fn with_device(
        config: ConnectionConfig,
        device: SimulatedRangefinder,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let transport = Self {
            config,
            device: Mutex::new(device),
            faults: Mutex::new(Faults::default()),
            link: Mutex::new(LinkState::default()),
            sent: Mutex::new(Vec::new()),
            events,
        };
        (transport, receiver)
    }

    /// Adjust the injected faults
    pub fn inject(&self, apply: impl FnOnce(&mut Faults)) {
        apply(&mut lock(&self.faults));
    }

    pub fn set_register(&self, register: u16, value: u32) {
        lock(&self.device).registers.insert(register, value);
    }

    pub fn register(&self, register: u16) -> Option<u32> {
        lock(&self.device).registers.get(&register).copied()
    }

    pub fn display_code(&self) -> u32 {
        lock(&self.device).display_code
    }

    pub fn access_token(&self) -> Uuid {
        lock(&self.device).access_token
    }

    pub fn is_authorized(&self) -> bool {
        lock(&self.device).authorized
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.link).connected
    }

    /// Request frames received on the write characteristic, in order
    pub fn sent_frames(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    /// Simulate the radio link going away
    pub fn drop_connection(&self) {
        let mut link = lock(&self.link);
        link.connected = false;
        link.subscribed = false;
        drop(link);
        lock(&self.device).authorized = false;
        self.emit(TransportEvent::ConnectionStateChanged(LinkSignal::Lost));
    }

    fn emit(&self, event: TransportEvent) {
        trace!("Loopback event {:?}", event);
        let _ = self.events.send(event);
    }

    fn check_target(&self, target: &CharacteristicId) -> Result<(), TransportError> {
        if *target == self.config.read_target() || *target == self.config.write_target() {
            Ok(())
        } else {
            Err(TransportError::CharacteristicNotFound(*target))
        }
    }

    fn check_connected(&self) -> Result<(), TransportError> {
        if lock(&self.link).connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn notify(&self, frames: Vec<String>) {
        let read_target = self.config.read_target();
        let mut link = lock(&self.link);
        if !link.subscribed {
            trace!("Loopback not subscribed, dropping {} frame(s)", frames.len());
            return;
        }
        for frame in frames {
            link.last_notification = frame.clone().into_bytes();
            self.emit(TransportEvent::ValueChanged {
                target: read_target,
                value: frame.into_bytes(),
            });
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        debug!("Loopback connect {}", address);
        lock(&self.link).connected = true;
        self.emit(TransportEvent::ConnectionStateChanged(LinkSignal::Ready));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.drop_connection();
        Ok(())
    }

    async fn send(
        &self,
        target: &CharacteristicId,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        self.check_connected()?;
        self.check_target(target)?;

        let faults = {
            let mut faults = lock(&self.faults);
            if faults.fail_sends {
                return Err(TransportError::Terminal {
                    reason: "loopback send failure".to_string(),
                });
            }
            if faults.busy_sends > 0 {
                faults.busy_sends -= 1;
                return Err(TransportError::Transient { status: GATT_BUSY });
            }
            faults.clone()
        };

        if with_response && !faults.drop_acks {
            self.emit(TransportEvent::WriteAck {
                target: *target,
                status: GATT_SUCCESS,
            });
        }
        if *target != self.config.write_target() {
            return Ok(());
        }

        lock(&self.sent).push(String::from_utf8_lossy(data).into_owned());
        if faults.mute_responses {
            return Ok(());
        }
        let mut frames = lock(&self.device).process(data, faults.sequence_skew);
        if faults.withhold_token {
            frames.retain(|frame| !protocol::is_token_notification(frame.as_bytes()));
        }
        self.notify(frames);
        Ok(())
    }

    async fn read_once(&self, target: &CharacteristicId) -> Result<(), TransportError> {
        self.check_connected()?;
        self.check_target(target)?;
        let value = lock(&self.link).last_notification.clone();
        self.emit(TransportEvent::ValueChanged {
            target: *target,
            value,
        });
        Ok(())
    }

    async fn subscribe(&self, target: &CharacteristicId) -> Result<(), TransportError> {
        self.check_connected()?;
        if *target != self.config.read_target() {
            return Err(TransportError::CharacteristicNotFound(*target));
        }
        lock(&self.link).subscribed = true;
        self.emit(TransportEvent::WriteAck {
            target: *target,
            status: GATT_SUCCESS,
        });
        Ok(())
    }

    async fn unsubscribe(&self, target: &CharacteristicId) -> Result<(), TransportError> {
        self.check_connected()?;
        if *target != self.config.read_target() {
            return Err(TransportError::CharacteristicNotFound(*target));
        }
        lock(&self.link).subscribed = false;
        self.emit(TransportEvent::WriteAck {
            target: *target,
            status: GATT_SUCCESS,
        });
        Ok(())
    }

    fn can_send_write_without_response(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_answers_reads() {
        let mut device = SimulatedRangefinder::default();
        device.registers.insert(7, 10_000_000);
        let request = protocol::assemble_read_request(4, &[7, 8, ACCESS_CODE_REGISTER]).unwrap();

        let frames = device.process(request.as_bytes(), 0);
        let response = protocol::parse_read_response(frames[0].as_bytes()).unwrap();
        assert_eq!(response.sequence, 4);
        assert_eq!(response.values, vec![10_000_000, 0, DEFAULT_PAIRING_CHALLENGE]);
        assert_eq!(response.return_codes, vec![0, UNKNOWN_REGISTER, 0]);
    }

    #[test]
    fn test_correct_password_releases_token() {
        let mut device = SimulatedRangefinder::default();
        let password =
            security::encrypt_password(DEFAULT_DISPLAY_CODE, DEFAULT_PAIRING_CHALLENGE).unwrap();
        let request = protocol::assemble_write_request(
            0,
            &[ACCESS_CODE_REGISTER],
            &[password],
            protocol::FrameWidth::Four,
        )
        .unwrap();

        let frames = device.process(request.as_bytes(), 0);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], "$K=e872f47a-e462-d05a-5ac4-42c832b43aa0");
    }

    #[test]
    fn test_wrong_challenge_response_is_rejected() {
        let mut device = SimulatedRangefinder::default();
        let request = protocol::assemble_write_request(
            0,
            &[CHALLENGE_REGISTER],
            &[1],
            protocol::FrameWidth::Four,
        )
        .unwrap();

        let frames = device.process(request.as_bytes(), 0);
        let response = protocol::parse_write_response(frames[0].as_bytes()).unwrap();
        assert_eq!(response.return_codes, vec![WRONG_RESPONSE]);
        assert!(!device.authorized);
    }

    #[test]
    fn test_bad_frames_are_ignored() {
        let mut device = SimulatedRangefinder::default();
        assert!(device.process(b"$R4050103050709X?", 0).is_empty());
        assert!(device.process(b"garbage", 0).is_empty());
    }

    #[tokio::test]
    async fn test_busy_and_unsubscribed() {
        let (transport, mut events) = LoopbackTransport::new(ConnectionConfig::default());
        let write_target = ConnectionConfig::default().write_target();
        let request = protocol::assemble_read_request(0, &[1]).unwrap();

        assert_eq!(
            transport.send(&write_target, request.as_bytes(), true).await,
            Err(TransportError::NotConnected)
        );

        transport.connect("LOOPBACK").await.unwrap();
        transport.inject(|f| f.busy_sends = 1);
        assert_eq!(
            transport.send(&write_target, request.as_bytes(), true).await,
            Err(TransportError::Transient { status: GATT_BUSY })
        );
        transport
            .send(&write_target, request.as_bytes(), true)
            .await
            .unwrap();

        // ready, then the ack; no notification without a subscription
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::ConnectionStateChanged(LinkSignal::Ready))
        );
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::WriteAck { .. })
        ));
        assert!(events.try_recv().is_err());
        assert_eq!(transport.sent_frames(), vec![request]);
    }
}
