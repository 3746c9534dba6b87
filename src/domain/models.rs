use crate::domain::security;
use crate::error::SecurityError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Largest register address (12 bits)
pub const MAX_REGISTER: u16 = 0x0FFF;

/// Sequence numbers are 6 bits wide
pub const SEQUENCE_MODULUS: u8 = 64;

/// A GATT characteristic inside a service.
///
/// Comparison is on the parsed UUIDs, so `"0000FCF9-..."` and `"0000fcf9-..."`
/// name the same characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicId {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicId {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }

    pub fn parse(service: &str, characteristic: &str) -> Result<Self, uuid::Error> {
        Ok(Self {
            service: Uuid::parse_str(service)?,
            characteristic: Uuid::parse_str(characteristic)?,
        })
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// A register address with the value to store in it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterValue {
    pub register: u16,
    pub value: u32,
}

impl RegisterValue {
    pub fn new(register: u16, value: u32) -> Self {
        Self { register, value }
    }
}

/// One register as reported by a read response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterReading {
    pub register: u16,
    pub value: u32,
    pub return_code: u8,
}

/// Per-register outcome of a write request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWriteResult {
    pub register: u16,
    pub return_code: u8,
}

impl RegisterWriteResult {
    pub fn is_accepted(&self) -> bool {
        self.return_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Inputs that move the connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTrigger {
    Connect,
    DeviceReady,
    Disconnect,
    TransportLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceMode {
    #[default]
    Default,
    Dfu,
    Pairing,
}

/// Handshake progress for one device, kept in memory for the session only
#[derive(Debug, Clone, Default)]
pub struct SecurityState {
    challenge_code: Option<u32>,
    device_code: Option<String>,
    pub access_code: Option<u32>,
    attempts: u32,
}

impl SecurityState {
    pub fn challenge_code(&self) -> Option<u32> {
        self.challenge_code
    }

    /// Two-letter code derived from the last challenge, if it maps onto the lookup table
    pub fn device_code(&self) -> Option<&str> {
        self.device_code.as_deref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn set_challenge(&mut self, challenge: u32) {
        self.challenge_code = Some(challenge);
        self.device_code = security::alpha_code(challenge).ok();
    }

    /// Count a handshake attempt, refusing once `max_attempts` have been spent
    pub fn begin_attempt(&mut self, max_attempts: u32) -> Result<u32, SecurityError> {
        if self.attempts >= max_attempts {
            return Err(SecurityError::AttemptsExhausted {
                attempts: self.attempts,
                max: max_attempts,
            });
        }
        self.attempts += 1;
        Ok(self.attempts)
    }

    pub(crate) fn clear_attempts(&mut self) {
        self.attempts = 0;
    }
}

/// Everything the session knows about the device on the other end of the link
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub address: String,
    pub signal_strength: i32,
    pub mode: DeviceMode,
    pub security: SecurityState,
    status: ConnectionStatus,
    current_sequence_number: u8,
}

impl DeviceState {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            signal_strength: 0,
            mode: DeviceMode::Default,
            security: SecurityState::default(),
            status: ConnectionStatus::Disconnected,
            current_sequence_number: 0,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: ConnectionStatus) {
        self.status = status;
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn current_sequence_number(&self) -> u8 {
        self.current_sequence_number
    }

    /// Advance the sequence counter, wrapping to 0 at 64
    pub fn touch_sequence(&mut self) -> u8 {
        self.current_sequence_number = (self.current_sequence_number + 1) % SEQUENCE_MODULUS;
        self.current_sequence_number
    }
}

/// Events published by the device session to the application
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionStatus(ConnectionStatus),
    Notification {
        target: CharacteristicId,
        value: Vec<u8>,
    },
    ModeChanged(DeviceMode),
    /// Alpha code to show the user while pairing
    PairingCode(String),
    Paired,
    Authorized,
    SecurityFailure {
        attempts: u32,
        error: SecurityError,
    },
}
