//! Error types
//!
//! Frame-level errors (`ParseError`, `ProtocolError`) never tear down the
//! link. `LinkError` is what the device session hands back to callers.

use crate::domain::models::{CharacteristicId, ConnectionStatus, ConnectionTrigger};
use std::time::Duration;
use thiserror::Error;

/// Malformed or corrupted frames. Recoverable: request the frame again.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Frame too short: need {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },

    #[error("Malformed frame header")]
    BadHeader,

    #[error("Checksum mismatch: computed {computed}, received {received}")]
    ChecksumMismatch { computed: u8, received: u8 },

    #[error("Frame truncated at byte {at}")]
    Truncated { at: usize },

    #[error("Frame length mismatch: expected {expected} bytes, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("Register count mismatch: requested {expected}, received {got}")]
    CountMismatch { expected: usize, got: usize },

    #[error("Sequence mismatch: sent {sent}, received {received}")]
    SequenceMismatch { sent: u8, received: u8 },

    #[error("Invalid access token frame: {0}")]
    InvalidToken(String),
}

/// Frames the protocol cannot express. Fatal for that message only.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unsupported width code: {0:?}")]
    UnsupportedWidth(char),

    #[error("Unsupported op code: {0:?}")]
    UnsupportedOp(char),

    #[error("Unexpected op code: expected {expected:?}, got {got:?}")]
    UnexpectedOp { expected: char, got: char },

    #[error("Unsupported value width: {0} bits")]
    UnsupportedBits(u32),

    #[error("Too many registers in one frame: {0} (max 63)")]
    TooManyRegisters(usize),

    #[error("Register {0} out of range (max 4095)")]
    RegisterOutOfRange(u16),

    #[error("Value {value} does not fit in {bits} bits")]
    ValueOutOfRange { value: u32, bits: u32 },

    #[error("Count mismatch: {registers} registers, {values} values")]
    CountMismatch { registers: usize, values: usize },
}

/// Anything that can go wrong turning bytes into a frame or back.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Failures reported by the platform transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The stack is busy; the send may be retried.
    #[error("Transport busy (status {status})")]
    Transient { status: i32 },

    #[error("Transport failure: {reason}")]
    Terminal { reason: String },

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(CharacteristicId),

    #[error("Transport not connected")]
    NotConnected,
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Handshake failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("Password {0} is not a 3-digit code (100-999)")]
    InvalidPassword(u32),

    #[error("Challenge nibble {0} has no alpha code letter")]
    UnmappedNibble(u32),

    #[error("Handshake attempts exhausted ({attempts} of {max})")]
    AttemptsExhausted { attempts: u32, max: u32 },

    #[error("Device rejected the handshake response (return code {return_code})")]
    Rejected { return_code: u8 },

    #[error("Security register not configured: {0}")]
    NotConfigured(&'static str),

    #[error("No challenge has been read from the device")]
    NoChallenge,
}

/// Error returned by device session operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation in progress on {0}")]
    InProgress(CharacteristicId),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Device not connected (status {0:?})")]
    NotConnected(ConnectionStatus),

    #[error("Invalid connection transition: {trigger:?} while {from:?}")]
    InvalidTransition {
        from: ConnectionStatus,
        trigger: ConnectionTrigger,
    },

    #[error("Write to {target} failed with status {status}")]
    WriteRejected { target: CharacteristicId, status: u8 },

    #[error("Register {register} returned code {return_code}")]
    DeviceRejected { register: u16, return_code: u8 },
}

impl From<ParseError> for LinkError {
    fn from(err: ParseError) -> Self {
        Self::Frame(FrameError::Parse(err))
    }
}

impl From<ProtocolError> for LinkError {
    fn from(err: ProtocolError) -> Self {
        Self::Frame(FrameError::Protocol(err))
    }
}

impl LinkError {
    /// Whether the same operation may simply be issued again
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Frame(FrameError::Parse(_)) | Self::Timeout(_) | Self::InProgress(_) => true,
            Self::Transport(err) => err.is_transient(),
            _ => false,
        }
    }

    pub fn is_terminal_transport(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Terminal { .. }))
    }
}
