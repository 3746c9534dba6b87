//! Transport Capability
//!
//! The platform Bluetooth adapter lives outside this crate. It implements
//! [`Transport`] for commands and reports what happens on the link as
//! [`TransportEvent`]s, which the application feeds into
//! `DeviceSession::handle_event` (or lets `DeviceSession::drive` pull from a
//! channel).

use crate::error::TransportError;
use async_trait::async_trait;

pub use crate::domain::models::CharacteristicId;

/// Status reported in a write acknowledgment when the write succeeded
pub const GATT_SUCCESS: u8 = 0;

/// Platform status for "stack busy, try again"
pub const GATT_BUSY: i32 = 201;

/// Link-level connection changes reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSignal {
    /// Connected and services discovered
    Ready,
    Lost,
}

/// Something the platform observed on the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A write (or descriptor write) on `target` finished with `status`
    WriteAck { target: CharacteristicId, status: u8 },
    /// A notification arrived or a read completed
    ValueChanged {
        target: CharacteristicId,
        value: Vec<u8>,
    },
    /// The stack can take another write-without-response
    ReadyToSend,
    ConnectionStateChanged(LinkSignal),
}

/// Commands the core issues to the platform adapter.
///
/// Every method returns once the command has been handed to the stack;
/// completion arrives later as a [`TransportEvent`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, address: &str) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Physical write. Busy stacks answer with [`TransportError::Transient`].
    async fn send(
        &self,
        target: &CharacteristicId,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError>;

    /// Request a one-shot read; the value arrives as `ValueChanged`
    async fn read_once(&self, target: &CharacteristicId) -> Result<(), TransportError>;

    /// Enable notifications; acknowledged with a `WriteAck` on `target`
    async fn subscribe(&self, target: &CharacteristicId) -> Result<(), TransportError>;

    async fn unsubscribe(&self, target: &CharacteristicId) -> Result<(), TransportError>;

    fn can_send_write_without_response(&self) -> bool {
        false
    }
}
