//! BLE Connection Module
//!
//! Characteristic layout of the rangefinder service and the connection
//! state machine.
//!
//! ```text
//!                 connect            DeviceReady
//! Disconnected ----------> Connecting ----------> Connected
//!      ^                       |                      |
//!      |                       | disconnect           | disconnect
//!      |                       v                      v
//!      +---- TransportLost --- Disconnecting <--------+
//! ```
//!
//! `TransportLost` returns to `Disconnected` from any state.

use crate::domain::models::{CharacteristicId, ConnectionStatus, ConnectionTrigger, DeviceState};
use crate::error::LinkError;
use crate::infrastructure::bluetooth::protocol;
use tracing::{debug, info};
use uuid::Uuid;

/// Which characteristics carry requests and responses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Service UUID to look for
    pub service_uuid: Uuid,
    /// Characteristic the device notifies responses on
    pub read_char_uuid: Uuid,
    /// Characteristic requests are written to
    pub write_char_uuid: Uuid,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE_UUID,
            read_char_uuid: protocol::READ_CHAR_UUID,
            write_char_uuid: protocol::WRITE_CHAR_UUID,
        }
    }
}

impl ConnectionConfig {
    /// Build from UUID strings, e.g. as stored in settings
    pub fn parse(service: &str, read_char: &str, write_char: &str) -> Result<Self, uuid::Error> {
        Ok(Self {
            service_uuid: Uuid::parse_str(service)?,
            read_char_uuid: Uuid::parse_str(read_char)?,
            write_char_uuid: Uuid::parse_str(write_char)?,
        })
    }

    pub fn read_target(&self) -> CharacteristicId {
        CharacteristicId::new(self.service_uuid, self.read_char_uuid)
    }

    pub fn write_target(&self) -> CharacteristicId {
        CharacteristicId::new(self.service_uuid, self.write_char_uuid)
    }
}

/// A state change produced by [`apply`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    /// Whether this transition moved into `status`
    pub fn entered(&self, status: ConnectionStatus) -> bool {
        self.changed() && self.to == status
    }
}

/// Where `trigger` takes a connection currently in `from`
pub fn next_status(
    from: ConnectionStatus,
    trigger: ConnectionTrigger,
) -> Result<ConnectionStatus, LinkError> {
    use ConnectionStatus::*;
    use ConnectionTrigger::*;

    match (from, trigger) {
        (_, TransportLost) => Ok(Disconnected),
        (Disconnected, Connect) => Ok(Connecting),
        (Connecting, DeviceReady) => Ok(Connected),
        (Connecting | Connected, Disconnect) => Ok(Disconnecting),
        (from, trigger) => Err(LinkError::InvalidTransition { from, trigger }),
    }
}

/// Apply `trigger` to `state`.
///
/// Entering `Disconnected` clears the handshake attempt counter. The
/// sequence counter survives reconnects.
pub fn apply(state: &mut DeviceState, trigger: ConnectionTrigger) -> Result<Transition, LinkError> {
    let from = state.status();
    let to = next_status(from, trigger)?;
    state.set_status(to);

    let transition = Transition { from, to };
    if transition.changed() {
        info!("Connection {}: {:?} -> {:?}", state.address, from, to);
    } else {
        debug!("Connection {}: {:?} on {:?} (no change)", state.address, trigger, from);
    }
    if transition.entered(ConnectionStatus::Disconnected) {
        state.security.clear_attempts();
    }
    Ok(transition)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_uuids_match_protocol() {
        let config = ConnectionConfig::default();
        let parsed = ConnectionConfig::parse(
            "0000FCF9-0000-1000-8000-00805F9B34FB",
            "0000fcfa-0000-1000-8000-00805f9b34fb",
            "0000fcfb-0000-1000-8000-00805f9b34fb",
        )
        .unwrap();
        assert_eq!(config, parsed);
        assert_ne!(config.read_target(), config.write_target());
    }

    #[test]
    fn test_happy_path() {
        let mut state = DeviceState::new("AA:BB");
        apply(&mut state, ConnectionTrigger::Connect).unwrap();
        assert_eq!(state.status(), ConnectionStatus::Connecting);
        let t = apply(&mut state, ConnectionTrigger::DeviceReady).unwrap();
        assert!(t.entered(ConnectionStatus::Connected));
        apply(&mut state, ConnectionTrigger::Disconnect).unwrap();
        assert_eq!(state.status(), ConnectionStatus::Disconnecting);
        apply(&mut state, ConnectionTrigger::TransportLost).unwrap();
        assert_eq!(state.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut state = DeviceState::new("AA:BB");
        assert_eq!(
            apply(&mut state, ConnectionTrigger::DeviceReady),
            Err(LinkError::InvalidTransition {
                from: ConnectionStatus::Disconnected,
                trigger: ConnectionTrigger::DeviceReady,
            })
        );
        assert!(next_status(ConnectionStatus::Disconnected, ConnectionTrigger::Disconnect).is_err());
        assert!(next_status(ConnectionStatus::Connected, ConnectionTrigger::Connect).is_err());
        assert_eq!(state.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_lost_link_clears_attempts_but_keeps_sequence() {
        let mut state = DeviceState::new("AA:BB");
        apply(&mut state, ConnectionTrigger::Connect).unwrap();
        apply(&mut state, ConnectionTrigger::DeviceReady).unwrap();
        state.security.begin_attempt(3).unwrap();
        state.touch_sequence();
        state.touch_sequence();

        let t = apply(&mut state, ConnectionTrigger::TransportLost).unwrap();
        assert!(t.entered(ConnectionStatus::Disconnected));
        assert_eq!(state.security.attempts(), 0);
        assert_eq!(state.current_sequence_number(), 2);

        // lost again while already down is not a transition
        let t = apply(&mut state, ConnectionTrigger::TransportLost).unwrap();
        assert!(!t.changed());
    }
}
