//! Device Session
//!
//! Public API for one rangefinder. Owns the [`DeviceState`], the request
//! correlator and the session configuration, and turns register-level calls
//! into framed exchanges on the configured characteristics.
//!
//! Transport events must be fed in through [`DeviceSession::handle_event`],
//! usually by spawning [`DeviceSession::drive`] on the transport's event
//! channel. Everything the application may want to show (status changes,
//! unsolicited notifications, pairing codes) is published as a
//! [`SessionEvent`].

use crate::domain::models::{
    CharacteristicId, ConnectionStatus, ConnectionTrigger, DeviceMode, DeviceState,
    RegisterReading, RegisterValue, RegisterWriteResult, SessionEvent,
};
use crate::domain::security::{self, SecurityConfig};
use crate::error::{LinkError, ParseError, ProtocolError, SecurityError};
use crate::infrastructure::bluetooth::connection::{self, ConnectionConfig, Transition};
use crate::infrastructure::bluetooth::correlator::{BleRequest, Correlator, LinkConfig};
use crate::infrastructure::bluetooth::protocol::{self, FrameWidth};
use crate::infrastructure::bluetooth::transport::{LinkSignal, Transport, TransportEvent};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Device registers written outside the security handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Written before a requested disconnect
    pub disconnect: Option<RegisterValue>,
    /// Written by [`DeviceSession::keep_alive`]
    pub keep_alive: Option<RegisterValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    pub connection: ConnectionConfig,
    pub link: LinkConfig,
    pub security: SecurityConfig,
    pub device: DeviceConfig,
}

pub struct DeviceSession {
    transport: Arc<dyn Transport>,
    correlator: Correlator,
    config: SessionConfig,
    state: Mutex<DeviceState>,
    status_tx: watch::Sender<ConnectionStatus>,
    /// Last `$K=` frame seen, still encoded
    token_tx: watch::Sender<Option<Uuid>>,
    event_sender: mpsc::UnboundedSender<SessionEvent>,
}

impl DeviceSession {
    pub fn new(
        address: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        event_sender: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (token_tx, _) = watch::channel(None);
        Self {
            correlator: Correlator::new(transport.clone(), config.link.clone()),
            transport,
            config,
            state: Mutex::new(DeviceState::new(address)),
            status_tx,
            token_tx,
            event_sender,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn read_target(&self) -> CharacteristicId {
        self.config.connection.read_target()
    }

    pub fn write_target(&self) -> CharacteristicId {
        self.config.connection.write_target()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Connect and wait until the transport reports the device ready
    pub async fn connect(&self) -> Result<(), LinkError> {
        self.transition(ConnectionTrigger::Connect)?;

        let address = self.lock_state().address.clone();
        info!("Connecting to rangefinder {}", address);
        if let Err(err) = self.transport.connect(&address).await {
            error!("Connect to {} failed: {}", address, err);
            self.transition(ConnectionTrigger::TransportLost)?;
            return Err(err.into());
        }

        self.wait_until_connected().await
    }

    /// Resolve once the session is `Connected`, or fail if it drops back to
    /// `Disconnected` or the operation deadline passes first
    pub async fn wait_until_connected(&self) -> Result<(), LinkError> {
        let deadline = self.config.link.operation_timeout;
        let mut status = self.status_tx.subscribe();

        let settled = tokio::time::timeout(deadline, async {
            status
                .wait_for(|s| {
                    matches!(s, ConnectionStatus::Connected | ConnectionStatus::Disconnected)
                })
                .await
                .map(|s| *s)
        })
        .await;

        match settled {
            Ok(Ok(ConnectionStatus::Connected)) => Ok(()),
            Ok(_) => Err(LinkError::Disconnected),
            Err(_) => {
                warn!("Device not ready after {:?}", deadline);
                self.transition(ConnectionTrigger::TransportLost)?;
                Err(LinkError::Timeout(deadline))
            }
        }
    }

    /// Disconnect, writing the configured disconnect register first.
    /// Calling this while already disconnected does nothing.
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        match self.status() {
            ConnectionStatus::Disconnected => return Ok(()),
            ConnectionStatus::Connected => {
                if let Some(reg) = self.config.device.disconnect {
                    if let Err(err) = self.write_registers(&[reg]).await {
                        warn!("Disconnect register write failed: {}", err);
                    }
                }
                // a failed write may already have taken the link down
                if self.status() == ConnectionStatus::Connected {
                    self.transition(ConnectionTrigger::Disconnect)?;
                }
            }
            ConnectionStatus::Connecting => {
                self.transition(ConnectionTrigger::Disconnect)?;
            }
            ConnectionStatus::Disconnecting => {}
        }

        let result = self.transport.disconnect().await;
        self.transition(ConnectionTrigger::TransportLost)?;
        result.map_err(LinkError::from)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock_state().status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Snapshot of the device state
    pub fn device_state(&self) -> DeviceState {
        self.lock_state().clone()
    }

    pub fn pending_operations(&self) -> usize {
        self.correlator.pending_count()
    }

    // -----------------------------------------------------------------------
    // Registers
    // -----------------------------------------------------------------------

    pub async fn read_registers(&self, registers: &[u16]) -> Result<Vec<RegisterReading>, LinkError> {
        let (sequence, frame) =
            self.frame_request(|seq| protocol::assemble_read_request(seq, registers))?;
        debug!("Read {:?} (seq {})", registers, sequence);

        let raw = self.exchange(frame).await?;
        let response = protocol::parse_read_response(&raw)?;
        check_sequence(sequence, response.sequence)?;
        check_count(registers.len(), response.values.len())?;

        Ok(registers
            .iter()
            .zip(response.values.iter().zip(&response.return_codes))
            .map(|(&register, (&value, &return_code))| RegisterReading {
                register,
                value,
                return_code,
            })
            .collect())
    }

    /// Read one register, failing if the device reports a non-zero return code
    pub async fn read_register(&self, register: u16) -> Result<u32, LinkError> {
        let reading = self
            .read_registers(&[register])
            .await?
            .into_iter()
            .next()
            .ok_or(ParseError::CountMismatch {
                expected: 1,
                got: 0,
            })?;
        if reading.return_code != 0 {
            return Err(LinkError::DeviceRejected {
                register,
                return_code: reading.return_code,
            });
        }
        Ok(reading.value)
    }

    /// Write registers in one frame. Per-register return codes are reported,
    /// not turned into errors.
    pub async fn write_registers(
        &self,
        values: &[RegisterValue],
    ) -> Result<Vec<RegisterWriteResult>, LinkError> {
        let registers: Vec<u16> = values.iter().map(|v| v.register).collect();
        let data: Vec<u32> = values.iter().map(|v| v.value).collect();
        let (sequence, frame) = self.frame_request(|seq| {
            protocol::assemble_write_request(seq, &registers, &data, FrameWidth::Four)
        })?;
        debug!("Write {:?} (seq {})", registers, sequence);

        let raw = self.exchange(frame).await?;
        let response = protocol::parse_write_response(&raw)?;
        check_sequence(sequence, response.sequence)?;
        check_count(registers.len(), response.return_codes.len())?;

        Ok(registers
            .iter()
            .zip(&response.return_codes)
            .map(|(&register, &return_code)| RegisterWriteResult {
                register,
                return_code,
            })
            .collect())
    }

    /// Write one register, failing if the device does not accept it
    pub async fn write_register(&self, register: u16, value: u32) -> Result<(), LinkError> {
        let result = self.write_single(RegisterValue::new(register, value)).await?;
        if !result.is_accepted() {
            return Err(LinkError::DeviceRejected {
                register,
                return_code: result.return_code,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Raw characteristic access
    // -----------------------------------------------------------------------

    pub async fn write(
        &self,
        target: &CharacteristicId,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), LinkError> {
        self.ensure_connected()?;
        let mut request = BleRequest::new(*target, data, with_response);
        let result = self.correlator.write(&mut request).await;
        self.settle(result).await
    }

    pub async fn read(&self, target: &CharacteristicId) -> Result<Vec<u8>, LinkError> {
        self.ensure_connected()?;
        let mut request = BleRequest::empty(*target);
        let result = self.correlator.read(&mut request).await;
        self.settle(result).await
    }

    /// Wait for the next notification on `target`. While this is pending the
    /// notification is returned here instead of published as a
    /// [`SessionEvent::Notification`].
    pub async fn next_notification(&self, target: &CharacteristicId) -> Result<Vec<u8>, LinkError> {
        self.ensure_connected()?;
        let result = self.correlator.await_notification(target).await;
        self.settle(result).await
    }

    pub async fn start_notifying(&self, target: &CharacteristicId) -> Result<(), LinkError> {
        self.ensure_connected()?;
        let result = self.correlator.subscribe(target).await;
        self.settle(result).await?;
        info!("Notifications enabled on {}", target);
        Ok(())
    }

    pub async fn stop_notifying(&self, target: &CharacteristicId) -> Result<(), LinkError> {
        self.ensure_connected()?;
        let result = self.correlator.unsubscribe(target).await;
        self.settle(result).await
    }

    // -----------------------------------------------------------------------
    // Security handshake
    // -----------------------------------------------------------------------

    /// Read the pairing challenge and return the alpha code the user should
    /// see next to the 3-digit code on the device display
    pub async fn begin_pairing(&self) -> Result<String, LinkError> {
        let register = self
            .config
            .security
            .access_code_register
            .ok_or(SecurityError::NotConfigured("access_code_register"))?;

        let challenge = self.read_register(register).await?;
        let code = security::alpha_code(challenge)?;
        self.lock_state().security.set_challenge(challenge);
        self.token_tx.send_replace(None);

        info!("Pairing started, device code {}", code);
        self.emit(SessionEvent::PairingCode(code.clone()));
        self.set_mode(DeviceMode::Pairing);
        Ok(code)
    }

    /// Answer the pairing challenge with the code from the device display and
    /// return the access token the device hands out in exchange
    pub async fn complete_pairing(&self, password: u32) -> Result<Uuid, LinkError> {
        let register = self
            .config
            .security
            .access_code_register
            .ok_or(SecurityError::NotConfigured("access_code_register"))?;
        let challenge = self
            .lock_state()
            .security
            .challenge_code()
            .ok_or(SecurityError::NoChallenge)?;
        let response = security::encrypt_password(password, challenge)?;
        let attempts = self.begin_attempt()?;

        self.token_tx.send_replace(None);
        let mut token_rx = self.token_tx.subscribe();
        let mut status_rx = self.status_tx.subscribe();

        self.answer_challenge(register, response, attempts).await?;

        let deadline = self.config.link.operation_timeout;
        let encoded = tokio::time::timeout(deadline, async {
            tokio::select! {
                token = token_rx.wait_for(Option::is_some) => {
                    token.map(|token| *token).map_err(|_| LinkError::Cancelled)
                }
                _ = status_rx.wait_for(|s| *s == ConnectionStatus::Disconnected) => {
                    Err(LinkError::Disconnected)
                }
            }
        })
        .await
        .map_err(|_| LinkError::Timeout(deadline))??
        .ok_or(LinkError::Cancelled)?;

        let token = security::decrypt_token(&encoded, password);
        self.lock_state().security.access_code = Some(response);
        info!("Paired after {} attempt(s)", attempts);
        self.set_mode(DeviceMode::Default);
        self.emit(SessionEvent::Paired);
        Ok(token)
    }

    /// Prove possession of a stored access token
    pub async fn authorize(&self, token: &Uuid) -> Result<(), LinkError> {
        let register = self
            .config
            .security
            .challenge_register
            .ok_or(SecurityError::NotConfigured("challenge_register"))?;
        let attempts = self.begin_attempt()?;

        let challenge = self.read_register(register).await?;
        self.lock_state().security.set_challenge(challenge);
        let response = security::encrypt_challenge(challenge, token);

        self.answer_challenge(register, response, attempts).await?;
        info!("Authorized");
        self.emit(SessionEvent::Authorized);
        Ok(())
    }

    /// Write the keep-alive register, if one is configured
    pub async fn keep_alive(&self) -> Result<(), LinkError> {
        match self.config.device.keep_alive {
            Some(reg) => self.write_register(reg.register, reg.value).await,
            None => {
                debug!("No keep-alive register configured");
                Ok(())
            }
        }
    }

    pub fn set_mode(&self, mode: DeviceMode) {
        let changed = {
            let mut state = self.lock_state();
            let changed = state.mode != mode;
            state.mode = mode;
            changed
        };
        if changed {
            self.emit(SessionEvent::ModeChanged(mode));
        }
    }

    /// Advance the sequence counter without sending anything
    pub fn touch_sequence(&self) -> u8 {
        self.lock_state().touch_sequence()
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::WriteAck { target, status } => {
                self.correlator.on_write_ack(&target, status);
            }
            TransportEvent::ValueChanged { target, value } => {
                if protocol::is_token_notification(&value) {
                    match protocol::parse_token_notification(&value) {
                        Ok(token) => {
                            debug!("Access token frame received");
                            self.token_tx.send_replace(Some(token));
                        }
                        Err(err) => warn!("Ignoring malformed token frame: {}", err),
                    }
                } else if !self.correlator.on_value_changed(&target, &value) {
                    self.emit(SessionEvent::Notification { target, value });
                }
            }
            TransportEvent::ReadyToSend => {
                self.correlator.on_ready_to_send();
            }
            TransportEvent::ConnectionStateChanged(signal) => {
                let trigger = match signal {
                    LinkSignal::Ready => ConnectionTrigger::DeviceReady,
                    LinkSignal::Lost => ConnectionTrigger::TransportLost,
                };
                if let Err(err) = self.transition(trigger) {
                    warn!("Ignoring {:?}: {}", signal, err);
                }
            }
        }
    }

    /// Feed every event from `events` into [`Self::handle_event`] until the
    /// channel closes
    pub async fn drive(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("Transport event channel closed");
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_sender.send(event);
    }

    fn transition(&self, trigger: ConnectionTrigger) -> Result<Transition, LinkError> {
        let transition = connection::apply(&mut self.lock_state(), trigger)?;
        if transition.changed() {
            self.status_tx.send_replace(transition.to);
            self.emit(SessionEvent::ConnectionStatus(transition.to));
            if transition.entered(ConnectionStatus::Disconnected) {
                self.correlator.cancel_all(LinkError::Disconnected);
            }
        }
        Ok(transition)
    }

    fn ensure_connected(&self) -> Result<(), LinkError> {
        match self.status() {
            ConnectionStatus::Connected => Ok(()),
            other => Err(LinkError::NotConnected(other)),
        }
    }

    /// Frame a request with the current sequence number, then advance it.
    /// Nothing advances if the request cannot be framed.
    fn frame_request<F>(&self, assemble: F) -> Result<(u8, String), LinkError>
    where
        F: FnOnce(u8) -> Result<String, ProtocolError>,
    {
        let mut state = self.lock_state();
        if !state.is_connected() {
            return Err(LinkError::NotConnected(state.status()));
        }
        let sequence = state.current_sequence_number();
        let frame = assemble(sequence)?;
        state.touch_sequence();
        Ok((sequence, frame))
    }

    /// Send a framed request and wait for the response notification
    async fn exchange(&self, frame: String) -> Result<Vec<u8>, LinkError> {
        let mut request = BleRequest::new(self.write_target(), frame.into_bytes(), true);
        let result = self
            .correlator
            .write_and_notify(&mut request, &self.read_target())
            .await;
        self.settle(result).await
    }

    /// A terminal transport failure takes a connected session down
    async fn settle<T>(&self, result: Result<T, LinkError>) -> Result<T, LinkError> {
        if let Err(err) = &result {
            if err.is_terminal_transport() && self.status() == ConnectionStatus::Connected {
                error!("Terminal transport error, disconnecting: {}", err);
                if self.transition(ConnectionTrigger::Disconnect).is_ok() {
                    if let Err(e) = self.transport.disconnect().await {
                        error!("Transport disconnect failed: {}", e);
                    }
                }
            }
        }
        result
    }

    async fn write_single(&self, value: RegisterValue) -> Result<RegisterWriteResult, LinkError> {
        self.write_registers(&[value])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ParseError::CountMismatch {
                    expected: 1,
                    got: 0,
                }
                .into()
            })
    }

    fn begin_attempt(&self) -> Result<u32, LinkError> {
        let max = self.config.security.max_attempts;
        let attempt = self.lock_state().security.begin_attempt(max);
        attempt.map_err(|err| {
            warn!("Handshake refused: {}", err);
            self.emit(SessionEvent::SecurityFailure {
                attempts: max,
                error: err.clone(),
            });
            err.into()
        })
    }

    /// Write a handshake response; a non-zero return code is a rejection
    async fn answer_challenge(
        &self,
        register: u16,
        response: u32,
        attempts: u32,
    ) -> Result<(), LinkError> {
        let result = self.write_single(RegisterValue::new(register, response)).await?;
        if !result.is_accepted() {
            let err = SecurityError::Rejected {
                return_code: result.return_code,
            };
            warn!("Handshake attempt {} rejected: {}", attempts, err);
            self.emit(SessionEvent::SecurityFailure {
                attempts,
                error: err.clone(),
            });
            return Err(err.into());
        }
        Ok(())
    }
}

fn check_sequence(sent: u8, received: u8) -> Result<(), ParseError> {
    if sent != received {
        return Err(ParseError::SequenceMismatch { sent, received });
    }
    Ok(())
}

fn check_count(expected: usize, got: usize) -> Result<(), ParseError> {
    if expected != got {
        return Err(ParseError::CountMismatch { expected, got });
    }
    Ok(())
}
