//! Request Correlator
//!
//! Turns the fire-and-forget [`Transport`] into request/response pairs. Each
//! operation registers a pending entry for its characteristic, performs the
//! physical send (retrying while the stack reports busy) and then waits for
//! the matching [`TransportEvent`](super::transport::TransportEvent) or the
//! deadline, whichever comes first.
//!
//! ```text
//! Idle -> AwaitingResponse -> Completed
//!                          -> TimedOut
//!                          -> Failed
//!                          -> Cancelled
//! ```
//!
//! Only one operation may be pending per characteristic. Registrations are
//! scoped: however the operation ends (response, deadline, error, or the
//! caller dropping the future) the entry is removed.

use crate::error::{LinkError, TransportError};
use crate::infrastructure::bluetooth::transport::{
    CharacteristicId, Transport, GATT_BUSY, GATT_SUCCESS,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(4000);
pub const DEFAULT_BUSY_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_BUSY_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Deadline and busy-retry policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub operation_timeout: Duration,
    /// Total send attempts, including the first
    pub busy_retry_attempts: u32,
    pub busy_retry_delay: Duration,
    /// Platform status treated as "busy"
    pub busy_status: i32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            busy_retry_attempts: DEFAULT_BUSY_RETRY_ATTEMPTS,
            busy_retry_delay: DEFAULT_BUSY_RETRY_DELAY,
            busy_status: GATT_BUSY,
        }
    }
}

/// What a pending operation is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Write acknowledgment
    Write,
    /// Transport ready-to-send signal
    WriteWithoutResponse,
    /// Value changed after `read_once`
    Read,
    /// Next value changed, nothing sent on the target itself
    Notify,
    /// Descriptor write acknowledgment
    Subscribe,
}

impl OperationKind {
    fn completes_on_ack(self) -> bool {
        matches!(self, Self::Write | Self::Subscribe)
    }

    fn completes_on_value(self) -> bool {
        matches!(self, Self::Read | Self::Notify)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationState {
    #[default]
    Idle,
    AwaitingResponse,
    Completed,
    TimedOut,
    Failed,
    Cancelled,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Idle | Self::AwaitingResponse)
    }
}

/// One GATT operation and its outcome. Settles exactly once.
#[derive(Debug, Clone)]
pub struct BleRequest {
    pub target: CharacteristicId,
    pub data: Vec<u8>,
    pub with_response: bool,
    response: Option<Vec<u8>>,
    error: Option<LinkError>,
    state: OperationState,
}

impl BleRequest {
    pub fn new(target: CharacteristicId, data: impl Into<Vec<u8>>, with_response: bool) -> Self {
        Self {
            target,
            data: data.into(),
            with_response,
            response: None,
            error: None,
            state: OperationState::Idle,
        }
    }

    /// A request with nothing to send (reads, subscriptions)
    pub fn empty(target: CharacteristicId) -> Self {
        Self::new(target, Vec::new(), true)
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn response(&self) -> Option<&[u8]> {
        self.response.as_deref()
    }

    pub fn error(&self) -> Option<&LinkError> {
        self.error.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.state == OperationState::Completed
    }

    /// Mark the request in flight. A dropped operation leaves it here.
    fn begin(&mut self) {
        if self.state == OperationState::Idle {
            self.state = OperationState::AwaitingResponse;
        }
    }

    /// Record the outcome. Later calls are ignored.
    fn settle(&mut self, outcome: &Result<Vec<u8>, LinkError>) {
        if self.state.is_terminal() {
            return;
        }
        match outcome {
            Ok(value) => {
                self.response = Some(value.clone());
                self.state = OperationState::Completed;
            }
            Err(err) => {
                self.state = match err {
                    LinkError::Timeout(_) => OperationState::TimedOut,
                    LinkError::Cancelled | LinkError::Disconnected => OperationState::Cancelled,
                    _ => OperationState::Failed,
                };
                self.error = Some(err.clone());
            }
        }
    }
}

type Outcome = Result<Vec<u8>, LinkError>;

struct PendingOperation {
    id: u64,
    kind: OperationKind,
    sender: oneshot::Sender<Outcome>,
}

/// Physical step an operation performs after registering
#[derive(Debug, Clone, Copy)]
enum TransportAction<'a> {
    Send {
        target: &'a CharacteristicId,
        data: &'a [u8],
        with_response: bool,
    },
    ReadOnce(&'a CharacteristicId),
    Subscribe(&'a CharacteristicId),
    Unsubscribe(&'a CharacteristicId),
    Nothing,
}

/// Removes its pending entry when dropped
struct Registration<'a> {
    correlator: &'a Correlator,
    target: CharacteristicId,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut pending = self.correlator.lock_pending();
        if pending.get(&self.target).map(|op| op.id) == Some(self.id) {
            pending.remove(&self.target);
            trace!("Unregistered operation {} on {}", self.id, self.target);
        }
    }
}

/// Pending-operation registry in front of a transport
pub struct Correlator {
    transport: Arc<dyn Transport>,
    config: LinkConfig,
    pending: Mutex<HashMap<CharacteristicId, PendingOperation>>,
    next_id: AtomicU64,
}

impl Correlator {
    pub fn new(transport: Arc<dyn Transport>, config: LinkConfig) -> Self {
        Self {
            transport,
            config,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Write `request.data` to `request.target`.
    ///
    /// With response, resolves on the write acknowledgment. Without, resolves
    /// as soon as the transport can take another write.
    pub async fn write(&self, request: &mut BleRequest) -> Result<(), LinkError> {
        let kind = if request.with_response {
            OperationKind::Write
        } else {
            OperationKind::WriteWithoutResponse
        };
        request.begin();
        let action = TransportAction::Send {
            target: &request.target,
            data: &request.data,
            with_response: request.with_response,
        };
        let target = request.target;
        let outcome = self.run(target, kind, action).await;
        request.settle(&outcome);
        outcome.map(|_| ())
    }

    /// Read the current value of `request.target`
    pub async fn read(&self, request: &mut BleRequest) -> Result<Vec<u8>, LinkError> {
        let target = request.target;
        request.begin();
        let outcome = self
            .run(target, OperationKind::Read, TransportAction::ReadOnce(&target))
            .await;
        request.settle(&outcome);
        outcome
    }

    /// Send `request` and resolve on the next notification from `notify`
    pub async fn write_and_notify(
        &self,
        request: &mut BleRequest,
        notify: &CharacteristicId,
    ) -> Result<Vec<u8>, LinkError> {
        request.begin();
        let action = TransportAction::Send {
            target: &request.target,
            data: &request.data,
            with_response: request.with_response,
        };
        let outcome = self.run(*notify, OperationKind::Notify, action).await;
        request.settle(&outcome);
        outcome
    }

    /// Resolve on the next notification from `target` without sending anything
    pub async fn await_notification(&self, target: &CharacteristicId) -> Result<Vec<u8>, LinkError> {
        self.run(*target, OperationKind::Notify, TransportAction::Nothing)
            .await
    }

    pub async fn subscribe(&self, target: &CharacteristicId) -> Result<(), LinkError> {
        self.run(
            *target,
            OperationKind::Subscribe,
            TransportAction::Subscribe(target),
        )
        .await
        .map(|_| ())
    }

    pub async fn unsubscribe(&self, target: &CharacteristicId) -> Result<(), LinkError> {
        self.run(
            *target,
            OperationKind::Subscribe,
            TransportAction::Unsubscribe(target),
        )
        .await
        .map(|_| ())
    }

    /// Feed a write acknowledgment. Returns whether it matched a pending operation.
    pub fn on_write_ack(&self, target: &CharacteristicId, status: u8) -> bool {
        let outcome = if status == GATT_SUCCESS {
            Ok(Vec::new())
        } else {
            Err(LinkError::WriteRejected {
                target: *target,
                status,
            })
        };
        self.complete(target, OperationKind::completes_on_ack, outcome)
    }

    /// Feed a value change. Returns whether it matched a pending operation.
    pub fn on_value_changed(&self, target: &CharacteristicId, value: &[u8]) -> bool {
        self.complete(
            target,
            OperationKind::completes_on_value,
            Ok(value.to_vec()),
        )
    }

    /// Release every write-without-response waiting for the stack
    pub fn on_ready_to_send(&self) -> usize {
        let mut pending = self.lock_pending();
        let ready: Vec<CharacteristicId> = pending
            .iter()
            .filter(|(_, op)| op.kind == OperationKind::WriteWithoutResponse)
            .map(|(target, _)| *target)
            .collect();
        for target in &ready {
            if let Some(op) = pending.remove(target) {
                let _ = op.sender.send(Ok(Vec::new()));
            }
        }
        ready.len()
    }

    /// Fail every pending operation with `reason`
    pub fn cancel_all(&self, reason: LinkError) -> usize {
        let drained: Vec<PendingOperation> = self.lock_pending().drain().map(|(_, op)| op).collect();
        if !drained.is_empty() {
            debug!("Cancelling {} pending operation(s): {}", drained.len(), reason);
        }
        let count = drained.len();
        for op in drained {
            let _ = op.sender.send(Err(reason.clone()));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn is_pending(&self, target: &CharacteristicId) -> bool {
        self.lock_pending().contains_key(target)
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<CharacteristicId, PendingOperation>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(
        &self,
        target: CharacteristicId,
        kind: OperationKind,
    ) -> Result<(Registration<'_>, oneshot::Receiver<Outcome>), LinkError> {
        let mut pending = self.lock_pending();
        if pending.contains_key(&target) {
            debug!("Rejecting {:?} on {}: operation in progress", kind, target);
            return Err(LinkError::InProgress(target));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        pending.insert(target, PendingOperation { id, kind, sender });
        trace!("Registered {:?} operation {} on {}", kind, id, target);

        Ok((
            Registration {
                correlator: self,
                target,
                id,
            },
            receiver,
        ))
    }

    fn complete(
        &self,
        target: &CharacteristicId,
        accepts: fn(OperationKind) -> bool,
        outcome: Outcome,
    ) -> bool {
        let op = {
            let mut pending = self.lock_pending();
            match pending.get(target) {
                Some(op) if accepts(op.kind) => pending.remove(target),
                _ => None,
            }
        };
        match op {
            Some(op) => {
                trace!("Completing operation {} on {}", op.id, target);
                let _ = op.sender.send(outcome);
                true
            }
            None => {
                trace!("No pending operation on {} for this event", target);
                false
            }
        }
    }

    async fn run(
        &self,
        target: CharacteristicId,
        kind: OperationKind,
        action: TransportAction<'_>,
    ) -> Outcome {
        let (_registration, receiver) = self.register(target, kind)?;
        let deadline = self.config.operation_timeout;

        let exchange = async {
            self.perform_with_retry(action).await?;
            if kind == OperationKind::WriteWithoutResponse
                && self.transport.can_send_write_without_response()
            {
                return Ok(Vec::new());
            }
            receiver.await.map_err(|_| LinkError::Cancelled)?
        };

        match tokio::time::timeout(deadline, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("{:?} on {} timed out after {:?}", kind, target, deadline);
                Err(LinkError::Timeout(deadline))
            }
        }
    }

    async fn perform_with_retry(&self, action: TransportAction<'_>) -> Result<(), LinkError> {
        let max_attempts = self.config.busy_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match action {
                TransportAction::Send {
                    target,
                    data,
                    with_response,
                } => {
                    trace!("Sending {} bytes to {}", data.len(), target);
                    self.transport.send(target, data, with_response).await
                }
                TransportAction::ReadOnce(target) => self.transport.read_once(target).await,
                TransportAction::Subscribe(target) => self.transport.subscribe(target).await,
                TransportAction::Unsubscribe(target) => self.transport.unsubscribe(target).await,
                TransportAction::Nothing => Ok(()),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(TransportError::Transient { status })
                    if status == self.config.busy_status && attempt < max_attempts =>
                {
                    warn!(
                        "Transport busy (status {}), retry {}/{} in {:?}",
                        status, attempt, max_attempts, self.config.busy_retry_delay
                    );
                    tokio::time::sleep(self.config.busy_retry_delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!("Transport still busy after {} attempts", attempt);
                    } else {
                        error!("Transport failure: {}", err);
                    }
                    return Err(err.into());
                }
            }
        }
    }
}
