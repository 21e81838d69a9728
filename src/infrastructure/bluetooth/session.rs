//! DRO Session
//!
//! Connection lifecycle and GATT resolution for one device:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> DiscoveringServices -> Ready
//!       ^                                                            |
//!       +------------------- transport disconnected -----------------+
//! ```
//!
//! All transport completions are fed in through [`Session::handle_event`],
//! one at a time, in the order the adapter delivered them.

use crate::domain::encoder::EncoderValueStore;
use crate::domain::models::{Axis, DroEvent, MessageSeverity, StatusMessage};
use crate::error::DroError;
use crate::infrastructure::bluetooth::protocol::{
    self, DroCharacteristic, CCCD_UUID, DISABLE_NOTIFICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
use crate::infrastructure::bluetooth::queue::{
    OperationQueue, OperationSink, PendingOperation, WriteOutcome,
};
use crate::infrastructure::bluetooth::transport::{
    AttributeHandle, BleAdapter, ConnectionId, DeviceAddress, GattService, GattStatus,
    TransportError, TransportEvent, WriteTarget,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    DiscoveringServices,
    Ready,
    /// The device cannot be driven (missing service, failed discovery or a
    /// protocol violation). Only `connect` leaves this state.
    Failed,
}

impl SessionState {
    fn accepts_connect(self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Failed)
    }

    fn link_up(self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::Connected
                | SessionState::DiscoveringServices
                | SessionState::Ready
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::DiscoveringServices => "discovering services",
            SessionState::Ready => "ready",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A resolved characteristic and its CCCD, if it has one.
#[derive(Debug, Clone, Copy)]
struct ResolvedCharacteristic {
    handle: AttributeHandle,
    cccd: Option<AttributeHandle>,
}

/// Submits queued writes on one connection.
struct ConnectionSink<'a> {
    adapter: &'a dyn BleAdapter,
    connection: ConnectionId,
}

impl OperationSink for ConnectionSink<'_> {
    fn submit(&self, op: &PendingOperation) -> Result<(), TransportError> {
        match op {
            PendingOperation::CharacteristicWrite { handle, value } => {
                debug!("Writing characteristic {}", handle);
                self.adapter
                    .write_characteristic(self.connection, *handle, value)
            }
            PendingOperation::DescriptorWrite { handle, value } => {
                debug!("Writing descriptor {}", handle);
                self.adapter.write_descriptor(self.connection, *handle, value)
            }
        }
    }
}

/// One logical connection to a DRO.
pub struct Session {
    adapter: Arc<dyn BleAdapter>,
    store: Arc<EncoderValueStore>,
    event_sender: mpsc::UnboundedSender<DroEvent>,
    address: Option<DeviceAddress>,
    connection: Option<ConnectionId>,
    state: SessionState,
    service: Option<AttributeHandle>,
    characteristics: HashMap<DroCharacteristic, ResolvedCharacteristic>,
    queue: OperationQueue,
    failure: Option<DroError>,
}

impl Session {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        store: Arc<EncoderValueStore>,
        event_sender: mpsc::UnboundedSender<DroEvent>,
    ) -> Self {
        Self {
            adapter,
            store,
            event_sender,
            address: None,
            connection: None,
            state: SessionState::Disconnected,
            service: None,
            characteristics: HashMap::new(),
            queue: OperationQueue::new(),
            failure: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn address(&self) -> Option<DeviceAddress> {
        self.address
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    /// Why the session entered [`SessionState::Failed`].
    pub fn failure(&self) -> Option<&DroError> {
        self.failure.as_ref()
    }

    pub fn service_handle(&self) -> Option<AttributeHandle> {
        self.service
    }

    pub fn is_resolved(&self, characteristic: DroCharacteristic) -> bool {
        self.characteristics.contains_key(&characteristic)
    }

    /// Writes queued or in flight.
    pub fn pending_writes(&self) -> usize {
        self.queue.len()
    }

    pub fn encoder_value(&self, axis: Axis) -> i32 {
        self.store.read(axis)
    }

    /// Start connecting to `address`.
    ///
    /// A connection object left over from an earlier session with the same
    /// address is reused when the adapter accepts it; otherwise a fresh one
    /// is created. After a failure the old object is never reused, since its
    /// requested disconnect may still be in flight.
    pub fn connect(&mut self, address: DeviceAddress) -> Result<(), DroError> {
        if !self.adapter.is_available() {
            warn!("Bluetooth adapter not initialized");
            return Err(DroError::TransportUnavailable);
        }
        if !self.state.accepts_connect() {
            return Err(DroError::InvalidState(self.state));
        }

        let reusable = self.state == SessionState::Disconnected;
        self.invalidate_handles();
        self.failure = None;

        match (self.address, self.connection) {
            (Some(previous), Some(connection)) if reusable && previous == address => {
                info!("Trying to use existing connection {} for {}", connection, address);
                match self.adapter.reconnect(connection) {
                    Ok(()) => {
                        self.set_state(SessionState::Connecting);
                        return Ok(());
                    }
                    Err(e) => {
                        warn!("Reusing {} failed ({}), creating a new connection", connection, e);
                        self.adapter.close(connection);
                        self.connection = None;
                    }
                }
            }
            (_, Some(stale)) => {
                debug!("Releasing previous connection {}", stale);
                self.adapter.close(stale);
                self.connection = None;
            }
            _ => {}
        }

        let connection = self.adapter.connect(address)?;
        info!("Trying to create a new connection to {}", address);
        self.send_log(
            &format!("Connecting to device {}...", address),
            MessageSeverity::Info,
        );
        self.address = Some(address);
        self.connection = Some(connection);
        self.set_state(SessionState::Connecting);
        Ok(())
    }

    /// Ask the transport to drop the link. The session reaches
    /// `Disconnected` when the transport confirms.
    pub fn disconnect(&mut self) {
        match self.connection {
            Some(connection) => {
                info!("Disconnecting {}", connection);
                self.adapter.disconnect(connection);
            }
            None => warn!("No connection to disconnect"),
        }
    }

    /// Release the transport connection object. Safe to call repeatedly.
    pub fn close(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        info!("Closing connection {}", connection);
        self.adapter.close(connection);
        self.invalidate_handles();
        self.abandon_pending_writes();

        let was_up = self.state.link_up();
        self.set_state(SessionState::Disconnected);
        if was_up {
            self.emit(DroEvent::Disconnected);
        }
    }

    /// Write a single byte to the command characteristic.
    pub fn send_command(&mut self, value: u8) -> Result<(), DroError> {
        if self.state != SessionState::Ready {
            return Err(DroError::InvalidState(self.state));
        }
        let handle = self
            .characteristics
            .get(&DroCharacteristic::Command)
            .map(|c| c.handle)
            .ok_or(DroError::CharacteristicMissing(DroCharacteristic::Command))?;

        info!("Writing command {:#04x}", value);
        self.enqueue(PendingOperation::CharacteristicWrite {
            handle,
            value: vec![value],
        })
    }

    /// Turn notifications for one axis on or off.
    pub fn set_axis_notifications(&mut self, axis: Axis, enabled: bool) -> Result<(), DroError> {
        if self.state != SessionState::Ready {
            return Err(DroError::InvalidState(self.state));
        }
        self.set_characteristic_notification(DroCharacteristic::for_axis(axis), enabled)
    }

    /// Feed one transport event into the state machine.
    ///
    /// Events for a connection other than the current one, and anything
    /// but link state changes once the session is down, are discarded.
    pub fn handle_event(&mut self, event: TransportEvent) -> Result<(), DroError> {
        let Some(connection) = event.connection() else {
            return Ok(());
        };
        if self.connection != Some(connection) {
            debug!("Discarding event for stale connection {}", connection);
            return Ok(());
        }

        match event {
            TransportEvent::ConnectionStateChanged {
                connected: true, ..
            } => self.on_connected(connection),
            TransportEvent::ConnectionStateChanged {
                connected: false, ..
            } => {
                self.on_disconnected();
                Ok(())
            }
            _ if !self.state.link_up() => {
                debug!("Discarding late event while {}", self.state);
                Ok(())
            }
            // Writes are only issued once Ready, so anything earlier on a
            // reused connection object belongs to the previous link
            TransportEvent::WriteComplete { target, .. } if self.state != SessionState::Ready => {
                debug!("Discarding write completion for {} while {}", target, self.state);
                Ok(())
            }
            TransportEvent::ServicesDiscovered {
                status, services, ..
            } => self.on_services_discovered(connection, status, &services),
            TransportEvent::CharacteristicChanged { uuid, value, .. } => {
                self.on_characteristic_changed(uuid, &value);
                Ok(())
            }
            TransportEvent::WriteComplete { target, status, .. } => {
                self.on_write_complete(connection, target, status)
            }
            TransportEvent::Advertisement(_) => Ok(()),
        }
    }

    fn on_connected(&mut self, connection: ConnectionId) -> Result<(), DroError> {
        if self.state != SessionState::Connecting {
            debug!("Ignoring connected event while {}", self.state);
            return Ok(());
        }

        info!("Connected to GATT server");
        self.set_state(SessionState::Connected);
        self.emit(DroEvent::Connected);

        info!("Starting service discovery");
        if let Err(e) = self.adapter.discover_services(connection) {
            let err = DroError::from(e);
            self.fail(err.clone(), false);
            return Err(err);
        }
        Ok(())
    }

    fn on_disconnected(&mut self) {
        info!("Disconnected from GATT server");
        self.invalidate_handles();
        self.abandon_pending_writes();

        let was_up = self.state.link_up();
        if was_up {
            self.set_state(SessionState::Disconnected);
        }
        if was_up || self.state == SessionState::Failed {
            self.send_log("Disconnected from device", MessageSeverity::Info);
            self.emit(DroEvent::Disconnected);
        }
    }

    fn on_services_discovered(
        &mut self,
        connection: ConnectionId,
        status: GattStatus,
        services: &[GattService],
    ) -> Result<(), DroError> {
        if self.state != SessionState::Connected {
            debug!("Ignoring service discovery result while {}", self.state);
            return Ok(());
        }
        if !status.is_success() {
            warn!("Service discovery failed: {}", status);
            let err = DroError::DiscoveryFailed(status);
            self.fail(err.clone(), false);
            return Err(err);
        }

        self.set_state(SessionState::DiscoveringServices);

        let Some(service) = services.iter().find(|s| s.uuid == protocol::SERVICE_UUID) else {
            let err = DroError::ServiceNotSupported(protocol::SERVICE_UUID);
            error!("{}", err);
            self.fail(err.clone(), false);
            return Err(err);
        };
        info!("Found DRO service at {}", service.handle);
        self.service = Some(service.handle);

        for characteristic in DroCharacteristic::ALL {
            match service.characteristic(characteristic.uuid()) {
                Some(found) => {
                    debug!("Found {} characteristic at {}", characteristic, found.handle);
                    self.characteristics.insert(
                        characteristic,
                        ResolvedCharacteristic {
                            handle: found.handle,
                            cccd: found.descriptor(CCCD_UUID).map(|d| d.handle),
                        },
                    );
                }
                None => {
                    warn!("{} characteristic not found", characteristic);
                    self.emit(DroEvent::CharacteristicMissing(characteristic));
                }
            }
        }

        debug!("Resolved {} characteristics on {}", self.characteristics.len(), connection);
        self.set_state(SessionState::Ready);
        self.send_log("Connection established!", MessageSeverity::Success);

        for axis in Axis::ALL {
            let characteristic = DroCharacteristic::for_axis(axis);
            if !self.is_resolved(characteristic) {
                continue;
            }
            if let Err(e) = self.set_characteristic_notification(characteristic, true) {
                warn!("Could not enable {} notifications: {}", characteristic, e);
                if matches!(e, DroError::CharacteristicMissing(_)) {
                    self.emit(DroEvent::CharacteristicMissing(characteristic));
                }
            }
        }
        Ok(())
    }

    fn on_characteristic_changed(&mut self, uuid: Uuid, value: &[u8]) {
        if self.state != SessionState::Ready {
            debug!("Ignoring notification while {}", self.state);
            return;
        }
        let Some(axis) = DroCharacteristic::from_uuid(uuid).and_then(DroCharacteristic::axis)
        else {
            trace!("Ignoring notification from unknown characteristic {}", uuid);
            return;
        };

        match protocol::decode_encoder_value(value) {
            Ok(count) => {
                trace!("Encoder {} = {}", axis, count);
                self.store.update(axis, count);
                self.emit(DroEvent::DataAvailable { axis, value: count });
            }
            Err(e) => warn!("Dropping encoder {} notification: {}", axis, e),
        }
    }

    fn on_write_complete(
        &mut self,
        connection: ConnectionId,
        target: WriteTarget,
        status: GattStatus,
    ) -> Result<(), DroError> {
        let result = {
            let sink = ConnectionSink {
                adapter: self.adapter.as_ref(),
                connection,
            };
            self.queue.on_completion(target, status, &sink)
        };

        match result {
            Ok(outcomes) => {
                self.report(outcomes);
                Ok(())
            }
            Err(err) => {
                error!("GATT serialization broken: {}", err);
                self.fail(err.clone(), true);
                Err(err)
            }
        }
    }

    fn set_characteristic_notification(
        &mut self,
        characteristic: DroCharacteristic,
        enabled: bool,
    ) -> Result<(), DroError> {
        let connection = self.connection.ok_or(DroError::InvalidState(self.state))?;
        let resolved = *self
            .characteristics
            .get(&characteristic)
            .ok_or(DroError::CharacteristicMissing(characteristic))?;
        let cccd = resolved
            .cccd
            .ok_or(DroError::CharacteristicMissing(characteristic))?;

        self.adapter
            .set_notification(connection, resolved.handle, enabled)?;

        let value = if enabled {
            ENABLE_NOTIFICATION_VALUE
        } else {
            DISABLE_NOTIFICATION_VALUE
        };
        info!(
            "{} notifications for {}",
            if enabled { "Enabling" } else { "Disabling" },
            characteristic
        );
        self.enqueue(PendingOperation::DescriptorWrite {
            handle: cccd,
            value: value.to_vec(),
        })
    }

    fn enqueue(&mut self, op: PendingOperation) -> Result<(), DroError> {
        let connection = self.connection.ok_or(DroError::InvalidState(self.state))?;
        let refused = {
            let sink = ConnectionSink {
                adapter: self.adapter.as_ref(),
                connection,
            };
            self.queue.enqueue(op, &sink)
        };
        self.report(refused);
        Ok(())
    }

    fn report(&mut self, outcomes: Vec<WriteOutcome>) {
        for outcome in outcomes {
            match outcome.result {
                Ok(()) => debug!("Write to {} complete", outcome.operation.target()),
                Err(error) => {
                    self.send_log(&error.to_string(), MessageSeverity::Warning);
                    self.emit(DroEvent::WriteFailed {
                        operation: outcome.operation,
                        error,
                    });
                }
            }
        }
    }

    /// Enter `Failed`. `release` closes the connection object instead of
    /// only asking the transport to disconnect.
    fn fail(&mut self, err: DroError, release: bool) {
        self.send_log(&err.to_string(), MessageSeverity::Error);
        self.failure = Some(err.clone());
        self.invalidate_handles();
        self.abandon_pending_writes();
        self.set_state(SessionState::Failed);
        self.emit(DroEvent::SessionFailed(err));

        if release {
            if let Some(connection) = self.connection.take() {
                self.adapter.close(connection);
            }
        } else if let Some(connection) = self.connection {
            self.adapter.disconnect(connection);
        }
    }

    fn invalidate_handles(&mut self) {
        self.service = None;
        self.characteristics.clear();
    }

    fn abandon_pending_writes(&mut self) {
        for operation in self.queue.clear() {
            debug!("Abandoning write to {}", operation.target());
            self.emit(DroEvent::WriteFailed {
                operation,
                error: DroError::LinkLost,
            });
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("Session state {} -> {}", self.state, state);
            self.state = state;
            self.emit(DroEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: DroEvent) {
        let _ = self.event_sender.send(event);
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        self.emit(DroEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}
