//! In-process DRO peripheral
//!
//! Implements [`BleAdapter`] without a radio. Every request is recorded so
//! tests can assert on exact submission order. In manual mode nothing is
//! completed until the test injects events; in automatic mode connects,
//! discovery and writes complete immediately with a standard DRO GATT table.

use crate::domain::models::Axis;
use crate::infrastructure::bluetooth::protocol::{
    self, DroCharacteristic, CCCD_UUID, ENABLE_NOTIFICATION_VALUE,
};
use crate::infrastructure::bluetooth::transport::{
    Advertisement, AttributeHandle, BleAdapter, ConnectionId, DeviceAddress, GattCharacteristic,
    GattDescriptor, GattService, GattStatus, TransportError, TransportEvent, WriteTarget,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// A request received by the simulated adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    Connect(DeviceAddress),
    Reconnect(ConnectionId),
    Disconnect(ConnectionId),
    Close(ConnectionId),
    DiscoverServices(ConnectionId),
    SetNotification {
        connection: ConnectionId,
        characteristic: AttributeHandle,
        enabled: bool,
    },
    WriteCharacteristic {
        connection: ConnectionId,
        handle: AttributeHandle,
        value: Vec<u8>,
    },
    WriteDescriptor {
        connection: ConnectionId,
        handle: AttributeHandle,
        value: Vec<u8>,
    },
    StartScan(Option<Uuid>),
    StopScan,
}

#[derive(Default)]
struct SimState {
    next_connection: u64,
    calls: Vec<AdapterCall>,
    links: HashMap<ConnectionId, DeviceAddress>,
    last_connection: Option<ConnectionId>,
    database: Vec<GattService>,
    subscribed: HashSet<AttributeHandle>,
    write_statuses: VecDeque<GattStatus>,
    reject_reconnect: bool,
    scanning: bool,
}

pub struct SimulatedAdapter {
    available: AtomicBool,
    auto_complete: bool,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<SimState>,
}

impl SimulatedAdapter {
    /// Adapter that only records requests.
    pub fn manual() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        Self::build(false)
    }

    /// Adapter that completes every request right away.
    pub fn automatic() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        Self::build(true)
    }

    fn build(auto_complete: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let adapter = Self {
            available: AtomicBool::new(true),
            auto_complete,
            events,
            state: Mutex::new(SimState {
                next_connection: 1,
                database: Self::dro_database(),
                ..Default::default()
            }),
        };
        (Arc::new(adapter), receiver)
    }

    /// GATT table of a PSoC 6 DRO.
    pub fn dro_database() -> Vec<GattService> {
        let characteristic = |c: DroCharacteristic, handle: u16, notify: bool| GattCharacteristic {
            uuid: c.uuid(),
            handle: AttributeHandle(handle),
            descriptors: if notify {
                vec![GattDescriptor {
                    uuid: CCCD_UUID,
                    handle: AttributeHandle(handle + 1),
                }]
            } else {
                Vec::new()
            },
        };

        vec![
            GattService {
                uuid: Uuid::from_u128(0x00001801_0000_1000_8000_00805f9b34fb),
                handle: AttributeHandle(0x0001),
                characteristics: Vec::new(),
            },
            GattService {
                uuid: protocol::SERVICE_UUID,
                handle: AttributeHandle(0x0010),
                characteristics: vec![
                    characteristic(DroCharacteristic::EncoderX, 0x0012, true),
                    characteristic(DroCharacteristic::EncoderY, 0x0015, true),
                    characteristic(DroCharacteristic::EncoderZ, 0x0018, true),
                    characteristic(DroCharacteristic::Command, 0x001B, false),
                ],
            },
        ]
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: AdapterCall) {
        trace!("Simulated adapter: {:?}", call);
        self.lock().calls.push(call);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_database(&self, services: Vec<GattService>) {
        self.lock().database = services;
    }

    /// Make `reconnect` fail as if the OS had invalidated the connection object.
    pub fn reject_reconnect(&self, reject: bool) {
        self.lock().reject_reconnect = reject;
    }

    /// Status reported by the next automatic write completion.
    pub fn push_write_status(&self, status: GattStatus) {
        self.lock().write_statuses.push_back(status);
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.lock().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<AdapterCall> {
        std::mem::take(&mut self.lock().calls)
    }

    pub fn last_connection(&self) -> Option<ConnectionId> {
        self.lock().last_connection
    }

    /// Number of CCCDs currently enabled.
    pub fn subscriptions(&self) -> usize {
        self.lock().subscribed.len()
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Deliver an advertisement if a scan is running.
    pub fn advertise(&self, advertisement: Advertisement) -> bool {
        if !self.lock().scanning {
            return false;
        }
        self.emit(TransportEvent::Advertisement(advertisement));
        true
    }

    /// Push an encoder count, if the client enabled notifications for that axis.
    pub fn notify_axis(&self, connection: ConnectionId, axis: Axis, value: i32) -> bool {
        let uuid = DroCharacteristic::for_axis(axis).uuid();
        let enabled = {
            let state = self.lock();
            state.links.contains_key(&connection)
                && state
                    .database
                    .iter()
                    .filter_map(|s| s.characteristic(uuid))
                    .filter_map(|c| c.descriptor(CCCD_UUID))
                    .any(|d| state.subscribed.contains(&d.handle))
        };
        if enabled {
            self.emit(TransportEvent::CharacteristicChanged {
                connection,
                uuid,
                value: protocol::encode_encoder_value(value).to_vec(),
            });
        }
        enabled
    }

    /// Drop the link from the peripheral side.
    pub fn link_lost(&self, connection: ConnectionId) {
        self.lock().subscribed.clear();
        self.emit(TransportEvent::ConnectionStateChanged {
            connection,
            connected: false,
        });
    }

    fn complete_write(&self, connection: ConnectionId, target: WriteTarget) {
        if !self.auto_complete {
            return;
        }
        let status = self
            .lock()
            .write_statuses
            .pop_front()
            .unwrap_or(GattStatus::Success);
        self.emit(TransportEvent::WriteComplete {
            connection,
            target,
            status,
        });
    }

    fn ensure_link(&self, connection: ConnectionId) -> Result<(), TransportError> {
        if self.lock().links.contains_key(&connection) {
            Ok(())
        } else {
            Err(TransportError::UnknownConnection(connection))
        }
    }
}

impl BleAdapter for SimulatedAdapter {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn connect(&self, address: DeviceAddress) -> Result<ConnectionId, TransportError> {
        if !self.is_available() {
            return Err(TransportError::Unavailable);
        }
        self.record(AdapterCall::Connect(address));
        let connection = {
            let mut state = self.lock();
            let connection = ConnectionId(state.next_connection);
            state.next_connection += 1;
            state.links.insert(connection, address);
            state.last_connection = Some(connection);
            connection
        };
        debug!("Simulated connection {} to {}", connection, address);
        if self.auto_complete {
            self.emit(TransportEvent::ConnectionStateChanged {
                connection,
                connected: true,
            });
        }
        Ok(connection)
    }

    fn reconnect(&self, connection: ConnectionId) -> Result<(), TransportError> {
        self.record(AdapterCall::Reconnect(connection));
        if self.lock().reject_reconnect {
            return Err(TransportError::Rejected(format!(
                "{} no longer valid",
                connection
            )));
        }
        self.ensure_link(connection)?;
        self.lock().last_connection = Some(connection);
        if self.auto_complete {
            self.emit(TransportEvent::ConnectionStateChanged {
                connection,
                connected: true,
            });
        }
        Ok(())
    }

    fn disconnect(&self, connection: ConnectionId) {
        self.record(AdapterCall::Disconnect(connection));
        self.lock().subscribed.clear();
        if self.auto_complete && self.ensure_link(connection).is_ok() {
            self.emit(TransportEvent::ConnectionStateChanged {
                connection,
                connected: false,
            });
        }
    }

    fn close(&self, connection: ConnectionId) {
        self.record(AdapterCall::Close(connection));
        let mut state = self.lock();
        state.links.remove(&connection);
        state.subscribed.clear();
    }

    fn discover_services(&self, connection: ConnectionId) -> Result<(), TransportError> {
        self.record(AdapterCall::DiscoverServices(connection));
        self.ensure_link(connection)?;
        if self.auto_complete {
            let services = self.lock().database.clone();
            self.emit(TransportEvent::ServicesDiscovered {
                connection,
                status: GattStatus::Success,
                services,
            });
        }
        Ok(())
    }

    fn set_notification(
        &self,
        connection: ConnectionId,
        characteristic: AttributeHandle,
        enabled: bool,
    ) -> Result<(), TransportError> {
        self.record(AdapterCall::SetNotification {
            connection,
            characteristic,
            enabled,
        });
        self.ensure_link(connection)
    }

    fn write_characteristic(
        &self,
        connection: ConnectionId,
        characteristic: AttributeHandle,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.record(AdapterCall::WriteCharacteristic {
            connection,
            handle: characteristic,
            value: value.to_vec(),
        });
        self.ensure_link(connection)?;
        self.complete_write(connection, WriteTarget::Characteristic(characteristic));
        Ok(())
    }

    fn write_descriptor(
        &self,
        connection: ConnectionId,
        descriptor: AttributeHandle,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.record(AdapterCall::WriteDescriptor {
            connection,
            handle: descriptor,
            value: value.to_vec(),
        });
        self.ensure_link(connection)?;
        {
            let mut state = self.lock();
            if value == ENABLE_NOTIFICATION_VALUE.as_slice() {
                state.subscribed.insert(descriptor);
            } else {
                state.subscribed.remove(&descriptor);
            }
        }
        self.complete_write(connection, WriteTarget::Descriptor(descriptor));
        Ok(())
    }

    fn start_scan(&self, service_filter: Option<Uuid>) -> Result<(), TransportError> {
        if !self.is_available() {
            return Err(TransportError::Unavailable);
        }
        self.record(AdapterCall::StartScan(service_filter));
        self.lock().scanning = true;
        Ok(())
    }

    fn stop_scan(&self) {
        self.record(AdapterCall::StopScan);
        self.lock().scanning = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_automatic_connect_and_discover() {
        let (adapter, mut events) = SimulatedAdapter::automatic();
        let addr = DeviceAddress([0, 0xA0, 0x50, 0, 0, 1]);

        let conn = adapter.connect(addr).unwrap();
        adapter.discover_services(conn).unwrap();

        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::ConnectionStateChanged { connected: true, .. })
        ));
        match events.recv().await {
            Some(TransportEvent::ServicesDiscovered { services, .. }) => {
                assert!(services.iter().any(|s| s.uuid == protocol::SERVICE_UUID));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_notifications_require_cccd() {
        let (adapter, mut events) = SimulatedAdapter::automatic();
        let conn = adapter.connect(DeviceAddress([1; 6])).unwrap();
        let _ = events.recv().await;

        assert!(!adapter.notify_axis(conn, Axis::X, 5));
        adapter
            .write_descriptor(conn, AttributeHandle(0x0013), &ENABLE_NOTIFICATION_VALUE)
            .unwrap();
        assert!(adapter.notify_axis(conn, Axis::X, 5));
        assert!(!adapter.notify_axis(conn, Axis::Y, 5));
    }

    #[test]
    fn test_manual_mode_records_only() {
        let (adapter, mut events) = SimulatedAdapter::manual();
        let conn = adapter.connect(DeviceAddress([2; 6])).unwrap();
        adapter
            .write_characteristic(conn, AttributeHandle(0x001B), &[0x01])
            .unwrap();

        assert!(events.try_recv().is_err());
        assert_eq!(adapter.calls().len(), 2);
    }

    #[test]
    fn test_closed_connection_rejects_requests() {
        let (adapter, _events) = SimulatedAdapter::manual();
        let conn = adapter.connect(DeviceAddress([3; 6])).unwrap();
        adapter.close(conn);

        assert_eq!(
            adapter.discover_services(conn),
            Err(TransportError::UnknownConnection(conn))
        );
        assert!(adapter.reconnect(conn).is_err());
    }
}
