//! DRO Service Module
//!
//! Main service that coordinates scanning, the connection session and
//! encoder data for the application.

use crate::domain::encoder::{EncoderSample, EncoderValueStore};
use crate::domain::models::{Axis, DroEvent, ScannedDevice};
use crate::domain::settings::SettingsService;
use crate::error::DroError;
use crate::infrastructure::bluetooth::{
    protocol,
    scanner::BleScanner,
    session::{Session, SessionState},
    transport::{BleAdapter, DeviceAddress, TransportEvent},
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Public API for the application
pub struct DroService {
    adapter: Arc<dyn BleAdapter>,
    session: Arc<Mutex<Session>>,
    scanner: BleScanner,
    store: Arc<EncoderValueStore>,
    settings: Arc<Mutex<SettingsService>>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    pump: Option<JoinHandle<()>>,
}

impl DroService {
    /// Create a new DRO service
    ///
    /// `transport_events` is the adapter's completion channel; it is drained
    /// once [`initialize`](Self::initialize) has been called.
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        event_sender: mpsc::UnboundedSender<DroEvent>,
        settings: Arc<Mutex<SettingsService>>,
    ) -> Self {
        let window = lock(&settings).get().scan_window();
        let store = Arc::new(EncoderValueStore::new());
        let session = Session::new(adapter.clone(), store.clone(), event_sender.clone());

        Self {
            scanner: BleScanner::new(adapter.clone(), event_sender, window),
            adapter,
            session: Arc::new(Mutex::new(session)),
            store,
            settings,
            transport_events: Some(transport_events),
            pump: None,
        }
    }

    /// Check the adapter, reset encoder values and start processing
    /// transport events. Must be called from within a tokio runtime.
    pub fn initialize(&mut self) -> bool {
        if !self.adapter.is_available() {
            error!("Unable to obtain a Bluetooth adapter.");
            return false;
        }

        self.store.reset();

        if self.pump.is_none() {
            match self.transport_events.take() {
                Some(events) => {
                    let session = self.session.clone();
                    let scanner = self.scanner.clone();
                    self.pump = Some(tokio::spawn(run_event_pump(events, session, scanner)));
                }
                None => {
                    error!("Transport event channel already consumed");
                    return false;
                }
            }
        }

        info!("DRO service initialized");
        true
    }

    /// Start scanning for DRO devices using the configured service UUID
    pub fn start_scan(&self) -> Result<(), DroError> {
        let configured = lock(&self.settings).get().ble_service_uuid.clone();
        let filter = protocol::parse_uuid(&configured).unwrap_or_else(|e| {
            warn!("{}; scanning for the default DRO service", e);
            protocol::SERVICE_UUID
        });
        self.scanner.start(Some(filter))
    }

    /// Stop scanning
    pub fn stop_scan(&self) {
        self.scanner.stop()
    }

    pub fn scanned_devices(&self) -> Vec<ScannedDevice> {
        self.scanner.devices()
    }

    /// Connect to a device by address. The result arrives as events.
    pub fn connect(&self, address: DeviceAddress) -> Result<(), DroError> {
        if self.pump.is_none() {
            warn!("DRO service not initialized");
            return Err(DroError::TransportUnavailable);
        }

        lock(&self.session).connect(address)?;
        self.scanner.stop();

        if let Err(e) = lock(&self.settings).add_known_address(address) {
            warn!("Could not remember device {}: {}", address, e);
        }
        Ok(())
    }

    /// Disconnect from the current device
    pub fn disconnect(&self) {
        lock(&self.session).disconnect();
    }

    /// Release the connection. Safe to call when already closed.
    pub fn close(&self) {
        lock(&self.session).close();
    }

    pub fn state(&self) -> SessionState {
        lock(&self.session).state()
    }

    /// Latest raw count for `axis`, 0 before the first notification.
    pub fn get_encoder_value(&self, axis: Axis) -> i32 {
        self.store.read(axis)
    }

    pub fn encoder_sample(&self, axis: Axis) -> EncoderSample {
        self.store.sample(axis)
    }

    /// Shared handle to the encoder values for readers on other tasks.
    pub fn encoder_store(&self) -> Arc<EncoderValueStore> {
        self.store.clone()
    }

    /// Calibrated display text for `axis`, e.g. `"12.500 mm"`.
    pub fn readout(&self, axis: Axis) -> String {
        let calibration = lock(&self.settings).get().calibration;
        calibration.format_readout(axis, self.store.read(axis))
    }

    /// Write one byte to the command characteristic
    pub fn send_reset_command(&self, value: u8) -> Result<(), DroError> {
        lock(&self.session).send_command(value)
    }

    /// Send the configured workspace-zero command
    pub fn zero_workspace(&self) -> Result<(), DroError> {
        let value = lock(&self.settings).get().reset_command_value;
        self.send_reset_command(value)
    }

    pub fn set_axis_notifications(&self, axis: Axis, enabled: bool) -> Result<(), DroError> {
        lock(&self.session).set_axis_notifications(axis, enabled)
    }
}

impl Drop for DroService {
    fn drop(&mut self) {
        self.scanner.stop();
        {
            let mut session = lock(&self.session);
            if session.connection().is_some() {
                session.disconnect();
            }
            session.close();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Deliver transport events in arrival order.
async fn run_event_pump(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    session: Arc<Mutex<Session>>,
    scanner: BleScanner,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Advertisement(advertisement) => scanner.on_advertisement(&advertisement),
            other => {
                if let Err(e) = lock(&session).handle_event(other) {
                    warn!("Transport event rejected: {}", e);
                }
            }
        }
    }
    debug!("Transport event channel closed");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::simulated::{AdapterCall, SimulatedAdapter};
    use crate::infrastructure::bluetooth::transport::{Advertisement, AttributeHandle, GattStatus};
    use crate::infrastructure::bluetooth::{protocol::SERVICE_UUID, transport::GattService};
    use std::time::Duration;
    use tokio::time::timeout;

    const ADDR: DeviceAddress = DeviceAddress([0x00, 0xA0, 0x50, 0x00, 0x00, 0x07]);

    struct Fixture {
        service: DroService,
        adapter: Arc<SimulatedAdapter>,
        events: mpsc::UnboundedReceiver<DroEvent>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let settings = SettingsService::with_path(dir.path().join("settings.json"));
        let (adapter, transport) = SimulatedAdapter::automatic();
        let (tx, events) = mpsc::unbounded_channel();
        let service = DroService::new(
            adapter.clone(),
            transport,
            tx,
            Arc::new(Mutex::new(settings)),
        );
        Fixture {
            service,
            adapter,
            events,
            _dir: dir,
        }
    }

    async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<DroEvent>, mut pred: F) -> DroEvent
    where
        F: FnMut(&DroEvent) -> bool,
    {
        timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("timed out waiting for condition");
    }

    async fn connect_ready(f: &mut Fixture) {
        assert!(f.service.initialize());
        f.service.connect(ADDR).unwrap();
        wait_for(&mut f.events, |e| {
            matches!(e, DroEvent::StateChanged(SessionState::Ready))
        })
        .await;
        let adapter = f.adapter.clone();
        let session = f.service.session.clone();
        wait_until(move || adapter.subscriptions() == 3 && lock(&session).pending_writes() == 0)
            .await;
    }

    #[tokio::test]
    async fn test_initialize_fails_without_adapter() {
        let mut f = fixture();
        f.adapter.set_available(false);
        assert!(!f.service.initialize());
        assert_eq!(f.service.connect(ADDR), Err(DroError::TransportUnavailable));
    }

    #[tokio::test]
    async fn test_initialize_resets_encoder_values() {
        let mut f = fixture();
        connect_ready(&mut f).await;
        let conn = f.adapter.last_connection().unwrap();
        for (axis, value) in [(Axis::X, 11), (Axis::Y, -22), (Axis::Z, 33)] {
            assert!(f.adapter.notify_axis(conn, axis, value));
            wait_for(&mut f.events, |e| matches!(e, DroEvent::DataAvailable { .. })).await;
        }
        let store = f.service.encoder_store();
        assert_eq!(store.snapshot().map(|s| s.raw), [11, -22, 33]);

        assert!(f.service.initialize());

        for sample in store.snapshot() {
            assert_eq!(sample.raw, 0);
            assert!(sample.updated_at.is_none());
        }
        assert_eq!(f.service.get_encoder_value(Axis::Y), 0);
    }

    #[tokio::test]
    async fn test_rejected_connect_keeps_scan_running() {
        let mut f = fixture();
        assert!(f.service.initialize());
        f.service.connect(ADDR).unwrap();
        f.service.start_scan().unwrap();

        assert_eq!(
            f.service.connect(ADDR),
            Err(DroError::InvalidState(SessionState::Connecting))
        );
        assert!(f.adapter.is_scanning());
    }

    #[tokio::test]
    async fn test_device_without_dro_service_fails() {
        let mut f = fixture();
        let other: Vec<GattService> = SimulatedAdapter::dro_database()
            .into_iter()
            .filter(|s| s.uuid != SERVICE_UUID)
            .collect();
        f.adapter.set_database(other);
        assert!(f.service.initialize());
        f.service.connect(ADDR).unwrap();

        let event = wait_for(&mut f.events, |e| matches!(e, DroEvent::SessionFailed(_))).await;
        assert!(matches!(
            event,
            DroEvent::SessionFailed(DroError::ServiceNotSupported(_))
        ));
        assert_eq!(f.service.state(), SessionState::Failed);

        // Connecting again starts from a fresh connection object
        f.adapter.set_database(SimulatedAdapter::dro_database());
        let failed = f.adapter.last_connection().unwrap();
        f.service.connect(ADDR).unwrap();
        assert_ne!(f.adapter.last_connection(), Some(failed));
        wait_for(&mut f.events, |e| {
            matches!(e, DroEvent::StateChanged(SessionState::Ready))
        })
        .await;
    }

    #[tokio::test]
    async fn test_scan_then_connect() {
        let mut f = fixture();
        assert!(f.service.initialize());
        f.service.start_scan().unwrap();

        let adv = Advertisement {
            address: ADDR,
            local_name: Some("PSoC6 DRO".into()),
            rssi: -52,
            service_uuids: vec![protocol::SERVICE_UUID],
        };
        assert!(f.adapter.advertise(adv.clone()));
        assert!(f.adapter.advertise(adv));

        let found = wait_for(&mut f.events, |e| matches!(e, DroEvent::DeviceFound(_))).await;
        let DroEvent::DeviceFound(device) = found else {
            unreachable!()
        };
        assert_eq!(device.address, ADDR);

        f.service.connect(device.address).unwrap();
        assert!(!f.adapter.is_scanning());
        wait_for(&mut f.events, |e| matches!(e, DroEvent::Connected)).await;
        wait_for(&mut f.events, |e| {
            matches!(e, DroEvent::StateChanged(SessionState::Ready))
        })
        .await;
        assert_eq!(f.service.scanned_devices().len(), 1);
        assert_eq!(
            lock(&f.service.settings).get().last_connected_address,
            Some(ADDR)
        );
    }

    #[tokio::test]
    async fn test_notifications_reach_store() {
        let mut f = fixture();
        connect_ready(&mut f).await;
        let conn = f.adapter.last_connection().unwrap();

        assert!(f.adapter.notify_axis(conn, Axis::Y, -42));
        wait_for(&mut f.events, |e| {
            matches!(e, DroEvent::DataAvailable { axis: Axis::Y, .. })
        })
        .await;

        assert_eq!(f.service.get_encoder_value(Axis::Y), -42);
        assert_eq!(f.service.get_encoder_value(Axis::X), 0);
        assert!(f.service.encoder_sample(Axis::Y).updated_at.is_some());

        f.adapter.notify_axis(conn, Axis::X, 180000);
        wait_for(&mut f.events, |e| {
            matches!(e, DroEvent::DataAvailable { axis: Axis::X, .. })
        })
        .await;
        assert_eq!(f.service.readout(Axis::X), "500.000 mm");
    }

    #[tokio::test]
    async fn test_reset_command_written() {
        let mut f = fixture();
        connect_ready(&mut f).await;
        f.adapter.take_calls();

        f.service.zero_workspace().unwrap();

        let conn = f.adapter.last_connection().unwrap();
        assert_eq!(
            f.adapter.calls(),
            vec![AdapterCall::WriteCharacteristic {
                connection: conn,
                handle: AttributeHandle(0x001B),
                value: vec![0x01],
            }]
        );
    }

    #[tokio::test]
    async fn test_failed_write_surfaces_to_consumer() {
        let mut f = fixture();
        connect_ready(&mut f).await;

        f.adapter.push_write_status(GattStatus::Error(0x03));
        f.service.send_reset_command(0x01).unwrap();

        let event = wait_for(&mut f.events, |e| matches!(e, DroEvent::WriteFailed { .. })).await;
        assert!(matches!(
            event,
            DroEvent::WriteFailed {
                error: DroError::WriteFailed { .. },
                ..
            }
        ));
        assert_eq!(f.service.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_remote_disconnect_returns_to_disconnected() {
        let mut f = fixture();
        connect_ready(&mut f).await;
        let conn = f.adapter.last_connection().unwrap();

        f.adapter.link_lost(conn);
        wait_for(&mut f.events, |e| matches!(e, DroEvent::Disconnected)).await;

        assert_eq!(f.service.state(), SessionState::Disconnected);
        assert_eq!(
            f.service.send_reset_command(0x01),
            Err(DroError::InvalidState(SessionState::Disconnected))
        );
    }

    #[tokio::test]
    async fn test_disconnect_then_close() {
        let mut f = fixture();
        connect_ready(&mut f).await;

        f.service.disconnect();
        wait_for(&mut f.events, |e| matches!(e, DroEvent::Disconnected)).await;
        f.service.close();
        f.service.close();

        assert_eq!(f.service.state(), SessionState::Disconnected);
        let closes = f
            .adapter
            .calls()
            .iter()
            .filter(|c| matches!(c, AdapterCall::Close(_)))
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_drop_releases_connection() {
        let mut f = fixture();
        connect_ready(&mut f).await;
        let conn = f.adapter.last_connection().unwrap();
        let adapter = f.adapter.clone();

        drop(f);

        let calls = adapter.calls();
        assert!(calls.contains(&AdapterCall::Disconnect(conn)));
        assert_eq!(calls.last(), Some(&AdapterCall::Close(conn)));
    }
}
