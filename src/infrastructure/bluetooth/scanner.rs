//! BLE Scanner Module
//!
//! Handles Bluetooth LE device discovery for DRO peripherals.

use crate::domain::models::{DroEvent, MessageSeverity, ScannedDevice, StatusMessage};
use crate::error::DroError;
use crate::infrastructure::bluetooth::transport::{Advertisement, BleAdapter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, trace};
use uuid::Uuid;

#[derive(Default)]
struct ScanState {
    scanning: bool,
    // Bumped on every start so a timer from an earlier scan cannot stop a newer one
    generation: u64,
    filter: Option<Uuid>,
    devices: Vec<ScannedDevice>,
}

/// BLE Scanner for discovering DRO devices
///
/// Cloning yields another handle to the same scan.
#[derive(Clone)]
pub struct BleScanner {
    adapter: Arc<dyn BleAdapter>,
    event_sender: mpsc::UnboundedSender<DroEvent>,
    window: Duration,
    state: Arc<Mutex<ScanState>>,
}

impl BleScanner {
    /// Create a new scanner that stops by itself after `window`
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        event_sender: mpsc::UnboundedSender<DroEvent>,
        window: Duration,
    ) -> Self {
        Self {
            adapter,
            event_sender,
            window,
            state: Arc::new(Mutex::new(ScanState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start scanning for BLE devices
    ///
    /// # Arguments
    /// * `service_uuid` - The service UUID to filter for (or None to report all devices)
    ///
    /// Must be called from within a tokio runtime; the scan window timer is
    /// a spawned task.
    pub fn start(&self, service_uuid: Option<Uuid>) -> Result<(), DroError> {
        // Stop any existing scan
        self.stop();

        info!("Starting BLE scan for service UUID: {:?}", service_uuid);
        // Ready before the adapter starts so the first advertisement is kept
        let generation = {
            let mut state = self.lock();
            state.scanning = true;
            state.generation += 1;
            state.filter = service_uuid;
            state.devices.clear();
            state.generation
        };

        if let Err(e) = self.adapter.start_scan(service_uuid) {
            let mut state = self.lock();
            if state.generation == generation {
                state.scanning = false;
            }
            return Err(e.into());
        }

        let deadline = Instant::now() + self.window;

        self.send_log("Scanning for DRO devices...", MessageSeverity::Info);

        let scanner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            scanner.expire(generation);
        });

        Ok(())
    }

    fn expire(&self, generation: u64) {
        let current = {
            let state = self.lock();
            state.scanning && state.generation == generation
        };
        if current {
            info!("Scan window of {:?} elapsed", self.window);
            self.stop();
        }
    }

    /// Stop scanning. Does nothing if no scan is running.
    pub fn stop(&self) {
        let was_scanning = std::mem::replace(&mut self.lock().scanning, false);
        if was_scanning {
            info!("Stopping BLE scan...");
            self.adapter.stop_scan();
            self.send_log("Scan stopped.", MessageSeverity::Info);
            let _ = self.event_sender.send(DroEvent::ScanStopped);
        }
    }

    /// Feed an advertisement received from the adapter.
    pub fn on_advertisement(&self, advertisement: &Advertisement) {
        let device = {
            let mut state = self.lock();
            if !state.scanning {
                return;
            }
            if let Some(filter) = state.filter {
                if !advertisement.service_uuids.contains(&filter) {
                    return;
                }
            }
            if state
                .devices
                .iter()
                .any(|d| d.address == advertisement.address)
            {
                trace!("Already reported {}", advertisement.address);
                return;
            }

            let device = ScannedDevice {
                name: match &advertisement.local_name {
                    Some(name) if !name.is_empty() => name.clone(),
                    _ => "Unknown".to_string(),
                },
                address: advertisement.address,
                signal_strength: advertisement.rssi,
            };
            state.devices.push(device.clone());
            device
        };

        info!(
            "Found device {} ({}, {} dBm)",
            device.name, device.address, device.signal_strength
        );
        let _ = self.event_sender.send(DroEvent::DeviceFound(device));
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    /// Devices found by the current or last scan
    pub fn devices(&self) -> Vec<ScannedDevice> {
        self.lock().devices.clone()
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(DroEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::SERVICE_UUID;
    use crate::infrastructure::bluetooth::simulated::{AdapterCall, SimulatedAdapter};
    use crate::infrastructure::bluetooth::transport::DeviceAddress;

    const WINDOW: Duration = Duration::from_secs(10);

    fn advertisement(last_octet: u8, uuids: Vec<Uuid>) -> Advertisement {
        Advertisement {
            address: DeviceAddress([0x00, 0xA0, 0x50, 0x00, 0x00, last_octet]),
            local_name: Some("PSoC6 DRO".to_string()),
            rssi: -60,
            service_uuids: uuids,
        }
    }

    fn scanner() -> (
        BleScanner,
        Arc<SimulatedAdapter>,
        mpsc::UnboundedReceiver<DroEvent>,
    ) {
        let (adapter, _transport) = SimulatedAdapter::manual();
        let (tx, rx) = mpsc::unbounded_channel();
        (BleScanner::new(adapter.clone(), tx, WINDOW), adapter, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DroEvent>) -> Vec<DroEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_duplicate_advertisements_reported_once() {
        let (scanner, _adapter, mut rx) = scanner();
        scanner.start(Some(SERVICE_UUID)).unwrap();

        scanner.on_advertisement(&advertisement(1, vec![SERVICE_UUID]));
        scanner.on_advertisement(&advertisement(1, vec![SERVICE_UUID]));

        assert_eq!(scanner.devices().len(), 1);
        let found = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, DroEvent::DeviceFound(_)))
            .count();
        assert_eq!(found, 1);
    }

    #[tokio::test]
    async fn test_filter_by_service_uuid() {
        let (scanner, _adapter, _rx) = scanner();
        scanner.start(Some(SERVICE_UUID)).unwrap();

        scanner.on_advertisement(&advertisement(1, vec![Uuid::from_u128(0x180F)]));
        scanner.on_advertisement(&advertisement(2, Vec::new()));
        scanner.on_advertisement(&advertisement(3, vec![Uuid::from_u128(0x180F), SERVICE_UUID]));

        let devices = scanner.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].address.0[5], 3);
    }

    #[tokio::test]
    async fn test_unnamed_device() {
        let (scanner, _adapter, _rx) = scanner();
        scanner.start(None).unwrap();
        let mut adv = advertisement(4, Vec::new());
        adv.local_name = Some(String::new());
        scanner.on_advertisement(&adv);
        assert_eq!(scanner.devices()[0].name, "Unknown");
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_stops_exactly_at_window() {
        let (scanner, adapter, mut rx) = scanner();
        scanner.start(Some(SERVICE_UUID)).unwrap();
        settle().await;

        tokio::time::advance(WINDOW - Duration::from_millis(1)).await;
        settle().await;
        assert!(scanner.is_scanning());
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, DroEvent::ScanStopped)));

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert!(!scanner.is_scanning());
        assert!(scanner.devices().is_empty());
        let stopped = drain(&mut rx)
            .iter()
            .filter(|e| matches!(e, DroEvent::ScanStopped))
            .count();
        assert_eq!(stopped, 1);
        assert_eq!(adapter.calls().last(), Some(&AdapterCall::StopScan));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_cancels_timer() {
        let (scanner, adapter, mut rx) = scanner();
        scanner.start(None).unwrap();
        scanner.stop();
        scanner.stop();

        tokio::time::advance(WINDOW * 2).await;
        settle().await;

        let stopped = drain(&mut rx)
            .iter()
            .filter(|e| matches!(e, DroEvent::ScanStopped))
            .count();
        assert_eq!(stopped, 1);
        let stop_calls = adapter
            .calls()
            .iter()
            .filter(|c| matches!(c, AdapterCall::StopScan))
            .count();
        assert_eq!(stop_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_ignores_old_timer() {
        let (scanner, _adapter, _rx) = scanner();
        scanner.start(None).unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        scanner.start(None).unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert!(scanner.is_scanning());

        tokio::time::advance(Duration::from_secs(4)).await;
        settle().await;
        assert!(!scanner.is_scanning());
    }

    #[tokio::test]
    async fn test_refused_start_rolls_back() {
        let (scanner, adapter, mut rx) = scanner();
        adapter.set_available(false);

        assert_eq!(
            scanner.start(Some(SERVICE_UUID)),
            Err(DroError::TransportUnavailable)
        );
        assert!(!scanner.is_scanning());
        scanner.on_advertisement(&advertisement(1, vec![SERVICE_UUID]));
        assert!(scanner.devices().is_empty());
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, DroEvent::ScanStopped | DroEvent::LogMessage(_))));
    }

    #[tokio::test]
    async fn test_advertisements_ignored_when_not_scanning() {
        let (scanner, _adapter, _rx) = scanner();
        scanner.on_advertisement(&advertisement(1, vec![SERVICE_UUID]));
        assert!(scanner.devices().is_empty());
    }
}
