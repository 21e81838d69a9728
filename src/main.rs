use anyhow::Context;
use dro_ble::domain::models::{Axis, DroEvent};
use dro_ble::domain::settings::SettingsService;
use dro_ble::infrastructure::bluetooth::protocol::SERVICE_UUID;
use dro_ble::infrastructure::bluetooth::session::SessionState;
use dro_ble::infrastructure::bluetooth::simulated::SimulatedAdapter;
use dro_ble::infrastructure::bluetooth::transport::{Advertisement, DeviceAddress};
use dro_ble::infrastructure::logging::init_logger;
use dro_ble::DroService;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

const DEMO_DEVICE: &str = "00:A0:50:00:00:01";

fn run_seconds() -> anyhow::Result<u64> {
    let mut args = std::env::args().skip(1);
    let mut seconds = 5;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--seconds" => {
                let value = args.next().context("--seconds needs a value")?;
                seconds = value
                    .parse()
                    .with_context(|| format!("invalid --seconds value '{}'", value))?;
            }
            other => anyhow::bail!("unknown argument '{}'", other),
        }
    }
    Ok(seconds)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let seconds = run_seconds()?;
    let settings = SettingsService::new()?;
    let _log_guard = init_logger(&settings.get().log_settings)?;
    info!("Starting DRO BLE demo against a simulated readout");

    let (adapter, transport_events) = SimulatedAdapter::automatic();
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let mut service = DroService::new(
        adapter.clone(),
        transport_events,
        event_tx,
        Arc::new(Mutex::new(settings)),
    );
    if !service.initialize() {
        anyhow::bail!("Bluetooth adapter unavailable");
    }

    service.start_scan()?;
    adapter.advertise(Advertisement {
        address: DEMO_DEVICE.parse::<DeviceAddress>()?,
        local_name: Some("PSoC6 DRO".to_string()),
        rssi: -48,
        service_uuids: vec![SERVICE_UUID],
    });

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    let mut motion = None;

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    DroEvent::DeviceFound(device) => {
                        info!("Connecting to {} ({})", device.name, device.address);
                        if let Err(e) = service.connect(device.address) {
                            warn!("Connect failed: {}", e);
                        }
                    }
                    DroEvent::StateChanged(SessionState::Ready) if motion.is_none() => {
                        if let Some(connection) = adapter.last_connection() {
                            let adapter = adapter.clone();
                            motion = Some(tokio::spawn(async move {
                                let mut ticker = tokio::time::interval(Duration::from_millis(250));
                                let mut position = 0i32;
                                loop {
                                    ticker.tick().await;
                                    position += 900;
                                    adapter.notify_axis(connection, Axis::X, position);
                                    adapter.notify_axis(connection, Axis::Y, -position / 2);
                                    adapter.notify_axis(connection, Axis::Z, position / 10);
                                }
                            }));
                        }
                    }
                    DroEvent::DataAvailable { axis, .. } => {
                        info!("{}: {}", axis, service.readout(axis));
                    }
                    DroEvent::SessionFailed(e) => warn!("Session failed: {}", e),
                    DroEvent::WriteFailed { error, .. } => warn!("Write failed: {}", error),
                    _ => {}
                }
            }
        }
    }

    if let Some(motion) = motion {
        motion.abort();
    }
    if let Err(e) = service.zero_workspace() {
        warn!("Could not zero workspace: {}", e);
    }
    service.disconnect();
    service.close();
    info!("Demo finished");
    Ok(())
}
