use crate::error::DroError;
use crate::infrastructure::bluetooth::protocol::DroCharacteristic;
use crate::infrastructure::bluetooth::queue::PendingOperation;
use crate::infrastructure::bluetooth::session::SessionState;
use crate::infrastructure::bluetooth::transport::DeviceAddress;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => f.write_str("X"),
            Axis::Y => f.write_str("Y"),
            Axis::Z => f.write_str("Z"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub name: String,
    pub address: DeviceAddress,
    pub signal_strength: i16,
}

/// Events delivered to the consumer.
#[derive(Debug, Clone)]
pub enum DroEvent {
    Connected,
    Disconnected,
    /// A new encoder count was stored.
    DataAvailable { axis: Axis, value: i32 },
    StateChanged(SessionState),
    DeviceFound(ScannedDevice),
    ScanStopped,
    /// A feature is unavailable because its characteristic was not found.
    CharacteristicMissing(DroCharacteristic),
    WriteFailed {
        operation: PendingOperation,
        error: DroError,
    },
    /// The session cannot proceed; the consumer must reconnect.
    SessionFailed(DroError),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
