use crate::infrastructure::bluetooth::protocol::DroCharacteristic;
use crate::infrastructure::bluetooth::session::SessionState;
use crate::infrastructure::bluetooth::transport::{GattStatus, TransportError, WriteTarget};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DroError {
    #[error("Bluetooth adapter not initialized or unavailable")]
    TransportUnavailable,

    #[error("DRO service {0} not supported by device")]
    ServiceNotSupported(Uuid),

    #[error("{0} characteristic not found")]
    CharacteristicMissing(DroCharacteristic),

    #[error("Write to {target} failed with status {status}")]
    WriteFailed { target: WriteTarget, status: GattStatus },

    /// A completion arrived that does not belong to the in-flight write.
    #[error("Write completion for {received} does not match in-flight operation {expected:?}")]
    ProtocolViolation {
        expected: Option<WriteTarget>,
        received: WriteTarget,
    },

    #[error("Operation not allowed while session is {0}")]
    InvalidState(SessionState),

    #[error("Link lost before the write completed")]
    LinkLost,

    #[error("Transport rejected request: {0}")]
    Transport(String),

    #[error("Malformed encoder payload ({0} bytes, expected 4)")]
    MalformedPayload(usize),

    #[error("Service discovery failed with status {0}")]
    DiscoveryFailed(GattStatus),

    #[error("Invalid machine parameters: {0}")]
    InvalidCalibration(String),
}

impl From<TransportError> for DroError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unavailable => DroError::TransportUnavailable,
            other => DroError::Transport(other.to_string()),
        }
    }
}
