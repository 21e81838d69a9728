//! BLE Adapter boundary
//!
//! The platform BLE stack is an external collaborator. Requests are
//! submitted through [`BleAdapter`] and return immediately; their results
//! arrive later, in order, as [`TransportEvent`]s on a single channel.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// A 6-byte BLE device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress(pub [u8; 6]);

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

impl FromStr for DeviceAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(TransportError::InvalidAddress(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(TransportError::InvalidAddress(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| TransportError::InvalidAddress(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

/// Opaque id of a transport connection object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// ATT handle of a service, characteristic or descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeHandle(pub u16);

impl fmt::Display for AttributeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    /// Non-zero ATT/stack status code.
    Error(u8),
}

impl GattStatus {
    pub fn is_success(self) -> bool {
        self == GattStatus::Success
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattStatus::Success => write!(f, "success"),
            GattStatus::Error(code) => write!(f, "error {:#04x}", code),
        }
    }
}

/// What a write completion refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteTarget {
    Characteristic(AttributeHandle),
    Descriptor(AttributeHandle),
}

impl fmt::Display for WriteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteTarget::Characteristic(h) => write!(f, "characteristic {}", h),
            WriteTarget::Descriptor(h) => write!(f, "descriptor {}", h),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattDescriptor {
    pub uuid: Uuid,
    pub handle: AttributeHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub handle: AttributeHandle,
    pub descriptors: Vec<GattDescriptor>,
}

impl GattCharacteristic {
    pub fn descriptor(&self, uuid: Uuid) -> Option<&GattDescriptor> {
        self.descriptors.iter().find(|d| d.uuid == uuid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub handle: AttributeHandle,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// A received advertisement.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: DeviceAddress,
    pub local_name: Option<String>,
    pub rssi: i16,
    pub service_uuids: Vec<Uuid>,
}

/// Completions and unsolicited events from the adapter.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    ConnectionStateChanged {
        connection: ConnectionId,
        connected: bool,
    },
    ServicesDiscovered {
        connection: ConnectionId,
        status: GattStatus,
        services: Vec<GattService>,
    },
    CharacteristicChanged {
        connection: ConnectionId,
        uuid: Uuid,
        value: Vec<u8>,
    },
    WriteComplete {
        connection: ConnectionId,
        target: WriteTarget,
        status: GattStatus,
    },
    Advertisement(Advertisement),
}

impl TransportEvent {
    /// Connection the event belongs to, if any.
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            TransportEvent::ConnectionStateChanged { connection, .. }
            | TransportEvent::ServicesDiscovered { connection, .. }
            | TransportEvent::CharacteristicChanged { connection, .. }
            | TransportEvent::WriteComplete { connection, .. } => Some(*connection),
            TransportEvent::Advertisement(_) => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Bluetooth adapter unavailable")]
    Unavailable,

    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// Platform BLE stack.
///
/// Every method submits a request and returns without waiting for the
/// radio; completions are delivered as [`TransportEvent`]s.
pub trait BleAdapter: Send + Sync {
    /// Whether the radio is present and powered.
    fn is_available(&self) -> bool;

    /// Create a new connection object and start connecting.
    fn connect(&self, address: DeviceAddress) -> Result<ConnectionId, TransportError>;

    /// Re-issue connect on an existing connection object.
    fn reconnect(&self, connection: ConnectionId) -> Result<(), TransportError>;

    fn disconnect(&self, connection: ConnectionId);

    /// Release the connection object. No further events are delivered for it.
    fn close(&self, connection: ConnectionId);

    fn discover_services(&self, connection: ConnectionId) -> Result<(), TransportError>;

    /// Enable or disable local delivery of notifications for a characteristic.
    fn set_notification(
        &self,
        connection: ConnectionId,
        characteristic: AttributeHandle,
        enabled: bool,
    ) -> Result<(), TransportError>;

    fn write_characteristic(
        &self,
        connection: ConnectionId,
        characteristic: AttributeHandle,
        value: &[u8],
    ) -> Result<(), TransportError>;

    fn write_descriptor(
        &self,
        connection: ConnectionId,
        descriptor: AttributeHandle,
        value: &[u8],
    ) -> Result<(), TransportError>;

    fn start_scan(&self, service_filter: Option<Uuid>) -> Result<(), TransportError>;

    fn stop_scan(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_round_trips_through_display() {
        let addr: DeviceAddress = "00:A0:50:12:34:AB".parse().unwrap();
        assert_eq!(addr.0, [0x00, 0xA0, 0x50, 0x12, 0x34, 0xAB]);
        assert_eq!(addr.to_string(), "00:A0:50:12:34:AB");
    }

    #[test]
    fn test_invalid_address_rejected() {
        assert!("00:A0:50".parse::<DeviceAddress>().is_err());
        assert!("00:A0:50:12:34:ZZ".parse::<DeviceAddress>().is_err());
        assert!("000:A0:50:12:34:AB".parse::<DeviceAddress>().is_err());
    }

    #[test]
    fn test_event_connection() {
        let event = TransportEvent::WriteComplete {
            connection: ConnectionId(7),
            target: WriteTarget::Descriptor(AttributeHandle(0x13)),
            status: GattStatus::Success,
        };
        assert_eq!(event.connection(), Some(ConnectionId(7)));
    }
}
