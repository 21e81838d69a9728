//! PSoC 6 DRO Protocol
//!
//! This module contains the protocol definitions for communicating with
//! the DRO peripheral

use crate::domain::models::Axis;
use crate::error::DroError;
use anyhow::Result;
use std::fmt;
use tracing::trace;
use uuid::Uuid;

/// DRO Service UUID
/// All DRO attributes share the base `00000000-0000-1000-8000-00805f9b34fX`
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805f9b34f0);

/// Encoder X Characteristic UUID - notifies the X axis count
pub const ENCODER_X_CHAR_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805f9b34f1);

/// Encoder Y Characteristic UUID - notifies the Y axis count
pub const ENCODER_Y_CHAR_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805f9b34f2);

/// Encoder Z Characteristic UUID - notifies the Z axis count
pub const ENCODER_Z_CHAR_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805f9b34f3);

/// Workspace 0 Characteristic UUID - where commands are sent
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805f9b34f4);

/// Client Characteristic Configuration Descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value disabling notifications
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Characteristics of the DRO service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DroCharacteristic {
    EncoderX,
    EncoderY,
    EncoderZ,
    /// Workspace zero / command characteristic
    Command,
}

impl DroCharacteristic {
    pub const ALL: [DroCharacteristic; 4] = [
        DroCharacteristic::EncoderX,
        DroCharacteristic::EncoderY,
        DroCharacteristic::EncoderZ,
        DroCharacteristic::Command,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            Self::EncoderX => ENCODER_X_CHAR_UUID,
            Self::EncoderY => ENCODER_Y_CHAR_UUID,
            Self::EncoderZ => ENCODER_Z_CHAR_UUID,
            Self::Command => COMMAND_CHAR_UUID,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }

    pub fn for_axis(axis: Axis) -> Self {
        match axis {
            Axis::X => Self::EncoderX,
            Axis::Y => Self::EncoderY,
            Axis::Z => Self::EncoderZ,
        }
    }

    /// Axis reported by this characteristic, `None` for the command characteristic.
    pub fn axis(self) -> Option<Axis> {
        match self {
            Self::EncoderX => Some(Axis::X),
            Self::EncoderY => Some(Axis::Y),
            Self::EncoderZ => Some(Axis::Z),
            Self::Command => None,
        }
    }
}

impl fmt::Display for DroCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EncoderX => "Encoder X",
            Self::EncoderY => "Encoder Y",
            Self::EncoderZ => "Encoder Z",
            Self::Command => "Workspace 0",
        };
        f.write_str(name)
    }
}

/// Commands accepted by the command characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DroCommand {
    /// Zero the device-side workspace counters
    ZeroWorkspace,
}

impl DroCommand {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::ZeroWorkspace => 0x01,
        }
    }
}

/// Decode an encoder notification payload.
///
/// The count is a signed 32-bit little-endian integer at offset 0; any
/// trailing bytes are ignored.
pub fn decode_encoder_value(payload: &[u8]) -> Result<i32, DroError> {
    let bytes: [u8; 4] = payload
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(DroError::MalformedPayload(payload.len()))?;

    trace!("Raw encoder payload: {:02X?}", payload);
    Ok(i32::from_le_bytes(bytes))
}

pub fn encode_encoder_value(value: i32) -> [u8; 4] {
    value.to_le_bytes()
}

/// Parse a UUID string from configuration
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    let uuid = Uuid::parse_str(uuid_str.trim())
        .map_err(|e| anyhow::anyhow!("Invalid UUID format '{}': {}", uuid_str, e))?;
    Ok(uuid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_uuids() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "00000000-0000-1000-8000-00805f9b34f0"
        );
        assert_eq!(
            COMMAND_CHAR_UUID.to_string(),
            "00000000-0000-1000-8000-00805f9b34f4"
        );
        assert_eq!(CCCD_UUID.to_string(), "00002902-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_parse_uuid() {
        let uuid = parse_uuid("00000000-0000-1000-8000-00805F9B34F2").unwrap();
        assert_eq!(uuid, ENCODER_Y_CHAR_UUID);
        assert!(parse_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn test_characteristic_lookup() {
        assert_eq!(
            DroCharacteristic::from_uuid(ENCODER_Z_CHAR_UUID),
            Some(DroCharacteristic::EncoderZ)
        );
        assert_eq!(DroCharacteristic::from_uuid(CCCD_UUID), None);
        assert_eq!(DroCharacteristic::Command.axis(), None);
        assert_eq!(DroCharacteristic::for_axis(Axis::Y).axis(), Some(Axis::Y));
    }

    #[test]
    fn test_decode_negative_value() {
        assert_eq!(decode_encoder_value(&[0xD6, 0xFF, 0xFF, 0xFF]), Ok(-42));
        assert_eq!(decode_encoder_value(&[0x40, 0x7E, 0x05, 0x00, 0xAA]), Ok(360_000));
    }

    #[test]
    fn test_decode_short_payload() {
        assert_eq!(
            decode_encoder_value(&[0x01, 0x02]),
            Err(DroError::MalformedPayload(2))
        );
    }

    #[test]
    fn test_command_bytes() {
        assert_eq!(DroCommand::ZeroWorkspace.as_byte(), 0x01);
    }
}
