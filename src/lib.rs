//! Client-side driver for the three-axis BLE digital readout (DRO).
//!
//! The device exposes one custom GATT service with an encoder
//! characteristic per axis and a command characteristic. This crate drives
//! that service over a platform BLE adapter that allows only one GATT
//! operation in flight at a time.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::models::{Axis, DroEvent};
pub use error::DroError;
pub use infrastructure::bluetooth::DroService;
