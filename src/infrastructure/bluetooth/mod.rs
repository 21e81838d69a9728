//! Bluetooth Module
//!
//! Provides BLE communication with a PSoC 6 digital readout.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       DroService                         │
//! │  (Main coordinator - public API for the application)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Scanner  │  │  Session   │  │ Protocol │
//! │           │  │            │  │          │
//! │ - BLE     │  │ - GATT     │  │ - UUIDs  │
//! │ discovery │  │ - Write    │  │ - Counts │
//! │           │  │   queue    │  │          │
//! └─────┬─────┘  └─────┬──────┘  └──────────┘
//!       │              │
//!       ▼              ▼
//! ┌─────────────────────────────┐
//! │   BleAdapter (transport)    │
//! └─────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`] - Platform BLE adapter trait and GATT types
//! - [`protocol`] - DRO UUIDs, commands and encoder payload parsing
//! - [`queue`] - Serialized GATT write queue
//! - [`session`] - Connection state machine and characteristic resolution
//! - [`scanner`] - BLE device discovery with a bounded scan window
//! - [`service`] - Main service coordinator
//! - [`simulated`] - In-process adapter for tests and the demo binary

pub mod protocol;
pub mod queue;
pub mod scanner;
pub mod service;
pub mod session;
pub mod simulated;
pub mod transport;

// Re-export main service for convenience
pub use service::DroService;
