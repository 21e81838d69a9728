pub mod calibration;
pub mod encoder;
pub mod models;
pub mod settings;
