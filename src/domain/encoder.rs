//! Latest encoder counts per axis.
//!
//! Written only by the session's event pump, read from any thread. Every
//! field is atomic so readers never wait on the notification path.

use crate::domain::models::Axis;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// One axis's latest raw counter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSample {
    pub axis: Axis,
    pub raw: i32,
    /// `None` until the first notification arrives.
    pub updated_at: Option<Instant>,
}

#[derive(Debug)]
pub struct EncoderValueStore {
    epoch: Instant,
    values: [AtomicI32; 3],
    // Microseconds since `epoch` plus one; 0 means never updated.
    stamps: [AtomicU64; 3],
}

impl Default for EncoderValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EncoderValueStore {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            values: [AtomicI32::new(0), AtomicI32::new(0), AtomicI32::new(0)],
            stamps: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    /// Overwrite the axis value. Last write wins.
    pub fn update(&self, axis: Axis, value: i32) {
        let i = axis.index();
        let micros = self.epoch.elapsed().as_micros() as u64;
        self.values[i].store(value, Ordering::Release);
        self.stamps[i].store(micros.saturating_add(1), Ordering::Release);
    }

    /// Latest raw count, 0 before any notification.
    pub fn read(&self, axis: Axis) -> i32 {
        self.values[axis.index()].load(Ordering::Acquire)
    }

    pub fn sample(&self, axis: Axis) -> EncoderSample {
        let i = axis.index();
        let raw = self.values[i].load(Ordering::Acquire);
        let stamp = self.stamps[i].load(Ordering::Acquire);
        let updated_at = stamp
            .checked_sub(1)
            .map(|micros| self.epoch + Duration::from_micros(micros));
        EncoderSample {
            axis,
            raw,
            updated_at,
        }
    }

    pub fn snapshot(&self) -> [EncoderSample; 3] {
        Axis::ALL.map(|axis| self.sample(axis))
    }

    /// True if the axis was never updated or its value is older than `max_age`.
    pub fn is_stale(&self, axis: Axis, max_age: Duration) -> bool {
        match self.sample(axis).updated_at {
            Some(at) => at.elapsed() > max_age,
            None => true,
        }
    }

    /// Back to the power-on state: all axes 0, never updated.
    pub fn reset(&self) {
        for i in 0..3 {
            self.values[i].store(0, Ordering::Release);
            self.stamps[i].store(0, Ordering::Release);
        }
    }
}
