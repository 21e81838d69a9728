use crate::domain::models::Axis;
use crate::error::DroError;
use serde::{Deserialize, Serialize};

/// Full-scale length and count for one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationParams {
    /// Physical travel in millimetres covered by `full_scale_count`.
    pub full_scale_length: i32,
    pub full_scale_count: i32,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            full_scale_length: 1000,
            full_scale_count: 360000,
        }
    }
}

impl CalibrationParams {
    /// Convert a raw encoder count to millimetres.
    pub fn to_millimetres(&self, raw: i32) -> f32 {
        // Avoid division by zero
        if self.full_scale_count == 0 {
            return 0.0;
        }
        (raw as f32 / self.full_scale_count as f32) * self.full_scale_length as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineCalibration {
    pub x: CalibrationParams,
    pub y: CalibrationParams,
    pub z: CalibrationParams,
}

impl MachineCalibration {
    pub fn axis(&self, axis: Axis) -> &CalibrationParams {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::Z => &self.z,
        }
    }

    /// Build from the six text fields in the order
    /// X length, X count, Y length, Y count, Z length, Z count.
    pub fn from_inputs(inputs: [&str; 6]) -> Result<Self, DroError> {
        let mut values = [0i32; 6];
        for (value, input) in values.iter_mut().zip(inputs) {
            *value = input
                .trim()
                .parse()
                .map_err(|_| DroError::InvalidCalibration(format!("'{}' is not an integer", input)))?;
        }
        let calibration = Self {
            x: CalibrationParams {
                full_scale_length: values[0],
                full_scale_count: values[1],
            },
            y: CalibrationParams {
                full_scale_length: values[2],
                full_scale_count: values[3],
            },
            z: CalibrationParams {
                full_scale_length: values[4],
                full_scale_count: values[5],
            },
        };
        calibration.validate()?;
        Ok(calibration)
    }

    /// Every one of the six values must be non-zero.
    pub fn validate(&self) -> Result<(), DroError> {
        for axis in Axis::ALL {
            let params = self.axis(axis);
            if params.full_scale_length == 0 {
                return Err(DroError::InvalidCalibration(format!(
                    "{} full scale length is zero",
                    axis
                )));
            }
            if params.full_scale_count == 0 {
                return Err(DroError::InvalidCalibration(format!(
                    "{} full scale count is zero",
                    axis
                )));
            }
        }
        Ok(())
    }

    pub fn to_millimetres(&self, axis: Axis, raw: i32) -> f32 {
        self.axis(axis).to_millimetres(raw)
    }

    /// Readout text as shown on the display, e.g. `"12.500 mm"`.
    pub fn format_readout(&self, axis: Axis, raw: i32) -> String {
        format!("{:.3} mm", self.to_millimetres(axis, raw))
    }
}
