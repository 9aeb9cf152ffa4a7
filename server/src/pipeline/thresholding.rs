use common::{
    identity::DeviceIdentity,
    types::{SensorSample, Sensitivity},
};

use super::Filter;

/// Zeroes samples whose value on one axis stays below a minimum amplitude
#[derive(Debug, Clone)]
pub struct ThresholdingFilter {
    minimum_amplitude: f32,
    axis: usize,
}

impl ThresholdingFilter {
    pub fn new(minimum_amplitude: f32, axis: usize) -> Self {
        Self {
            minimum_amplitude,
            axis,
        }
    }
}

impl Filter for ThresholdingFilter {
    fn filter(&mut self, _: &DeviceIdentity, sample: &mut SensorSample, _: &mut Sensitivity) -> bool {
        // Samples without the axis are left alone
        let Some(value) = sample.values.get(self.axis) else {
            return true;
        };

        if value.abs() < self.minimum_amplitude {
            sample.values.fill(0.0);
        }

        true
    }
}
