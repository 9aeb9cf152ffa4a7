use common::{
    identity::DeviceIdentity,
    types::{SensorSample, Sensitivity},
};

use super::Filter;

/// Multiplies every value with a factor
///
/// With ranges, values are first clamped to `±source_range` and then
/// projected onto `±target_range`.
#[derive(Debug, Clone)]
pub struct ScalingFilter {
    factor: f32,
    source_range: Option<f32>,
}

impl ScalingFilter {
    pub fn with_factor(factor: f32) -> Self {
        Self {
            factor,
            source_range: None,
        }
    }

    pub fn with_ranges(target_range: f32, source_range: f32) -> Self {
        Self {
            factor: target_range / source_range,
            source_range: Some(source_range),
        }
    }

    /// Keeps the target range when the source range of the sensor becomes known
    pub fn set_source_range(&mut self, source_range: f32) {
        let target_range = match self.source_range {
            Some(old) => self.factor * old,
            None => self.factor,
        };

        self.factor = target_range / source_range;
        self.source_range = Some(source_range);
    }

    pub fn factor(&self) -> f32 {
        self.factor
    }
}

impl Filter for ScalingFilter {
    fn filter(&mut self, _: &DeviceIdentity, sample: &mut SensorSample, _: &mut Sensitivity) -> bool {
        for value in &mut sample.values {
            if let Some(range) = self.source_range {
                *value = value.clamp(-range, range);
            }
            *value *= self.factor;
        }

        true
    }
}
