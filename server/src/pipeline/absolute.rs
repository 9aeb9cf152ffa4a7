use common::{
    identity::DeviceIdentity,
    types::{SensorSample, Sensitivity},
};

use super::Filter;

/// Replaces every value with its magnitude
#[derive(Debug, Clone, Copy, Default)]
pub struct AbsoluteFilter;

impl Filter for AbsoluteFilter {
    fn filter(&mut self, _: &DeviceIdentity, sample: &mut SensorSample, _: &mut Sensitivity) -> bool {
        sample.values.iter_mut().for_each(|value| *value = value.abs());
        true
    }
}
