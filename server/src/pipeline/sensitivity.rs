use common::{
    identity::DeviceIdentity,
    types::{SensorSample, Sensitivity},
};

use super::Filter;

/// Applies the user's sensitivity to the values
///
/// Values are multiplied with `sensitivity / reference`, downstream stages
/// receive a neutral sensitivity of one.
#[derive(Debug, Clone)]
pub struct SensitivityFilter {
    reference: Sensitivity,
}

impl SensitivityFilter {
    /// `reference` is the sensitivity that leaves values unchanged
    pub fn new(reference: Sensitivity) -> Self {
        Self { reference }
    }
}

impl Default for SensitivityFilter {
    fn default() -> Self {
        Self::new(common::types::DEFAULT_SENSITIVITY)
    }
}

impl Filter for SensitivityFilter {
    fn filter(
        &mut self,
        _: &DeviceIdentity,
        sample: &mut SensorSample,
        sensitivity: &mut Sensitivity,
    ) -> bool {
        let factor = *sensitivity / self.reference;
        sample.values.iter_mut().for_each(|value| *value *= factor);
        *sensitivity = 1.0;

        true
    }
}
