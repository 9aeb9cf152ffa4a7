//! Filters that sum samples up instead of forwarding them one by one

use common::{
    identity::DeviceIdentity,
    ring_buffer::RingBuffer,
    types::{SensorSample, Sensitivity},
};

use super::Filter;

/// Replaces every value with the sum of all values seen at its position
#[derive(Debug, Clone, Default)]
pub struct IntegratingFilter {
    sums: Vec<f32>,
}

impl IntegratingFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts integrating from zero again
    pub fn reset(&mut self) {
        self.sums.fill(0.0);
    }
}

impl Filter for IntegratingFilter {
    fn filter(&mut self, _: &DeviceIdentity, sample: &mut SensorSample, _: &mut Sensitivity) -> bool {
        if self.sums.len() < sample.values.len() {
            self.sums.resize(sample.values.len(), 0.0);
        }

        for (value, sum) in sample.values.iter_mut().zip(&mut self.sums) {
            *sum += *value;
            *value = *sum;
        }

        true
    }
}

/// Replaces every value with the sum over the last `length` samples at its position
#[derive(Debug, Clone)]
pub struct TemporaryIntegratingFilter {
    length: usize,
    history: Vec<RingBuffer<f32>>,
}

impl TemporaryIntegratingFilter {
    /// Panics if `length` is zero
    pub fn new(length: usize) -> Self {
        assert!(length > 0, "Integration length must not be zero");

        Self {
            length,
            history: Vec::new(),
        }
    }

    /// Forgets all stored samples
    pub fn reset(&mut self) {
        self.history.clear();
    }
}

impl Filter for TemporaryIntegratingFilter {
    fn filter(&mut self, _: &DeviceIdentity, sample: &mut SensorSample, _: &mut Sensitivity) -> bool {
        while self.history.len() < sample.values.len() {
            self.history.push(RingBuffer::new(self.length, 0.0));
        }

        for (value, history) in sample.values.iter_mut().zip(&mut self.history) {
            history.add(*value);
            *value = history.iter().sum();
        }

        true
    }
}
