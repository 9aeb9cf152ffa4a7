use common::{
    identity::DeviceIdentity,
    types::{SensorSample, Sensitivity},
};

use super::Filter;

/// Zeroes samples that differ too little from the last sample that passed
///
/// The change is the sum of the absolute differences of all values. Before
/// the first sample passed, the reference is all zeros.
#[derive(Debug, Clone)]
pub struct DifferenceThresholdFilter {
    minimum_change: f32,
    last: Vec<f32>,
}

impl DifferenceThresholdFilter {
    pub fn new(minimum_change: f32) -> Self {
        Self {
            minimum_change,
            last: Vec::new(),
        }
    }

    fn change(&self, values: &[f32]) -> f32 {
        values
            .iter()
            .enumerate()
            .map(|(index, value)| (value - self.last.get(index).copied().unwrap_or(0.0)).abs())
            .sum()
    }
}

impl Filter for DifferenceThresholdFilter {
    fn filter(&mut self, _: &DeviceIdentity, sample: &mut SensorSample, _: &mut Sensitivity) -> bool {
        if self.change(&sample.values) < self.minimum_change {
            sample.values.fill(0.0);
        } else {
            self.last.clone_from(&sample.values);
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{phone, sample, RecordingSink};
    use crate::pipeline::{DataSink, FilterStage};

    #[test]
    fn small_changes_are_zeroed() {
        let sink = RecordingSink::default();
        let mut stage = FilterStage::with_sink(DifferenceThresholdFilter::new(1.0), sink.boxed());

        for input in [
            [0.5, 0.2, 0.0],
            [2.0, 0.0, 0.0],
            [2.3, 0.3, 0.2],
            [2.3, 1.3, 0.0],
        ] {
            stage.on_data(&phone(), sample(&input), 50.0);
        }

        assert_eq!(
            sink.values(),
            vec![
                vec![0.0, 0.0, 0.0],
                vec![2.0, 0.0, 0.0],
                vec![0.0, 0.0, 0.0],
                vec![2.3, 1.3, 0.0],
            ]
        );
    }
}
