use common::{
    identity::DeviceIdentity,
    ring_buffer::RingBuffer,
    types::{SensorSample, Sensitivity},
};

use super::Filter;

/// Moving average over the last `window` samples, separately for every value position
///
/// The windows start out filled with zeros and the sum is always divided by
/// the full window length, so the first outputs ramp up from zero.
#[derive(Debug, Clone)]
pub struct AveragingFilter {
    window: usize,
    history: Vec<RingBuffer<f32>>,
}

impl AveragingFilter {
    /// Panics if `window` is zero
    pub fn new(window: usize) -> Self {
        assert!(window > 0, "Averaging window must not be empty");

        Self {
            window,
            history: Vec::new(),
        }
    }
}

impl Filter for AveragingFilter {
    fn filter(&mut self, _: &DeviceIdentity, sample: &mut SensorSample, _: &mut Sensitivity) -> bool {
        // Samples may carry more values than seen so far
        while self.history.len() < sample.values.len() {
            self.history.push(RingBuffer::new(self.window, 0.0));
        }

        for (value, history) in sample.values.iter_mut().zip(&mut self.history) {
            history.add(*value);
            *value = history.iter().sum::<f32>() / history.capacity() as f32;
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
    fn window_of_three() {
        let sink = RecordingSink::default();
        let mut stage = FilterStage::with_sink(AveragingFilter::new(3), sink.boxed());

        for input in [
            [0.0, 0.0, 0.0],
            [-3.0, 6.0, 9.0],
            [-3.0, 6.0, 9.0],
            [-3.0, 6.0, -18.0],
        ] {
            stage.on_data(&phone(), sample(&input), 50.0);
        }

        assert_eq!(
            sink.values(),
            vec![
                vec![0.0, 0.0, 0.0],
                vec![-1.0, 2.0, 3.0],
                vec![-2.0, 4.0, 6.0],
                vec![-3.0, 6.0, 0.0],
            ]
        );
    }

    #[test]
    fn old_values_leave_the_window() {
        let mut filter = AveragingFilter::new(2);
        let origin = phone();
        let mut sensitivity = 50.0;

        let mut outputs = Vec::new();
        for input in [4.0, 4.0, 0.0, 0.0] {
            let mut current = sample(&[input]);
            filter.filter(&origin, &mut current, &mut sensitivity);
            outputs.push(current.values[0]);
        }

        assert_eq!(outputs, vec![2.0, 4.0, 2.0, 0.0]);
    }
}
