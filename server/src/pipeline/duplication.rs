use common::{
    identity::DeviceIdentity,
    types::{SensorSample, Sensitivity},
};

use super::{DataSink, DataSource};

/// Hands every sample to all of its sinks, each one gets its own copy
#[derive(Default)]
pub struct PipelineDuplication {
    sinks: Vec<Box<dyn DataSink>>,
    closed: bool,
}

impl PipelineDuplication {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Box<dyn DataSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl DataSink for PipelineDuplication {
    fn on_data(&mut self, origin: &DeviceIdentity, sample: SensorSample, sensitivity: Sensitivity) {
        if self.closed {
            return;
        }

        let Some((last, others)) = self.sinks.split_last_mut() else {
            return;
        };

        for sink in others {
            sink.on_data(origin, sample.clone(), sensitivity);
        }
        last.on_data(origin, sample, sensitivity);
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.sinks.iter_mut().for_each(|sink| sink.close());
    }
}

/// Inside a pipeline the downstream sink becomes one more output
impl DataSource for PipelineDuplication {
    fn set_data_sink(&mut self, sink: Box<dyn DataSink>) {
        self.sinks.push(sink);
    }

    fn close(&mut self) {
        DataSink::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{phone, sample, RecordingSink};
    use crate::pipeline::{Filter, FilterStage};

    /// Mutates the copy it receives
    struct Negate;

    impl Filter for Negate {
        fn filter(&mut self, _: &DeviceIdentity, sample: &mut SensorSample, _: &mut Sensitivity) -> bool {
            sample.values.iter_mut().for_each(|value| *value = -*value);
            true
        }
    }

    #[test]
    fn copies_are_independent() {
        let plain = RecordingSink::default();
        let negated = RecordingSink::default();

        let mut duplication = PipelineDuplication::new()
            .with(Box::new(FilterStage::with_sink(Negate, negated.boxed())))
            .with(plain.boxed());

        duplication.on_data(&phone(), sample(&[1.0, 2.0]), 50.0);
        DataSink::close(&mut duplication);

        assert_eq!(negated.values(), vec![vec![-1.0, -2.0]]);
        assert_eq!(plain.values(), vec![vec![1.0, 2.0]]);
        assert_eq!(plain.closed(), 1);
        assert_eq!(negated.closed(), 1);
    }
}
