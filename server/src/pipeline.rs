//! Composable processing stages between the data channels and the application
//!
//! Every stage receives samples through [`DataSink::on_data`] and hands them
//! to the next sink it was given through [`DataSource::set_data_sink`].

pub mod absolute;
pub mod averaging;
pub mod difference;
pub mod duplication;
pub mod integrating;
pub mod scaling;
pub mod sensitivity;
pub mod splitter;
pub mod switch;
pub mod thresholding;
pub mod throughput;

use common::{
    identity::DeviceIdentity,
    types::{SensorSample, Sensitivity},
};
use tracing::warn;

/// Consumer of sensor samples
pub trait DataSink: Send {
    fn on_data(&mut self, origin: &DeviceIdentity, sample: SensorSample, sensitivity: Sensitivity);

    /// Releases the sink, stages close their downstream sinks too
    fn close(&mut self);
}

/// Producer of sensor samples
pub trait DataSource {
    fn set_data_sink(&mut self, sink: Box<dyn DataSink>);

    fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&mut self);
}

/// A pipeline element that is both a sink and a source
pub trait Stage: DataSink + DataSource {
    fn into_sink(self: Box<Self>) -> Box<dyn DataSink>;
}

impl<T: DataSink + DataSource + 'static> Stage for T {
    fn into_sink(self: Box<Self>) -> Box<dyn DataSink> {
        self
    }
}

/// Per sample transformation, wrapped into a [`FilterStage`] to become part of a pipeline
pub trait Filter: Send {
    /// Returns false if the sample should not be forwarded
    fn filter(
        &mut self,
        origin: &DeviceIdentity,
        sample: &mut SensorSample,
        sensitivity: &mut Sensitivity,
    ) -> bool;
}

/// Runs a [`Filter`] and forwards its output to the downstream sink
pub struct FilterStage<F> {
    filter: F,
    sink: Option<Box<dyn DataSink>>,
    closed: bool,
}

impl<F: Filter> FilterStage<F> {
    pub fn new(filter: F) -> Self {
        Self {
            filter,
            sink: None,
            closed: false,
        }
    }

    pub fn with_sink(filter: F, sink: Box<dyn DataSink>) -> Self {
        Self {
            filter,
            sink: Some(sink),
            closed: false,
        }
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut F {
        &mut self.filter
    }
}

impl<F: Filter> DataSink for FilterStage<F> {
    fn on_data(&mut self, origin: &DeviceIdentity, mut sample: SensorSample, mut sensitivity: Sensitivity) {
        if self.closed {
            return;
        }

        if !self.filter.filter(origin, &mut sample, &mut sensitivity) {
            return;
        }

        match &mut self.sink {
            Some(sink) => sink.on_data(origin, sample, sensitivity),
            None => warn!("Filter stage has no sink, sample dropped"),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(sink) = &mut self.sink {
            sink.close();
        }
    }
}

impl<F: Filter> DataSource for FilterStage<F> {
    fn set_data_sink(&mut self, sink: Box<dyn DataSink>) {
        self.sink = Some(sink);
    }

    fn close(&mut self) {
        DataSink::close(self);
    }
}

/// Ordered list of stages that is linked into a chain on [`PipelineBuilder::build`]
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Box<dyn Stage>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a stage in front of all others
    pub fn prepend(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.insert(0, Box::new(stage));
        self
    }

    pub fn append(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Inserts a stage at `index`, stages after it move back, an out of range index appends
    pub fn insert(mut self, index: usize, stage: impl Stage + 'static) -> Self {
        let index = index.min(self.stages.len());
        self.stages.insert(index, Box::new(stage));
        self
    }

    /// Removes the stage at `index`, out of range indices are ignored
    pub fn remove(mut self, index: usize) -> Self {
        if index < self.stages.len() {
            self.stages.remove(index);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Links every stage to its successor, the last one to `sink`, and starts them
    ///
    /// Returns the head of the pipeline, which is `sink` itself for an empty builder.
    pub fn build(self, sink: Box<dyn DataSink>) -> anyhow::Result<Box<dyn DataSink>> {
        let mut next = sink;

        for mut stage in self.stages.into_iter().rev() {
            stage.set_data_sink(next);
            stage.start()?;
            next = stage.into_sink();
        }

        Ok(next)
    }
}
