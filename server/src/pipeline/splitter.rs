//! Stages that route samples to different sinks depending on their origin or type

use common::{
    identity::DeviceIdentity,
    types::{SensorSample, SensorType, Sensitivity},
};
use fxhash::FxHashMap as HashMap;
use tracing::trace;

use super::DataSink;

/// Routes samples by their sensor type, types without a route are dropped
#[derive(Default)]
pub struct SensorSplitter {
    routes: HashMap<SensorType, Box<dyn DataSink>>,
    closed: bool,
}

impl SensorSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces an existing route for the same type
    pub fn route(mut self, sensor_type: SensorType, sink: Box<dyn DataSink>) -> Self {
        self.routes.insert(sensor_type, sink);
        self
    }
}

impl DataSink for SensorSplitter {
    fn on_data(&mut self, origin: &DeviceIdentity, sample: SensorSample, sensitivity: Sensitivity) {
        if self.closed {
            return;
        }

        match self.routes.get_mut(&sample.sensor_type) {
            Some(sink) => sink.on_data(origin, sample, sensitivity),
            None => trace!("No route for {}", sample.sensor_type),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.routes.values_mut().for_each(|sink| sink.close());
    }
}

/// Routes samples by the device that sent them
///
/// Devices without a route go to the fallback sink, if there is one.
#[derive(Default)]
pub struct ClientSplitter {
    routes: HashMap<DeviceIdentity, Box<dyn DataSink>>,
    fallback: Option<Box<dyn DataSink>>,
    closed: bool,
}

impl ClientSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, client: DeviceIdentity, sink: Box<dyn DataSink>) -> Self {
        self.routes.insert(client, sink);
        self
    }

    pub fn fallback(mut self, sink: Box<dyn DataSink>) -> Self {
        self.fallback = Some(sink);
        self
    }

    /// Removes and closes the route of a device that left
    pub fn remove_route(&mut self, client: &DeviceIdentity) {
        if let Some(mut sink) = self.routes.remove(client) {
            sink.close();
        }
    }
}

impl DataSink for ClientSplitter {
    fn on_data(&mut self, origin: &DeviceIdentity, sample: SensorSample, sensitivity: Sensitivity) {
        if self.closed {
            return;
        }

        match self.routes.get_mut(origin) {
            Some(sink) => sink.on_data(origin, sample, sensitivity),
            None => match &mut self.fallback {
                Some(sink) => sink.on_data(origin, sample, sensitivity),
                None => trace!("No route for {origin}"),
            },
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.routes.values_mut().for_each(|sink| sink.close());
        if let Some(sink) = &mut self.fallback {
            sink.close();
        }
    }
}
