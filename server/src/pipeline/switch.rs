use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use common::{
    identity::DeviceIdentity,
    types::{SensorSample, Sensitivity},
};

use super::{DataSink, DataSource};

/// Routes every sample to exactly one of two sinks
///
/// The routing flag is shared with a [`SwitchHandle`] and may be flipped from any thread.
pub struct Switch {
    first: Box<dyn DataSink>,
    second: Box<dyn DataSink>,
    /// Set while samples go to `first`
    flag: Arc<AtomicBool>,
    closed: bool,
}

/// Remote control of a [`Switch`]
#[derive(Debug, Clone)]
pub struct SwitchHandle(Arc<AtomicBool>);

impl Switch {
    pub fn new(first: Box<dyn DataSink>, second: Box<dyn DataSink>, start_with_first: bool) -> Self {
        Self {
            first,
            second,
            flag: Arc::new(AtomicBool::new(start_with_first)),
            closed: false,
        }
    }

    pub fn handle(&self) -> SwitchHandle {
        SwitchHandle(self.flag.clone())
    }
}

impl SwitchHandle {
    pub fn route_to_first(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn route_to_second(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    /// Returns true if samples go to the first sink afterwards
    pub fn toggle(&self) -> bool {
        !self.0.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn is_routing_to_first(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl DataSink for Switch {
    fn on_data(&mut self, origin: &DeviceIdentity, sample: SensorSample, sensitivity: Sensitivity) {
        if self.closed {
            return;
        }

        if self.flag.load(Ordering::Relaxed) {
            self.first.on_data(origin, sample, sensitivity);
        } else {
            self.second.on_data(origin, sample, sensitivity);
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.first.close();
        self.second.close();
    }
}

/// Inside a pipeline the downstream sink is the first route, the replaced sink is closed
impl DataSource for Switch {
    fn set_data_sink(&mut self, sink: Box<dyn DataSink>) {
        let mut replaced = std::mem::replace(&mut self.first, sink);
        replaced.close();
    }

    fn close(&mut self) {
        DataSink::close(self);
    }
}
