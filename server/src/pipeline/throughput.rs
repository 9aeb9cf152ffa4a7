use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use common::{
    identity::DeviceIdentity,
    ring_buffer::RingBuffer,
    types::{SensorSample, Sensitivity},
};
use crossbeam::channel::{self, Sender};
use tracing::{error, span, trace, warn, Level};

use super::{DataSink, DataSource};

/// Counts the samples passing through without changing them
///
/// Once started, a timer thread stores the count of every period in a ring
/// buffer, [`ThroughputHandle::average_per_period`] reports the moving average.
pub struct ThroughputMeasurer {
    handle: ThroughputHandle,
    sink: Option<Box<dyn DataSink>>,
    closed: bool,
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct ThroughputHandle {
    period: Duration,
    counter: Arc<AtomicU64>,
    history: Arc<Mutex<RingBuffer<u64>>>,
}

impl ThroughputMeasurer {
    /// Averages over the last `window` periods
    pub fn new(period: Duration, window: usize) -> Self {
        Self {
            handle: ThroughputHandle {
                period,
                counter: Arc::default(),
                history: Arc::new(Mutex::new(RingBuffer::new(window, 0))),
            },
            sink: None,
            closed: false,
            stop: None,
            worker: None,
        }
    }

    pub fn handle(&self) -> ThroughputHandle {
        self.handle.clone()
    }
}

impl ThroughputHandle {
    /// Closes the current period, returns its sample count
    pub fn snapshot(&self) -> u64 {
        let count = self.counter.swap(0, Ordering::Relaxed);
        match self.history.lock() {
            Ok(mut history) => {
                history.add(count);
            }
            Err(_) => warn!("Throughput history poisoned"),
        }

        count
    }

    /// Moving average of the sample count per period, zero before the first period
    pub fn average_per_period(&self) -> f64 {
        let Ok(history) = self.history.lock() else {
            return 0.0;
        };

        let periods = history.size();
        if periods == 0 {
            return 0.0;
        }

        let total: u64 = (0..periods).map(|index| *history.get(index)).sum();
        total as f64 / periods as f64
    }

    /// The moving average converted to samples per second
    pub fn rate_per_second(&self) -> f64 {
        self.average_per_period() / self.period.as_secs_f64()
    }
}

impl DataSink for ThroughputMeasurer {
    fn on_data(&mut self, origin: &DeviceIdentity, sample: SensorSample, sensitivity: Sensitivity) {
        if self.closed {
            return;
        }

        self.handle.counter.fetch_add(1, Ordering::Relaxed);

        if let Some(sink) = &mut self.sink {
            sink.on_data(origin, sample, sensitivity);
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // Disconnecting the channel stops the timer
        self.stop = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Throughput timer panicked");
            }
        }

        if let Some(sink) = &mut self.sink {
            sink.close();
        }
    }
}

impl DataSource for ThroughputMeasurer {
    fn set_data_sink(&mut self, sink: Box<dyn DataSink>) {
        self.sink = Some(sink);
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.worker.is_some() || self.closed {
            return Ok(());
        }

        let (stop, stopped) = channel::bounded::<()>(0);
        let handle = self.handle.clone();

        let worker = thread::Builder::new()
            .name("throughput".to_owned())
            .spawn(move || {
                let _span = span!(Level::INFO, "Throughput timer").entered();

                let ticker = channel::tick(handle.period);
                loop {
                    crossbeam::select! {
                        recv(ticker) -> _ => {
                            let count = handle.snapshot();
                            trace!("{count} samples in the last period");
                        }
                        recv(stopped) -> _ => break,
                    }
                }
            })?;

        self.stop = Some(stop);
        self.worker = Some(worker);

        Ok(())
    }

    fn close(&mut self) {
        DataSink::close(self);
    }
}

impl Drop for ThroughputMeasurer {
    fn drop(&mut self) {
        self.stop = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{phone, sample, RecordingSink};

    #[test]
    fn forwards_unchanged() {
        let sink = RecordingSink::default();
        let mut measurer = ThroughputMeasurer::new(Duration::from_secs(1), 4);
        DataSource::set_data_sink(&mut measurer, sink.boxed());

        measurer.on_data(&phone(), sample(&[1.0, 2.0]), 50.0);

        assert_eq!(sink.values(), vec![vec![1.0, 2.0]]);
    }

    #[test]
    fn average_over_periods() {
        let mut measurer = ThroughputMeasurer::new(Duration::from_millis(500), 4);
        DataSource::set_data_sink(&mut measurer, RecordingSink::default().boxed());
        let handle = measurer.handle();

        assert_eq!(handle.average_per_period(), 0.0);
        assert_eq!(handle.rate_per_second(), 0.0);

        for _ in 0..10 {
            measurer.on_data(&phone(), sample(&[0.0]), 50.0);
        }
        assert_eq!(handle.snapshot(), 10);
        assert_eq!(handle.snapshot(), 0);

        // 10 samples in two half second periods
        assert_eq!(handle.average_per_period(), 5.0);
        assert_eq!(handle.rate_per_second(), 10.0);
    }

    #[test]
    fn timer_takes_snapshots() {
        let sink = RecordingSink::default();
        let mut measurer = ThroughputMeasurer::new(Duration::from_millis(20), 8);
        DataSource::set_data_sink(&mut measurer, sink.boxed());
        measurer.start().unwrap();
        let handle = measurer.handle();

        measurer.on_data(&phone(), sample(&[0.0]), 50.0);
        thread::sleep(Duration::from_millis(100));

        assert!(handle.average_per_period() > 0.0);

        DataSink::close(&mut measurer);
        assert_eq!(sink.closed(), 1);
    }
}
