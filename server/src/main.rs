//! Demo server: logs the samples of every connected client

use std::{collections::BTreeMap, net::IpAddr, time::Duration};

use anyhow::Context;
use clap::Parser;
use common::{identity::DeviceIdentity, types::{SensorSample, SensorType, Sensitivity}};
use crossbeam::channel;
use networking::discovery::DiscoveryConfig;
use server::{
    listeners::{ButtonListener, LoggingListener},
    pipeline::{
        averaging::AveragingFilter,
        sensitivity::SensitivityFilter,
        splitter::SensorSplitter,
        switch::{Switch, SwitchHandle},
        throughput::ThroughputMeasurer,
        DataSink, DataSource, FilterStage, PipelineBuilder,
    },
    Server, ServerConfig,
};
use tracing::{debug, info, Level};

#[derive(Parser, Debug)]
#[command(about = "Receives sensor samples from clients on the local network")]
struct Args {
    /// Name announced to clients
    #[arg(long, default_value = "server")]
    name: String,
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,
    /// 0 picks a free port
    #[arg(long, default_value_t = 0)]
    port: u16,
    /// Do not answer discovery requests
    #[arg(long)]
    no_discovery: bool,
    /// Length of the moving average window
    #[arg(long, default_value_t = 3)]
    average: usize,
    /// Reject clients while this many are connected
    #[arg(long)]
    max_clients: Option<usize>,
    #[arg(short, long)]
    verbose: bool,
}

/// Logs every sample of one sensor type
struct LoggingSink {
    sensor_type: SensorType,
    received: u64,
}

impl DataSink for LoggingSink {
    fn on_data(&mut self, origin: &DeviceIdentity, sample: SensorSample, sensitivity: Sensitivity) {
        self.received += 1;
        debug!("{origin}: {sample} (sensitivity {sensitivity})");
    }

    fn close(&mut self) {
        info!("Logged {} {} samples", self.received, self.sensor_type);
    }
}

/// Gives every sensor its own averaging window in front of its own sink
fn averaged_per_sensor(
    sensors: &[SensorType],
    window: usize,
    mut sink_for: impl FnMut(SensorType) -> Box<dyn DataSink>,
) -> SensorSplitter {
    sensors
        .iter()
        .fold(SensorSplitter::new(), |splitter, &sensor_type| {
            let averaging = FilterStage::with_sink(AveragingFilter::new(window), sink_for(sensor_type));
            splitter.route(sensor_type, Box::new(averaging))
        })
}

/// Drops every sample
struct Muted;

impl DataSink for Muted {
    fn on_data(&mut self, _: &DeviceIdentity, _: SensorSample, _: Sensitivity) {}

    fn close(&mut self) {}
}

/// Button 0 mutes and unmutes the sample log
struct MuteButton(SwitchHandle);

impl ButtonListener for MuteButton {
    fn on_button_click(&mut self, origin: &DeviceIdentity, id: i32, is_hold: bool) {
        if id == 0 && !is_hold {
            let logging = self.0.toggle();
            info!("{origin} turned sample logging {}", if logging { "on" } else { "off" });
        } else {
            LoggingListener.on_button_click(origin, id, is_hold);
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .init();
    info!("Starting server");

    let sensors = [SensorType::Gyroscope, SensorType::Accelerometer];
    let config = ServerConfig {
        name: args.name,
        bind_ip: args.bind,
        command_port: args.port,
        discovery: (!args.no_discovery).then(DiscoveryConfig::default),
        required_sensors: sensors.into(),
        client_maximum: args.max_clients,
        buttons: BTreeMap::from([(0, "Mute".to_owned()), (1, "Action".to_owned())]),
        ..Default::default()
    };

    let splitter = averaged_per_sensor(&sensors, args.average.max(1), |sensor_type| {
        Box::new(LoggingSink {
            sensor_type,
            received: 0,
        })
    });

    let switch = Switch::new(Box::new(splitter), Box::new(Muted), true);
    let mute = switch.handle();
    let throughput = ThroughputMeasurer::new(Duration::from_secs(1), 5);
    let rate = throughput.handle();

    let head = PipelineBuilder::new()
        .append(FilterStage::new(SensitivityFilter::default()))
        .append(throughput)
        .build(Box::new(switch))
        .context("Build pipeline")?;

    let mut server = Server::new(config);
    server.set_client_listener(LoggingListener);
    server.set_button_listener(MuteButton(mute));
    server.set_data_sink(head);
    server.start().context("Start server")?;

    let (stop_tx, stop_rx) = channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("Set ctrl-c")?;

    let handle = server.handle();
    let report = channel::tick(Duration::from_secs(5));
    loop {
        crossbeam::select! {
            recv(stop_rx) -> _ => break,
            recv(report) -> _ => {
                let clients = handle.connected_clients();
                info!("{} clients, {:.1} samples/s", clients.len(), rate.rate_per_second());
            }
        }
    }

    info!("Stopping server");
    server.close();
    info!("Server stopped");

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<Vec<f32>>>>);

    impl DataSink for Collect {
        fn on_data(&mut self, _: &DeviceIdentity, sample: SensorSample, _: Sensitivity) {
            self.0.lock().unwrap().push(sample.values);
        }

        fn close(&mut self) {}
    }

    #[test]
    fn sensors_do_not_share_a_window() {
        let gyroscope = Collect::default();
        let accelerometer = Collect::default();
        let mut splitter = averaged_per_sensor(
            &[SensorType::Gyroscope, SensorType::Accelerometer],
            3,
            |sensor_type| match sensor_type {
                SensorType::Gyroscope => Box::new(gyroscope.clone()),
                _ => Box::new(accelerometer.clone()),
            },
        );
        let phone = DeviceIdentity::new("phone1");

        splitter.on_data(
            &phone,
            SensorSample::new(SensorType::Gyroscope, vec![3.0, 3.0, 3.0], 0),
            50.0,
        );
        splitter.on_data(
            &phone,
            SensorSample::new(SensorType::Accelerometer, vec![0.0, 0.0, 0.0], 1),
            50.0,
        );

        assert_eq!(*gyroscope.0.lock().unwrap(), vec![vec![1.0, 1.0, 1.0]]);
        assert_eq!(*accelerometer.0.lock().unwrap(), vec![vec![0.0, 0.0, 0.0]]);
    }
}
