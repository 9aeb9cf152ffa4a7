//! Simulated phone: finds a server, connects and streams synthetic sensor samples

mod sensors;

use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
    time::{Duration, Instant},
};

use anyhow::Context;
use clap::Parser;
use common::{
    error::LogErrorExt,
    identity::DeviceIdentity,
    protocol::Command,
    types::{SensorSpeed, SensorType},
};
use crossbeam::channel::{self, Receiver};
use networking::{
    client::{ClientConfig, ClientEvent, ClientSession},
    discovery::{DiscoveryAnnouncer, DiscoveryConfig},
};
use tracing::{info, warn, Level};

use crate::sensors::SensorSimulator;

#[derive(Parser, Debug)]
#[command(about = "Streams simulated sensor samples to a server")]
struct Args {
    /// Name announced to the server
    #[arg(long, default_value = "phone")]
    name: String,
    /// Connect to this command address instead of discovering a server
    #[arg(long)]
    server: Option<SocketAddr>,
    /// Samples per second and sensor
    #[arg(long, default_value_t = 50)]
    rate: u32,
    /// Seconds to wait for a discovery answer
    #[arg(long, default_value_t = 30)]
    discovery_timeout: u64,
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    let (stop_tx, stop_rx) = channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("Set ctrl-c")?;

    let server = match args.server {
        Some(addr) => DeviceIdentity::with_ports("server", addr.port(), 0).observed_at(addr.ip()),
        None => discover(&args.name, Duration::from_secs(args.discovery_timeout), &stop_rx)?,
    };

    info!("Connecting to {server}");
    let mut session = ClientSession::connect(&server, &args.name, &ClientConfig::default())
        .with_context(|| format!("Connect to {server}"))?;

    let mut simulator = SensorSimulator::new();
    for sensor_type in SensorType::ALL {
        session
            .notify_range(sensor_type, simulator.range(sensor_type))
            .log_error("Could not send sensor range");
    }

    stream(&mut session, &mut simulator, args.rate.max(1), &stop_rx);

    session.close();
    info!("Disconnected");

    Ok(())
}

/// Broadcasts until the first server answers
fn discover(name: &str, timeout: Duration, stop: &Receiver<()>) -> anyhow::Result<DeviceIdentity> {
    let (found_tx, found_rx) = channel::bounded(1);

    let mut announcer = DiscoveryAnnouncer::new(DeviceIdentity::new(name), DiscoveryConfig::default());
    announcer
        .start(move |devices| {
            if let Some(first) = devices.first() {
                let _ = found_tx.try_send(first.clone());
            }
        })
        .context("Start discovery")?;
    info!("Looking for a server");

    let server = crossbeam::select! {
        recv(found_rx) -> server => server.context("Discovery stopped"),
        recv(stop) -> _ => Err(anyhow::anyhow!("Interrupted")),
        default(timeout) => Err(anyhow::anyhow!("No server answered within {timeout:?}")),
    };
    announcer.close();

    server
}

/// Sensors the server asked for and how often to sample them
#[derive(Default)]
struct Streaming {
    enabled: BTreeSet<SensorType>,
    speeds: BTreeMap<SensorType, SensorSpeed>,
    last_sent: BTreeMap<SensorType, Instant>,
}

impl Streaming {
    /// Sensors that are enabled and whose interval has passed at `now`
    fn due(&mut self, now: Instant) -> Vec<SensorType> {
        let mut due = Vec::new();

        for sensor_type in &self.enabled {
            let interval = self
                .speeds
                .get(sensor_type)
                .map(|speed| speed.interval())
                .unwrap_or_default();
            let ready = match self.last_sent.get(sensor_type) {
                Some(last) => now.saturating_duration_since(*last) >= interval,
                None => true,
            };

            if ready {
                self.last_sent.insert(*sensor_type, now);
                due.push(*sensor_type);
            }
        }

        due
    }
}

fn stream(session: &mut ClientSession, simulator: &mut SensorSimulator, rate: u32, stop: &Receiver<()>) {
    let mut streaming = Streaming::default();
    let started = Instant::now();
    let ticker = channel::tick(Duration::from_secs(1) / rate);
    let clicker = channel::tick(Duration::from_secs(10));
    let events = session.events().clone();

    loop {
        crossbeam::select! {
            recv(stop) -> _ => return,
            recv(events) -> event => match event {
                Ok(ClientEvent::Command(command)) => {
                    if !handle_command(command, &mut streaming) {
                        return;
                    }
                }
                Ok(ClientEvent::Disconnected(reason)) => {
                    warn!("Server closed the connection: {reason:?}");
                    return;
                }
                Err(_) => return,
            },
            recv(ticker) -> _ => {
                let elapsed = started.elapsed();
                for sensor_type in streaming.due(Instant::now()) {
                    let sample = simulator.sample(sensor_type, elapsed);
                    if let Err(err) = session.send_sample(&sample) {
                        warn!("Could not send sample: {err}");
                    }
                }
            }
            recv(clicker) -> _ => {
                session.button_click(1, false).log_error("Could not click button");
            }
        }
    }
}

/// Returns false once the server ended the session
fn handle_command(command: Command, streaming: &mut Streaming) -> bool {
    match command {
        Command::SetSensorList { required } => {
            info!("Server requires {required:?}");
            streaming.enabled = required;
        }
        Command::SetSensorSpeed { sensor_type, speed } => {
            info!("Sampling {sensor_type} at {speed:?} speed");
            streaming.speeds.insert(sensor_type, speed);
        }
        Command::UpdateButtonsMap { mapping } => {
            for (id, label) in mapping {
                info!("Button {id}: {label}");
            }
        }
        Command::UpdateButtonLayout { definition } => {
            info!("New button layout of {} bytes", definition.len());
        }
        Command::DisplayNotification { title, content, .. } => {
            info!("Notification: {title}: {content}");
        }
        Command::EndConnection => return false,
        other => warn!("Unexpected command {}", other.tag()),
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_limits_sampling() {
        let mut streaming = Streaming::default();
        handle_command(
            Command::SetSensorList {
                required: BTreeSet::from([SensorType::Gyroscope, SensorType::Gravity]),
            },
            &mut streaming,
        );
        handle_command(
            Command::SetSensorSpeed {
                sensor_type: SensorType::Gravity,
                speed: SensorSpeed::Normal,
            },
            &mut streaming,
        );

        let start = Instant::now();
        assert_eq!(
            streaming.due(start),
            vec![SensorType::Gyroscope, SensorType::Gravity]
        );
        assert_eq!(
            streaming.due(start + Duration::from_millis(20)),
            vec![SensorType::Gyroscope]
        );
        assert_eq!(
            streaming.due(start + Duration::from_millis(250)),
            vec![SensorType::Gyroscope, SensorType::Gravity]
        );
    }

    #[test]
    fn end_of_connection_stops_streaming() {
        assert!(!handle_command(Command::EndConnection, &mut Streaming::default()));
    }
}
