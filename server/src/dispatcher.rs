//! The single thread that owns the pipeline, the listeners and all sessions

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::anyhow;
use common::{
    error::LogErrorExt,
    identity::DeviceIdentity,
    protocol::Command,
    types::{SensorSample, SensorSpeed, SensorType, Sensitivity, DEFAULT_SENSITIVITY, MAX_SENSITIVITY},
};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use fxhash::FxHashMap as HashMap;
use mio::net::TcpStream;
use networking::{
    command::{ChannelEvent, CloseReason, CommandChannel},
    data::{DataChannel, DataEvent},
    watch::{ConnectionWatch, WatchAction},
    NetError,
};
use tracing::{debug, info, trace, warn};

use crate::{
    listeners::Listeners,
    pipeline::{scaling::ScalingFilter, DataSink, Filter},
    server::ServerConfig,
};

/// How often alive checks and pending handshakes are looked at
const WATCH_TICK: Duration = Duration::from_millis(50);

/// Connections that do not send a connection request within this time are dropped
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SessionKey(u64);

pub(crate) enum Dispatch {
    Accepted(TcpStream),
    Channel(SessionKey, ChannelEvent),
    /// The data channel of a session stopped receiving
    DataFault(SessionKey, NetError),
    Control(Control),
}

pub(crate) enum Control {
    SetRequiredSensors(BTreeSet<SensorType>),
    SetSensorSpeed(SensorType, SensorSpeed),
    SetOutputRange(SensorType, f32),
    SetClientMaximum(Option<usize>),
    UpdateButtonsMap(BTreeMap<i32, String>),
    UpdateButtonLayout(String),
    DisplayNotification {
        id: i32,
        title: String,
        content: String,
    },
    CloseClient(DeviceIdentity),
    Shutdown,
}

pub(crate) type SampleEvent = (SessionKey, SensorSample);

/// Hands the events of one data channel to the dispatcher
///
/// Samples share a bounded queue that sheds its oldest entries when full,
/// faults go through the unbounded event channel and are never dropped.
pub(crate) struct DataRouter {
    key: SessionKey,
    samples: Sender<SampleEvent>,
    backlog: Receiver<SampleEvent>,
    events: Sender<Dispatch>,
}

impl DataRouter {
    pub fn route(&self, event: DataEvent) {
        match event {
            DataEvent::Sample(sample) => self.offer(sample),
            DataEvent::Fault(err) => {
                // Fails only once the dispatcher is gone
                let _ = self.events.send(Dispatch::DataFault(self.key, err));
            }
        }
    }

    fn offer(&self, sample: SensorSample) {
        let mut pending = (self.key, sample);

        loop {
            match self.samples.try_send(pending) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => return,
                Err(TrySendError::Full(rejected)) => {
                    if self.backlog.try_recv().is_ok() {
                        trace!("Sample queue full, oldest sample dropped");
                    }
                    pending = rejected;
                }
            }
        }
    }
}

/// How a session ended, decides which callbacks fire
enum Outcome {
    /// Rejected or never completed the handshake
    Silent,
    /// Peer closed or sent an end of connection
    Disconnected,
    /// Closed by the host or by shutdown
    Closed,
    TimedOut,
    Fault(NetError, &'static str),
}

struct Session {
    channel: CommandChannel,
    opened: Instant,
    /// Set once the handshake completed
    client: Option<DeviceIdentity>,
    data: Option<DataChannel>,
    watch: Option<ConnectionWatch>,
    sensitivities: HashMap<SensorType, Sensitivity>,
    /// Ranges the client reported for its sensors
    ranges: HashMap<SensorType, f32>,
    /// Maps the client's ranges onto the output ranges of the host
    scalers: HashMap<SensorType, ScalingFilter>,
}

impl Session {
    fn new(channel: CommandChannel) -> Self {
        Self {
            channel,
            opened: Instant::now(),
            client: None,
            data: None,
            watch: None,
            sensitivities: SensorType::ALL
                .into_iter()
                .map(|sensor_type| (sensor_type, DEFAULT_SENSITIVITY))
                .collect(),
            ranges: HashMap::default(),
            scalers: HashMap::default(),
        }
    }

    /// Scaling needs both the range of the client and the output range of the host
    fn update_scaler(&mut self, sensor_type: SensorType, output_range: Option<f32>) {
        match (self.ranges.get(&sensor_type), output_range) {
            (Some(&source), Some(target)) if source > 0.0 => {
                self.scalers
                    .insert(sensor_type, ScalingFilter::with_ranges(target, source));
            }
            _ => {
                self.scalers.remove(&sensor_type);
            }
        }
    }

    fn sensitivity(&self, sensor_type: SensorType) -> Sensitivity {
        self.sensitivities
            .get(&sensor_type)
            .copied()
            .unwrap_or(DEFAULT_SENSITIVITY)
    }
}

pub(crate) struct Dispatcher {
    config: ServerConfig,
    identity: DeviceIdentity,
    head: Box<dyn DataSink>,
    listeners: Listeners,

    sessions: HashMap<SessionKey, Session>,
    next_key: u64,

    required_sensors: BTreeSet<SensorType>,
    sensor_speeds: BTreeMap<SensorType, SensorSpeed>,
    output_ranges: BTreeMap<SensorType, f32>,
    client_maximum: Option<usize>,
    buttons: BTreeMap<i32, String>,
    layout: Option<String>,

    events: Sender<Dispatch>,
    samples: Sender<SampleEvent>,
    backlog: Receiver<SampleEvent>,
    clients: Arc<Mutex<Vec<DeviceIdentity>>>,
}

impl Dispatcher {
    pub fn new(
        config: ServerConfig,
        identity: DeviceIdentity,
        head: Box<dyn DataSink>,
        listeners: Listeners,
        events: Sender<Dispatch>,
        samples: Sender<SampleEvent>,
        backlog: Receiver<SampleEvent>,
        clients: Arc<Mutex<Vec<DeviceIdentity>>>,
    ) -> Self {
        Self {
            required_sensors: config.required_sensors.clone(),
            sensor_speeds: config.sensor_speeds.clone(),
            output_ranges: config.output_ranges.clone(),
            client_maximum: config.client_maximum,
            buttons: config.buttons.clone(),
            layout: None,
            config,
            identity,
            head,
            listeners,
            sessions: HashMap::default(),
            next_key: 0,
            events,
            samples,
            backlog,
            clients,
        }
    }

    pub fn run(mut self, events: Receiver<Dispatch>, samples: Receiver<SampleEvent>) {
        let ticker = channel::tick(WATCH_TICK);

        loop {
            crossbeam::select! {
                recv(events) -> event => match event {
                    Ok(Dispatch::Control(Control::Shutdown)) | Err(_) => break,
                    Ok(event) => self.handle(event),
                },
                recv(samples) -> sample => {
                    if let Ok((key, sample)) = sample {
                        self.handle_sample(key, sample);
                    }
                }
                recv(ticker) -> _ => self.check_liveness(Instant::now()),
            }
        }

        self.shutdown();
    }

    fn handle(&mut self, event: Dispatch) {
        match event {
            Dispatch::Accepted(stream) => self.open_session(stream),
            Dispatch::Channel(key, event) => self.handle_channel(key, event),
            Dispatch::DataFault(key, err) => self.end_session(key, Outcome::Fault(err, "Data channel")),
            Dispatch::Control(control) => self.handle_control(control),
        }
    }

    fn open_session(&mut self, stream: TcpStream) {
        let key = SessionKey(self.next_key);
        self.next_key += 1;

        let events = self.events.clone();
        let channel = CommandChannel::from_accepted(stream, move |event, _| {
            // Fails only once the dispatcher is gone
            let _ = events.send(Dispatch::Channel(key, event));
        });

        match channel {
            Ok(channel) => {
                debug!("New connection from {}", channel.peer_addr());
                self.sessions.insert(key, Session::new(channel));
            }
            Err(err) => {
                self.listeners
                    .exception
                    .on_exception(None, &err, "Open command channel");
            }
        }
    }

    fn handle_channel(&mut self, key: SessionKey, event: ChannelEvent) {
        let Some(session) = self.sessions.get(&key) else {
            trace!("Event for closed session: {event:?}");
            return;
        };

        match event {
            ChannelEvent::Command(command) => self.handle_command(key, command),
            ChannelEvent::Malformed(err) => {
                let origin = session.client.clone();
                self.listeners
                    .exception
                    .on_exception(origin.as_ref(), &err, "Malformed command");
            }
            ChannelEvent::Closed(CloseReason::Local) => self.end_session(key, Outcome::Silent),
            ChannelEvent::Closed(CloseReason::Remote) => self.end_session(key, Outcome::Disconnected),
            ChannelEvent::Closed(CloseReason::Fault(err)) => {
                self.end_session(key, Outcome::Fault(err, "Command channel"))
            }
        }
    }

    fn handle_command(&mut self, key: SessionKey, command: Command) {
        let Some(session) = self.sessions.get_mut(&key) else {
            return;
        };

        let Some(client) = session.client.clone() else {
            match command {
                Command::ConnectionRequest { identity } => self.handshake(key, identity),
                other => {
                    let err = NetError::ParsingError(anyhow!("{} before the handshake", other.tag()));
                    self.listeners
                        .exception
                        .on_exception(None, &err, "Protocol violation");
                    self.end_session(key, Outcome::Silent);
                }
            }
            return;
        };

        match command {
            Command::ChangeSensorSensitivity { sensor_type, value } => {
                let value = value.min(MAX_SENSITIVITY) as Sensitivity;
                debug!("{client} set the sensitivity of {sensor_type} to {value}");
                session.sensitivities.insert(sensor_type, value);
            }
            Command::SensorRangeNotification { sensor_type, range } => {
                debug!("{client} reports a range of {range} for {sensor_type}");
                session.ranges.insert(sensor_type, range);
                session.update_scaler(sensor_type, self.output_ranges.get(&sensor_type).copied());
            }
            Command::ButtonClick { id, is_hold } => {
                self.listeners.button.on_button_click(&client, id, is_hold);
            }
            Command::ResetToCenter => {
                self.listeners.reset.on_reset_position(&client);
            }
            Command::ConnectionAliveCheck {
                answerer: Some(_), ..
            } => {
                if let Some(watch) = &mut session.watch {
                    watch.on_answer(Instant::now());
                }
            }
            check @ Command::ConnectionAliveCheck { answerer: None, .. } => {
                if let Some(answer) = check.answer_alive_check(&self.identity) {
                    session.channel.send(answer).log_warn("Answer alive check");
                }
            }
            Command::EndConnection => self.end_session(key, Outcome::Disconnected),
            Command::ConnectionRequest { .. } => {
                warn!("{client} repeated its connection request");
            }
            other => warn!("{client} sent unexpected {}", other.tag()),
        }
    }

    fn handshake(&mut self, key: SessionKey, claimed: DeviceIdentity) {
        let Some(session) = self.sessions.get(&key) else {
            return;
        };

        let peer_ip = session.channel.peer_addr().ip();
        let client = claimed.observed_at(peer_ip);

        if self.is_client_maximum_reached() {
            info!("Rejected {client}, client maximum reached");
            self.end_session(key, Outcome::Silent);
            return;
        }

        if !self.listeners.client.accept_client(&client) {
            info!("Rejected {client}");
            self.end_session(key, Outcome::Silent);
            return;
        }

        let router = DataRouter {
            key,
            samples: self.samples.clone(),
            backlog: self.backlog.clone(),
            events: self.events.clone(),
        };
        let data = DataChannel::bind(
            self.config.bind_ip,
            peer_ip,
            self.config.data_read_timeout,
            move |event| router.route(event),
        );
        let data = match data {
            Ok(data) => data,
            Err(err) => {
                self.listeners
                    .exception
                    .on_exception(Some(&client), &err, "Bind data channel");
                self.end_session(key, Outcome::Silent);
                return;
            }
        };

        let data_addr = data.local_addr();
        let mut session_identity = self.identity.clone();
        session_identity.data_port = data_addr.port();

        let mut greeting = vec![
            Command::ConnectionAccepted {
                session: session_identity,
            },
            Command::SetSensorList {
                required: self.required_sensors.clone(),
            },
        ];
        greeting.extend(
            self.sensor_speeds
                .iter()
                .map(|(&sensor_type, &speed)| Command::SetSensorSpeed { sensor_type, speed }),
        );
        if !self.buttons.is_empty() {
            greeting.push(Command::UpdateButtonsMap {
                mapping: self.buttons.clone(),
            });
        }
        if let Some(definition) = &self.layout {
            greeting.push(Command::UpdateButtonLayout {
                definition: definition.clone(),
            });
        }

        let Some(session) = self.sessions.get_mut(&key) else {
            return;
        };
        session.client = Some(client.clone());
        session.data = Some(data);
        session.watch = Some(ConnectionWatch::new(self.config.watch, Instant::now()));

        for command in greeting {
            if let Err(err) = session.channel.send(command) {
                self.end_session(key, Outcome::Fault(err, "Send greeting"));
                return;
            }
        }

        info!("Accepted {client}, receiving samples on {data_addr}");
        self.publish_clients();
        self.listeners.client.on_client_accepted(&client);
    }

    fn handle_sample(&mut self, key: SessionKey, mut sample: SensorSample) {
        let Some(session) = self.sessions.get_mut(&key) else {
            return;
        };
        let Some(client) = &session.client else {
            return;
        };

        let mut sensitivity = session.sensitivity(sample.sensor_type);
        if let Some(scaler) = session.scalers.get_mut(&sample.sensor_type) {
            if !scaler.filter(client, &mut sample, &mut sensitivity) {
                return;
            }
        }

        self.head.on_data(client, sample, sensitivity);
    }

    fn is_client_maximum_reached(&self) -> bool {
        let Some(maximum) = self.client_maximum else {
            return false;
        };

        let accepted = self
            .sessions
            .values()
            .filter(|session| session.client.is_some())
            .count();
        accepted >= maximum
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::SetRequiredSensors(required) => {
                self.required_sensors = required.clone();
                self.broadcast(Command::SetSensorList { required });
            }
            Control::SetSensorSpeed(sensor_type, speed) => {
                self.sensor_speeds.insert(sensor_type, speed);
                self.broadcast(Command::SetSensorSpeed { sensor_type, speed });
            }
            Control::SetOutputRange(sensor_type, range) => {
                self.output_ranges.insert(sensor_type, range);
                for session in self.sessions.values_mut() {
                    session.update_scaler(sensor_type, Some(range));
                }
            }
            Control::SetClientMaximum(maximum) => {
                debug!("Client maximum set to {maximum:?}");
                self.client_maximum = maximum;
            }
            Control::UpdateButtonsMap(mapping) => {
                self.buttons = mapping.clone();
                self.broadcast(Command::UpdateButtonsMap { mapping });
            }
            Control::UpdateButtonLayout(definition) => {
                self.layout = Some(definition.clone());
                self.broadcast(Command::UpdateButtonLayout { definition });
            }
            Control::DisplayNotification { id, title, content } => {
                self.broadcast(Command::DisplayNotification { id, title, content });
            }
            Control::CloseClient(client) => {
                let key = self
                    .sessions
                    .iter()
                    .find(|(_, session)| session.client.as_ref() == Some(&client))
                    .map(|(key, _)| *key);

                match key {
                    Some(key) => self.end_session(key, Outcome::Closed),
                    None => warn!("Cannot close unknown client {client}"),
                }
            }
            // Handled by the run loop
            Control::Shutdown => {}
        }
    }

    /// Sends `command` to every accepted client
    fn broadcast(&self, command: Command) {
        for session in self.sessions.values() {
            if session.client.is_some() {
                session
                    .channel
                    .send(command.clone())
                    .log_warn("Broadcast command");
            }
        }
    }

    fn check_liveness(&mut self, now: Instant) {
        let mut expired = Vec::new();

        for (key, session) in &mut self.sessions {
            let Some(watch) = &mut session.watch else {
                if now.saturating_duration_since(session.opened) >= HANDSHAKE_TIMEOUT {
                    debug!("{} never sent a connection request", session.channel.peer_addr());
                    expired.push((*key, Outcome::Silent));
                }
                continue;
            };

            match watch.poll(now) {
                WatchAction::SendCheck => {
                    let check = Command::ConnectionAliveCheck {
                        requester: self.identity.clone(),
                        answerer: None,
                    };
                    session.channel.send(check).log_warn("Send alive check");
                }
                WatchAction::TimedOut => expired.push((*key, Outcome::TimedOut)),
                WatchAction::Wait => {}
            }
        }

        for (key, outcome) in expired {
            self.end_session(key, outcome);
        }
    }

    /// Closes the session and fires its terminal callbacks, at most once per session
    fn end_session(&mut self, key: SessionKey, outcome: Outcome) {
        let Some(mut session) = self.sessions.remove(&key) else {
            return;
        };

        if matches!(outcome, Outcome::Closed | Outcome::TimedOut) {
            session
                .channel
                .send(Command::EndConnection)
                .log_warn("Send end of connection");
        }

        if let Some(data) = &mut session.data {
            data.close();
        }
        session.channel.close();

        let Some(client) = session.client else {
            if let Outcome::Fault(err, info) = outcome {
                debug!("Pending connection failed, {info}: {err}");
            }
            return;
        };

        self.publish_clients();

        match outcome {
            Outcome::Silent => {}
            Outcome::Disconnected | Outcome::Closed => {
                self.listeners.client.on_client_disconnected(&client);
            }
            Outcome::TimedOut => {
                self.listeners.client.on_client_timeout(&client);
            }
            Outcome::Fault(err, info) => {
                self.listeners
                    .exception
                    .on_exception(Some(&client), &err, info);
                self.listeners.client.on_client_disconnected(&client);
            }
        }
    }

    fn publish_clients(&self) {
        let clients = self
            .sessions
            .values()
            .filter_map(|session| session.client.clone())
            .collect();

        match self.clients.lock() {
            Ok(mut shared) => *shared = clients,
            Err(poisoned) => *poisoned.into_inner() = clients,
        }
    }

    fn shutdown(&mut self) {
        info!("Closing {} sessions", self.sessions.len());

        let keys: Vec<_> = self.sessions.keys().copied().collect();
        for key in keys {
            self.end_session(key, Outcome::Closed);
        }

        self.head.close();
    }
}

#[cfg(test)]
mod tests {
    use common::types::SensorType;

    use super::*;

    fn router(queue: usize) -> (DataRouter, Receiver<SampleEvent>, Receiver<Dispatch>) {
        let (samples, samples_rx) = channel::bounded(queue);
        let (events, events_rx) = channel::unbounded();
        let router = DataRouter {
            key: SessionKey(7),
            samples,
            backlog: samples_rx.clone(),
            events,
        };

        (router, samples_rx, events_rx)
    }

    fn stamped(timestamp_nanos: i64) -> DataEvent {
        DataEvent::Sample(SensorSample::new(SensorType::Gyroscope, vec![0.0], timestamp_nanos))
    }

    #[test]
    fn full_queue_keeps_newest_samples() {
        let (router, samples, _events) = router(3);

        for timestamp in 0..10 {
            router.route(stamped(timestamp));
        }

        let queued: Vec<_> = samples
            .try_iter()
            .map(|(key, sample)| {
                assert_eq!(key, SessionKey(7));
                sample.timestamp_nanos
            })
            .collect();
        assert_eq!(queued, vec![7, 8, 9]);
    }

    #[test]
    fn fault_is_delivered_with_full_queue() {
        let (router, samples, events) = router(1);

        router.route(stamped(0));
        router.route(DataEvent::Fault(NetError::PeerClosed));

        assert_eq!(samples.len(), 1);
        assert!(matches!(
            events.try_recv(),
            Ok(Dispatch::DataFault(SessionKey(7), NetError::PeerClosed))
        ));
    }
}
