//! Session façade: accepts clients, owns their channels and feeds the pipeline

use std::{
    collections::{BTreeMap, BTreeSet},
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{bail, Context};
use common::{
    identity::{DeviceIdentity, UNASSIGNED_PORT},
    types::{SensorSpeed, SensorType},
};
use crossbeam::channel::{self, Receiver, Sender};
use mio::{net::TcpListener, Events, Interest, Poll, Token};
use networking::{
    discovery::{DiscoveryConfig, DiscoveryResponder},
    watch::WatchConfig,
    MessageError,
};
use tracing::{debug, error, info, span, warn, Level};

use crate::{
    dispatcher::{Control, Dispatch, Dispatcher, SampleEvent},
    listeners::{ButtonListener, ClientListener, ExceptionListener, Listeners, ResetListener},
    pipeline::{DataSink, DataSource},
};

const LISTENER_TOKEN: Token = Token(0);

/// Samples waiting for the dispatcher, the oldest ones are dropped when full
const SAMPLE_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name announced to clients
    pub name: String,
    pub bind_ip: IpAddr,
    /// Port for command connections, 0 picks a free one which is announced through discovery
    pub command_port: u16,
    /// `None` disables the discovery responder
    pub discovery: Option<DiscoveryConfig>,
    pub watch: WatchConfig,
    /// Upper bound for one poll of the acceptor
    pub poll_timeout: Duration,
    /// Upper bound for one read of a data channel
    pub data_read_timeout: Duration,
    /// Sensors every client is asked to stream after connecting
    pub required_sensors: BTreeSet<SensorType>,
    /// Update rates sent to every client after connecting
    pub sensor_speeds: BTreeMap<SensorType, SensorSpeed>,
    /// Samples of these sensors are scaled from the range the client reports onto this range
    pub output_ranges: BTreeMap<SensorType, f32>,
    /// Further clients are rejected while this many are connected, `None` for no limit
    pub client_maximum: Option<usize>,
    pub buttons: BTreeMap<i32, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "server".to_owned(),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            command_port: UNASSIGNED_PORT,
            discovery: Some(DiscoveryConfig::default()),
            watch: WatchConfig::default(),
            poll_timeout: Duration::from_millis(100),
            data_read_timeout: Duration::from_millis(100),
            required_sensors: BTreeSet::from([SensorType::Gyroscope]),
            sensor_speeds: BTreeMap::new(),
            output_ranges: BTreeMap::new(),
            client_maximum: None,
            buttons: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Idle,
    Running,
    Closed,
}

/// Accepts clients and forwards their samples to the data sink
///
/// Listeners and the data sink are handed over on [`DataSource::start`],
/// afterwards the server is controlled through a [`ServerHandle`].
pub struct Server {
    config: ServerConfig,
    state: ServerState,

    sink: Option<Box<dyn DataSink>>,
    listeners: Listeners,

    events: Sender<Dispatch>,
    samples: Sender<SampleEvent>,
    receivers: Option<(Receiver<Dispatch>, Receiver<SampleEvent>)>,
    clients: Arc<Mutex<Vec<DeviceIdentity>>>,

    running: Arc<AtomicBool>,
    responder: Option<DiscoveryResponder>,
    command_addr: Option<SocketAddr>,
    workers: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let (events, events_rx) = channel::unbounded();
        let (samples, samples_rx) = channel::bounded(SAMPLE_QUEUE);

        Self {
            config,
            state: ServerState::Idle,
            sink: None,
            listeners: Listeners::default(),
            events,
            samples,
            receivers: Some((events_rx, samples_rx)),
            clients: Arc::default(),
            running: Arc::new(AtomicBool::new(false)),
            responder: None,
            command_addr: None,
            workers: Vec::new(),
        }
    }

    pub fn set_client_listener(&mut self, listener: impl ClientListener + 'static) {
        self.listeners.client = Box::new(listener);
    }

    pub fn set_button_listener(&mut self, listener: impl ButtonListener + 'static) {
        self.listeners.button = Box::new(listener);
    }

    pub fn set_reset_listener(&mut self, listener: impl ResetListener + 'static) {
        self.listeners.reset = Box::new(listener);
    }

    pub fn set_exception_listener(&mut self, listener: impl ExceptionListener + 'static) {
        self.listeners.exception = Box::new(listener);
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            events: self.events.clone(),
            clients: self.clients.clone(),
        }
    }

    /// Address command connections are accepted on, once started
    pub fn command_addr(&self) -> Option<SocketAddr> {
        self.command_addr
    }

    /// Address the discovery responder listens on, if enabled and started
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.responder.as_ref().and_then(|responder| responder.local_addr())
    }
}

impl DataSource for Server {
    fn set_data_sink(&mut self, sink: Box<dyn DataSink>) {
        if self.state != ServerState::Idle {
            warn!("Data sink can only be set before the server starts");
            return;
        }

        self.sink = Some(sink);
    }

    fn start(&mut self) -> anyhow::Result<()> {
        match self.state {
            ServerState::Idle => {}
            ServerState::Running => bail!("Server already started"),
            ServerState::Closed => bail!("Server is closed"),
        }

        if self.sink.is_none() {
            bail!("Server needs a data sink");
        }

        let bind_addr = SocketAddr::new(self.config.bind_ip, self.config.command_port);
        let mut listener = TcpListener::bind(bind_addr)
            .with_context(|| format!("Bind command port {bind_addr}"))?;
        let command_addr = listener.local_addr().context("Command address")?;

        let poll = Poll::new().context("Create poll")?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .context("Register listener")?;

        let identity =
            DeviceIdentity::with_ports(self.config.name.clone(), command_addr.port(), UNASSIGNED_PORT);

        if let Some(discovery) = &self.config.discovery {
            let mut responder = DiscoveryResponder::new(identity.clone(), discovery.clone());
            responder.start().context("Start discovery responder")?;
            self.responder = Some(responder);
        }

        let head = self.sink.take().context("Server needs a data sink")?;
        let (events_rx, samples_rx) = self.receivers.take().context("Server was started before")?;
        let listeners = std::mem::take(&mut self.listeners);

        self.running.store(true, Ordering::Relaxed);

        let acceptor = {
            let running = self.running.clone();
            let events = self.events.clone();
            let poll_timeout = self.config.poll_timeout;

            thread::Builder::new()
                .name("acceptor".to_owned())
                .spawn(move || {
                    let _span = span!(Level::INFO, "Acceptor", %command_addr).entered();
                    run_acceptor(poll, listener, poll_timeout, &running, &events);
                })
                .context("Spawn acceptor")?
        };
        self.workers.push(acceptor);

        let dispatcher = Dispatcher::new(
            self.config.clone(),
            identity,
            head,
            listeners,
            self.events.clone(),
            self.samples.clone(),
            samples_rx.clone(),
            self.clients.clone(),
        );
        let dispatcher = thread::Builder::new()
            .name("dispatcher".to_owned())
            .spawn(move || {
                let _span = span!(Level::INFO, "Dispatcher").entered();
                dispatcher.run(events_rx, samples_rx);
            })
            .context("Spawn dispatcher")?;
        self.workers.push(dispatcher);

        info!("Accepting clients on {command_addr}");
        self.command_addr = Some(command_addr);
        self.state = ServerState::Running;

        Ok(())
    }

    /// Ends all sessions, closes the pipeline and joins every server thread
    fn close(&mut self) {
        if self.state == ServerState::Closed {
            return;
        }
        self.state = ServerState::Closed;

        self.running.store(false, Ordering::Relaxed);
        let _ = self.events.send(Dispatch::Control(Control::Shutdown));

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Server thread panicked");
            }
        }

        if let Some(responder) = &mut self.responder {
            responder.close();
        }

        // Never started, the sink is still ours
        if let Some(sink) = &mut self.sink {
            sink.close();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        DataSource::close(self);
    }
}

fn run_acceptor(
    mut poll: Poll,
    listener: TcpListener,
    poll_timeout: Duration,
    running: &AtomicBool,
    events: &Sender<Dispatch>,
) {
    let mut poll_events = Events::with_capacity(16);

    while running.load(Ordering::Relaxed) {
        if let Err(err) = poll.poll(&mut poll_events, Some(poll_timeout)) {
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }

            error!("Could not poll, sleeping 300ms: {err}");
            // Slight cool down to avoid a possible error spam
            thread::sleep(Duration::from_millis(300));
            continue;
        }

        for event in &poll_events {
            if event.token() != LISTENER_TOKEN {
                continue;
            }

            // Accept all new connections
            loop {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        debug!("Accepted connection from {addr}");
                        if events.send(Dispatch::Accepted(stream)).is_err() {
                            return;
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) => {
                        warn!("Could not accept connection: {err}");
                        break;
                    }
                }
            }
        }
    }
}

/// Controls a running [`Server`] from any thread
#[derive(Clone)]
pub struct ServerHandle {
    events: Sender<Dispatch>,
    clients: Arc<Mutex<Vec<DeviceIdentity>>>,
}

impl ServerHandle {
    /// Replaces the sensors all current and future clients have to stream
    pub fn set_required_sensors(
        &self,
        required: impl IntoIterator<Item = SensorType>,
    ) -> Result<(), MessageError> {
        self.control(Control::SetRequiredSensors(required.into_iter().collect()))
    }

    /// Asks all current and future clients to sample `sensor_type` at `speed`
    pub fn set_sensor_speed(&self, sensor_type: SensorType, speed: SensorSpeed) -> Result<(), MessageError> {
        self.control(Control::SetSensorSpeed(sensor_type, speed))
    }

    /// Scales samples of `sensor_type` from the range each client reported onto `range`
    pub fn set_output_range(&self, sensor_type: SensorType, range: f32) -> Result<(), MessageError> {
        self.control(Control::SetOutputRange(sensor_type, range))
    }

    /// Connected clients stay, only new connection requests are rejected
    pub fn set_client_maximum(&self, maximum: Option<usize>) -> Result<(), MessageError> {
        self.control(Control::SetClientMaximum(maximum))
    }

    pub fn update_buttons_map(&self, mapping: BTreeMap<i32, String>) -> Result<(), MessageError> {
        self.control(Control::UpdateButtonsMap(mapping))
    }

    pub fn update_button_layout(&self, definition: impl Into<String>) -> Result<(), MessageError> {
        self.control(Control::UpdateButtonLayout(definition.into()))
    }

    pub fn display_notification(
        &self,
        id: i32,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<(), MessageError> {
        self.control(Control::DisplayNotification {
            id,
            title: title.into(),
            content: content.into(),
        })
    }

    /// Ends the session of `client`, the client is told with an end of connection
    pub fn close_client(&self, client: &DeviceIdentity) -> Result<(), MessageError> {
        self.control(Control::CloseClient(client.clone()))
    }

    /// Clients that completed the handshake and are still connected
    pub fn connected_clients(&self) -> Vec<DeviceIdentity> {
        match self.clients.lock() {
            Ok(clients) => clients.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn control(&self, control: Control) -> Result<(), MessageError> {
        self.events
            .send(Dispatch::Control(control))
            .map_err(|_| MessageError)
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, net::TcpStream, time::Instant};

    use common::{codec, protocol::Command, types::SensorSample};
    use networking::{
        client::{ClientConfig, ClientEvent, ClientSession},
        command::{ChannelEvent, CommandChannel},
        NetError,
    };

    use super::*;
    use crate::pipeline::tests::RecordingSink;

    /// Records every callback as a line of text
    #[derive(Clone)]
    struct EventLog {
        lines: Arc<Mutex<Vec<String>>>,
        accept: bool,
    }

    impl EventLog {
        fn new(accept: bool) -> Self {
            Self {
                lines: Arc::default(),
                accept,
            }
        }

        fn push(&self, line: String) {
            self.lines.lock().unwrap().push(line);
        }

        fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }

        fn wait_for(&self, line: &str) {
            wait_until(|| self.lines().iter().any(|seen| seen == line));
        }
    }

    impl ClientListener for EventLog {
        fn accept_client(&mut self, client: &DeviceIdentity) -> bool {
            self.push(format!("request {}", client.name));
            self.accept
        }

        fn on_client_accepted(&mut self, client: &DeviceIdentity) {
            self.push(format!("accepted {client}"));
        }

        fn on_client_disconnected(&mut self, client: &DeviceIdentity) {
            self.push(format!("disconnected {}", client.name));
        }

        fn on_client_timeout(&mut self, client: &DeviceIdentity) {
            self.push(format!("timeout {}", client.name));
        }
    }

    impl ButtonListener for EventLog {
        fn on_button_click(&mut self, origin: &DeviceIdentity, id: i32, is_hold: bool) {
            self.push(format!("button {} {id} {is_hold}", origin.name));
        }
    }

    impl ResetListener for EventLog {
        fn on_reset_position(&mut self, origin: &DeviceIdentity) {
            self.push(format!("reset {}", origin.name));
        }
    }

    impl ExceptionListener for EventLog {
        fn on_exception(&mut self, _: Option<&DeviceIdentity>, _: &NetError, info: &str) {
            self.push(format!("exception {info}"));
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "Condition not met in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            name: "server1".to_owned(),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            discovery: None,
            poll_timeout: Duration::from_millis(20),
            data_read_timeout: Duration::from_millis(20),
            ..Default::default()
        }
    }

    /// Alive checks are rare enough to never fire during a test
    fn patient_config() -> ServerConfig {
        ServerConfig {
            watch: WatchConfig {
                interval: Duration::from_secs(30),
                deadline: Duration::from_secs(30),
            },
            ..test_config()
        }
    }

    fn start_server(config: ServerConfig, log: &EventLog, sink: &RecordingSink) -> Server {
        let mut server = Server::new(config);
        server.set_client_listener(log.clone());
        server.set_button_listener(log.clone());
        server.set_reset_listener(log.clone());
        server.set_exception_listener(log.clone());
        server.set_data_sink(sink.boxed());
        server.start().unwrap();

        server
    }

    fn server_identity(server: &Server) -> DeviceIdentity {
        let port = server.command_addr().unwrap().port();

        DeviceIdentity::with_ports("server1", port, UNASSIGNED_PORT)
            .observed_at(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    fn frame(command: &Command) -> Vec<u8> {
        let mut buffer = Vec::new();
        codec::write_frame(command, &mut buffer).unwrap();
        buffer
    }

    /// Sends a connection request over a plain socket, nothing answers alive checks
    fn raw_client(server: &Server, name: &str) -> TcpStream {
        let mut stream = TcpStream::connect(server.command_addr().unwrap()).unwrap();
        stream
            .write_all(&frame(&Command::ConnectionRequest {
                identity: DeviceIdentity::new(name),
            }))
            .unwrap();

        stream
    }

    fn next_command(client: &ClientSession) -> Command {
        match client.events().recv_timeout(Duration::from_secs(2)).unwrap() {
            ClientEvent::Command(command) => command,
            other => panic!("Expected a command, got {other:?}"),
        }
    }

    #[test]
    fn full_session() {
        let log = EventLog::new(true);
        let sink = RecordingSink::default();
        let mut server = start_server(test_config(), &log, &sink);
        let handle = server.handle();

        let mut client =
            ClientSession::connect(&server_identity(&server), "phone1", &ClientConfig::default())
                .unwrap();
        log.wait_for("accepted phone1@127.0.0.1");
        assert_ne!(client.server().data_port, UNASSIGNED_PORT);
        assert_eq!(
            next_command(&client),
            Command::SetSensorList {
                required: BTreeSet::from([SensorType::Gyroscope]),
            }
        );
        assert_eq!(handle.connected_clients().len(), 1);

        // Default sensitivity
        let sample = SensorSample::new(SensorType::Gyroscope, vec![1.0, 2.0, 3.0], 5);
        client.send_sample(&sample).unwrap();
        wait_until(|| sink.count() == 1);

        client.change_sensitivity(SensorType::Gyroscope, 80).unwrap();
        client.button_click(4, true).unwrap();
        log.wait_for("button phone1 4 true");
        client.send_sample(&sample).unwrap();
        wait_until(|| sink.count() == 2);

        {
            let recording = sink.0.lock().unwrap();
            assert_eq!(recording.samples[0].0.address, "127.0.0.1");
            assert_eq!(recording.samples[0].1, sample);
            assert_eq!(recording.samples[0].2, 50.0);
            assert_eq!(recording.samples[1].2, 80.0);
        }

        client.reset_to_center().unwrap();
        log.wait_for("reset phone1");

        handle.display_notification(1, "title", "content").unwrap();
        assert_eq!(
            next_command(&client),
            Command::DisplayNotification {
                id: 1,
                title: "title".to_owned(),
                content: "content".to_owned(),
            }
        );

        client.close();
        log.wait_for("disconnected phone1");
        assert!(handle.connected_clients().is_empty());

        server.close();
        assert_eq!(sink.closed(), 1);

        // Exactly one terminal notification
        let terminal = log
            .lines()
            .iter()
            .filter(|line| line.starts_with("disconnected") || line.starts_with("timeout"))
            .count();
        assert_eq!(terminal, 1);
    }

    #[test]
    fn rejected_client() {
        let log = EventLog::new(false);
        let sink = RecordingSink::default();
        let mut server = start_server(test_config(), &log, &sink);

        let result = ClientSession::connect(&server_identity(&server), "phone1", &ClientConfig::default());

        assert!(matches!(result, Err(NetError::Rejected)));
        assert_eq!(log.lines(), vec!["request phone1".to_owned()]);

        server.close();
    }

    #[test]
    fn silent_client_times_out() {
        let log = EventLog::new(true);
        let sink = RecordingSink::default();
        let config = ServerConfig {
            watch: WatchConfig {
                interval: Duration::from_millis(100),
                deadline: Duration::from_millis(100),
            },
            ..test_config()
        };
        let mut server = start_server(config, &log, &sink);

        // Completes the handshake but never answers alive checks
        let (seen_tx, seen) = channel::unbounded();
        let mut mute = CommandChannel::connect(
            server.command_addr().unwrap(),
            Duration::from_secs(1),
            move |event, _| {
                let _ = seen_tx.send(event);
            },
        )
        .unwrap();
        mute.send(Command::ConnectionRequest {
            identity: DeviceIdentity::new("mute"),
        })
        .unwrap();

        log.wait_for("timeout mute");
        assert!(!log.lines().iter().any(|line| line.starts_with("disconnected")));

        // The server says goodbye before closing
        let mut ended = false;
        while let Ok(event) = seen.recv_timeout(Duration::from_secs(2)) {
            match event {
                ChannelEvent::Command(Command::EndConnection) => ended = true,
                ChannelEvent::Closed(_) => break,
                _ => {}
            }
        }
        assert!(ended);

        mute.close();
        server.close();
    }

    #[test]
    fn host_closes_client() {
        let log = EventLog::new(true);
        let sink = RecordingSink::default();
        let mut server = start_server(test_config(), &log, &sink);
        let handle = server.handle();

        let client =
            ClientSession::connect(&server_identity(&server), "phone1", &ClientConfig::default())
                .unwrap();
        log.wait_for("accepted phone1@127.0.0.1");

        handle.close_client(&handle.connected_clients()[0]).unwrap();
        log.wait_for("disconnected phone1");

        // The client sees the end of connection and then the closed socket
        let mut ended = false;
        while let Ok(event) = client.events().recv_timeout(Duration::from_secs(2)) {
            match event {
                ClientEvent::Command(Command::EndConnection) => ended = true,
                ClientEvent::Disconnected(_) => break,
                ClientEvent::Command(_) => {}
            }
        }
        assert!(ended);

        drop(client);
        server.close();
    }

    #[test]
    fn command_before_handshake_is_a_protocol_fault() {
        let log = EventLog::new(true);
        let sink = RecordingSink::default();
        let mut server = start_server(test_config(), &log, &sink);

        let mut early = CommandChannel::connect(
            server.command_addr().unwrap(),
            Duration::from_secs(1),
            |_, _| {},
        )
        .unwrap();
        early.send(Command::ResetToCenter).unwrap();

        log.wait_for("exception Protocol violation");
        assert!(!log.lines().iter().any(|line| line.starts_with("reset")));

        early.close();
        server.close();
    }

    #[test]
    fn malformed_command_keeps_session() {
        let log = EventLog::new(true);
        let sink = RecordingSink::default();
        let mut server = start_server(patient_config(), &log, &sink);
        let handle = server.handle();

        let mut raw = raw_client(&server, "raw");
        log.wait_for("accepted raw@127.0.0.1");

        // Length of 3 followed by an unknown variant
        raw.write_all(&[3, 0, 0, 0, 0xff, 0xff, 0xff]).unwrap();
        log.wait_for("exception Malformed command");

        raw.write_all(&frame(&Command::ButtonClick { id: 2, is_hold: false }))
            .unwrap();
        log.wait_for("button raw 2 false");

        assert_eq!(handle.connected_clients().len(), 1);
        assert!(!log.lines().iter().any(|line| line.starts_with("disconnected")));

        drop(raw);
        log.wait_for("disconnected raw");
        server.close();
    }

    #[test]
    fn transport_fault_ends_only_its_session() {
        let log = EventLog::new(true);
        let sink = RecordingSink::default();
        let mut server = start_server(patient_config(), &log, &sink);
        let handle = server.handle();

        let healthy =
            ClientSession::connect(&server_identity(&server), "phone1", &ClientConfig::default())
                .unwrap();
        log.wait_for("accepted phone1@127.0.0.1");
        let mut raw = raw_client(&server, "raw");
        log.wait_for("accepted raw@127.0.0.1");

        // A header announcing more than a frame may hold breaks the framing
        raw.write_all(&u32::MAX.to_le_bytes()).unwrap();
        log.wait_for("disconnected raw");

        let lines = log.lines();
        let exceptions: Vec<_> = lines
            .iter()
            .filter(|line| line.starts_with("exception"))
            .cloned()
            .collect();
        assert_eq!(exceptions, vec!["exception Command channel".to_owned()]);
        let position = |wanted: &str| lines.iter().position(|line| line == wanted).unwrap();
        assert!(position("exception Command channel") < position("disconnected raw"));

        let names: Vec<_> = handle
            .connected_clients()
            .into_iter()
            .map(|client| client.name)
            .collect();
        assert_eq!(names, vec!["phone1".to_owned()]);

        healthy.button_click(3, false).unwrap();
        log.wait_for("button phone1 3 false");
        healthy
            .send_sample(&SensorSample::new(SensorType::Gyroscope, vec![1.0], 0))
            .unwrap();
        wait_until(|| sink.count() == 1);
        assert!(!log.lines().iter().any(|line| line == "disconnected phone1"));

        drop(raw);
        drop(healthy);
        server.close();
    }

    #[test]
    fn client_maximum_rejects_without_asking() {
        let log = EventLog::new(true);
        let sink = RecordingSink::default();
        let config = ServerConfig {
            client_maximum: Some(1),
            ..test_config()
        };
        let mut server = start_server(config, &log, &sink);
        let handle = server.handle();

        let first =
            ClientSession::connect(&server_identity(&server), "phone1", &ClientConfig::default())
                .unwrap();
        log.wait_for("accepted phone1@127.0.0.1");

        let second =
            ClientSession::connect(&server_identity(&server), "phone2", &ClientConfig::default());
        assert!(matches!(second, Err(NetError::Rejected)));
        assert!(!log.lines().iter().any(|line| line == "request phone2"));

        handle.set_client_maximum(None).unwrap();
        let third =
            ClientSession::connect(&server_identity(&server), "phone3", &ClientConfig::default())
                .unwrap();
        log.wait_for("accepted phone3@127.0.0.1");
        assert_eq!(handle.connected_clients().len(), 2);

        drop(first);
        drop(third);
        server.close();
    }

    #[test]
    fn sensor_speeds_reach_clients() {
        let log = EventLog::new(true);
        let sink = RecordingSink::default();
        let config = ServerConfig {
            sensor_speeds: BTreeMap::from([(SensorType::Gyroscope, SensorSpeed::Game)]),
            ..test_config()
        };
        let mut server = start_server(config, &log, &sink);
        let handle = server.handle();

        let client =
            ClientSession::connect(&server_identity(&server), "phone1", &ClientConfig::default())
                .unwrap();
        assert_eq!(
            next_command(&client),
            Command::SetSensorList {
                required: BTreeSet::from([SensorType::Gyroscope]),
            }
        );
        assert_eq!(
            next_command(&client),
            Command::SetSensorSpeed {
                sensor_type: SensorType::Gyroscope,
                speed: SensorSpeed::Game,
            }
        );

        handle
            .set_sensor_speed(SensorType::Accelerometer, SensorSpeed::Fastest)
            .unwrap();
        assert_eq!(
            next_command(&client),
            Command::SetSensorSpeed {
                sensor_type: SensorType::Accelerometer,
                speed: SensorSpeed::Fastest,
            }
        );

        drop(client);
        server.close();
    }

    #[test]
    fn reported_range_scales_samples() {
        let log = EventLog::new(true);
        let sink = RecordingSink::default();
        let config = ServerConfig {
            output_ranges: BTreeMap::from([(SensorType::Gyroscope, 1.0)]),
            ..test_config()
        };
        let mut server = start_server(config, &log, &sink);

        let client =
            ClientSession::connect(&server_identity(&server), "phone1", &ClientConfig::default())
                .unwrap();
        client.notify_range(SensorType::Gyroscope, 10.0).unwrap();
        // Commands are handled in order, the click proves the range arrived
        client.button_click(0, false).unwrap();
        log.wait_for("button phone1 0 false");

        client
            .send_sample(&SensorSample::new(SensorType::Gyroscope, vec![5.0, 20.0, -1.0], 0))
            .unwrap();
        wait_until(|| sink.count() == 1);
        // No output range, left alone
        client
            .send_sample(&SensorSample::new(SensorType::Accelerometer, vec![5.0], 0))
            .unwrap();
        wait_until(|| sink.count() == 2);

        assert_eq!(sink.values(), vec![vec![0.5, 1.0, -0.1], vec![5.0]]);

        drop(client);
        server.close();
    }

    #[test]
    fn start_needs_a_sink() {
        let mut server = Server::new(test_config());

        assert!(server.start().is_err());
    }
}
