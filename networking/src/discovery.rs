//! Broadcast discovery of devices on the local network
//!
//! A [`DiscoveryAnnouncer`] periodically broadcasts its identity, every
//! [`DiscoveryResponder`] that hears it answers with its own identity.

use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use common::{
    codec::{self, MAX_DATAGRAM_SIZE},
    identity::{DeviceIdentity, UNASSIGNED_PORT},
};
use fxhash::FxHashMap as HashMap;
use tracing::{debug, error, info, span, trace, warn, Level};

use crate::{NetError, NetResult};

pub const DISCOVERY_PORT: u16 = 8888;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Port responders listen on and announcers send to
    pub port: u16,
    /// Time between two announcements
    pub interval: Duration,
    /// Upper bound for one blocking read, used to notice `close`
    pub read_timeout: Duration,
    /// Where announcements are sent to
    pub broadcast_target: IpAddr,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DISCOVERY_PORT,
            interval: Duration::from_secs(4),
            read_timeout: Duration::from_millis(100),
            broadcast_target: IpAddr::V4(Ipv4Addr::BROADCAST),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Running,
    Closed,
}

/// Start/close bookkeeping shared by both discovery roles
struct Lifecycle {
    state: DiscoveryState,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: DiscoveryState::Idle,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            local_addr: None,
        }
    }

    fn check_startable(&self) -> NetResult<()> {
        match self.state {
            DiscoveryState::Idle => Ok(()),
            DiscoveryState::Running => Err(NetError::AlreadyStarted),
            DiscoveryState::Closed => Err(NetError::Closed),
        }
    }

    fn started(&mut self, worker: JoinHandle<()>, local_addr: SocketAddr) {
        self.state = DiscoveryState::Running;
        self.worker = Some(worker);
        self.local_addr = Some(local_addr);
    }

    fn close(&mut self) {
        self.state = DiscoveryState::Closed;
        self.running.store(false, Ordering::Relaxed);

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Discovery worker panicked");
            }
        }
    }
}

fn bind_broadcast(port: u16, read_timeout: Duration) -> NetResult<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
        .map_err(|err| NetError::from(err).chain(format!("Bind discovery port {port}")))?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(read_timeout))?;

    Ok(socket)
}

/// Pause after a failed receive so a persistent error does not spin the loop
const ERROR_COOL_DOWN: Duration = Duration::from_millis(300);

fn is_timeout(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

/// How long to wait before the next receive, `None` for plain read timeouts
fn receive_retry_delay(kind: ErrorKind) -> Option<Duration> {
    (!is_timeout(kind)).then_some(ERROR_COOL_DOWN)
}

/// Answers announcements with the own identity
pub struct DiscoveryResponder {
    identity: DeviceIdentity,
    config: DiscoveryConfig,
    lifecycle: Lifecycle,
}

impl DiscoveryResponder {
    pub fn new(identity: DeviceIdentity, config: DiscoveryConfig) -> Self {
        Self {
            identity,
            config,
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn start(&mut self) -> NetResult<()> {
        self.lifecycle.check_startable()?;

        let socket = bind_broadcast(self.config.port, self.config.read_timeout)?;
        let local_addr = socket.local_addr()?;

        let mut identity = self.identity.clone();
        identity.discovery_port = local_addr.port();
        let answer = codec::encode_identity(&identity)
            .map_err(|err| NetError::ParsingError(err.into()).chain("Encode own identity".to_owned()))?;

        let running = self.lifecycle.running.clone();
        running.store(true, Ordering::Relaxed);

        let worker = thread::Builder::new()
            .name("discovery responder".to_owned())
            .spawn(move || {
                let _span = span!(Level::INFO, "Discovery responder", %local_addr).entered();
                info!("Answering discovery requests as {identity}");

                let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
                while running.load(Ordering::Relaxed) {
                    let (len, source) = match socket.recv_from(&mut buffer) {
                        Ok(received) => received,
                        Err(err) => {
                            if let Some(delay) = receive_retry_delay(err.kind()) {
                                warn!("Discovery receive failed, sleeping {delay:?}: {err}");
                                thread::sleep(delay);
                            }
                            continue;
                        }
                    };

                    let announced = match codec::decode_identity(&buffer[..len]) {
                        Ok(announced) => announced.observed_at(source.ip()),
                        Err(err) => {
                            trace!("Discarding discovery datagram from {source}: {err:?}");
                            continue;
                        }
                    };

                    let reply_port = match announced.discovery_port {
                        UNASSIGNED_PORT => source.port(),
                        port => port,
                    };
                    let reply_to = SocketAddr::new(source.ip(), reply_port);

                    debug!("Announcement from {announced}, answering at {reply_to}");
                    if let Err(err) = socket.send_to(&answer, reply_to) {
                        warn!("Could not answer {announced}: {err}");
                    }
                }
            })?;

        self.lifecycle.started(worker, local_addr);

        Ok(())
    }

    pub fn state(&self) -> DiscoveryState {
        self.lifecycle.state
    }

    /// Address the responder is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr
    }

    pub fn close(&mut self) {
        self.lifecycle.close();
    }
}

impl Drop for DiscoveryResponder {
    fn drop(&mut self) {
        self.close();
    }
}

/// Devices seen during one discovery run, in order of first sight
#[derive(Debug, Default)]
pub struct KnownDevices {
    order: Vec<DeviceIdentity>,
    last_seen: HashMap<DeviceIdentity, Instant>,
}

impl KnownDevices {
    /// Returns true if the device was not known before
    pub fn observe(&mut self, identity: DeviceIdentity, now: Instant) -> bool {
        if let Some(seen) = self.last_seen.get_mut(&identity) {
            *seen = now;
            return false;
        }

        self.last_seen.insert(identity.clone(), now);
        self.order.push(identity);

        true
    }

    pub fn devices(&self) -> &[DeviceIdentity] {
        &self.order
    }

    pub fn last_seen(&self, identity: &DeviceIdentity) -> Option<Instant> {
        self.last_seen.get(identity).copied()
    }
}

/// Broadcasts the own identity and collects the answering devices
pub struct DiscoveryAnnouncer {
    identity: DeviceIdentity,
    config: DiscoveryConfig,
    lifecycle: Lifecycle,
    known: Arc<Mutex<KnownDevices>>,
}

impl DiscoveryAnnouncer {
    pub fn new(identity: DeviceIdentity, config: DiscoveryConfig) -> Self {
        Self {
            identity,
            config,
            lifecycle: Lifecycle::new(),
            known: Arc::default(),
        }
    }

    /// `listener` receives the full device list every time a new device shows up
    pub fn start(
        &mut self,
        mut listener: impl FnMut(&[DeviceIdentity]) + Send + 'static,
    ) -> NetResult<()> {
        self.lifecycle.check_startable()?;

        let socket = bind_broadcast(0, self.config.read_timeout)?;
        let local_addr = socket.local_addr()?;

        let mut identity = self.identity.clone();
        identity.discovery_port = local_addr.port();
        let announcement = codec::encode_identity(&identity)
            .map_err(|err| NetError::ParsingError(err.into()).chain("Encode own identity".to_owned()))?;

        let target = SocketAddr::new(self.config.broadcast_target, self.config.port);
        let interval = self.config.interval;
        let known = self.known.clone();
        let running = self.lifecycle.running.clone();
        running.store(true, Ordering::Relaxed);

        let worker = thread::Builder::new()
            .name("discovery announcer".to_owned())
            .spawn(move || {
                let _span = span!(Level::INFO, "Discovery announcer", %local_addr).entered();
                info!("Announcing {identity} to {target}");

                let mut next_announcement = Instant::now();
                let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
                while running.load(Ordering::Relaxed) {
                    if Instant::now() >= next_announcement {
                        if let Err(err) = socket.send_to(&announcement, target) {
                            warn!("Could not announce to {target}: {err}");
                        }
                        next_announcement = Instant::now() + interval;
                    }

                    match socket.recv_from(&mut buffer) {
                        Ok((len, source)) => {
                            handle_answer(&known, &buffer[..len], source, &mut listener);
                        }
                        Err(err) => {
                            if let Some(delay) = receive_retry_delay(err.kind()) {
                                warn!("Discovery receive failed, sleeping {delay:?}: {err}");
                                thread::sleep(delay);
                            }
                        }
                    }
                }
            })?;

        self.lifecycle.started(worker, local_addr);

        Ok(())
    }

    pub fn state(&self) -> DiscoveryState {
        self.lifecycle.state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr
    }

    /// Snapshot of the devices found so far
    pub fn known_devices(&self) -> Vec<DeviceIdentity> {
        match self.known.lock() {
            Ok(known) => known.devices().to_vec(),
            Err(poisoned) => poisoned.into_inner().devices().to_vec(),
        }
    }

    pub fn close(&mut self) {
        self.lifecycle.close();
    }
}

impl Drop for DiscoveryAnnouncer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Records one answer datagram, notifies `listener` only when the device list grew
fn handle_answer(
    known: &Mutex<KnownDevices>,
    bytes: &[u8],
    source: SocketAddr,
    listener: &mut impl FnMut(&[DeviceIdentity]),
) {
    let identity = match codec::decode_identity(bytes) {
        Ok(identity) => identity.observed_at(source.ip()),
        Err(err) => {
            trace!("Discarding discovery answer from {source}: {err:?}");
            return;
        }
    };

    let devices = {
        let mut known = match known.lock() {
            Ok(known) => known,
            Err(poisoned) => poisoned.into_inner(),
        };

        if !known.observe(identity.clone(), Instant::now()) {
            return;
        }

        known.devices().to_vec()
    };

    info!("Discovered {identity}");
    (listener)(&devices);
}
