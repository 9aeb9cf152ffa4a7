//! Connecting side of a session

use std::time::Duration;

use common::{
    identity::DeviceIdentity,
    protocol::Command,
    types::{SensorSample, SensorType},
};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, TrySendError};
use tracing::{debug, info, warn};

use crate::{
    command::{ChannelEvent, CloseReason, CommandChannel},
    data::DataSender,
    NetError, NetResult,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    /// Time the server has to accept or reject the connection request
    pub handshake_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Commands of the server the client has to act upon
#[derive(Debug)]
pub enum ClientEvent {
    Command(Command),
    Disconnected(CloseReason),
}

/// An accepted session with a server
pub struct ClientSession {
    identity: DeviceIdentity,
    server: DeviceIdentity,
    channel: CommandChannel,
    data: DataSender,
    events: Receiver<ClientEvent>,
}

impl ClientSession {
    /// Connects to `server` and performs the handshake
    ///
    /// Alive checks are answered automatically, all other commands end up in [`Self::events`].
    pub fn connect(server: &DeviceIdentity, name: &str, config: &ClientConfig) -> NetResult<Self> {
        let addr = server.command_addr()?;
        let identity = DeviceIdentity::new(name);

        let (accept_tx, accept_rx) = channel::bounded(1);
        let (event_tx, event_rx) = channel::bounded(256);

        let mut accepted = false;
        let answerer = identity.clone();
        let mut channel = CommandChannel::connect(addr, config.connect_timeout, move |event, messenger| {
            match event {
                ChannelEvent::Command(Command::ConnectionAccepted { session }) if !accepted => {
                    accepted = true;
                    let _ = accept_tx.try_send(Ok(session));
                }
                ChannelEvent::Command(command) => {
                    if let Some(answer) = command.answer_alive_check(&answerer) {
                        if let Err(err) = messenger.send_command(answer) {
                            warn!("Could not answer alive check: {err}");
                        }
                        return;
                    }

                    match event_tx.try_send(ClientEvent::Command(command)) {
                        Err(TrySendError::Full(_)) => warn!("Client event queue full, command dropped"),
                        Err(TrySendError::Disconnected(_)) | Ok(()) => {}
                    }
                }
                ChannelEvent::Malformed(err) => {
                    warn!("Server sent a malformed command: {err}");
                }
                ChannelEvent::Closed(reason) if !accepted => {
                    let _ = accept_tx.try_send(Err(reason));
                }
                ChannelEvent::Closed(reason) => {
                    let _ = event_tx.send(ClientEvent::Disconnected(reason));
                }
            }
        })?;

        channel.send(Command::ConnectionRequest {
            identity: identity.clone(),
        })?;

        let session = match accept_rx.recv_timeout(config.handshake_timeout) {
            Ok(Ok(session)) => session,
            Ok(Err(CloseReason::Remote)) => return Err(NetError::Rejected),
            Ok(Err(CloseReason::Local)) => return Err(NetError::Closed),
            Ok(Err(CloseReason::Fault(err))) => return Err(err.chain("Handshake".to_owned())),
            Err(RecvTimeoutError::Timeout) => {
                channel.close();
                return Err(NetError::Timeout);
            }
            Err(RecvTimeoutError::Disconnected) => return Err(NetError::Closed),
        };

        // The server does not know its own address, use the one we reached it at
        let server = session.observed_at(addr.ip());
        let data = DataSender::new(server.data_addr()?)?;
        info!("Connected to {server}, streaming to {}", data.target());

        Ok(ClientSession {
            identity,
            server,
            channel,
            data,
            events: event_rx,
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// The server identity with the ports of this session
    pub fn server(&self) -> &DeviceIdentity {
        &self.server
    }

    pub fn events(&self) -> &Receiver<ClientEvent> {
        &self.events
    }

    pub fn send_sample(&self, sample: &SensorSample) -> NetResult<()> {
        self.data.send(sample)
    }

    pub fn button_click(&self, id: i32, is_hold: bool) -> NetResult<()> {
        self.channel.send(Command::ButtonClick { id, is_hold })
    }

    pub fn reset_to_center(&self) -> NetResult<()> {
        self.channel.send(Command::ResetToCenter)
    }

    pub fn change_sensitivity(&self, sensor_type: SensorType, value: u8) -> NetResult<()> {
        self.channel
            .send(Command::ChangeSensorSensitivity { sensor_type, value })
    }

    pub fn notify_range(&self, sensor_type: SensorType, range: f32) -> NetResult<()> {
        self.channel
            .send(Command::SensorRangeNotification { sensor_type, range })
    }

    /// Says goodbye to the server and closes the connection
    pub fn close(&mut self) {
        if self.channel.is_closed() {
            self.channel.close();
            return;
        }

        if let Err(err) = self.channel.send(Command::EndConnection) {
            debug!("Could not send end of connection: {err}");
        }
        self.channel.close();
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close();
    }
}
