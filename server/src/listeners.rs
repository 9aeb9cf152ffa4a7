//! Capabilities the application plugs into the server
//!
//! All callbacks run on the server's dispatcher thread, one at a time.

use common::identity::DeviceIdentity;
use networking::NetError;
use tracing::{info, warn};

/// Decides about and follows the lifecycle of client sessions
pub trait ClientListener: Send {
    /// Returns false to reject the client, the connection is closed without an answer
    fn accept_client(&mut self, client: &DeviceIdentity) -> bool;

    fn on_client_accepted(&mut self, client: &DeviceIdentity);

    /// The client left, closed the connection or the connection failed
    fn on_client_disconnected(&mut self, client: &DeviceIdentity);

    /// The client stopped answering alive checks
    fn on_client_timeout(&mut self, client: &DeviceIdentity);
}

pub trait ButtonListener: Send {
    fn on_button_click(&mut self, origin: &DeviceIdentity, id: i32, is_hold: bool);
}

pub trait ResetListener: Send {
    fn on_reset_position(&mut self, origin: &DeviceIdentity);
}

pub trait ExceptionListener: Send {
    /// `origin` is `None` for faults of connections that have not completed the handshake
    fn on_exception(&mut self, origin: Option<&DeviceIdentity>, error: &NetError, info: &str);
}

/// Accepts every client and logs everything else
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl ClientListener for LoggingListener {
    fn accept_client(&mut self, client: &DeviceIdentity) -> bool {
        info!("Accepting {client}");
        true
    }

    fn on_client_accepted(&mut self, client: &DeviceIdentity) {
        info!("{client} connected");
    }

    fn on_client_disconnected(&mut self, client: &DeviceIdentity) {
        info!("{client} disconnected");
    }

    fn on_client_timeout(&mut self, client: &DeviceIdentity) {
        warn!("{client} timed out");
    }
}

impl ButtonListener for LoggingListener {
    fn on_button_click(&mut self, origin: &DeviceIdentity, id: i32, is_hold: bool) {
        info!("{origin} clicked button {id} (hold: {is_hold})");
    }
}

impl ResetListener for LoggingListener {
    fn on_reset_position(&mut self, origin: &DeviceIdentity) {
        info!("{origin} requested a reset");
    }
}

impl ExceptionListener for LoggingListener {
    fn on_exception(&mut self, origin: Option<&DeviceIdentity>, error: &NetError, info: &str) {
        match origin {
            Some(origin) => warn!("{info} ({origin}): {error}"),
            None => warn!("{info}: {error}"),
        }
    }
}

/// The set of listeners owned by the dispatcher
pub struct Listeners {
    pub client: Box<dyn ClientListener>,
    pub button: Box<dyn ButtonListener>,
    pub reset: Box<dyn ResetListener>,
    pub exception: Box<dyn ExceptionListener>,
}

impl Default for Listeners {
    fn default() -> Self {
        Self {
            client: Box::new(LoggingListener),
            button: Box::new(LoggingListener),
            reset: Box::new(LoggingListener),
            exception: Box::new(LoggingListener),
        }
    }
}
