//! Transports of the sensor link: discovery, command channels and data channels

pub mod client;
pub mod command;
pub mod data;
pub mod discovery;
mod peer;
pub mod watch;

use std::{io, sync::Arc};

use common::identity::ResolveError;
use crossbeam::channel::Sender;
use mio::Waker;
use thiserror::Error;

pub type NetResult<T> = Result<T, NetError>;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("Peer closed socket")]
    PeerClosed,
    #[error("Tried to write packet with len {0} which does not fit")]
    OversizedPacket(usize),
    #[error("Messenging Error: {0}")]
    Message(#[from] MessageError),
    #[error("Could not parse packet: {0}")]
    ParsingError(anyhow::Error),
    #[error("Service was already started")]
    AlreadyStarted,
    #[error("Service is closed")]
    Closed,
    #[error("Connection was rejected by the peer")]
    Rejected,
    #[error("Peer did not answer in time")]
    Timeout,
    #[error("Could not resolve peer: {0}")]
    Unresolvable(#[from] ResolveError),
    #[error("Error {0}: Caused by: ({1})")]
    Chain(String, #[source] Box<NetError>),
}

impl NetError {
    pub fn chain(self, message: String) -> Self {
        NetError::Chain(message, Box::new(self))
    }

    /// Strips all context layers
    pub fn root(&self) -> &NetError {
        match self {
            NetError::Chain(_, inner) => inner.root(),
            other => other,
        }
    }
}

#[derive(Error, Debug, Default)]
#[error("Failed to send message to worker")]
pub struct MessageError;

/// Queues messages for a mio worker and wakes it up
#[derive(Debug)]
pub struct Messenger<M> {
    waker: Arc<Waker>,
    sender: Sender<M>,
}

impl<M> Clone for Messenger<M> {
    fn clone(&self) -> Self {
        Self {
            waker: self.waker.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<M> Messenger<M> {
    pub(crate) fn new(waker: Arc<Waker>, sender: Sender<M>) -> Self {
        Self { waker, sender }
    }

    pub(crate) fn send_message(&self, message: M) -> Result<(), MessageError> {
        self.sender.send(message).map_err(|_| MessageError)?;
        self.waker.wake().map_err(|_| MessageError)
    }
}
