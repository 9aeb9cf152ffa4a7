//! Reliable, ordered command connection with one worker thread per channel

use std::{
    io::ErrorKind,
    net::{SocketAddr, TcpStream as StdTcpStream},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use common::protocol::Command;
use crossbeam::channel::{self, Receiver};
use mio::{net::TcpStream, Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, span, trace, warn, Level};

use crate::{peer::Peer, Messenger, NetError, NetResult};

const STREAM_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Upper bound for one poll, the worker re-checks its queue at least this often
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub enum ChannelMessage {
    Command(Command),
    Close,
}

pub type CommandMessenger = Messenger<ChannelMessage>;

impl CommandMessenger {
    pub fn send_command(&self, command: Command) -> NetResult<()> {
        Ok(self.send_message(ChannelMessage::Command(command))?)
    }

    /// Asks the worker to flush and shut down, does not wait for it
    pub fn close(&self) -> NetResult<()> {
        Ok(self.send_message(ChannelMessage::Close)?)
    }
}

#[derive(Debug)]
pub enum ChannelEvent {
    Command(Command),
    /// A complete frame could not be decoded, the channel stays open
    Malformed(NetError),
    /// Always the last event of a channel
    Closed(CloseReason),
}

#[derive(Debug)]
pub enum CloseReason {
    /// `close` was called on this side
    Local,
    /// The peer closed the connection
    Remote,
    Fault(NetError),
}

/// Handle to a worker thread owning one TCP connection
pub struct CommandChannel {
    messenger: CommandMessenger,
    peer_addr: SocketAddr,
    worker: Option<JoinHandle<()>>,
}

impl CommandChannel {
    /// Connects to `addr` and spawns the worker
    pub fn connect(
        addr: SocketAddr,
        timeout: Duration,
        handler: impl FnMut(ChannelEvent, &CommandMessenger) + Send + 'static,
    ) -> NetResult<Self> {
        let stream = StdTcpStream::connect_timeout(&addr, timeout)
            .map_err(|err| NetError::from(err).chain(format!("Connect to {addr}")))?;

        Self::spawn(stream, handler)
    }

    /// Takes over an already connected stream, `handler` runs on the worker thread
    pub fn spawn(
        stream: StdTcpStream,
        handler: impl FnMut(ChannelEvent, &CommandMessenger) + Send + 'static,
    ) -> NetResult<Self> {
        stream.set_nonblocking(true)?;

        Self::from_accepted(TcpStream::from_std(stream), handler)
    }

    /// Takes over a stream accepted by a mio listener
    pub fn from_accepted(
        mut socket: TcpStream,
        handler: impl FnMut(ChannelEvent, &CommandMessenger) + Send + 'static,
    ) -> NetResult<Self> {
        let peer_addr = socket.peer_addr()?;
        socket.set_nodelay(true)?;

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        poll.registry()
            .register(&mut socket, STREAM_TOKEN, Interest::READABLE | Interest::WRITABLE)
            .map_err(|err| NetError::from(err).chain("Register socket".to_owned()))?;

        let (sender, receiver) = channel::bounded(256);
        let messenger = Messenger::new(waker, sender);

        let worker = {
            let messenger = messenger.clone();
            thread::Builder::new()
                .name(format!("command {peer_addr}"))
                .spawn(move || {
                    let _span = span!(Level::INFO, "Command worker", %peer_addr).entered();

                    run_worker(poll, Peer::new(socket), &receiver, &messenger, handler);
                })?
        };

        Ok(CommandChannel {
            messenger,
            peer_addr,
            worker: Some(worker),
        })
    }

    pub fn messenger(&self) -> CommandMessenger {
        self.messenger.clone()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn send(&self, command: Command) -> NetResult<()> {
        if self.worker.is_none() {
            return Err(NetError::Closed);
        }

        self.messenger.send_command(command)
    }

    /// Flushes queued commands, closes the socket and joins the worker
    pub fn close(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        // Fails if the worker already exited on its own
        let _ = self.messenger.close();

        if worker.join().is_err() {
            error!("Command worker for {} panicked", self.peer_addr);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.worker.as_ref().map_or(true, |worker| worker.is_finished())
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_worker(
    mut poll: Poll,
    mut peer: Peer<TcpStream>,
    receiver: &Receiver<ChannelMessage>,
    messenger: &CommandMessenger,
    mut handler: impl FnMut(ChannelEvent, &CommandMessenger),
) {
    let mut events = Events::with_capacity(16);

    let reason = 'outer: loop {
        if let Err(err) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if err.kind() == ErrorKind::Interrupted {
                continue 'outer;
            }

            break 'outer CloseReason::Fault(NetError::from(err).chain("Poll".to_owned()));
        }

        for event in &events {
            match event.token() {
                WAKER_TOKEN => {
                    for message in receiver.try_iter() {
                        match message {
                            ChannelMessage::Command(command) => {
                                trace!("Send {}", command.tag());

                                if let Err(err) = peer.write_command(&command) {
                                    break 'outer close_reason(err, "Write command");
                                }
                            }
                            ChannelMessage::Close => {
                                flush(&mut peer);
                                break 'outer CloseReason::Local;
                            }
                        }
                    }
                }
                STREAM_TOKEN => {
                    if event.is_writable() {
                        if let Err(err) = peer.write_remaining() {
                            break 'outer close_reason(err, "Write commands");
                        }
                    }

                    if event.is_readable() {
                        loop {
                            match peer.read_frame() {
                                Ok(Some(frame)) => match Command::try_from(&frame[..]) {
                                    Ok(command) => {
                                        trace!("Received {}", command.tag());
                                        (handler)(ChannelEvent::Command(command), messenger);
                                    }
                                    Err(err) => {
                                        (handler)(
                                            ChannelEvent::Malformed(NetError::ParsingError(err)),
                                            messenger,
                                        );
                                    }
                                },
                                Ok(None) => break,
                                Err(err) => break 'outer close_reason(err, "Read commands"),
                            }
                        }
                    }
                }
                token => warn!("Got event for unknown token {token:?}"),
            }
        }
    };

    debug!("Command channel closed: {reason:?}");

    // Close the socket before the handler learns about it
    drop(peer);
    (handler)(ChannelEvent::Closed(reason), messenger);
}

fn close_reason(err: NetError, context: &str) -> CloseReason {
    match err {
        NetError::PeerClosed => CloseReason::Remote,
        NetError::Io(io) if is_disconnect(io.kind()) => CloseReason::Remote,
        err => CloseReason::Fault(err.chain(context.to_owned())),
    }
}

fn is_disconnect(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
    )
}

/// Best effort write of queued frames before a local close
fn flush(peer: &mut Peer<TcpStream>) {
    let mut attempts = 0;
    while peer.has_pending_writes() && attempts < 10 {
        if let Err(err) = peer.write_remaining() {
            debug!("Could not flush before close: {err}");
            return;
        }

        attempts += 1;
        if peer.has_pending_writes() {
            thread::sleep(Duration::from_millis(5));
        }
    }
}
