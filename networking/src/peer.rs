use std::io::{ErrorKind, Read, Write};

use common::{codec, protocol::Command};
use tracing::warn;

use crate::{NetError, NetResult};

const CHUNK_LENGTH: usize = 4096;

/// Buffered framing state of one non-blocking stream
pub(crate) struct Peer<S> {
    write_buffer: Vec<u8>,
    read_buffer: Vec<u8>,

    socket: S,
}

impl<S> Peer<S> {
    pub fn new(socket: S) -> Self {
        Peer {
            write_buffer: Vec::new(),
            read_buffer: Vec::new(),
            socket,
        }
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.write_buffer.is_empty()
    }
}

impl<S: Write> Peer<S> {
    /// Queues a frame behind any unwritten data and writes as much as the socket takes
    pub fn write_command(&mut self, command: &Command) -> NetResult<()> {
        codec::write_frame(command, &mut self.write_buffer).map_err(NetError::ParsingError)?;

        self.write_remaining()
    }

    /// Writes buffered data, leftovers wait for the next writeable event
    pub fn write_remaining(&mut self) -> NetResult<()> {
        raw_write(&mut self.socket, &mut self.write_buffer)?;

        Ok(())
    }
}

impl<S: Read> Peer<S> {
    /// Returns the next complete frame, `None` once the socket ran dry
    pub fn read_frame(&mut self) -> NetResult<Option<Vec<u8>>> {
        // A frame may be split across multiple read calls
        // And a single read call may return multiple frames
        loop {
            let frame = codec::take_frame(&mut self.read_buffer).map_err(NetError::ParsingError)?;
            if let Some(frame) = frame {
                return Ok(Some(frame));
            }

            // Not enough data was available
            let readable = raw_read_once(&mut self.socket, &mut self.read_buffer)?;
            if !readable {
                return Ok(None);
            }
        }
    }
}

// Returns if the socket is still writeable
// Any data not accepted by the socket stays in `buffer`
fn raw_write<S: Write>(mut socket: S, buffer: &mut Vec<u8>) -> NetResult<bool> {
    while !buffer.is_empty() {
        let res = socket.write(buffer);
        match res {
            Ok(0) => {
                // Write zero means that the connection got closed
                return Err(NetError::PeerClosed);
            }
            Ok(count) => {
                buffer.drain(..count);
            }

            // An error case means nothing has been written
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                return Ok(false);
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {
                continue;
            }
            Err(err) => {
                return Err(err.into());
            }
        }
    }

    Ok(true)
}

// Returns if the socket is still readable
fn raw_read_once<S: Read>(mut socket: S, buffer: &mut Vec<u8>) -> NetResult<bool> {
    let mut chunk = [0u8; CHUNK_LENGTH];

    // Need loop in the unlikely case of an interruption
    loop {
        let res = socket.read(&mut chunk);
        match res {
            Ok(0) => {
                // Read zero means that the connection got closed
                if !buffer.is_empty() {
                    warn!("Peer closed with {} bytes of a partial frame", buffer.len());
                }
                return Err(NetError::PeerClosed);
            }
            Ok(count) => {
                buffer.extend_from_slice(&chunk[..count]);
                return Ok(true);
            }

            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                return Ok(false);
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {
                continue;
            }
            Err(err) => {
                return Err(err.into());
            }
        }
    }
}
