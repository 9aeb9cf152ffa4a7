//! Lossy datagram transport for sensor samples

use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use common::{
    codec::{self, DatagramError, MAX_DATAGRAM_SIZE},
    types::SensorSample,
};
use tracing::{debug, error, span, trace, Level};

use crate::{NetError, NetResult};

#[derive(Debug)]
pub enum DataEvent {
    Sample(SensorSample),
    /// The socket failed, the receive loop has stopped
    Fault(NetError),
}

/// Receives samples from a single peer on an ephemeral port
pub struct DataChannel {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl DataChannel {
    /// Binds an ephemeral port on `bind_ip` and accepts datagrams from `peer` only
    pub fn bind(
        bind_ip: IpAddr,
        peer: IpAddr,
        read_timeout: Duration,
        mut handler: impl FnMut(DataEvent) + Send + 'static,
    ) -> NetResult<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0))
            .map_err(|err| NetError::from(err).chain("Bind data socket".to_owned()))?;
        socket.set_read_timeout(Some(read_timeout))?;
        let local_addr = socket.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicU64::new(0));

        let worker = {
            let running = running.clone();
            let dropped = dropped.clone();

            thread::Builder::new()
                .name(format!("data {local_addr}"))
                .spawn(move || {
                    let _span = span!(Level::INFO, "Data receiver", %local_addr, %peer).entered();

                    // One extra byte to notice datagrams that are too large
                    let mut buffer = [0u8; MAX_DATAGRAM_SIZE + 1];
                    while running.load(Ordering::Relaxed) {
                        let (len, source) = match socket.recv_from(&mut buffer) {
                            Ok(received) => received,
                            Err(err)
                                if matches!(
                                    err.kind(),
                                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                                ) =>
                            {
                                continue;
                            }
                            Err(err) => {
                                (handler)(DataEvent::Fault(
                                    NetError::from(err).chain("Receive sample".to_owned()),
                                ));
                                break;
                            }
                        };

                        if source.ip() != peer {
                            trace!("Ignoring datagram from {source}");
                            continue;
                        }

                        if len > MAX_DATAGRAM_SIZE {
                            dropped.fetch_add(1, Ordering::Relaxed);
                            debug!("Dropped oversized datagram");
                            continue;
                        }

                        match codec::decode_sample(&buffer[..len]) {
                            Ok(sample) => (handler)(DataEvent::Sample(sample)),
                            Err(err) => {
                                dropped.fetch_add(1, Ordering::Relaxed);
                                debug!("Dropped undecodable datagram: {err:?}");
                            }
                        }
                    }
                })?
        };

        Ok(DataChannel {
            local_addr,
            running,
            dropped,
            worker: Some(worker),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of datagrams from the peer that could not be decoded
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops the receive loop within one read timeout and joins it
    pub fn close(&mut self) {
        self.running.store(false, Ordering::Relaxed);

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Data receiver on {} panicked", self.local_addr);
            }
        }
    }
}

impl Drop for DataChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sends samples to the data channel of a session
pub struct DataSender {
    socket: UdpSocket,
    target: SocketAddr,
}

impl DataSender {
    pub fn new(target: SocketAddr) -> NetResult<Self> {
        let unspecified = match target {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0))?;

        Ok(DataSender { socket, target })
    }

    /// Samples are never truncated, too large ones are rejected
    pub fn send(&self, sample: &SensorSample) -> NetResult<()> {
        let bytes = codec::encode_sample(sample).map_err(|err| match err {
            DatagramError::Oversized(len) => NetError::OversizedPacket(len),
            DatagramError::Encode(err) => NetError::ParsingError(err.into()),
        })?;

        self.socket.send_to(&bytes, self.target)?;

        Ok(())
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

#[cfg(test)]
mod tests {
    use common::types::SensorType;
    use crossbeam::channel;

    use super::*;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn samples_reach_handler() {
        let (tx, rx) = channel::unbounded();
        let mut data = DataChannel::bind(LOCALHOST, LOCALHOST, Duration::from_millis(50), move |event| {
            let _ = tx.send(event);
        })
        .unwrap();

        let sender = DataSender::new(data.local_addr()).unwrap();
        let sample = SensorSample::new(SensorType::Gyroscope, vec![0.5, -0.5, 1.0], 7);
        sender.send(&sample).unwrap();

        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            DataEvent::Sample(received) => assert_eq!(received, sample),
            other => panic!("Unexpected event {other:?}"),
        }

        data.close();
        data.close();
    }

    #[test]
    fn garbage_is_counted_not_fatal() {
        let (tx, rx) = channel::unbounded();
        let mut data = DataChannel::bind(LOCALHOST, LOCALHOST, Duration::from_millis(50), move |event| {
            let _ = tx.send(event);
        })
        .unwrap();

        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.send_to(&[0xff; 3], data.local_addr()).unwrap();

        let sender = DataSender::new(data.local_addr()).unwrap();
        let sample = SensorSample::new(SensorType::Accelerometer, vec![1.0], 1);
        sender.send(&sample).unwrap();

        // Datagrams from one host on loopback arrive in order
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            DataEvent::Sample(_)
        ));
        assert_eq!(data.dropped(), 1);

        data.close();
    }

    #[test]
    fn oversized_sample_is_rejected() {
        let sender = DataSender::new("127.0.0.1:9".parse().unwrap()).unwrap();
        let sample = SensorSample::new(SensorType::Accelerometer, vec![0.0; 300], 0);

        assert!(matches!(sender.send(&sample), Err(NetError::OversizedPacket(_))));
    }

    #[test]
    fn other_hosts_are_ignored() {
        let (tx, rx) = channel::unbounded();
        let stranger: IpAddr = "10.255.255.1".parse().unwrap();
        let mut data = DataChannel::bind(LOCALHOST, stranger, Duration::from_millis(50), move |event| {
            let _ = tx.send(event);
        })
        .unwrap();

        let sender = DataSender::new(data.local_addr()).unwrap();
        sender
            .send(&SensorSample::new(SensorType::Gravity, vec![9.81], 0))
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        assert_eq!(data.dropped(), 0);

        data.close();
    }
}
