use std::{
    io,
    net::{SocketAddr, UdpSocket},
};

use crossbeam_channel::Sender;

/// Destination for the non-meta payloads of a playback run.
///
/// A sink is owned by exactly one run; errors end that run early.
pub trait EventSink: Send {
    fn send(&mut self, payload: &[u8]) -> io::Result<()>;
}

/// Forwards payloads over a channel. Fails once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<Vec<u8>>,
}

impl ChannelSink {
    pub fn new(tx: Sender<Vec<u8>>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.tx
            .send(payload.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "event receiver dropped"))
    }
}

/// Sends each payload as one datagram, e.g. to a software synth bridge.
#[derive(Debug)]
pub struct UdpSink {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpSink {
    pub fn connect(target: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(("127.0.0.1", 0))?;
        Ok(Self { socket, target })
    }
}

impl EventSink for UdpSink {
    fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.socket.send_to(payload, self.target).map(|_| ())
    }
}

/// Writes payloads to the log. Useful when no synth is attached.
#[derive(Debug, Default)]
pub struct LogSink {
    sent: u64,
}

impl EventSink for LogSink {
    fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.sent += 1;
        tracing::debug!(index = self.sent, ?payload, "midi event");
        Ok(())
    }
}
