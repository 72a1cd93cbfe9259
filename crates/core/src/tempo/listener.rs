use std::{
    io,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    time::{Duration, Instant},
};

use crate::{
    protocol::{CalibrationStatus, LinkStatus, SensorLine},
    Result, Shutdown, TempoConfig,
};

use super::{InputMode, SharedTempo, TempoController};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Playback-side ingest loop for hub datagrams.
///
/// Applies wand tempo through the [`TempoController`], keeps the connection
/// watchdog fed, counts beat triggers and tracks calibration readiness.
#[derive(Debug)]
pub struct TempoListener {
    socket: UdpSocket,
    tempo: SharedTempo,
    controller: TempoController,
    connection_timeout: Duration,
}

impl TempoListener {
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        controller: TempoController,
        config: &TempoConfig,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        Ok(Self {
            socket,
            tempo: controller.tempo().clone(),
            controller,
            connection_timeout: config.connection_timeout(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Runs until `shutdown` is triggered.
    pub fn run(&self, shutdown: &Shutdown) {
        tracing::info!(addr = ?self.socket.local_addr().ok(), "tempo listener started");
        let mut buf = [0_u8; 1024];

        while !shutdown.is_triggered() {
            match self.socket.recv_from(&mut buf) {
                Ok((len, _)) => self.handle_datagram(&buf[..len], Instant::now()),
                Err(err) if is_timeout(&err) => {}
                Err(err) => {
                    tracing::warn!(%err, "tempo socket receive failed");
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
            self.tempo.expire_heartbeat(Instant::now(), self.connection_timeout);
        }

        tracing::info!("tempo listener stopped");
    }

    pub fn handle_datagram(&self, bytes: &[u8], now: Instant) {
        let line = match SensorLine::parse_bytes(bytes) {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(err) => {
                tracing::debug!(%err, "dropping malformed tempo datagram");
                return;
            }
        };

        match line {
            SensorLine::Bpm(raw) => {
                self.tempo.mark_heartbeat(now);
                let state = self.tempo.snapshot();
                if state.mode == InputMode::LiveGesture && state.calibration_ready {
                    self.controller.normalize(raw);
                } else {
                    tracing::trace!(raw, mode = ?state.mode, "ignoring wand tempo");
                }
            }
            SensorLine::Status(LinkStatus::Connected) | SensorLine::Data(_) => {
                self.tempo.mark_heartbeat(now);
            }
            SensorLine::Status(LinkStatus::Disconnected) => self.tempo.mark_disconnected(),
            SensorLine::BeatTrigger => {
                self.tempo.mark_heartbeat(now);
                let beats = self.tempo.count_beat();
                tracing::debug!(beats, "beat trigger");
            }
            SensorLine::Calibration(status) => {
                self.tempo
                    .set_calibration_ready(status == CalibrationStatus::Ready);
            }
            SensorLine::Log(_) => {}
        }
    }
}

pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
