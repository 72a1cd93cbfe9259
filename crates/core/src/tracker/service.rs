use std::{
    net::{SocketAddr, UdpSocket},
    thread,
    time::Instant,
};

use nalgebra::Vector3;

use super::{OrientationTracker, TrackerNotice, ViewerFrame};
use crate::{
    bridge::resolve,
    protocol::SensorLine,
    tempo::listener::is_timeout,
    Result, Shutdown, TrackerConfig,
};

/// Requests a viewer may send back to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerCommand {
    Recalibrate,
    Begin,
    Reset,
}

impl ViewerCommand {
    /// Accepts the short keywords and the older `CMD_*` spellings.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "RECALIBRATE" | "CMD_RECALIBRATE" => Some(Self::Recalibrate),
            "BEGIN" | "CMD_CONFIRM" => Some(Self::Begin),
            "RESET" | "CMD_RESET_CALIB" => Some(Self::Reset),
            _ => None,
        }
    }
}

/// Runs an [`OrientationTracker`] against live sockets at a fixed publish
/// rate.
#[derive(Debug)]
pub struct TrackerService {
    tracker: OrientationTracker,
    input: UdpSocket,
    commands: UdpSocket,
    output: UdpSocket,
    viewer_target: SocketAddr,
    command_target: SocketAddr,
    status_target: SocketAddr,
    publish_interval: std::time::Duration,
}

impl TrackerService {
    pub fn bind(config: &TrackerConfig) -> Result<Self> {
        let input = UdpSocket::bind(resolve(&config.listen)?)?;
        input.set_nonblocking(true)?;
        let commands = UdpSocket::bind(resolve(&config.viewer_commands)?)?;
        commands.set_nonblocking(true)?;

        Ok(Self {
            tracker: OrientationTracker::new(config),
            input,
            commands,
            output: UdpSocket::bind(("0.0.0.0", 0))?,
            viewer_target: resolve(&config.viewer_target)?,
            command_target: resolve(&config.command_target)?,
            status_target: resolve(&config.status_target)?,
            publish_interval: config.publish_interval(),
        })
    }

    pub fn input_addr(&self) -> Result<SocketAddr> {
        Ok(self.input.local_addr()?)
    }

    pub fn commands_addr(&self) -> Result<SocketAddr> {
        Ok(self.commands.local_addr()?)
    }

    pub fn tracker(&self) -> &OrientationTracker {
        &self.tracker
    }

    pub fn run(&mut self, shutdown: &Shutdown) {
        tracing::info!(
            viewer = %self.viewer_target,
            interval_ms = self.publish_interval.as_millis() as u64,
            "orientation tracker started"
        );
        let mut next_tick = Instant::now();

        while !shutdown.is_triggered() {
            self.step(Instant::now());

            next_tick += self.publish_interval;
            let now = Instant::now();
            if next_tick > now {
                thread::sleep(next_tick - now);
            } else {
                next_tick = now;
            }
        }

        tracing::info!("orientation tracker stopped");
    }

    /// One publish cycle: drain inputs, advance the state machine, publish.
    pub fn step(&mut self, now: Instant) -> ViewerFrame {
        let mut notices = self.drain_input(now);
        notices.extend(self.drain_commands(now));

        let (frame, tick_notices) = self.tracker.tick(now);
        notices.extend(tick_notices);

        match serde_json::to_vec(&frame) {
            Ok(bytes) => {
                if let Err(err) = self.output.send_to(&bytes, self.viewer_target) {
                    tracing::trace!(%err, "viewer frame not delivered");
                }
            }
            Err(err) => tracing::warn!(%err, "cannot encode viewer frame"),
        }

        for notice in notices {
            self.deliver(&notice);
        }
        frame
    }

    fn drain_input(&mut self, now: Instant) -> Vec<TrackerNotice> {
        let mut notices = Vec::new();
        let mut buf = [0_u8; 1024];
        loop {
            let len = match self.input.recv_from(&mut buf) {
                Ok((len, _)) => len,
                Err(err) if is_timeout(&err) => break,
                Err(err) => {
                    tracing::debug!(%err, "tracker input receive failed");
                    break;
                }
            };
            match SensorLine::parse_bytes(&buf[..len]) {
                Ok(Some(SensorLine::Data(fields))) => {
                    if let [x, y, z, ..] = fields[..] {
                        self.tracker.ingest(Vector3::new(x, y, z), now);
                    }
                }
                Ok(Some(SensorLine::BeatTrigger)) => notices.extend(self.tracker.beat()),
                Ok(_) => {}
                Err(err) => tracing::debug!(%err, "dropping malformed tracker input"),
            }
        }
        notices
    }

    fn drain_commands(&mut self, now: Instant) -> Vec<TrackerNotice> {
        let mut notices = Vec::new();
        let mut buf = [0_u8; 256];
        while let Ok((len, _)) = self.commands.recv_from(&mut buf) {
            let text = String::from_utf8_lossy(&buf[..len]);
            match ViewerCommand::parse(&text) {
                Some(ViewerCommand::Recalibrate) => {
                    notices.extend(self.tracker.request_recalibration(now));
                }
                Some(ViewerCommand::Begin) => notices.extend(self.tracker.begin()),
                Some(ViewerCommand::Reset) => notices.extend(self.tracker.reset()),
                None => tracing::debug!(command = %text.trim(), "unknown viewer command"),
            }
        }
        notices
    }

    fn deliver(&self, notice: &TrackerNotice) {
        let (bytes, target) = match notice {
            TrackerNotice::Device(command) => {
                (command.to_string().into_bytes(), self.command_target)
            }
            TrackerNotice::Calibration(status) => {
                (status.datagram().as_bytes().to_vec(), self.status_target)
            }
        };
        if let Err(err) = self.output.send_to(&bytes, target) {
            tracing::debug!(%err, addr = %target, "tracker notice not delivered");
        }
    }
}
