//! Serial hub: one wand, several downstream consumers.
//!
//! The bridge owns the serial device exclusively. Every complete line read
//! from it is republished unmodified to each subscriber, command datagrams are
//! written back to the device, and a heartbeat keeps the tempo consumer aware
//! of the link even when the wand is still. When playback asks for it, data
//! samples are also recorded for the length of the session.

mod device;

use std::{
    io::{self, BufRead, BufReader, Write},
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    thread,
    time::{Duration, Instant},
};

pub use device::{DeviceConnector, SerialDevice, SerialPortConnector};

use crate::{
    protocol::{DeviceCommand, SensorLine, DISCONNECT_LINE, HEARTBEAT_LINE},
    record::Recorder,
    tempo::listener::is_timeout,
    BridgeConfig, ConductorError, InputMode, Result, SessionMonitor, SharedTempo, Shutdown,
};

const COMMAND_BUFFER: usize = 128;
const LINE_LIMIT: usize = 4096;

/// Role of a downstream endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriberKind {
    /// Playback side: receives tempo lines and heartbeats.
    Tempo,
    /// Orientation tracker / visualiser.
    Visual,
}

/// Static fan-out target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Subscriber {
    addr: SocketAddr,
    kind: SubscriberKind,
}

/// Resolves `host:port` to the first socket address it names.
pub fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| ConductorError::Config(format!("address `{addr}` did not resolve")))
}

/// Why a connected session ended.
enum LinkEnd {
    Lost,
    Shutdown,
}

pub struct SensorBridge {
    connector: Box<dyn DeviceConnector>,
    socket: UdpSocket,
    commands: UdpSocket,
    subscribers: Vec<Subscriber>,
    tempo: SharedTempo,
    monitor: Option<SessionMonitor>,
    recorder: Recorder,
    heartbeat_interval: Duration,
    backoff: Duration,
    max_backoff: Duration,
    idle_poll: Duration,
}

impl SensorBridge {
    pub fn new(
        connector: Box<dyn DeviceConnector>,
        config: &BridgeConfig,
        tempo: SharedTempo,
    ) -> Result<Self> {
        let subscribers = vec![
            Subscriber {
                addr: resolve(&config.tempo_target)?,
                kind: SubscriberKind::Tempo,
            },
            Subscriber {
                addr: resolve(&config.visual_target)?,
                kind: SubscriberKind::Visual,
            },
        ];

        let commands = UdpSocket::bind(resolve(&config.command_bind)?)?;
        commands.set_nonblocking(true)?;
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;

        Ok(Self {
            connector,
            socket,
            commands,
            subscribers,
            tempo,
            monitor: None,
            recorder: Recorder::new(&config.log_dir, config.sensor_fields),
            heartbeat_interval: config.heartbeat_interval(),
            backoff: Duration::from_millis(config.reconnect_backoff_ms.max(1)),
            max_backoff: Duration::from_millis(
                config.max_reconnect_backoff_ms.max(config.reconnect_backoff_ms),
            ),
            idle_poll: config.read_timeout(),
        })
    }

    /// Lets the bridge follow the playback lifecycle for recording.
    #[must_use]
    pub fn with_monitor(mut self, monitor: SessionMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn command_addr(&self) -> Result<SocketAddr> {
        Ok(self.commands.local_addr()?)
    }

    /// Connects, forwards, reconnects; returns only once `shutdown` fires.
    pub fn run(&mut self, shutdown: &Shutdown) {
        let device_name = self.connector.describe();
        tracing::info!(device = %device_name, "sensor bridge started");
        let mut backoff = self.backoff;

        while !shutdown.is_triggered() {
            match self.connector.connect() {
                Ok(device) => {
                    tracing::info!(device = %device_name, "serial device connected");
                    backoff = self.backoff;
                    match self.serve(device, shutdown) {
                        LinkEnd::Shutdown => break,
                        LinkEnd::Lost => {
                            tracing::warn!(device = %device_name, "serial device lost");
                            self.notify_disconnect();
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        device = %device_name,
                        %err,
                        retry_ms = backoff.as_millis() as u64,
                        "cannot open serial device"
                    );
                    self.notify_disconnect();
                    self.wait_backoff(backoff, shutdown);
                    backoff = (backoff * 2).min(self.max_backoff);
                }
            }
        }

        self.recorder.stop();
        tracing::info!("sensor bridge stopped");
    }

    fn serve(&mut self, device: Box<dyn SerialDevice>, shutdown: &Shutdown) -> LinkEnd {
        let mut reader = BufReader::new(device);
        let mut line = Vec::with_capacity(256);
        let mut last_heartbeat: Option<Instant> = None;

        loop {
            if shutdown.is_triggered() {
                return LinkEnd::Shutdown;
            }

            if last_heartbeat.map_or(true, |at| at.elapsed() >= self.heartbeat_interval) {
                self.send_to_kind(SubscriberKind::Tempo, HEARTBEAT_LINE.as_bytes());
                last_heartbeat = Some(Instant::now());
            }

            self.follow_lifecycle();

            match reader.read_until(b'\n', &mut line) {
                Ok(0) => return LinkEnd::Lost,
                Ok(_) if line.ends_with(b"\n") => {
                    self.handle_line(&line);
                    line.clear();
                }
                Ok(_) => {}
                Err(err) if is_timeout(&err) || err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    tracing::warn!(%err, "serial read failed");
                    return LinkEnd::Lost;
                }
            }
            if line.len() > LINE_LIMIT {
                tracing::debug!(len = line.len(), "discarding oversized serial line");
                line.clear();
            }

            if let Err(err) = self.forward_commands(reader.get_mut()) {
                tracing::warn!(%err, "serial write failed");
                return LinkEnd::Lost;
            }
        }
    }

    /// Republishes one complete line and records it when it carries data.
    fn handle_line(&mut self, raw: &[u8]) {
        if self.tempo.mode() == InputMode::Replay {
            tracing::trace!("replay active; hardware line suppressed");
            return;
        }

        for subscriber in &self.subscribers {
            if let Err(err) = self.socket.send_to(raw, subscriber.addr) {
                tracing::debug!(%err, addr = %subscriber.addr, "forward failed");
            }
        }

        match SensorLine::parse_bytes(raw) {
            Ok(Some(SensorLine::Data(values))) => {
                self.recorder.record_sample(&values, self.tempo.bpm());
            }
            Ok(Some(SensorLine::Log(text))) => tracing::debug!(device_log = %text),
            Ok(_) => {}
            Err(err) => tracing::debug!(%err, "skipping malformed serial line"),
        }
    }

    /// Drains pending command datagrams into the device.
    fn forward_commands(&mut self, device: &mut Box<dyn SerialDevice>) -> io::Result<()> {
        let mut buf = [0_u8; COMMAND_BUFFER];
        loop {
            match self.commands.recv_from(&mut buf) {
                Ok((len, _)) => {
                    let payload = &buf[..len];
                    tracing::info!(
                        command = %DeviceCommand::parse(&String::from_utf8_lossy(payload)),
                        "forwarding command to device"
                    );
                    device.write_all(payload)?;
                    device.write_all(b"\n")?;
                    device.flush()?;
                }
                Err(err) if is_timeout(&err) => return Ok(()),
                Err(err) => {
                    tracing::debug!(%err, "command socket receive failed");
                    return Ok(());
                }
            }
        }
    }

    fn follow_lifecycle(&mut self) {
        let Some(monitor) = &self.monitor else {
            return;
        };
        self.recorder.observe(monitor.snapshot(), self.tempo.mode());
    }

    fn notify_disconnect(&mut self) {
        self.send_to_kind(SubscriberKind::Tempo, DISCONNECT_LINE.as_bytes());
        self.recorder.stop();
    }

    fn send_to_kind(&self, kind: SubscriberKind, line: &[u8]) {
        let mut datagram = line.to_vec();
        datagram.push(b'\n');
        for subscriber in self.subscribers.iter().filter(|s| s.kind == kind) {
            if let Err(err) = self.socket.send_to(&datagram, subscriber.addr) {
                tracing::debug!(%err, addr = %subscriber.addr, "status datagram failed");
            }
        }
    }

    /// Sleeps out a reconnect backoff while discarding commands that cannot
    /// reach the device.
    fn wait_backoff(&mut self, backoff: Duration, shutdown: &Shutdown) {
        let deadline = Instant::now() + backoff;
        let mut buf = [0_u8; COMMAND_BUFFER];
        while Instant::now() < deadline && !shutdown.is_triggered() {
            while let Ok((len, _)) = self.commands.recv_from(&mut buf) {
                tracing::warn!(
                    command = %String::from_utf8_lossy(&buf[..len]).trim(),
                    "dropping command; device not connected"
                );
            }
            self.follow_lifecycle();
            thread::sleep(self.idle_poll.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
}

impl std::fmt::Debug for SensorBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorBridge")
            .field("device", &self.connector.describe())
            .field("subscribers", &self.subscribers)
            .field("recording", &self.recorder.is_recording())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        io::Read,
        sync::Arc,
    };

    use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        record::tests::scratch_dir, EventStream, LoadOptions, PlaybackConfig, PlaybackEngine,
        RunOutcome, SensorFields, SessionState, TempoController, TempoState, TimedEvent,
    };

    struct FakeDevice {
        incoming: Receiver<Vec<u8>>,
        pending: VecDeque<u8>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl Read for FakeDevice {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                match self.incoming.recv_timeout(Duration::from_millis(10)) {
                    Ok(bytes) => self.pending.extend(bytes),
                    Err(RecvTimeoutError::Timeout) => {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
                    }
                    Err(RecvTimeoutError::Disconnected) => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len());
            for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for FakeDevice {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FakeConnector {
        devices: VecDeque<FakeDevice>,
    }

    impl DeviceConnector for FakeConnector {
        fn connect(&mut self) -> Result<Box<dyn SerialDevice>> {
            match self.devices.pop_front() {
                Some(device) => Ok(Box::new(device)),
                None => Err(io::Error::new(io::ErrorKind::NotFound, "no wand").into()),
            }
        }

        fn describe(&self) -> String {
            "fake".to_string()
        }
    }

    struct Harness {
        device_tx: Sender<Vec<u8>>,
        written: Arc<Mutex<Vec<u8>>>,
        tempo_rx: UdpSocket,
        visual_rx: UdpSocket,
        command_addr: SocketAddr,
        tempo: SharedTempo,
        shutdown: Shutdown,
        handle: thread::JoinHandle<()>,
    }

    impl Harness {
        fn start(
            log_dir: &std::path::Path,
            monitor: Option<SessionMonitor>,
            tempo: SharedTempo,
        ) -> Self {
            let (device_tx, incoming) = crossbeam_channel::unbounded();
            let written = Arc::new(Mutex::new(Vec::new()));
            let device = FakeDevice {
                incoming,
                pending: VecDeque::new(),
                written: Arc::clone(&written),
            };
            Self::with_connector(
                FakeConnector {
                    devices: VecDeque::from([device]),
                },
                log_dir,
                monitor,
                tempo,
                device_tx,
                written,
            )
        }

        fn with_connector(
            connector: FakeConnector,
            log_dir: &std::path::Path,
            monitor: Option<SessionMonitor>,
            tempo: SharedTempo,
            device_tx: Sender<Vec<u8>>,
            written: Arc<Mutex<Vec<u8>>>,
        ) -> Self {
            let tempo_rx = UdpSocket::bind("127.0.0.1:0").unwrap();
            let visual_rx = UdpSocket::bind("127.0.0.1:0").unwrap();
            for socket in [&tempo_rx, &visual_rx] {
                socket
                    .set_read_timeout(Some(Duration::from_millis(100)))
                    .unwrap();
            }
            let config = BridgeConfig {
                tempo_target: tempo_rx.local_addr().unwrap().to_string(),
                visual_target: visual_rx.local_addr().unwrap().to_string(),
                command_bind: "127.0.0.1:0".to_string(),
                read_timeout_ms: 10,
                reconnect_backoff_ms: 20,
                max_reconnect_backoff_ms: 40,
                log_dir: log_dir.display().to_string(),
                sensor_fields: SensorFields::Orientation,
                ..Default::default()
            };

            let mut bridge =
                SensorBridge::new(Box::new(connector), &config, tempo.clone()).unwrap();
            if let Some(monitor) = monitor {
                bridge = bridge.with_monitor(monitor);
            }
            let command_addr = bridge.command_addr().unwrap();
            let shutdown = Shutdown::new();
            let stop = shutdown.clone();
            let handle = thread::spawn(move || bridge.run(&stop));

            Self {
                device_tx,
                written,
                tempo_rx,
                visual_rx,
                command_addr,
                tempo,
                shutdown,
                handle,
            }
        }

        fn stop(self) {
            self.shutdown.trigger();
            self.handle.join().unwrap();
        }
    }

    /// Receives datagrams until one satisfies `pred` or two seconds pass.
    fn receive_matching(socket: &UdpSocket, pred: impl Fn(&[u8]) -> bool) -> Option<Vec<u8>> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut buf = [0_u8; 1024];
        while Instant::now() < deadline {
            if let Ok((len, _)) = socket.recv_from(&mut buf) {
                if pred(&buf[..len]) {
                    return Some(buf[..len].to_vec());
                }
            }
        }
        None
    }

    /// Content of the first recording in `dir` with exactly `lines` lines.
    fn recording_with_lines(dir: &std::path::Path, lines: usize) -> Option<String> {
        std::fs::read_dir(dir)
            .ok()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .find_map(|path| {
                let content = std::fs::read_to_string(&path).ok()?;
                (content.lines().count() == lines).then_some(content)
            })
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn command_datagram_reaches_device_with_newline() {
        let harness = Harness::start(&scratch_dir("bridge-cmd"), None, SharedTempo::new());
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"SET_SIG:3", harness.command_addr).unwrap();

        let written = Arc::clone(&harness.written);
        assert!(wait_for(|| !written.lock().is_empty()));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(written.lock().as_slice(), b"SET_SIG:3\n");
        harness.stop();
    }

    #[test]
    fn lines_fan_out_unmodified_with_heartbeats() {
        let harness = Harness::start(&scratch_dir("bridge-fanout"), None, SharedTempo::new());

        let heartbeat =
            receive_matching(&harness.tempo_rx, |d| d.starts_with(b"STATUS: CONNECTED"));
        assert_eq!(heartbeat.as_deref(), Some(&b"STATUS: CONNECTED\n"[..]));

        harness.device_tx.send(b"BPM: 1".to_vec()).unwrap();
        harness.device_tx.send(b"00\nDATA,0.1,0.2,0.3\n".to_vec()).unwrap();

        let bpm = receive_matching(&harness.tempo_rx, |d| d.starts_with(b"BPM"));
        assert_eq!(bpm.as_deref(), Some(&b"BPM: 100\n"[..]));
        let visual_bpm = receive_matching(&harness.visual_rx, |d| d.starts_with(b"BPM"));
        assert_eq!(visual_bpm.as_deref(), Some(&b"BPM: 100\n"[..]));
        let data = receive_matching(&harness.visual_rx, |d| d.starts_with(b"DATA"));
        assert_eq!(data.as_deref(), Some(&b"DATA,0.1,0.2,0.3\n"[..]));
        harness.stop();
    }

    #[test]
    fn replay_mode_suppresses_hardware_lines() {
        let harness = Harness::start(&scratch_dir("bridge-replay"), None, SharedTempo::new());
        harness.tempo.set_mode(InputMode::Replay);

        harness.device_tx.send(b"DATA,1,2,3\n".to_vec()).unwrap();
        assert_eq!(receive_matching(&harness.visual_rx, |d| d.starts_with(b"DATA")), None);

        harness.tempo.set_mode(InputMode::LiveGesture);
        harness.device_tx.send(b"DATA,4,5,6\n".to_vec()).unwrap();
        let data = receive_matching(&harness.visual_rx, |d| d.starts_with(b"DATA"));
        assert_eq!(data.as_deref(), Some(&b"DATA,4,5,6\n"[..]));
        harness.stop();
    }

    #[test]
    fn missing_device_triggers_disconnect_notice() {
        let (device_tx, _) = crossbeam_channel::unbounded();
        let harness = Harness::with_connector(
            FakeConnector {
                devices: VecDeque::new(),
            },
            &scratch_dir("bridge-missing"),
            None,
            SharedTempo::new(),
            device_tx,
            Arc::new(Mutex::new(Vec::new())),
        );

        let notice = receive_matching(&harness.tempo_rx, |d| d.starts_with(b"STATUS"));
        assert_eq!(notice.as_deref(), Some(&b"STATUS: DISCONNECTED\n"[..]));
        harness.stop();
    }

    #[test]
    fn lost_device_reconnects() {
        let (first_tx, first_rx) = crossbeam_channel::unbounded();
        let (second_tx, second_rx) = crossbeam_channel::unbounded();
        let written = Arc::new(Mutex::new(Vec::new()));
        let devices = VecDeque::from([
            FakeDevice {
                incoming: first_rx,
                pending: VecDeque::new(),
                written: Arc::clone(&written),
            },
            FakeDevice {
                incoming: second_rx,
                pending: VecDeque::new(),
                written: Arc::clone(&written),
            },
        ]);
        let harness = Harness::with_connector(
            FakeConnector { devices },
            &scratch_dir("bridge-reconnect"),
            None,
            SharedTempo::new(),
            second_tx,
            written,
        );

        drop(first_tx);
        let notice = receive_matching(&harness.tempo_rx, |d| d.starts_with(b"STATUS: DIS"));
        assert!(notice.is_some());

        harness.device_tx.send(b"BEAT_TRIG\n".to_vec()).unwrap();
        let beat = receive_matching(&harness.visual_rx, |d| d.starts_with(b"BEAT"));
        assert_eq!(beat.as_deref(), Some(&b"BEAT_TRIG\n"[..]));
        harness.stop();
    }

    #[test]
    fn records_samples_while_playback_runs() {
        let log_dir = scratch_dir("bridge-record");
        let tempo = SharedTempo::with_state(TempoState {
            bpm: 60.0,
            ..Default::default()
        });
        let engine = PlaybackEngine::new(
            TempoController::new(tempo.clone()),
            &PlaybackConfig::default(),
        );
        let harness = Harness::start(&log_dir, Some(engine.monitor()), tempo);

        let stream = EventStream::new(
            480,
            vec![TimedEvent::new(0, [0x90, 60, 90]), TimedEvent::new(480, [0x80, 60, 0])],
        )
        .unwrap();
        engine
            .load(
                stream,
                LoadOptions {
                    record: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let playback = engine.spawn(Box::new(crate::LogSink::default())).unwrap();

        assert!(wait_for(|| engine.monitor().snapshot().state == SessionState::Running));
        thread::sleep(Duration::from_millis(50));
        for line in [
            "DATA,1,0,0\n",
            "DATA,0,1,x\n",
            "DATA,0,1,0\n",
            "DATA,1,2\n",
            "BPM: 60\n",
            "DATA,0,0,1\n",
        ] {
            harness.device_tx.send(line.as_bytes().to_vec()).unwrap();
        }

        assert_eq!(playback.join().unwrap(), RunOutcome::Completed);

        assert!(wait_for(|| recording_with_lines(&log_dir, 4).is_some()));
        let content = recording_with_lines(&log_dir, 4).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("Timestamp,X,Y,Z,bpm"));
        assert!(lines.all(|row| row.ends_with(",60")));

        let files = std::fs::read_dir(&log_dir).unwrap().count();
        assert_eq!(files, 1);
        harness.stop();
        std::fs::remove_dir_all(log_dir).unwrap();
    }

    #[test]
    fn records_a_session_that_starts_paused() {
        let log_dir = scratch_dir("bridge-paused-start");
        let tempo = SharedTempo::with_state(TempoState {
            bpm: 0.0,
            paused: true,
            ..Default::default()
        });
        let controller = TempoController::new(tempo.clone());
        let engine = PlaybackEngine::new(controller.clone(), &PlaybackConfig::default());
        let harness = Harness::start(&log_dir, Some(engine.monitor()), tempo);

        let stream = EventStream::new(
            480,
            vec![TimedEvent::new(0, [0x90, 60, 90]), TimedEvent::new(240, [0x80, 60, 0])],
        )
        .unwrap();
        let options = LoadOptions {
            record: true,
            ..Default::default()
        };
        engine.load(stream, options).unwrap();
        let playback = engine.spawn(Box::new(crate::LogSink::default())).unwrap();

        assert!(wait_for(|| engine.monitor().snapshot().state == SessionState::Paused));
        controller.normalize(60.0);
        assert!(wait_for(|| engine.monitor().snapshot().state == SessionState::Running));
        harness.device_tx.send(b"DATA,1,0,0
".to_vec()).unwrap();
        harness.device_tx.send(b"DATA,0,1,0
".to_vec()).unwrap();

        assert_eq!(playback.join().unwrap(), RunOutcome::Completed);
        assert!(wait_for(|| recording_with_lines(&log_dir, 3).is_some()));
        assert_eq!(std::fs::read_dir(&log_dir).unwrap().count(), 1);
        harness.stop();
        std::fs::remove_dir_all(log_dir).unwrap();
    }
}
