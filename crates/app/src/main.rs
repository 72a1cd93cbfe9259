use std::{
    net::UdpSocket,
    path::{Path, PathBuf},
    thread::{self, JoinHandle},
    time::Duration,
};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wand_conductor_core::{
    bridge::resolve, replay::load_recording, AppConfig, DeviceCommand, EventSink, EventStream,
    InputMode, LoadOptions, LogSink, PlaybackEngine, ReplayDriver, RunOutcome, SensorBridge,
    SerialPortConnector, SharedTempo, Shutdown, TempoController, TempoListener, TempoState,
    TrackerService, UdpSink,
};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

fn main() -> wand_conductor_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Hub { port, baud } => {
            if let Some(port) = port {
                config.bridge.serial_port = port;
            }
            if let Some(baud) = baud {
                config.bridge.baud_rate = baud;
            }
            run_hub(&config)
        }
        Commands::Play { midi, options } => run_play(&config, &midi, &options),
        Commands::Track => run_track(&config),
        Commands::Run {
            midi,
            options,
            record,
            replay,
        } => {
            let session = Session::prepare(&config, &midi, &options, record)?;
            run_all(&config, session, replay.as_deref())
        }
    }
}

/// A standalone hub has no playback to follow, so it never records.
fn run_hub(config: &AppConfig) -> wand_conductor_core::Result<()> {
    let connector = SerialPortConnector::from_config(&config.bridge);
    let tempo = SharedTempo::new();
    let mut bridge = SensorBridge::new(Box::new(connector), &config.bridge, tempo)?;
    bridge.run(&Shutdown::new());
    Ok(())
}

fn run_track(config: &AppConfig) -> wand_conductor_core::Result<()> {
    let mut service = TrackerService::bind(&config.tracker)?;
    service.run(&Shutdown::new());
    Ok(())
}

/// Playback against a separately running hub.
fn run_play(
    config: &AppConfig,
    midi: &Path,
    options: &PlayOptions,
) -> wand_conductor_core::Result<()> {
    let shutdown = Shutdown::new();
    let session = Session::prepare(config, midi, options, false)?;
    let listener = session.spawn_listener(config, &shutdown)?;

    let outcome = session.play(config)?;

    shutdown.trigger();
    join_loop(listener, "tempo listener");
    report(outcome);
    Ok(())
}

/// Hub, tempo listener, tracker and playback in one process. With a
/// recording to replay, its tempo column drives this session's tempo and the
/// hub's hardware input is suspended until the replay ends.
fn run_all(
    config: &AppConfig,
    session: Session,
    replay: Option<&Path>,
) -> wand_conductor_core::Result<()> {
    let shutdown = Shutdown::new();

    let connector = SerialPortConnector::from_config(&config.bridge);
    let tempo = session.tempo.clone();
    let mut bridge = SensorBridge::new(Box::new(connector), &config.bridge, tempo)?
        .with_monitor(session.engine.monitor());
    let mut tracker = TrackerService::bind(&config.tracker)?;

    let listener = session.spawn_listener(config, &shutdown)?;
    let bridge_handle = spawn_loop("bridge", shutdown.clone(), move |stop| bridge.run(stop))?;
    let tracker_handle = spawn_loop("tracker", shutdown.clone(), move |stop| tracker.run(stop))?;
    let replay_handle = match replay {
        Some(path) => Some(session.spawn_replay(config, path, &shutdown)?),
        None => None,
    };

    let outcome = session.play(config)?;

    shutdown.trigger();
    join_loop(listener, "tempo listener");
    join_loop(bridge_handle, "bridge");
    join_loop(tracker_handle, "tracker");
    if let Some(handle) = replay_handle {
        join_loop(handle, "replay");
    }
    report(outcome);
    Ok(())
}

/// A loaded stream plus the shared records it will play against.
struct Session {
    tempo: SharedTempo,
    controller: TempoController,
    engine: PlaybackEngine,
    stream: EventStream,
    load: LoadOptions,
    gesture: bool,
}

impl Session {
    fn prepare(
        config: &AppConfig,
        midi: &Path,
        options: &PlayOptions,
        record: bool,
    ) -> wand_conductor_core::Result<Self> {
        let stream = EventStream::from_file(midi)?;
        tracing::info!(
            path = %midi.display(),
            events = stream.len(),
            detected_bpm = ?stream.detected_bpm(),
            signature = ?stream.time_signature_numerator(),
            "stream loaded"
        );

        let mode = if options.gesture {
            InputMode::LiveGesture
        } else {
            InputMode::StandardTempo
        };
        let tempo = SharedTempo::with_state(TempoState {
            mode,
            ..Default::default()
        });
        let controller = TempoController::with_max_bpm(tempo.clone(), config.tempo.max_bpm);

        // Gesture runs wait for the wand's first tempo reading.
        let start_bpm = if options.gesture {
            0.0
        } else {
            options
                .bpm
                .or(stream.detected_bpm())
                .unwrap_or(config.tempo.default_bpm)
        };
        controller.normalize(start_bpm);

        let engine = PlaybackEngine::new(controller.clone(), &config.playback);
        Ok(Self {
            tempo,
            controller,
            engine,
            stream,
            load: LoadOptions {
                start_paused: options.paused,
                warmup: options.warmup,
                record,
            },
            gesture: options.gesture,
        })
    }

    fn spawn_listener(
        &self,
        config: &AppConfig,
        shutdown: &Shutdown,
    ) -> wand_conductor_core::Result<JoinHandle<()>> {
        let listener = TempoListener::bind(
            resolve(&config.tempo.listen)?,
            self.controller.clone(),
            &config.tempo,
        )?;
        let handle =
            spawn_loop("tempo-listener", shutdown.clone(), move |stop| listener.run(stop))?;
        Ok(handle)
    }

    /// Replays `path` through this session's tempo controller.
    fn spawn_replay(
        &self,
        config: &AppConfig,
        path: &Path,
        shutdown: &Shutdown,
    ) -> wand_conductor_core::Result<JoinHandle<()>> {
        let samples = load_recording(path)?;
        let driver = ReplayDriver::new(self.controller.clone(), &config.replay)?;
        let name = path.display().to_string();
        let handle = spawn_loop("replay", shutdown.clone(), move |stop| {
            let outcome = driver.run(&samples, stop);
            tracing::info!(?outcome, path = %name, "replay done");
        })?;
        Ok(handle)
    }

    /// Loads the stream, pushes the time signature to the wand in gesture
    /// mode, and blocks until playback ends.
    fn play(self, config: &AppConfig) -> wand_conductor_core::Result<RunOutcome> {
        if self.gesture {
            let beats = self.stream.warmup_beats(config.playback.warmup_default_beats);
            push_signature(config, beats);
        }

        self.engine.load(self.stream, self.load)?;
        let handle = self.engine.spawn(open_sink(config))?;

        while !handle.is_finished() {
            thread::sleep(PROGRESS_INTERVAL);
            let progress = self.engine.progress();
            tracing::info!(
                state = ?progress.state,
                percent = progress.percent,
                elapsed_s = progress.elapsed.as_secs(),
                bpm = progress.bpm,
                "playback progress"
            );
        }

        Ok(handle.join().unwrap_or_else(|_| {
            tracing::error!("playback thread panicked");
            RunOutcome::Failed
        }))
    }
}

fn open_sink(config: &AppConfig) -> Box<dyn EventSink> {
    let Some(target) = config.playback.sink_target.as_deref() else {
        return Box::new(LogSink::default());
    };
    match resolve(target).and_then(|addr| Ok(UdpSink::connect(addr)?)) {
        Ok(sink) => {
            tracing::info!(sink = target, "sending events over UDP");
            Box::new(sink)
        }
        Err(err) => {
            tracing::warn!(%err, sink = target, "cannot open UDP sink; logging events instead");
            Box::new(LogSink::default())
        }
    }
}

fn push_signature(config: &AppConfig, beats: u32) {
    let Ok(beats) = u8::try_from(beats) else {
        tracing::warn!(beats, "time signature out of range; not sent");
        return;
    };
    let command = DeviceCommand::SetSignature(beats).to_string();
    let sent = resolve(&config.bridge.command_bind).and_then(|addr| {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.send_to(command.as_bytes(), addr)?;
        Ok(())
    });
    match sent {
        Ok(()) => tracing::info!(%command, "time signature sent to wand"),
        Err(err) => tracing::warn!(%err, "could not send time signature"),
    }
}

fn spawn_loop<F>(name: &str, shutdown: Shutdown, body: F) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce(&Shutdown) + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(&shutdown))
}

fn join_loop(handle: JoinHandle<()>, name: &str) {
    if handle.join().is_err() {
        tracing::error!(name, "loop thread panicked");
    }
}

fn report(outcome: RunOutcome) {
    match outcome {
        RunOutcome::Completed => tracing::info!("playback completed"),
        RunOutcome::Disconnected => tracing::warn!("playback aborted: wand disconnected"),
        other => tracing::warn!(?other, "playback ended early"),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Conduct MIDI playback with a motion-sensing wand",
    long_about = None
)]
struct Cli {
    /// TOML configuration file. Built-in defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
struct PlayOptions {
    /// Follow the wand's tempo; playback aborts if the wand disconnects.
    #[arg(short, long)]
    gesture: bool,
    /// Starting tempo in standard mode. Defaults to the file's own tempo.
    #[arg(long)]
    bpm: Option<f32>,
    /// Wait for one bar of preparatory beats before starting.
    #[arg(short, long)]
    warmup: bool,
    /// Start paused.
    #[arg(long)]
    paused: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Own the serial device and fan its lines out to the other processes.
    /// Recording needs the playback in the same process; see `run`.
    Hub {
        /// Serial device path, e.g. /dev/ttyUSB0.
        #[arg(short, long)]
        port: Option<String>,
        #[arg(short, long)]
        baud: Option<u32>,
    },
    /// Play a Standard MIDI File against a separately running hub.
    Play {
        midi: PathBuf,
        #[command(flatten)]
        options: PlayOptions,
    },
    /// Run the orientation tracker and stream frames to the viewer.
    Track,
    /// Hub, tracker and playback together in one process.
    Run {
        midi: PathBuf,
        #[command(flatten)]
        options: PlayOptions,
        /// Record wand data for the length of the session.
        #[arg(short, long)]
        record: bool,
        /// Drive tempo and visuals from a recording instead of the wand.
        #[arg(long, value_name = "CSV", conflicts_with = "gesture")]
        replay: Option<PathBuf>,
    },
}
