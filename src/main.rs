//! fourtrack - A four-track tape recorder on the command line.
//!
//! Drives the recording engine against the system's audio devices and
//! keeps cassettes in a project directory.
//!
//! # Usage
//!
//! ```bash
//! fourtrack new                                  # Create a blank cassette
//! fourtrack list                                 # List stored cassettes
//! fourtrack devices                              # List audio devices
//! fourtrack calibrate                            # Measure and store round-trip latency
//! fourtrack play <id> --from 10                  # Play a cassette from 10 s
//! fourtrack record <id> --track 2 --seconds 8    # Punch in on track 2 at the counter
//! fourtrack mixdown <id> -o mix.wav              # Export a stereo mix
//! fourtrack delete <id>                          # Remove a cassette
//! ```
//!
//! Set `RUST_LOG=fourtrack=debug` for engine logging.

use anyhow::{bail, Context, Result};
use fourtrack::audio::{AudioEngine, RodioBackend, TransportState};
use fourtrack::clock::SystemClock;
use fourtrack::config::EngineConfig;
use fourtrack::error::EngineError;
use fourtrack::events::EngineEvent;
use fourtrack::tape::{DirectoryStore, ProjectData, ProjectStore, TrackId};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_CONFIG_PATH: &str = "fourtrack.json";
const DEFAULT_STORE_PATH: &str = "cassettes";

/// What to do once the engine is up.
enum Command {
    New,
    List,
    Devices,
    Calibrate,
    Play {
        project: String,
        from: Option<f64>,
    },
    Record {
        project: String,
        track: u8,
        seconds: f64,
        at: Option<f64>,
    },
    Mixdown {
        project: String,
        output: PathBuf,
    },
    Delete {
        project: String,
    },
}

/// Command-line options for the application.
struct CliOptions {
    /// Engine configuration file.
    config: PathBuf,
    /// Directory holding stored cassettes.
    store: PathBuf,
    command: Command,
}

fn print_help(program: &str) {
    eprintln!("fourtrack - Four-track tape recorder");
    eprintln!();
    eprintln!("Usage: {} [OPTIONS] <COMMAND>", program);
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  new                                Create a blank cassette");
    eprintln!("  list                               List stored cassettes");
    eprintln!("  devices                            List audio input and output devices");
    eprintln!("  calibrate                          Measure round-trip latency and save it");
    eprintln!("  play <id> [--from S]               Play a cassette until the tape ends");
    eprintln!("  record <id> --track N --seconds S [--at S]");
    eprintln!("                                     Record onto track N for S seconds");
    eprintln!("  mixdown <id> -o PATH               Export a stereo mix as WAV");
    eprintln!("  delete <id>                        Remove a cassette");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config PATH  Engine configuration file (default: {})", DEFAULT_CONFIG_PATH);
    eprintln!("  -s, --store PATH   Cassette directory (default: {})", DEFAULT_STORE_PATH);
    eprintln!("  -h, --help         Print this help message");
}

fn parse_seconds(flag: &str, value: Option<&String>) -> Result<f64> {
    let value = value.with_context(|| format!("{} requires a value", flag))?;
    let seconds: f64 = value
        .parse()
        .with_context(|| format!("Invalid value for {}: {}", flag, value))?;
    if !seconds.is_finite() || seconds < 0.0 {
        bail!("{} must be a non-negative number of seconds", flag);
    }
    Ok(seconds)
}

impl CliOptions {
    /// Parses command-line arguments.
    ///
    /// Global options may appear anywhere; the first positional argument
    /// names the command.
    fn parse() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let program = args.first().map(String::as_str).unwrap_or("fourtrack");

        let mut config = PathBuf::from(DEFAULT_CONFIG_PATH);
        let mut store = PathBuf::from(DEFAULT_STORE_PATH);
        let mut positional: Vec<String> = Vec::new();
        let mut from = None;
        let mut at = None;
        let mut track = None;
        let mut seconds = None;
        let mut output = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--config" | "-c" => {
                    i += 1;
                    config = PathBuf::from(args.get(i).context("--config requires a path")?);
                }
                "--store" | "-s" => {
                    i += 1;
                    store = PathBuf::from(args.get(i).context("--store requires a path")?);
                }
                "--from" => {
                    i += 1;
                    from = Some(parse_seconds("--from", args.get(i))?);
                }
                "--at" => {
                    i += 1;
                    at = Some(parse_seconds("--at", args.get(i))?);
                }
                "--seconds" => {
                    i += 1;
                    seconds = Some(parse_seconds("--seconds", args.get(i))?);
                }
                "--track" | "-t" => {
                    i += 1;
                    let value = args.get(i).context("--track requires a number")?;
                    track = Some(
                        value
                            .parse::<u8>()
                            .with_context(|| format!("Invalid track number: {}", value))?,
                    );
                }
                "--output" | "-o" => {
                    i += 1;
                    output = Some(PathBuf::from(args.get(i).context("--output requires a path")?));
                }
                "--help" | "-h" => {
                    print_help(program);
                    std::process::exit(0);
                }
                other if other.starts_with('-') => {
                    eprintln!("Unknown option: {}", other);
                    eprintln!("Use --help for usage information");
                    std::process::exit(1);
                }
                other => positional.push(other.to_string()),
            }
            i += 1;
        }

        let project = || -> Result<String> {
            positional
                .get(1)
                .cloned()
                .context("This command requires a cassette id")
        };

        let command = match positional.first().map(String::as_str) {
            Some("new") => Command::New,
            Some("list") => Command::List,
            Some("devices") => Command::Devices,
            Some("calibrate") => Command::Calibrate,
            Some("play") => Command::Play {
                project: project()?,
                from,
            },
            Some("record") => Command::Record {
                project: project()?,
                track: track.context("record requires --track")?,
                seconds: seconds.context("record requires --seconds")?,
                at,
            },
            Some("mixdown") => Command::Mixdown {
                project: project()?,
                output: output.context("mixdown requires --output")?,
            },
            Some("delete") => Command::Delete {
                project: project()?,
            },
            Some(other) => bail!("Unknown command: {}", other),
            None => {
                print_help(program);
                std::process::exit(1);
            }
        };

        Ok(Self {
            config,
            store,
            command,
        })
    }
}

fn create_engine(config: &EngineConfig) -> AudioEngine {
    AudioEngine::new(
        config.clone(),
        Box::new(RodioBackend::new(config.output_sample_rate)),
        Arc::new(SystemClock::new()),
    )
}

fn load_project(store: &DirectoryStore, id: &str) -> Result<ProjectData> {
    store
        .load(id)?
        .with_context(|| format!("No cassette with id {}", id))
}

/// Ticks the engine until `done` returns true, printing the counter.
fn run_transport(
    engine: &mut AudioEngine,
    config: &EngineConfig,
    mut done: impl FnMut(&AudioEngine) -> bool,
) {
    let events = engine.subscribe();
    let interval = Duration::from_millis(config.tick_interval_ms);
    let mut last_print = Instant::now();

    loop {
        engine.tick();
        for event in events.try_iter() {
            match event {
                EngineEvent::Position(p) if last_print.elapsed() >= Duration::from_millis(500) => {
                    eprint!("\r{:>7.1}s", p);
                    last_print = Instant::now();
                }
                EngineEvent::State(state) => tracing::debug!("Transport {:?}", state),
                EngineEvent::Error(message) => eprintln!("\nError: {}", message),
                _ => {}
            }
        }
        if done(&*engine) {
            break;
        }
        std::thread::sleep(interval);
    }
    eprintln!();
}

/// Main entry point.
fn main() -> Result<()> {
    let cli = CliOptions::parse()?;

    // Initialize logging (RUST_LOG controls verbosity)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut config = EngineConfig::load_from_file(&cli.config)?;
    let store = DirectoryStore::new(&cli.store);

    match cli.command {
        Command::New => {
            let (id, project) = store.create()?;
            println!("{} {}", id, project.color);
        }
        Command::List => {
            for (id, project) in store.list()? {
                let recorded = project.tracks.iter().filter(|t| t.audio.is_some()).count();
                let title = if project.title.is_empty() {
                    "(untitled)"
                } else {
                    project.title.as_str()
                };
                println!("{} {} {} tracks recorded  {}", id, project.color, recorded, title);
            }
        }
        Command::Devices => {
            let engine = create_engine(&config);
            println!("Inputs:");
            for name in engine.input_devices() {
                println!("  {}", name);
            }
            println!("Outputs:");
            for name in engine.output_devices() {
                println!("  {}", name);
            }
        }
        Command::Calibrate => {
            let mut engine = create_engine(&config);
            eprintln!("Hold the microphone near the speaker...");
            let latency = engine
                .calibrate_latency()
                .context("Latency calibration failed")?;
            config.latency_ms = latency;
            config.save_to_file(&cli.config)?;
            println!("Latency set to {:.1}ms", latency);
        }
        Command::Play { project, from } => {
            let data = load_project(&store, &project)?;
            let mut engine = create_engine(&config);
            engine.set_tracks(data.tracks)?;
            engine.seek(from.unwrap_or(data.counter_position))?;
            engine.play()?;
            run_transport(&mut engine, &config, |e| e.state() != TransportState::Playing);
        }
        Command::Record {
            project,
            track,
            seconds,
            at,
        } => {
            let id = TrackId::new(track).ok_or(EngineError::InvalidTrack(track))?;
            let mut data = load_project(&store, &project)?;
            let mut engine = create_engine(&config);
            engine.set_tracks(data.tracks.clone())?;
            engine.seek(at.unwrap_or(data.counter_position))?;
            engine.toggle_arm(id)?;
            engine.record()?;

            let started = Instant::now();
            let length = Duration::from_secs_f64(seconds);
            run_transport(&mut engine, &config, |e| {
                e.state() != TransportState::Recording || started.elapsed() >= length
            });
            engine.stop()?;

            data.tracks = engine.tracks()?;
            data.counter_position = engine.position();
            store.save(&project, &data)?;
            println!("Recorded {:.1}s on track {}", seconds, track);
        }
        Command::Mixdown { project, output } => {
            let data = load_project(&store, &project)?;
            let mut engine = create_engine(&config);
            engine.set_tracks(data.tracks)?;
            engine.export_to_wav(&output)?;
            println!("Exported mix to {}", output.display());
        }
        Command::Delete { project } => {
            store.delete(&project)?;
        }
    }

    Ok(())
}
