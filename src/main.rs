//! midiseq - plays a Standard MIDI File through the sequencing engine.
//!
//! Tracks play through SoundFont synths. With `--dry-run`, scheduled
//! commands are printed instead.
//!
//! # Usage
//!
//! ```bash
//! midiseq song.mid --soundfont gm.sf2
//! midiseq song.mid --soundfont gm.sf2 --loop 8 16 --rate 1.5
//! RUST_LOG=midiseq=debug midiseq song.mid --dry-run
//! ```

use anyhow::{bail, Context, Result};
use midiseq::audio::{AudioEngine, AudioOutput};
use midiseq::midi::note_to_name;
use midiseq::scheduler::{shared_sink, CommandSchedulingSink, ScheduledCommand};
use midiseq::timing::{HostClock, LoopEnd, MonotonicClock};
use midiseq::{MidiMessage, Sequence, Sequencer, SequencerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// How often the sequencer is ticked.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Command-line options for the application.
struct CliOptions {
    file: PathBuf,
    soundfont: Option<PathBuf>,
    config: Option<PathBuf>,
    loop_region: Option<(f64, f64)>,
    rate: Option<f64>,
    tempo: Option<f64>,
    start: f64,
    dry_run: bool,
}

impl CliOptions {
    /// Parses command-line arguments.
    ///
    /// Supports:
    /// - `<file.mid>`: The Standard MIDI File to play
    /// - `--soundfont <path>` or `-sf <path>`: SoundFont for the builtin synths
    /// - `--config <path>`: Sequencer settings as JSON
    /// - `--loop <start> <end>`: Loop between two beats
    /// - `--rate <rate>`: Playback rate
    /// - `--tempo <bpm>`: Flat tempo replacing the file's tempo map
    /// - `--start <beat>`: Start position
    /// - `--dry-run`: Print commands instead of playing them
    /// - `--help` or `-h`: Print help and exit
    fn parse() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let mut file = None;
        let mut soundfont = None;
        let mut config = None;
        let mut loop_region = None;
        let mut rate = None;
        let mut tempo = None;
        let mut start = 0.0;
        let mut dry_run = false;
        let mut i = 1;

        while i < args.len() {
            match args[i].as_str() {
                "--soundfont" | "-sf" => {
                    i += 1;
                    soundfont = Some(PathBuf::from(arg_value(&args, i, "--soundfont")?));
                }
                "--config" => {
                    i += 1;
                    config = Some(PathBuf::from(arg_value(&args, i, "--config")?));
                }
                "--loop" => {
                    let loop_start = arg_number(&args, i + 1, "--loop")?;
                    let loop_end = arg_number(&args, i + 2, "--loop")?;
                    loop_region = Some((loop_start, loop_end));
                    i += 2;
                }
                "--rate" => {
                    i += 1;
                    rate = Some(arg_number(&args, i, "--rate")?);
                }
                "--tempo" => {
                    i += 1;
                    tempo = Some(arg_number(&args, i, "--tempo")?);
                }
                "--start" => {
                    i += 1;
                    start = arg_number(&args, i, "--start")?;
                }
                "--dry-run" => dry_run = true,
                "--help" | "-h" => {
                    eprintln!("midiseq - MIDI sequencing engine");
                    eprintln!();
                    eprintln!("Usage: midiseq FILE.mid [OPTIONS]");
                    eprintln!();
                    eprintln!("Options:");
                    eprintln!("  -sf, --soundfont PATH  SoundFont file (.sf2) for the builtin synths");
                    eprintln!("  --config PATH          Sequencer settings (JSON)");
                    eprintln!("  --loop START END       Loop between two beats");
                    eprintln!("  --rate RATE            Playback rate (1.0 is normal speed)");
                    eprintln!("  --tempo BPM            Replace the tempo map with a flat tempo");
                    eprintln!("  --start BEAT           Start position in beats");
                    eprintln!("  --dry-run              Print commands instead of playing them");
                    eprintln!("  -h, --help             Print this help message");
                    std::process::exit(0);
                }
                other if other.starts_with('-') => {
                    bail!("Unknown option: {} (use --help for usage information)", other);
                }
                other => file = Some(PathBuf::from(other)),
            }
            i += 1;
        }

        let file = file.context("No MIDI file given (use --help for usage information)")?;
        Ok(Self {
            file,
            soundfont,
            config,
            loop_region,
            rate,
            tempo,
            start,
            dry_run,
        })
    }
}

fn arg_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i)
        .map(String::as_str)
        .with_context(|| format!("{} requires an argument", flag))
}

fn arg_number(args: &[String], i: usize, flag: &str) -> Result<f64> {
    let raw = arg_value(args, i, flag)?;
    raw.parse()
        .with_context(|| format!("{} expects a number, got {:?}", flag, raw))
}

/// Prints scheduled note-ons to stdout.
struct PrintSink {
    label: String,
}

impl CommandSchedulingSink for PrintSink {
    fn schedule(&mut self, commands: &[ScheduledCommand]) {
        for command in commands {
            if let MidiMessage::NoteOn {
                channel,
                key,
                velocity,
            } = command.message
            {
                if velocity > 0 {
                    println!(
                        "{:>10.3}  {:<12} ch{:<2} {:<4} vel {}",
                        command.beat,
                        self.label,
                        channel + 1,
                        note_to_name(key),
                        velocity
                    );
                }
            }
        }
    }

    fn flush_pending_note_offs(&mut self) {}
}

/// Main entry point.
fn main() -> Result<()> {
    let cli = CliOptions::parse()?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let data = std::fs::read(&cli.file)
        .with_context(|| format!("Failed to read MIDI file: {}", cli.file.display()))?;
    let name = cli
        .file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Untitled Sequence".to_string());
    let sequence = Sequence::from_smf_bytes(name, &data)
        .with_context(|| format!("Failed to parse MIDI file: {}", cli.file.display()))?;
    info!(
        tracks = sequence.track_count(),
        length = sequence.length(),
        "loaded sequence"
    );
    let tracks: Vec<_> = sequence
        .tracks()
        .iter()
        .map(|track| (track.id, track.name.clone()))
        .collect();

    let mut config = match &cli.config {
        Some(path) => SequencerConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => SequencerConfig::default(),
    };
    if let Some((start, end)) = cli.loop_region {
        config.looping = true;
        config.loop_start = start;
        config.loop_end = LoopEnd::Beat(end);
    }
    if let Some(rate) = cli.rate {
        config.rate = rate;
    }
    if cli.tempo.is_some() {
        config.tempo_override = cli.tempo;
    }

    let clock: Arc<dyn HostClock> = Arc::new(MonotonicClock::new());
    let mut sequencer = Sequencer::with_host_clock(sequence.into_shared(), Arc::clone(&clock));
    sequencer
        .apply_config(&config)
        .context("Invalid sequencer settings")?;

    // Kept alive until playback ends
    let mut audio_output = None;
    if cli.dry_run {
        for (id, name) in tracks {
            sequencer.set_command_scheduler(id, Some(shared_sink(PrintSink { label: name })))?;
        }
    } else {
        let soundfont = cli
            .soundfont
            .as_ref()
            .context("No SoundFont given (use --soundfont PATH or --dry-run)")?;
        let output = AudioOutput::open()?;
        let engine = AudioEngine::new(soundfont, &output, Arc::clone(&clock))?;
        sequencer.set_metronome(Some(shared_sink(engine.create_synth()?)));
        sequencer.set_sink_factory(Some(Box::new(engine)));
        sequencer.set_create_synths_if_needed(true);
        audio_output = Some(output);
    }

    sequencer
        .start_playback_at(cli.start)
        .context("Failed to start playback")?;
    while sequencer.is_playing() {
        sequencer.process_tick();
        std::thread::sleep(TICK_INTERVAL);
    }
    // Let the last release tails ring out
    if audio_output.is_some() {
        std::thread::sleep(Duration::from_millis(500));
    }
    info!("playback finished");
    Ok(())
}
