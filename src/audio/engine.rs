//! Audio output and builtin synth creation.
//!
//! [`AudioOutput`] owns the rodio output stream. [`AudioEngine`] loads a
//! SoundFont and creates one [`SynthSink`] per track, each mixed into the
//! output as its own source.

use super::synth::{SynthSink, SAMPLE_RATE};
use crate::midi::TrackId;
use crate::scheduler::{shared_sink, SinkFactory, SinkRef};
use crate::timing::HostClock;
use anyhow::{Context, Result};
use rodio::{OutputStream, OutputStreamHandle};
use rustysynth::{SoundFont, Synthesizer, SynthesizerSettings};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// The default audio output device.
///
/// Must stay alive for as long as anything plays. Sound stops when it is
/// dropped.
pub struct AudioOutput {
    _stream: OutputStream,
    handle: OutputStreamHandle,
}

impl AudioOutput {
    /// Opens the default output device.
    ///
    /// # Errors
    ///
    /// Returns error if no audio output can be initialized
    pub fn open() -> Result<Self> {
        let (stream, handle) = OutputStream::try_default().context("Failed to open audio output")?;
        Ok(Self {
            _stream: stream,
            handle,
        })
    }

    pub fn handle(&self) -> OutputStreamHandle {
        self.handle.clone()
    }
}

/// Creates SoundFont synths playing to an audio output.
pub struct AudioEngine {
    soundfont: Arc<SoundFont>,
    handle: OutputStreamHandle,
    clock: Arc<dyn HostClock>,
}

impl AudioEngine {
    /// Creates an engine with the specified SoundFont.
    ///
    /// # Arguments
    ///
    /// * `soundfont_path` - Path to the SoundFont file (.sf2)
    /// * `output` - Where synths play
    /// * `clock` - Host clock scheduled commands are timed against
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The SoundFont file cannot be read
    /// - The SoundFont is invalid
    pub fn new<P: AsRef<Path>>(
        soundfont_path: P,
        output: &AudioOutput,
        clock: Arc<dyn HostClock>,
    ) -> Result<Self> {
        let mut file = BufReader::new(File::open(soundfont_path.as_ref()).with_context(|| {
            format!(
                "Failed to open SoundFont: {}",
                soundfont_path.as_ref().display()
            )
        })?);
        let soundfont = Arc::new(
            SoundFont::new(&mut file)
                .map_err(|e| anyhow::anyhow!("Failed to load SoundFont: {:?}", e))?,
        );

        Ok(Self {
            soundfont,
            handle: output.handle(),
            clock,
        })
    }

    /// Creates a synth and starts playing it.
    ///
    /// # Errors
    ///
    /// Returns error if the synthesizer cannot be created or the output
    /// has gone away
    pub fn create_synth(&self) -> Result<SynthSink> {
        let settings = SynthesizerSettings::new(SAMPLE_RATE as i32);
        let synth = Synthesizer::new(&self.soundfont, &settings)
            .map_err(|e| anyhow::anyhow!("Failed to create synthesizer: {:?}", e))?;
        let sink = SynthSink::new(synth);
        self.handle
            .play_raw(sink.source(Arc::clone(&self.clock)))
            .context("Failed to start audio playback")?;
        Ok(sink)
    }
}

impl SinkFactory for AudioEngine {
    fn create_sink(&self, track: TrackId) -> Option<SinkRef> {
        match self.create_synth() {
            Ok(sink) => {
                debug!(%track, "created builtin synth");
                Some(shared_sink(sink))
            }
            Err(e) => {
                warn!(%track, error = %e, "could not create builtin synth");
                None
            }
        }
    }
}
