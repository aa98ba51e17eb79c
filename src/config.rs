//! Sequencer configuration.
//!
//! A [`SequencerConfig`] holds every setting a [`Sequencer`] can be created
//! with and is stored as JSON. Missing fields take their defaults, so a
//! config file only needs the settings it changes.
//!
//! [`Sequencer`]: crate::Sequencer

use crate::midi::MusicTimeStamp;
use crate::record::{ClickTrackStatus, DEFAULT_PRE_ROLL};
use crate::scheduler::DEFAULT_LOOK_AHEAD_INTERVAL;
use crate::timing::LoopEnd;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Settings applied by [`Sequencer::with_config`](crate::Sequencer::with_config).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Playback rate, 1.0 is normal speed.
    pub rate: f64,
    /// Flat tempo replacing the tempo track, in BPM.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tempo_override: Option<f64>,
    /// Beats of lead-in before a recording start.
    pub pre_roll: MusicTimeStamp,
    /// Scheduling lookahead in seconds.
    pub maximum_look_ahead_interval: f64,
    pub click_track_status: ClickTrackStatus,
    /// Create a builtin synth for tracks without a sink.
    pub create_synths_if_needed: bool,
    pub looping: bool,
    pub loop_start: MusicTimeStamp,
    pub loop_end: LoopEnd,
    /// Beats per bar for the click track accent.
    pub beats_per_bar: u32,
    /// Semitones added to every played note.
    pub transpose: i8,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            rate: 1.0,
            tempo_override: None,
            pre_roll: DEFAULT_PRE_ROLL,
            maximum_look_ahead_interval: DEFAULT_LOOK_AHEAD_INTERVAL,
            click_track_status: ClickTrackStatus::EnabledInRecord,
            create_synths_if_needed: true,
            looping: false,
            loop_start: 0.0,
            loop_end: LoopEnd::EndOfSequence,
            beats_per_bar: 4,
            transpose: 0,
        }
    }
}

impl SequencerConfig {
    /// Parses a config from JSON.
    ///
    /// # Errors
    ///
    /// Returns error if parsing fails
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serializes the config to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Loads a config from a JSON file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the input file
    ///
    /// # Errors
    ///
    /// Returns error if file reading or parsing fails
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Saves the config to a JSON file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let json = self
            .to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)
    }
}
