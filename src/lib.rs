//! midiseq - a MIDI sequencing engine.
//!
//! Plays and records beat-timed MIDI sequences against a host clock. A
//! tempo map converts beats to seconds, an optional loop region repeats
//! part of the sequence, and a lookahead scheduler hands commands to sinks
//! slightly ahead of the time they should sound.
//!
//! The engine is driven from outside: call [`Sequencer::process_tick`]
//! every few milliseconds while playing.

pub mod audio;
pub mod config;
pub mod error;
pub mod midi;
pub mod record;
pub mod scheduler;
pub mod sequencer;
pub mod timing;

// Re-export commonly used types
pub use config::SequencerConfig;
pub use error::{Result, SequencerError};
pub use midi::{Command, MidiMessage, MusicTimeStamp, Sequence, SharedSequence, Track, TrackId};
pub use record::{ClickTrackStatus, Metronome};
pub use scheduler::{CommandSchedulingSink, MemorySink, ScheduledCommand, SinkRef};
pub use sequencer::{Sequencer, TransportState};
pub use timing::{ConversionOptions, HostTime, LoopEnd, LoopRegion, LoopState, TempoMap};
