//! Builtin software synths.
//!
//! Real-time MIDI synthesis using rustysynth, with audio output via rodio.
//! Tracks without a sink of their own play through an [`AudioEngine`]
//! synth when builtin synth creation is on.

pub mod engine;
pub mod synth;

pub use engine::{AudioEngine, AudioOutput};
pub use synth::{EventQueue, SynthSink, SynthSource, BUFFER_SIZE, SAMPLE_RATE};
