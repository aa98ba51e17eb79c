//! Musical time and host time.
//!
//! The [`TempoMap`] maps beats to seconds, the [`TimeConverter`] layers tempo
//! override, rate and looping on top of it, the [`Clock`] pins a beat to a
//! host time and the [`LoopController`] decides when playback wraps.

mod clock;
mod converter;
mod loop_controller;
mod tempo_map;

pub use clock::{Clock, ClockAnchor, HostClock, HostTime, ManualClock, MonotonicClock};
pub use converter::{ConversionOptions, TimeConverter};
pub use loop_controller::{LoopController, LoopEnd, LoopRegion, LoopState};
pub use tempo_map::{TempoEvent, TempoMap};
