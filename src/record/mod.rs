//! Recording and the click track.

mod engine;
mod metronome;

pub use engine::{ClickTrackStatus, RecordEngine, DEFAULT_PRE_ROLL};
pub use metronome::{Click, ClickType, Metronome, ACCENT_KEY, PERCUSSION_CHANNEL, REGULAR_KEY};
