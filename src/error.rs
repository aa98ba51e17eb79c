//! Error types for sequencer configuration.

use crate::midi::{MusicTimeStamp, TrackId};
use thiserror::Error;

/// Errors returned by mutating sequencer calls.
///
/// A call that returns an error leaves the previous configuration in place.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SequencerError {
    #[error("invalid playback rate {0}: must be finite and greater than zero")]
    InvalidRate(f64),

    #[error("invalid tempo {0} BPM: must be finite and greater than zero")]
    InvalidTempo(f64),

    #[error("invalid loop region [{start}, {end})")]
    InvalidLoopRegion {
        start: MusicTimeStamp,
        end: MusicTimeStamp,
    },

    #[error("invalid time stamp {0}")]
    InvalidTimeStamp(MusicTimeStamp),

    #[error("invalid pre-roll {0}: must be finite and not negative")]
    InvalidPreRoll(MusicTimeStamp),

    #[error("invalid sequence length {0}")]
    InvalidLength(MusicTimeStamp),

    #[error("track {0} is not part of the sequence")]
    UnknownTrack(TrackId),
}

/// Result type for sequencer operations.
pub type Result<T> = std::result::Result<T, SequencerError>;
