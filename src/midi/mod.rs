//! MIDI data structures for representing sequences.
//!
//! This module provides the commands, tracks and sequences the sequencer
//! reads from and records to. Positions are expressed in beats
//! ([`MusicTimeStamp`]), independent of tempo.

mod command;
mod sequence;
mod smf;
mod track;

pub use command::{Command, MidiMessage};
pub use sequence::{Sequence, SharedSequence};
pub use smf::SmfError;
pub use track::{RangeBounds, Track, TrackId};

/// A position in musical time, in beats (quarter notes).
pub type MusicTimeStamp = f64;

/// Default tempo in beats per minute, used where the tempo track is silent.
pub const DEFAULT_TEMPO: f64 = 120.0;

/// Standard MIDI note names for display purposes.
pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Converts a MIDI note number to a human-readable note name with octave.
///
/// # Examples
///
/// ```
/// use midiseq::midi::note_to_name;
///
/// let name = note_to_name(60); // Middle C
/// assert_eq!(name, "C4");
/// ```
pub fn note_to_name(note: u8) -> String {
    let octave = (note / 12) as i8 - 1; // MIDI octave convention
    let note_index = (note % 12) as usize;
    format!("{}{}", NOTE_NAMES[note_index], octave)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_to_name() {
        assert_eq!(note_to_name(60), "C4");
        assert_eq!(note_to_name(69), "A4");
        assert_eq!(note_to_name(0), "C-1");
        assert_eq!(note_to_name(127), "G9");
    }
}
