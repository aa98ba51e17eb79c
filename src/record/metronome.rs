//! Click track generation.
//!
//! Clicks fall on every whole beat. The first beat of each bar is accented
//! with a different percussion key and a higher velocity.

use crate::midi::{MidiMessage, MusicTimeStamp, RangeBounds};
use serde::{Deserialize, Serialize};

/// General MIDI percussion channel (channel 10, zero-based).
pub const PERCUSSION_CHANNEL: u8 = 9;
/// Hi wood block.
pub const ACCENT_KEY: u8 = 76;
/// Low wood block.
pub const REGULAR_KEY: u8 = 77;

/// Metronome click type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickType {
    /// Click on first beat of bar (accent/downbeat)
    Accent,
    /// Click on other beats
    Regular,
}

/// A click at a beat position, as a note-on/note-off pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Click {
    pub beat: MusicTimeStamp,
    pub click_type: ClickType,
    pub note_on: MidiMessage,
    pub note_off: MidiMessage,
}

/// Generates clicks for beat ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metronome {
    pub beats_per_bar: u32,
    pub channel: u8,
    pub accent_key: u8,
    pub regular_key: u8,
    pub accent_velocity: u8,
    pub regular_velocity: u8,
    /// Length of a click in beats.
    pub click_length: MusicTimeStamp,
}

impl Metronome {
    pub fn new(beats_per_bar: u32) -> Self {
        Self {
            beats_per_bar: beats_per_bar.max(1),
            ..Self::default()
        }
    }

    /// Click type for a whole beat.
    pub fn click_type(&self, beat: i64) -> ClickType {
        if beat.rem_euclid(self.beats_per_bar.max(1) as i64) == 0 {
            ClickType::Accent
        } else {
            ClickType::Regular
        }
    }

    /// Clicks whose beats fall between `from` and `to`, honoring `bounds`.
    pub fn clicks_in_range(
        &self,
        from: MusicTimeStamp,
        to: MusicTimeStamp,
        bounds: RangeBounds,
    ) -> Vec<Click> {
        if !(from.is_finite() && to.is_finite()) || to < from {
            return Vec::new();
        }
        let mut first = from.ceil();
        if first == from && !bounds.include_start {
            first += 1.0;
        }
        let mut clicks = Vec::new();
        let mut beat = first;
        while beat < to || (beat == to && bounds.include_end) {
            clicks.push(self.click(beat));
            beat += 1.0;
        }
        clicks
    }

    fn click(&self, beat: MusicTimeStamp) -> Click {
        let click_type = self.click_type(beat as i64);
        let (key, velocity) = match click_type {
            ClickType::Accent => (self.accent_key, self.accent_velocity),
            ClickType::Regular => (self.regular_key, self.regular_velocity),
        };
        let channel = self.channel & 0x0F;
        Click {
            beat,
            click_type,
            note_on: MidiMessage::NoteOn {
                channel,
                key,
                velocity,
            },
            note_off: MidiMessage::NoteOff {
                channel,
                key,
                velocity: 0,
            },
        }
    }
}

impl Default for Metronome {
    fn default() -> Self {
        Self {
            beats_per_bar: 4,
            channel: PERCUSSION_CHANNEL,
            accent_key: ACCENT_KEY,
            regular_key: REGULAR_KEY,
            accent_velocity: 127,
            regular_velocity: 100,
            click_length: 0.25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accent_on_downbeat() {
        let metronome = Metronome::new(3);
        let types: Vec<_> = (0..6).map(|b| metronome.click_type(b)).collect();
        assert_eq!(
            types,
            vec![
                ClickType::Accent,
                ClickType::Regular,
                ClickType::Regular,
                ClickType::Accent,
                ClickType::Regular,
                ClickType::Regular,
            ]
        );
    }

    #[test]
    fn test_clicks_in_range_bounds() {
        let metronome = Metronome::default();
        let beats = |from, to, bounds| -> Vec<f64> {
            metronome
                .clicks_in_range(from, to, bounds)
                .iter()
                .map(|c| c.beat)
                .collect()
        };
        assert_eq!(beats(0.0, 2.0, RangeBounds::CLOSED), vec![0.0, 1.0, 2.0]);
        assert_eq!(beats(0.0, 2.0, RangeBounds::AFTER_START), vec![1.0, 2.0]);
        assert_eq!(beats(0.0, 2.0, RangeBounds::BEFORE_END), vec![0.0, 1.0]);
        assert_eq!(beats(0.5, 0.9, RangeBounds::CLOSED), Vec::<f64>::new());
        assert_eq!(beats(3.0, 1.0, RangeBounds::CLOSED), Vec::<f64>::new());
    }

    #[test]
    fn test_click_messages() {
        let metronome = Metronome::default();
        let clicks = metronome.clicks_in_range(4.0, 5.0, RangeBounds::CLOSED);
        assert_eq!(
            clicks[0].note_on,
            MidiMessage::NoteOn {
                channel: PERCUSSION_CHANNEL,
                key: ACCENT_KEY,
                velocity: 127
            }
        );
        assert_eq!(clicks[1].click_type, ClickType::Regular);
        assert!(clicks[1].note_off.is_note_off());
    }
}
