//! Tempo map: beats <-> seconds along a tempo track.
//!
//! The tempo track is split into intervals of constant tempo. A table of the
//! elapsed seconds at the start of each interval makes a conversion one
//! binary search plus one multiplication.

use crate::midi::{MusicTimeStamp, DEFAULT_TEMPO};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A tempo change at a beat position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempoEvent {
    /// Position of the change in beats.
    pub beat: MusicTimeStamp,
    /// New tempo in beats per minute.
    pub bpm: f64,
}

impl TempoEvent {
    pub fn new(beat: MusicTimeStamp, bpm: f64) -> Self {
        Self { beat, bpm }
    }

    fn is_valid(&self) -> bool {
        self.bpm.is_finite() && self.bpm > 0.0 && self.beat.is_finite()
    }
}

/// Seconds per beat at a tempo.
#[inline]
fn seconds_per_beat(bpm: f64) -> f64 {
    60.0 / bpm
}

/// Piecewise-constant tempo map.
///
/// Always holds at least one event, at beat 0.
#[derive(Debug, Clone, PartialEq)]
pub struct TempoMap {
    /// Tempo events sorted by beat, first one at beat 0.
    events: Vec<TempoEvent>,
    /// Seconds elapsed at each event, parallel to `events`.
    seconds_at_event: Vec<f64>,
}

impl TempoMap {
    /// Builds a tempo map from tempo events in any order.
    ///
    /// Events with a zero, negative or non-finite tempo are skipped, so the
    /// previous valid tempo stays in effect across them. When several events
    /// share a beat the last one wins. If nothing sits at beat 0 an event at
    /// [`DEFAULT_TEMPO`] is synthesized there. Events before beat 0 only
    /// contribute their tempo to beat 0.
    pub fn new(events: impl IntoIterator<Item = TempoEvent>) -> Self {
        let mut valid: Vec<TempoEvent> = Vec::new();
        for event in events {
            if event.is_valid() {
                valid.push(event);
            } else {
                warn!(
                    beat = event.beat,
                    bpm = event.bpm,
                    "skipping invalid tempo event"
                );
            }
        }
        // Stable sort keeps insertion order for duplicates
        valid.sort_by(|a, b| a.beat.total_cmp(&b.beat));

        let mut sorted: Vec<TempoEvent> = Vec::with_capacity(valid.len() + 1);
        let mut initial = TempoEvent::new(0.0, DEFAULT_TEMPO);
        for event in valid {
            if event.beat <= 0.0 {
                initial.bpm = event.bpm;
                continue;
            }
            match sorted.last_mut() {
                Some(last) if last.beat == event.beat => *last = event,
                _ => sorted.push(event),
            }
        }
        sorted.insert(0, initial);

        let mut seconds_at_event = Vec::with_capacity(sorted.len());
        let mut elapsed = 0.0;
        for (i, event) in sorted.iter().enumerate() {
            if i > 0 {
                let prev = &sorted[i - 1];
                elapsed += (event.beat - prev.beat) * seconds_per_beat(prev.bpm);
            }
            seconds_at_event.push(elapsed);
        }

        Self {
            events: sorted,
            seconds_at_event,
        }
    }

    /// A map with a single constant tempo.
    pub fn constant(bpm: f64) -> Self {
        Self::new([TempoEvent::new(0.0, bpm)])
    }

    /// Returns the tempo events, starting at beat 0.
    pub fn events(&self) -> &[TempoEvent] {
        &self.events
    }

    /// Index of the interval containing `beat`.
    fn index_for_beat(&self, beat: MusicTimeStamp) -> usize {
        self.events
            .partition_point(|e| e.beat <= beat)
            .saturating_sub(1)
    }

    /// Index of the interval containing `seconds`.
    fn index_for_seconds(&self, seconds: f64) -> usize {
        self.seconds_at_event
            .partition_point(|s| *s <= seconds)
            .saturating_sub(1)
    }

    /// Returns the tempo in effect at `beat`.
    pub fn tempo_at(&self, beat: MusicTimeStamp) -> f64 {
        self.events[self.index_for_beat(beat)].bpm
    }

    /// Seconds elapsed from beat 0 to `beat`.
    ///
    /// Beats before 0 extrapolate with the initial tempo.
    pub fn seconds_for_beat(&self, beat: MusicTimeStamp) -> f64 {
        let i = self.index_for_beat(beat);
        let event = &self.events[i];
        self.seconds_at_event[i] + (beat - event.beat) * seconds_per_beat(event.bpm)
    }

    /// Beat reached after `seconds` from beat 0. Inverse of
    /// [`seconds_for_beat`](Self::seconds_for_beat).
    pub fn beat_for_seconds(&self, seconds: f64) -> MusicTimeStamp {
        let i = self.index_for_seconds(seconds);
        let event = &self.events[i];
        event.beat + (seconds - self.seconds_at_event[i]) / seconds_per_beat(event.bpm)
    }
}

impl Default for TempoMap {
    fn default() -> Self {
        Self::constant(DEFAULT_TEMPO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn many_changes() -> TempoMap {
        TempoMap::new([
            TempoEvent::new(0.0, 120.0),
            TempoEvent::new(4.0, 60.0),
            TempoEvent::new(6.5, 180.0),
            TempoEvent::new(10.0, 90.0),
            TempoEvent::new(11.25, 240.0),
            TempoEvent::new(16.0, 75.0),
        ])
    }

    #[test]
    fn test_constant_tempo() {
        let map = TempoMap::constant(120.0);
        assert_relative_eq!(map.seconds_for_beat(0.0), 0.0);
        assert_relative_eq!(map.seconds_for_beat(1.0), 0.5);
        assert_relative_eq!(map.seconds_for_beat(16.0), 8.0);
        assert_relative_eq!(map.beat_for_seconds(8.0), 16.0);
    }

    #[test]
    fn test_tempo_change() {
        // 4 beats at 120 (2s), then 60 BPM (1s per beat)
        let map = TempoMap::new([TempoEvent::new(0.0, 120.0), TempoEvent::new(4.0, 60.0)]);
        assert_relative_eq!(map.seconds_for_beat(4.0), 2.0);
        assert_relative_eq!(map.seconds_for_beat(6.0), 4.0);
        assert_relative_eq!(map.beat_for_seconds(3.0), 5.0);
        assert_eq!(map.tempo_at(3.99), 120.0);
        assert_eq!(map.tempo_at(4.0), 60.0);
    }

    #[test]
    fn test_round_trip() {
        let maps = [
            TempoMap::constant(97.0),
            TempoMap::new([TempoEvent::new(0.0, 120.0), TempoEvent::new(3.0, 45.0)]),
            many_changes(),
        ];
        for map in &maps {
            let mut beat = 0.0;
            while beat < 24.0 {
                let seconds = map.seconds_for_beat(beat);
                assert_relative_eq!(map.beat_for_seconds(seconds), beat, epsilon = 1e-9);
                beat += 0.37;
            }
        }
    }

    #[test]
    fn test_strictly_increasing() {
        let map = many_changes();
        let mut previous = map.seconds_for_beat(0.0);
        for step in 1..200 {
            let seconds = map.seconds_for_beat(step as f64 * 0.1);
            assert!(seconds > previous);
            previous = seconds;
        }
    }

    #[test]
    fn test_synthesizes_initial_event() {
        let empty = TempoMap::new([]);
        assert_eq!(empty.events(), &[TempoEvent::new(0.0, DEFAULT_TEMPO)]);

        // First change at beat 2: default tempo covers [0, 2)
        let late = TempoMap::new([TempoEvent::new(2.0, 60.0)]);
        assert_eq!(late.events().len(), 2);
        assert_relative_eq!(late.seconds_for_beat(2.0), 1.0);
        assert_relative_eq!(late.seconds_for_beat(3.0), 2.0);
    }

    #[test]
    fn test_invalid_tempo_is_skipped() {
        let map = TempoMap::new([
            TempoEvent::new(0.0, 120.0),
            TempoEvent::new(2.0, 0.0),
            TempoEvent::new(3.0, -60.0),
            TempoEvent::new(4.0, f64::NAN),
        ]);
        assert_eq!(map.events().len(), 1);
        assert_relative_eq!(map.seconds_for_beat(8.0), 4.0);
    }

    #[test]
    fn test_duplicate_beat_last_wins() {
        let map = TempoMap::new([
            TempoEvent::new(0.0, 120.0),
            TempoEvent::new(4.0, 60.0),
            TempoEvent::new(4.0, 240.0),
        ]);
        assert_eq!(map.events().len(), 2);
        assert_eq!(map.tempo_at(5.0), 240.0);
    }

    #[test]
    fn test_negative_beats_extrapolate() {
        let map = TempoMap::constant(60.0);
        assert_relative_eq!(map.seconds_for_beat(-2.0), -2.0);
        assert_relative_eq!(map.beat_for_seconds(-2.0), -2.0);
    }
}
