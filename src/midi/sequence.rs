//! MIDI sequence container.
//!
//! A sequence is the set of tracks the sequencer plays and records to, plus
//! one distinguished tempo track whose tempo commands drive the tempo map.

use super::command::{Command, MidiMessage};
use super::track::{Track, TrackId};
use super::MusicTimeStamp;
use crate::timing::TempoEvent;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// A sequence shared between the control, tick and record paths.
///
/// The tick path only holds the lock while it copies out the commands of one
/// window, so a command appended by the record path is never seen half-built.
pub type SharedSequence = Arc<Mutex<Sequence>>;

/// An ordered collection of tracks plus a tempo track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    /// Sequence name.
    pub name: String,

    /// The tempo track. Only [`MidiMessage::Tempo`] commands are read from it.
    tempo_track: Track,

    /// Collection of tracks in the sequence.
    tracks: Vec<Track>,

    /// Explicit length in beats; `None` derives it from the tracks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<MusicTimeStamp>,
}

impl Sequence {
    /// Creates a new empty sequence with an empty tempo track.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tempo_track: Track::new("Tempo"),
            tracks: Vec::new(),
            length: None,
        }
    }

    /// Wraps the sequence for sharing with a sequencer.
    pub fn into_shared(self) -> SharedSequence {
        Arc::new(Mutex::new(self))
    }

    /// Returns the tempo track.
    pub fn tempo_track(&self) -> &Track {
        &self.tempo_track
    }

    /// Returns the tempo track for editing.
    pub fn tempo_track_mut(&mut self) -> &mut Track {
        &mut self.tempo_track
    }

    /// Adds a tempo change to the tempo track.
    pub fn set_tempo(&mut self, timestamp: MusicTimeStamp, bpm: f64) {
        self.tempo_track.add_command(Command::tempo(timestamp, bpm));
    }

    /// Returns the tempo events of the tempo track in timestamp order.
    pub fn tempo_events(&self) -> Vec<TempoEvent> {
        self.tempo_track
            .commands()
            .iter()
            .filter_map(|c| match c.message {
                MidiMessage::Tempo { bpm } => Some(TempoEvent::new(c.timestamp, bpm)),
                _ => None,
            })
            .collect()
    }

    /// Adds a track to the sequence, returning its ID.
    pub fn add_track(&mut self, track: Track) -> TrackId {
        let id = track.id;
        self.tracks.push(track);
        id
    }

    /// Creates and adds a new empty track.
    pub fn create_track(&mut self, name: impl Into<String>) -> TrackId {
        self.add_track(Track::new(name))
    }

    /// Removes a track by its ID.
    pub fn remove_track(&mut self, id: TrackId) -> Option<Track> {
        let pos = self.tracks.iter().position(|t| t.id == id)?;
        Some(self.tracks.remove(pos))
    }

    /// Returns a reference to a track by its ID.
    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// Returns a mutable reference to a track by its ID.
    pub fn track_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id == id)
    }

    /// Returns true when the sequence contains the track.
    pub fn contains_track(&self, id: TrackId) -> bool {
        self.tracks.iter().any(|t| t.id == id)
    }

    /// Returns all tracks in the sequence.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Returns the number of tracks in the sequence.
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Returns tracks that should be played (considering mute/solo states).
    ///
    /// If any track is soloed, only soloed tracks play.
    /// Otherwise, all non-muted tracks play.
    pub fn playable_tracks(&self) -> impl Iterator<Item = &Track> {
        let any_solo = self.tracks.iter().any(|t| t.solo);
        self.tracks.iter().filter(move |t| {
            if any_solo {
                t.solo && !t.muted
            } else {
                !t.muted
            }
        })
    }

    /// Returns the length of the sequence in beats.
    ///
    /// This is the explicit length if one is set, otherwise the maximum
    /// length across all tracks.
    pub fn length(&self) -> MusicTimeStamp {
        self.length.unwrap_or_else(|| {
            self.tracks
                .iter()
                .map(Track::length)
                .fold(0.0, f64::max)
        })
    }

    /// Sets an explicit length in beats, or clears it with `None`.
    pub fn set_length(&mut self, length: Option<MusicTimeStamp>) {
        self.length = length.filter(|l| l.is_finite() && *l > 0.0);
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new("Untitled Sequence")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_creation() {
        let sequence = Sequence::new("Test");
        assert_eq!(sequence.name, "Test");
        assert_eq!(sequence.track_count(), 0);
        assert_eq!(sequence.length(), 0.0);
        assert!(sequence.tempo_events().is_empty());
    }

    #[test]
    fn test_length_from_tracks_and_override() {
        let mut sequence = Sequence::new("Test");
        let a = sequence.create_track("A");
        let b = sequence.create_track("B");
        sequence
            .track_mut(a)
            .unwrap()
            .add_command(Command::note(0.0, 4.0, 0, 60, 100));
        sequence
            .track_mut(b)
            .unwrap()
            .add_command(Command::note(10.0, 2.0, 0, 60, 100));
        assert_eq!(sequence.length(), 12.0);

        sequence.set_length(Some(16.0));
        assert_eq!(sequence.length(), 16.0);

        sequence.set_length(Some(-1.0));
        assert_eq!(sequence.length(), 12.0);
    }

    #[test]
    fn test_tempo_events() {
        let mut sequence = Sequence::new("Test");
        sequence.set_tempo(8.0, 90.0);
        sequence.set_tempo(0.0, 120.0);
        sequence
            .tempo_track_mut()
            .add_command(Command::new(4.0, MidiMessage::Meta { kind: 0x03, data: vec![] }));

        let events = sequence.tempo_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], TempoEvent::new(0.0, 120.0));
        assert_eq!(events[1], TempoEvent::new(8.0, 90.0));
    }

    #[test]
    fn test_playable_tracks() {
        let mut sequence = Sequence::new("Test");
        let a = sequence.create_track("A");
        let b = sequence.create_track("B");
        let c = sequence.create_track("C");

        sequence.track_mut(a).unwrap().muted = true;
        let playable: Vec<_> = sequence.playable_tracks().map(|t| t.id).collect();
        assert_eq!(playable, vec![b, c]);

        sequence.track_mut(c).unwrap().solo = true;
        let playable: Vec<_> = sequence.playable_tracks().map(|t| t.id).collect();
        assert_eq!(playable, vec![c]);
    }

    #[test]
    fn test_remove_track() {
        let mut sequence = Sequence::new("Test");
        let a = sequence.create_track("A");
        assert!(sequence.contains_track(a));
        assert!(sequence.remove_track(a).is_some());
        assert!(!sequence.contains_track(a));
        assert!(sequence.remove_track(a).is_none());
    }
}
