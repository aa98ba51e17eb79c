//! Recording onto record-enabled tracks.
//!
//! Incoming messages are stamped with the current playback position and
//! appended to every record-enabled track. A note-on is held until its
//! note-off arrives and then stored as a single note command with a
//! duration.
//!
//! Recording starts `pre_roll` beats before the requested position. The
//! lead-in is audible but nothing that arrives during it is recorded.

use super::metronome::Metronome;
use crate::error::{Result, SequencerError};
use crate::midi::{Command, MidiMessage, MusicTimeStamp, Sequence, TrackId};
use crate::scheduler::{ScheduledCommand, ScheduledSegment};
use crate::timing::TimeConverter;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace};

/// Default pre-roll in beats.
pub const DEFAULT_PRE_ROLL: MusicTimeStamp = 4.0;

/// When the click track can be heard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClickTrackStatus {
    /// Never.
    Disabled,
    /// While recording, pre-roll included.
    #[default]
    EnabledInRecord,
    /// While recording, during the pre-roll only.
    EnabledOnlyInPreRoll,
    /// Whenever the transport is playing.
    AlwaysEnabled,
}

impl ClickTrackStatus {
    /// Whether a click at a position with the given recording state sounds.
    pub fn is_audible(&self, recording: bool, in_pre_roll: bool) -> bool {
        match self {
            ClickTrackStatus::Disabled => false,
            ClickTrackStatus::EnabledInRecord => recording,
            ClickTrackStatus::EnabledOnlyInPreRoll => recording && in_pre_roll,
            ClickTrackStatus::AlwaysEnabled => true,
        }
    }
}

/// Captures messages onto record-enabled tracks.
#[derive(Debug, Clone)]
pub struct RecordEngine {
    recording: bool,
    /// The requested recording start, after the pre-roll.
    record_start: MusicTimeStamp,
    pre_roll: MusicTimeStamp,
    record_enabled: BTreeSet<TrackId>,
    /// Note-ons waiting for a note-off, by (channel, key).
    held_notes: HashMap<(u8, u8), (MusicTimeStamp, u8)>,
    click_track_status: ClickTrackStatus,
    metronome: Metronome,
}

impl RecordEngine {
    pub fn new() -> Self {
        Self {
            recording: false,
            record_start: 0.0,
            pre_roll: DEFAULT_PRE_ROLL,
            record_enabled: BTreeSet::new(),
            held_notes: HashMap::new(),
            click_track_status: ClickTrackStatus::default(),
            metronome: Metronome::default(),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn record_start(&self) -> MusicTimeStamp {
        self.record_start
    }

    pub fn pre_roll(&self) -> MusicTimeStamp {
        self.pre_roll
    }

    /// Sets the pre-roll in beats.
    pub fn set_pre_roll(&mut self, beats: MusicTimeStamp) -> Result<()> {
        if !beats.is_finite() || beats < 0.0 {
            return Err(SequencerError::InvalidPreRoll(beats));
        }
        self.pre_roll = beats;
        Ok(())
    }

    pub fn click_track_status(&self) -> ClickTrackStatus {
        self.click_track_status
    }

    pub fn set_click_track_status(&mut self, status: ClickTrackStatus) {
        self.click_track_status = status;
    }

    pub fn metronome(&self) -> &Metronome {
        &self.metronome
    }

    pub fn set_metronome(&mut self, metronome: Metronome) {
        self.metronome = metronome;
    }

    pub fn record_enabled_tracks(&self) -> impl Iterator<Item = TrackId> + '_ {
        self.record_enabled.iter().copied()
    }

    pub fn set_record_enabled_tracks(&mut self, tracks: impl IntoIterator<Item = TrackId>) {
        self.record_enabled = tracks.into_iter().collect();
    }

    /// Position playback starts from for a recording requested at
    /// `requested`. Never before beat 0.
    pub fn effective_start(&self, requested: MusicTimeStamp) -> MusicTimeStamp {
        (requested - self.pre_roll).max(0.0)
    }

    /// Starts capturing from `requested`.
    pub fn arm(&mut self, requested: MusicTimeStamp) {
        self.recording = true;
        self.record_start = requested;
        self.held_notes.clear();
        debug!(record_start = requested, pre_roll = self.pre_roll, "recording armed");
    }

    /// Stops capturing. Notes still held end at `position`.
    pub fn disarm(&mut self, position: MusicTimeStamp, sequence: &mut Sequence) {
        if !self.recording {
            return;
        }
        let mut held: Vec<_> = self.held_notes.drain().collect();
        held.sort_by(|a, b| a.1 .0.total_cmp(&b.1 .0));
        for ((channel, key), (start, velocity)) in held {
            let note = Command::note(start, (position - start).max(0.0), channel, key, velocity);
            self.append(note, sequence);
        }
        self.recording = false;
        debug!(position, "recording stopped");
    }

    /// True while recording and before the requested start.
    pub fn is_in_pre_roll(&self, position: MusicTimeStamp) -> bool {
        self.recording && position < self.record_start
    }

    /// Records `command` at `position`.
    ///
    /// Returns false when nothing was captured: not recording, still in the
    /// pre-roll, or a note-off without a matching note-on.
    pub fn record(
        &mut self,
        command: &Command,
        position: MusicTimeStamp,
        sequence: &mut Sequence,
    ) -> bool {
        if !self.recording {
            return false;
        }
        if position < self.record_start {
            trace!(position, "ignoring command during pre-roll");
            return false;
        }
        let message = &command.message;
        if message.is_note_on() {
            if let MidiMessage::NoteOn {
                channel,
                key,
                velocity,
            } = *message
            {
                self.held_notes.insert((channel, key), (position, velocity));
            }
            return true;
        }
        if message.is_note_off() {
            let (MidiMessage::NoteOn { channel, key, .. } | MidiMessage::NoteOff { channel, key, .. }) =
                *message
            else {
                return false;
            };
            let Some((start, velocity)) = self.held_notes.remove(&(channel, key)) else {
                return false;
            };
            let note = Command::note(start, (position - start).max(0.0), channel, key, velocity);
            self.append(note, sequence);
            return true;
        }
        self.append(command.at(position), sequence);
        true
    }

    fn append(&self, command: Command, sequence: &mut Sequence) {
        for id in &self.record_enabled {
            if let Some(track) = sequence.track_mut(*id) {
                track.add_command(command.clone());
            }
        }
    }

    /// Click commands for a scheduled segment, limited to the clicks the
    /// click-track status lets through.
    pub fn click_commands(
        &self,
        segment: &ScheduledSegment,
        converter: &TimeConverter,
    ) -> Vec<ScheduledCommand> {
        let mut batch = Vec::new();
        for click in self
            .metronome
            .clicks_in_range(segment.from, segment.to, segment.bounds)
        {
            let audible = self
                .click_track_status
                .is_audible(self.recording, self.is_in_pre_roll(click.beat));
            if !audible {
                continue;
            }
            let off_beat = click.beat + self.metronome.click_length;
            batch.push(ScheduledCommand::new(
                converter.host_time_for_beat(&segment.anchor, click.beat),
                click.beat,
                click.note_on,
            ));
            batch.push(ScheduledCommand::new(
                converter.host_time_for_beat(&segment.anchor, off_beat),
                off_beat,
                click.note_off,
            ));
        }
        batch
    }
}

impl Default for RecordEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::RangeBounds;
    use crate::timing::{ClockAnchor, HostTime};

    fn note_on(key: u8) -> Command {
        Command::new(
            0.0,
            MidiMessage::NoteOn {
                channel: 0,
                key,
                velocity: 90,
            },
        )
    }

    fn note_off(key: u8) -> Command {
        Command::new(
            0.0,
            MidiMessage::NoteOff {
                channel: 0,
                key,
                velocity: 0,
            },
        )
    }

    fn armed(sequence: &mut Sequence) -> (RecordEngine, TrackId) {
        let track = sequence.create_track("rec");
        let mut engine = RecordEngine::new();
        engine.set_record_enabled_tracks([track]);
        engine.arm(8.0);
        (engine, track)
    }

    #[test]
    fn test_not_recording_is_noop() {
        let mut sequence = Sequence::new("s");
        let track = sequence.create_track("rec");
        let mut engine = RecordEngine::new();
        engine.set_record_enabled_tracks([track]);
        assert!(!engine.record(&note_on(60), 1.0, &mut sequence));
        assert!(sequence.track(track).unwrap().is_empty());
    }

    #[test]
    fn test_note_pairs_become_notes() {
        let mut sequence = Sequence::new("s");
        let (mut engine, track) = armed(&mut sequence);
        assert!(engine.record(&note_on(60), 8.5, &mut sequence));
        assert!(engine.record(&note_off(60), 9.25, &mut sequence));

        let commands = sequence.track(track).unwrap().commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].timestamp, 8.5);
        assert_eq!(commands[0].duration, 0.75);
        assert!(matches!(commands[0].message, MidiMessage::Note { key: 60, velocity: 90, .. }));
    }

    #[test]
    fn test_velocity_zero_note_on_ends_note() {
        let mut sequence = Sequence::new("s");
        let (mut engine, track) = armed(&mut sequence);
        engine.record(&note_on(64), 9.0, &mut sequence);
        let release = Command::new(
            0.0,
            MidiMessage::NoteOn {
                channel: 0,
                key: 64,
                velocity: 0,
            },
        );
        assert!(engine.record(&release, 10.0, &mut sequence));
        assert_eq!(sequence.track(track).unwrap().commands()[0].duration, 1.0);
    }

    #[test]
    fn test_pre_roll_is_not_recorded() {
        let mut sequence = Sequence::new("s");
        let (mut engine, track) = armed(&mut sequence);
        assert_eq!(engine.effective_start(8.0), 4.0);
        assert!(engine.is_in_pre_roll(5.0));
        assert!(!engine.record(&note_on(60), 5.0, &mut sequence));
        assert!(!engine.record(&note_off(60), 8.5, &mut sequence));
        assert!(sequence.track(track).unwrap().is_empty());
    }

    #[test]
    fn test_effective_start_clamped() {
        let engine = RecordEngine::new();
        assert_eq!(engine.effective_start(2.0), 0.0);
    }

    #[test]
    fn test_other_messages_and_multiple_tracks() {
        let mut sequence = Sequence::new("s");
        let a = sequence.create_track("a");
        let b = sequence.create_track("b");
        let mut engine = RecordEngine::new();
        engine.set_record_enabled_tracks([a, b]);
        engine.arm(0.0);
        let cc = Command::new(
            99.0,
            MidiMessage::ControlChange {
                channel: 0,
                controller: 64,
                value: 127,
            },
        );
        assert!(engine.record(&cc, 2.0, &mut sequence));
        for id in [a, b] {
            let commands = sequence.track(id).unwrap().commands();
            assert_eq!(commands.len(), 1);
            assert_eq!(commands[0].timestamp, 2.0);
        }
    }

    #[test]
    fn test_held_notes_closed_on_disarm() {
        let mut sequence = Sequence::new("s");
        let (mut engine, track) = armed(&mut sequence);
        engine.record(&note_on(60), 8.0, &mut sequence);
        engine.disarm(10.0, &mut sequence);
        assert!(!engine.is_recording());
        let commands = sequence.track(track).unwrap().commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].duration, 2.0);
    }

    #[test]
    fn test_invalid_pre_roll() {
        let mut engine = RecordEngine::new();
        assert_eq!(
            engine.set_pre_roll(-1.0),
            Err(SequencerError::InvalidPreRoll(-1.0))
        );
        assert_eq!(engine.pre_roll(), DEFAULT_PRE_ROLL);
    }

    #[test]
    fn test_click_audibility_table() {
        use ClickTrackStatus::*;
        assert!(!Disabled.is_audible(true, true));
        assert!(EnabledInRecord.is_audible(true, false));
        assert!(EnabledInRecord.is_audible(true, true));
        assert!(!EnabledInRecord.is_audible(false, false));
        assert!(EnabledOnlyInPreRoll.is_audible(true, true));
        assert!(!EnabledOnlyInPreRoll.is_audible(true, false));
        assert!(AlwaysEnabled.is_audible(false, false));
    }

    #[test]
    fn test_clicks_only_in_pre_roll() {
        let mut engine = RecordEngine::new();
        engine.set_click_track_status(ClickTrackStatus::EnabledOnlyInPreRoll);
        engine.arm(8.0);
        let segment = ScheduledSegment {
            from: 4.0,
            to: 12.0,
            bounds: RangeBounds::CLOSED,
            anchor: ClockAnchor::new(HostTime::ZERO, 4.0, 1.0),
        };
        let clicks = engine.click_commands(&segment, &TimeConverter::default());
        let beats: Vec<f64> = clicks
            .iter()
            .filter(|c| c.message.is_note_on())
            .map(|c| c.beat)
            .collect();
        assert_eq!(beats, vec![4.0, 5.0, 6.0, 7.0]);
        // Beat 4 is a downbeat
        assert_eq!(clicks[0].at, HostTime::ZERO);
        assert!(matches!(clicks[0].message, MidiMessage::NoteOn { key: 76, .. }));
    }
}
