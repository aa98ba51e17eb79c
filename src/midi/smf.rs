//! Standard MIDI File (SMF) conversion.
//!
//! Converts the bytes of a .mid file into a [`Sequence`]. Reading the file
//! itself is left to the caller.
//!
//! # Limitations
//!
//! - SMPTE timecode timing and Format 2 (sequential) files are rejected
//! - Every tempo change goes to the tempo track; other meta events are dropped
//! - SysEx and system messages are ignored

use super::{Command, MidiMessage, MusicTimeStamp, Sequence, Track};
use midly::{Format, MetaMessage, Smf, Timing, TrackEventKind};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur while converting a Standard MIDI File.
#[derive(Debug, Error)]
pub enum SmfError {
    /// MIDI parsing failed
    #[error("MIDI parse error: {0}")]
    Parse(#[from] midly::Error),
    /// Unsupported MIDI format or timing
    #[error("unsupported format: {0}")]
    UnsupportedFormat(&'static str),
}

/// Duration given to notes that are never released.
const UNCLOSED_NOTE_BEATS: MusicTimeStamp = 1.0;

/// Active notes during conversion.
/// Key is (channel, key), value is (start beat, velocity).
type ActiveNotes = HashMap<(u8, u8), (MusicTimeStamp, u8)>;

impl Sequence {
    /// Builds a sequence from the bytes of a Standard MIDI File.
    ///
    /// Note-on/note-off pairs become note commands with a duration. Format 1
    /// files keep one sequence track per file track; a Format 0 file becomes a
    /// single track.
    pub fn from_smf_bytes(name: impl Into<String>, data: &[u8]) -> Result<Self, SmfError> {
        let smf = Smf::parse(data)?;

        let ticks_per_beat = match smf.header.timing {
            Timing::Metrical(tpb) => tpb.as_int() as f64,
            Timing::Timecode(_, _) => {
                return Err(SmfError::UnsupportedFormat(
                    "SMPTE timecode timing not supported",
                ))
            }
        };
        if smf.header.format == Format::Sequential {
            return Err(SmfError::UnsupportedFormat(
                "Format 2 (sequential) MIDI files not supported",
            ));
        }

        let mut sequence = Sequence::new(name);
        for (index, events) in smf.tracks.iter().enumerate() {
            let (track, tempos) = convert_track(events, index, ticks_per_beat);
            for (beat, bpm) in tempos {
                sequence.set_tempo(beat, bpm);
            }
            if !track.is_empty() {
                sequence.add_track(track);
            }
        }
        Ok(sequence)
    }
}

/// Converts one SMF track, returning the track and its tempo changes.
fn convert_track(
    events: &[midly::TrackEvent],
    index: usize,
    ticks_per_beat: f64,
) -> (Track, Vec<(MusicTimeStamp, f64)>) {
    let mut track = Track::new(format!("Track {}", index + 1));
    let mut active_notes: ActiveNotes = HashMap::new();
    let mut tempos = Vec::new();
    let mut tick: u64 = 0;

    for event in events {
        tick += event.delta.as_int() as u64;
        let beat = tick as f64 / ticks_per_beat;

        match event.kind {
            TrackEventKind::Meta(MetaMessage::TrackName(name)) => {
                if let Ok(name) = std::str::from_utf8(name) {
                    track.name = name.to_string();
                }
            }
            TrackEventKind::Meta(MetaMessage::Tempo(usec_per_beat)) => {
                let usec_per_beat = usec_per_beat.as_int();
                if usec_per_beat > 0 {
                    tempos.push((beat, 60_000_000.0 / usec_per_beat as f64));
                }
            }
            TrackEventKind::Midi { channel, message } => {
                let channel = channel.as_int();
                match message {
                    midly::MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                        active_notes.insert((channel, key.as_int()), (beat, vel.as_int()));
                    }
                    // Note on with velocity 0 = note off
                    midly::MidiMessage::NoteOn { key, .. }
                    | midly::MidiMessage::NoteOff { key, .. } => {
                        let key = key.as_int();
                        if let Some((start, velocity)) = active_notes.remove(&(channel, key)) {
                            track.add_command(Command::note(
                                start,
                                beat - start,
                                channel,
                                key,
                                velocity,
                            ));
                        }
                    }
                    other => {
                        if let Some(message) = convert_message(channel, other) {
                            track.add_command(Command::new(beat, message));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    // Close any remaining active notes (in case MIDI file is incomplete)
    for ((channel, key), (start, velocity)) in active_notes {
        track.add_command(Command::note(
            start,
            UNCLOSED_NOTE_BEATS,
            channel,
            key,
            velocity,
        ));
    }

    (track, tempos)
}

/// Converts the non-note channel messages.
fn convert_message(channel: u8, message: midly::MidiMessage) -> Option<MidiMessage> {
    let message = match message {
        midly::MidiMessage::Aftertouch { key, vel } => MidiMessage::PolyAftertouch {
            channel,
            key: key.as_int(),
            pressure: vel.as_int(),
        },
        midly::MidiMessage::Controller { controller, value } => MidiMessage::ControlChange {
            channel,
            controller: controller.as_int(),
            value: value.as_int(),
        },
        midly::MidiMessage::ProgramChange { program } => MidiMessage::ProgramChange {
            channel,
            program: program.as_int(),
        },
        midly::MidiMessage::ChannelAftertouch { vel } => MidiMessage::ChannelPressure {
            channel,
            pressure: vel.as_int(),
        },
        midly::MidiMessage::PitchBend { bend } => MidiMessage::PitchBend {
            channel,
            value: bend.0.as_int(),
        },
        midly::MidiMessage::NoteOn { .. } | midly::MidiMessage::NoteOff { .. } => return None,
    };
    Some(message)
}
