//! MIDI command representation.
//!
//! A command is a single timestamped MIDI message in musical time. Notes are
//! stored as one command with a duration; the scheduler expands them into a
//! note-on/note-off pair when they are dispatched.

use super::MusicTimeStamp;
use serde::{Deserialize, Serialize};

/// Status byte high nibbles for channel voice messages.
const NOTE_OFF_STATUS: u8 = 0x80;
const NOTE_ON_STATUS: u8 = 0x90;
const POLY_AFTERTOUCH_STATUS: u8 = 0xA0;
const CONTROL_CHANGE_STATUS: u8 = 0xB0;
const PROGRAM_CHANGE_STATUS: u8 = 0xC0;
const CHANNEL_PRESSURE_STATUS: u8 = 0xD0;
const PITCH_BEND_STATUS: u8 = 0xE0;

/// Meta event type for tempo changes in Standard MIDI Files.
const TEMPO_META_TYPE: u8 = 0x51;

/// A typed MIDI message.
///
/// Channel voice messages carry their channel (0-15). Tempo is kept as a
/// BPM value since that is what the tempo map consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MidiMessage {
    /// A note with a duration held by the owning [`Command`].
    Note { channel: u8, key: u8, velocity: u8 },
    NoteOn { channel: u8, key: u8, velocity: u8 },
    NoteOff { channel: u8, key: u8, velocity: u8 },
    PolyAftertouch { channel: u8, key: u8, pressure: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, pressure: u8 },
    /// 14-bit pitch bend value, 0x2000 is centered.
    PitchBend { channel: u8, value: u16 },
    /// Tempo change in beats per minute.
    Tempo { bpm: f64 },
    /// Any other meta event, kept verbatim.
    Meta { kind: u8, data: Vec<u8> },
}

impl MidiMessage {
    /// Returns the MIDI channel for channel voice messages.
    pub fn channel(&self) -> Option<u8> {
        match *self {
            MidiMessage::Note { channel, .. }
            | MidiMessage::NoteOn { channel, .. }
            | MidiMessage::NoteOff { channel, .. }
            | MidiMessage::PolyAftertouch { channel, .. }
            | MidiMessage::ControlChange { channel, .. }
            | MidiMessage::ProgramChange { channel, .. }
            | MidiMessage::ChannelPressure { channel, .. }
            | MidiMessage::PitchBend { channel, .. } => Some(channel),
            MidiMessage::Tempo { .. } | MidiMessage::Meta { .. } => None,
        }
    }

    /// True for note-on messages with a non-zero velocity.
    pub fn is_note_on(&self) -> bool {
        matches!(self, MidiMessage::NoteOn { velocity, .. } if *velocity > 0)
    }

    /// True for note-off messages, including the velocity-0 note-on form.
    pub fn is_note_off(&self) -> bool {
        matches!(
            self,
            MidiMessage::NoteOff { .. } | MidiMessage::NoteOn { velocity: 0, .. }
        )
    }

    /// Returns a copy of this message with its key moved by `semitones`.
    ///
    /// Non-note messages are returned unchanged. Keys are clamped to 0-127.
    pub fn transposed(&self, semitones: i8) -> Self {
        let shift = |key: u8| (key as i16 + semitones as i16).clamp(0, 127) as u8;
        match *self {
            MidiMessage::Note {
                channel,
                key,
                velocity,
            } => MidiMessage::Note {
                channel,
                key: shift(key),
                velocity,
            },
            MidiMessage::NoteOn {
                channel,
                key,
                velocity,
            } => MidiMessage::NoteOn {
                channel,
                key: shift(key),
                velocity,
            },
            MidiMessage::NoteOff {
                channel,
                key,
                velocity,
            } => MidiMessage::NoteOff {
                channel,
                key: shift(key),
                velocity,
            },
            MidiMessage::PolyAftertouch {
                channel,
                key,
                pressure,
            } => MidiMessage::PolyAftertouch {
                channel,
                key: shift(key),
                pressure,
            },
            _ => self.clone(),
        }
    }

    /// Encodes the message as raw MIDI bytes.
    ///
    /// A `Note` encodes as its note-on. Meta events use the Standard MIDI
    /// File layout (`FF type len data`) with a single-byte length.
    pub fn raw_bytes(&self) -> Vec<u8> {
        match self {
            MidiMessage::Note {
                channel,
                key,
                velocity,
            }
            | MidiMessage::NoteOn {
                channel,
                key,
                velocity,
            } => vec![NOTE_ON_STATUS | (channel & 0x0F), *key, *velocity],
            MidiMessage::NoteOff {
                channel,
                key,
                velocity,
            } => vec![NOTE_OFF_STATUS | (channel & 0x0F), *key, *velocity],
            MidiMessage::PolyAftertouch {
                channel,
                key,
                pressure,
            } => vec![POLY_AFTERTOUCH_STATUS | (channel & 0x0F), *key, *pressure],
            MidiMessage::ControlChange {
                channel,
                controller,
                value,
            } => vec![CONTROL_CHANGE_STATUS | (channel & 0x0F), *controller, *value],
            MidiMessage::ProgramChange { channel, program } => {
                vec![PROGRAM_CHANGE_STATUS | (channel & 0x0F), *program]
            }
            MidiMessage::ChannelPressure { channel, pressure } => {
                vec![CHANNEL_PRESSURE_STATUS | (channel & 0x0F), *pressure]
            }
            MidiMessage::PitchBend { channel, value } => vec![
                PITCH_BEND_STATUS | (channel & 0x0F),
                (value & 0x7F) as u8,
                ((value >> 7) & 0x7F) as u8,
            ],
            MidiMessage::Tempo { bpm } => {
                let usec_per_beat = (60_000_000.0 / bpm).round() as u32;
                let bytes = usec_per_beat.to_be_bytes();
                vec![0xFF, TEMPO_META_TYPE, 3, bytes[1], bytes[2], bytes[3]]
            }
            MidiMessage::Meta { kind, data } => {
                let mut bytes = vec![0xFF, *kind, data.len().min(0x7F) as u8];
                bytes.extend(data.iter().take(0x7F));
                bytes
            }
        }
    }

    /// Decodes a channel voice message from raw bytes.
    ///
    /// Returns `None` for incomplete data, running status, system messages
    /// and anything that is not a channel voice message.
    pub fn from_raw(bytes: &[u8]) -> Option<Self> {
        let status = *bytes.first()?;
        if status < 0x80 || status >= 0xF0 {
            return None;
        }
        let channel = status & 0x0F;
        let data = |i: usize| bytes.get(i).map(|b| b & 0x7F);
        let message = match status & 0xF0 {
            NOTE_OFF_STATUS => MidiMessage::NoteOff {
                channel,
                key: data(1)?,
                velocity: data(2)?,
            },
            NOTE_ON_STATUS => MidiMessage::NoteOn {
                channel,
                key: data(1)?,
                velocity: data(2)?,
            },
            POLY_AFTERTOUCH_STATUS => MidiMessage::PolyAftertouch {
                channel,
                key: data(1)?,
                pressure: data(2)?,
            },
            CONTROL_CHANGE_STATUS => MidiMessage::ControlChange {
                channel,
                controller: data(1)?,
                value: data(2)?,
            },
            PROGRAM_CHANGE_STATUS => MidiMessage::ProgramChange {
                channel,
                program: data(1)?,
            },
            CHANNEL_PRESSURE_STATUS => MidiMessage::ChannelPressure {
                channel,
                pressure: data(1)?,
            },
            PITCH_BEND_STATUS => MidiMessage::PitchBend {
                channel,
                value: data(1)? as u16 | ((data(2)? as u16) << 7),
            },
            _ => return None,
        };
        Some(message)
    }
}

/// A MIDI message positioned in musical time.
///
/// Commands are immutable once created; tracks own them and the scheduler
/// only reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Position in beats from the start of the sequence.
    pub timestamp: MusicTimeStamp,

    /// Length in beats. Only meaningful for [`MidiMessage::Note`].
    pub duration: MusicTimeStamp,

    /// The message to send.
    pub message: MidiMessage,
}

impl Command {
    /// Creates a command without a duration.
    pub fn new(timestamp: MusicTimeStamp, message: MidiMessage) -> Self {
        Self {
            timestamp,
            duration: 0.0,
            message,
        }
    }

    /// Creates a note command.
    ///
    /// # Examples
    ///
    /// ```
    /// use midiseq::midi::Command;
    ///
    /// // Middle C, one beat long, starting on beat 2
    /// let note = Command::note(2.0, 1.0, 0, 60, 100);
    /// assert_eq!(note.end_timestamp(), 3.0);
    /// ```
    pub fn note(
        timestamp: MusicTimeStamp,
        duration: MusicTimeStamp,
        channel: u8,
        key: u8,
        velocity: u8,
    ) -> Self {
        Self {
            timestamp,
            duration: duration.max(0.0),
            message: MidiMessage::Note {
                channel: channel.min(15),
                key: key.min(127),
                velocity: velocity.min(127),
            },
        }
    }

    /// Creates a tempo change command for a tempo track.
    pub fn tempo(timestamp: MusicTimeStamp, bpm: f64) -> Self {
        Self::new(timestamp, MidiMessage::Tempo { bpm })
    }

    /// Returns the position where this command stops sounding.
    pub fn end_timestamp(&self) -> MusicTimeStamp {
        self.timestamp + self.duration
    }

    /// Returns a copy of this command moved to `timestamp`.
    pub fn at(&self, timestamp: MusicTimeStamp) -> Self {
        Self {
            timestamp,
            ..self.clone()
        }
    }

    /// Returns the raw MIDI payload of the message.
    pub fn raw_bytes(&self) -> Vec<u8> {
        self.message.raw_bytes()
    }
}
