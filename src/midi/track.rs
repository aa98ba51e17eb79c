//! MIDI track representation.
//!
//! A track is an ordered list of commands. Tracks can be muted and soloed;
//! the scheduler honors both when it selects commands to dispatch.

use super::command::Command;
use super::MusicTimeStamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for generating unique track IDs.
static TRACK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a track.
///
/// Sink bindings and the record-enabled set refer to tracks by ID rather
/// than by reference, so the sequence stays the single owner of its tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackId(u64);

impl TrackId {
    /// Generates a new unique track ID.
    pub fn new() -> Self {
        Self(TRACK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TrackId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which ends of a beat range are included in a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeBounds {
    pub include_start: bool,
    pub include_end: bool,
}

impl RangeBounds {
    /// `(start, end]`, the bounds used between consecutive scheduler windows.
    pub const AFTER_START: Self = Self {
        include_start: false,
        include_end: true,
    };

    /// `[start, end]`, used for the first window after a start or a loop wrap.
    pub const CLOSED: Self = Self {
        include_start: true,
        include_end: true,
    };

    /// `[start, end)`, used for the segment that ends at a loop boundary.
    pub const BEFORE_END: Self = Self {
        include_start: true,
        include_end: false,
    };

    /// `(start, end)`.
    pub const OPEN: Self = Self {
        include_start: false,
        include_end: false,
    };

    /// Builds bounds from the two flags.
    pub fn new(include_start: bool, include_end: bool) -> Self {
        Self {
            include_start,
            include_end,
        }
    }
}

/// A single track of timestamped commands.
///
/// Commands are kept sorted by timestamp. Commands with equal timestamps keep
/// the order in which they were added. Deserialized tracks are sorted the
/// same way.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "TrackData")]
pub struct Track {
    /// Unique identifier for this track.
    pub id: TrackId,

    /// Human-readable name for the track.
    pub name: String,

    /// Whether this track is muted (not played during playback).
    pub muted: bool,

    /// Whether this track is soloed (only soloed tracks play when any track is soloed).
    pub solo: bool,

    /// Commands sorted by timestamp.
    commands: Vec<Command>,
}

/// A track as stored, before its commands are put in order.
#[derive(Deserialize)]
struct TrackData {
    id: TrackId,
    name: String,
    #[serde(default)]
    muted: bool,
    #[serde(default)]
    solo: bool,
    #[serde(default)]
    commands: Vec<Command>,
}

impl From<TrackData> for Track {
    fn from(data: TrackData) -> Self {
        let mut commands = data.commands;
        // Stable, so equal timestamps keep their stored order
        commands.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        Self {
            id: data.id,
            name: data.name,
            muted: data.muted,
            solo: data.solo,
            commands,
        }
    }
}

impl Track {
    /// Creates a new empty track.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TrackId::new(),
            name: name.into(),
            muted: false,
            solo: false,
            commands: Vec::new(),
        }
    }

    /// Adds a command, keeping the track sorted by timestamp.
    ///
    /// A command whose timestamp equals existing ones is placed after them.
    pub fn add_command(&mut self, command: Command) {
        let pos = self
            .commands
            .partition_point(|c| c.timestamp <= command.timestamp);
        self.commands.insert(pos, command);
    }

    /// Adds several commands.
    pub fn extend_commands(&mut self, commands: impl IntoIterator<Item = Command>) {
        for command in commands {
            self.add_command(command);
        }
    }

    /// Returns all commands in the track (sorted by timestamp).
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Returns the commands whose timestamps fall between `start` and `end`.
    ///
    /// `bounds` decides whether each end of the range is included. The result
    /// is a contiguous slice in timestamp order.
    pub fn commands_in_range(
        &self,
        start: MusicTimeStamp,
        end: MusicTimeStamp,
        bounds: RangeBounds,
    ) -> &[Command] {
        let first = if bounds.include_start {
            self.commands.partition_point(|c| c.timestamp < start)
        } else {
            self.commands.partition_point(|c| c.timestamp <= start)
        };
        let last = if bounds.include_end {
            self.commands.partition_point(|c| c.timestamp <= end)
        } else {
            self.commands.partition_point(|c| c.timestamp < end)
        };
        if first >= last {
            return &[];
        }
        &self.commands[first..last]
    }

    /// Returns the length of the track in beats: the end of the last command.
    pub fn length(&self) -> MusicTimeStamp {
        self.commands
            .iter()
            .map(Command::end_timestamp)
            .fold(0.0, f64::max)
    }

    /// Returns the number of commands in the track.
    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    /// Returns true when the track holds no commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Clears all commands from the track.
    pub fn clear(&mut self) {
        self.commands.clear();
    }
}

impl Default for Track {
    fn default() -> Self {
        Self::new("Track 1")
    }
}
