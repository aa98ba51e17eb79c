//! Loop region and loop state machine.

use crate::error::{Result, SequencerError};
use crate::midi::MusicTimeStamp;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The end of a loop region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopEnd {
    /// A fixed beat position.
    Beat(MusicTimeStamp),
    /// Whatever the sequence length is when the end is asked for.
    EndOfSequence,
}

/// A loop region `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoopRegion {
    pub start: MusicTimeStamp,
    pub end: LoopEnd,
}

impl LoopRegion {
    /// Creates a validated loop region.
    ///
    /// The start must be finite and not negative. A fixed end must be finite
    /// and not before the start.
    pub fn new(start: MusicTimeStamp, end: LoopEnd) -> Result<Self> {
        let invalid = |end_beat| SequencerError::InvalidLoopRegion {
            start,
            end: end_beat,
        };
        if !start.is_finite() || start < 0.0 {
            let end_beat = match end {
                LoopEnd::Beat(b) => b,
                LoopEnd::EndOfSequence => f64::INFINITY,
            };
            return Err(invalid(end_beat));
        }
        if let LoopEnd::Beat(b) = end {
            if !b.is_finite() || b < start {
                return Err(invalid(b));
            }
        }
        Ok(Self { start, end })
    }

    /// Loop from the beginning to the end of the sequence.
    pub fn whole_sequence() -> Self {
        Self {
            start: 0.0,
            end: LoopEnd::EndOfSequence,
        }
    }

    /// Resolves the end against the current sequence length.
    pub fn effective_end(&self, sequence_length: MusicTimeStamp) -> MusicTimeStamp {
        match self.end {
            LoopEnd::Beat(beat) => beat,
            LoopEnd::EndOfSequence => sequence_length,
        }
    }

    /// Loop length for the given sequence length. May be zero or negative
    /// when the sequence is shorter than the loop start.
    pub fn length(&self, sequence_length: MusicTimeStamp) -> MusicTimeStamp {
        self.effective_end(sequence_length) - self.start
    }
}

impl Default for LoopRegion {
    fn default() -> Self {
        Self::whole_sequence()
    }
}

/// Where playback stands relative to the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    /// Looping is off, or the region is empty.
    Disabled,
    /// Looping is on and playback has not reached the loop start yet.
    PendingEntry,
    /// Playback is inside the loop and wraps at its end.
    Active,
    /// Looping is on but playback started past the loop end, so the loop is
    /// never reached until the transport is repositioned.
    Bypassed,
}

/// Tracks the loop flag, the loop region and the resulting [`LoopState`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoopController {
    enabled: bool,
    region: LoopRegion,
    state: LoopState,
}

impl LoopController {
    pub fn new() -> Self {
        Self {
            enabled: false,
            region: LoopRegion::whole_sequence(),
            state: LoopState::Disabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn region(&self) -> LoopRegion {
        self.region
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// True once playback is inside the loop.
    pub fn is_looping(&self) -> bool {
        self.state == LoopState::Active
    }

    /// True when time conversion should follow the loop: the loop is active
    /// or will be entered later in this pass.
    pub fn is_engaged(&self) -> bool {
        matches!(self.state, LoopState::PendingEntry | LoopState::Active)
    }

    /// Turns the loop on or off and re-resolves the state at `position`.
    pub fn set_enabled(
        &mut self,
        enabled: bool,
        position: MusicTimeStamp,
        sequence_length: MusicTimeStamp,
    ) {
        self.enabled = enabled;
        self.resolve(position, sequence_length);
    }

    /// Replaces the loop region and re-resolves the state at `position`.
    pub fn set_region(
        &mut self,
        region: LoopRegion,
        position: MusicTimeStamp,
        sequence_length: MusicTimeStamp,
    ) {
        self.region = region;
        self.resolve(position, sequence_length);
    }

    /// Derives the state from scratch for a transport positioned at
    /// `position`.
    pub fn resolve(&mut self, position: MusicTimeStamp, sequence_length: MusicTimeStamp) {
        let end = self.region.effective_end(sequence_length);
        let state = if !self.enabled || end - self.region.start <= 0.0 {
            LoopState::Disabled
        } else if position < self.region.start {
            LoopState::PendingEntry
        } else if position < end {
            LoopState::Active
        } else {
            LoopState::Bypassed
        };
        self.transition(state);
    }

    /// Moves `PendingEntry` to `Active` once playback reaches the loop
    /// start. Other states are unchanged.
    ///
    /// An end-of-sequence loop that has collapsed to nothing disables
    /// itself here.
    pub fn advance(&mut self, position: MusicTimeStamp, sequence_length: MusicTimeStamp) {
        if self.is_engaged() && self.region.length(sequence_length) <= 0.0 {
            self.transition(LoopState::Disabled);
            return;
        }
        if self.state == LoopState::PendingEntry && position >= self.region.start {
            self.transition(LoopState::Active);
        }
    }

    fn transition(&mut self, state: LoopState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "loop state changed");
            self.state = state;
        }
    }
}

impl Default for LoopController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: f64, end: f64) -> LoopRegion {
        LoopRegion::new(start, LoopEnd::Beat(end)).unwrap()
    }

    #[test]
    fn test_region_validation() {
        assert!(LoopRegion::new(4.0, LoopEnd::Beat(8.0)).is_ok());
        assert!(LoopRegion::new(4.0, LoopEnd::Beat(4.0)).is_ok());
        assert!(LoopRegion::new(0.0, LoopEnd::EndOfSequence).is_ok());
        assert_eq!(
            LoopRegion::new(8.0, LoopEnd::Beat(4.0)),
            Err(SequencerError::InvalidLoopRegion {
                start: 8.0,
                end: 4.0
            })
        );
        assert!(LoopRegion::new(-1.0, LoopEnd::Beat(4.0)).is_err());
        assert!(LoopRegion::new(f64::NAN, LoopEnd::EndOfSequence).is_err());
        assert!(LoopRegion::new(0.0, LoopEnd::Beat(f64::INFINITY)).is_err());
    }

    #[test]
    fn test_end_of_sequence_resolves_at_query_time() {
        let region = LoopRegion::new(2.0, LoopEnd::EndOfSequence).unwrap();
        assert_eq!(region.effective_end(16.0), 16.0);
        assert_eq!(region.effective_end(32.0), 32.0);
        assert_eq!(region.length(32.0), 30.0);
    }

    #[test]
    fn test_state_from_position() {
        let mut controller = LoopController::new();
        controller.set_region(region(4.0, 8.0), 0.0, 16.0);
        assert_eq!(controller.state(), LoopState::Disabled);

        controller.set_enabled(true, 0.0, 16.0);
        assert_eq!(controller.state(), LoopState::PendingEntry);
        assert!(controller.is_engaged());
        assert!(!controller.is_looping());

        controller.resolve(5.0, 16.0);
        assert_eq!(controller.state(), LoopState::Active);
        assert!(controller.is_looping());

        controller.resolve(10.0, 16.0);
        assert_eq!(controller.state(), LoopState::Bypassed);
        assert!(!controller.is_engaged());

        controller.set_enabled(false, 5.0, 16.0);
        assert_eq!(controller.state(), LoopState::Disabled);
    }

    #[test]
    fn test_pending_entry_becomes_active() {
        let mut controller = LoopController::new();
        controller.set_region(region(4.0, 8.0), 0.0, 16.0);
        controller.set_enabled(true, 0.0, 16.0);

        controller.advance(3.9, 16.0);
        assert_eq!(controller.state(), LoopState::PendingEntry);
        controller.advance(4.0, 16.0);
        assert_eq!(controller.state(), LoopState::Active);
    }

    #[test]
    fn test_empty_region_disables() {
        let mut controller = LoopController::new();
        controller.set_region(region(4.0, 4.0), 0.0, 16.0);
        controller.set_enabled(true, 0.0, 16.0);
        assert_eq!(controller.state(), LoopState::Disabled);

        // End-of-sequence loop on an empty sequence
        controller.set_region(LoopRegion::whole_sequence(), 0.0, 0.0);
        assert_eq!(controller.state(), LoopState::Disabled);

        // Sequence shrinks below the loop start while looping
        controller.set_region(LoopRegion::new(4.0, LoopEnd::EndOfSequence).unwrap(), 5.0, 16.0);
        assert_eq!(controller.state(), LoopState::Active);
        controller.advance(5.0, 2.0);
        assert_eq!(controller.state(), LoopState::Disabled);
    }
}
