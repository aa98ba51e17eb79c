//! Scheduling sinks: the targets commands are dispatched to.
//!
//! A sink receives commands tagged with the host time they should sound at,
//! ahead of that time. It owns any queueing needed to play them on time.

use crate::midi::{MidiMessage, MusicTimeStamp, TrackId};
use crate::timing::HostTime;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A message to be sent at a host time.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledCommand {
    /// When the message should sound.
    pub at: HostTime,
    /// Beat position the message was taken from, inside the loop when
    /// looping.
    pub beat: MusicTimeStamp,
    pub message: MidiMessage,
}

impl ScheduledCommand {
    pub fn new(at: HostTime, beat: MusicTimeStamp, message: MidiMessage) -> Self {
        Self { at, beat, message }
    }
}

/// Anything that can receive scheduled MIDI: an output port, a software
/// synthesizer, a recorder.
pub trait CommandSchedulingSink: Send {
    /// Queues commands for delivery at their host times.
    fn schedule(&mut self, commands: &[ScheduledCommand]);

    /// Sends every queued note-off right away and drops the other queued
    /// commands. Called when the transport stops.
    fn flush_pending_note_offs(&mut self);
}

/// Shared handle to a sink. Several tracks may share one sink.
pub type SinkRef = Arc<Mutex<dyn CommandSchedulingSink>>;

/// Wraps a sink into a [`SinkRef`].
pub fn shared_sink(sink: impl CommandSchedulingSink + 'static) -> SinkRef {
    Arc::new(Mutex::new(sink))
}

/// True when both handles point at the same sink.
pub fn same_sink(a: &SinkRef, b: &SinkRef) -> bool {
    Arc::ptr_eq(a, b)
}

/// Creates default sinks for tracks that have none bound.
pub trait SinkFactory: Send {
    /// Returns a new sink for `track`, or `None` if one cannot be made.
    fn create_sink(&self, track: TrackId) -> Option<SinkRef>;
}

/// A sink that keeps everything it receives.
///
/// Useful for offline rendering and for inspecting what the scheduler
/// dispatched.
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Vec<Vec<ScheduledCommand>>,
    flush_count: usize,
    /// Note-offs received since the last flush, by (channel, key).
    pending_note_offs: HashMap<(u8, u8), HostTime>,
    flushed_note_offs: Vec<MidiMessage>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every batch received, in order.
    pub fn batches(&self) -> &[Vec<ScheduledCommand>] {
        &self.batches
    }

    /// Every command received, flattened across batches.
    pub fn commands(&self) -> impl Iterator<Item = &ScheduledCommand> {
        self.batches.iter().flatten()
    }

    /// Note-on messages received, flattened.
    pub fn note_ons(&self) -> Vec<&ScheduledCommand> {
        self.commands().filter(|c| c.message.is_note_on()).collect()
    }

    /// Number of flush requests received.
    pub fn flush_count(&self) -> usize {
        self.flush_count
    }

    /// Note-offs that were sent early by a flush.
    pub fn flushed_note_offs(&self) -> &[MidiMessage] {
        &self.flushed_note_offs
    }

    pub fn clear(&mut self) {
        self.batches.clear();
        self.pending_note_offs.clear();
        self.flushed_note_offs.clear();
        self.flush_count = 0;
    }
}

impl CommandSchedulingSink for MemorySink {
    fn schedule(&mut self, commands: &[ScheduledCommand]) {
        for command in commands {
            if let MidiMessage::NoteOff { channel, key, .. }
            | MidiMessage::NoteOn {
                channel,
                key,
                velocity: 0,
            } = command.message
            {
                self.pending_note_offs.insert((channel, key), command.at);
            }
        }
        self.batches.push(commands.to_vec());
    }

    fn flush_pending_note_offs(&mut self) {
        self.flush_count += 1;
        let mut pending: Vec<_> = self.pending_note_offs.drain().collect();
        pending.sort();
        self.flushed_note_offs
            .extend(pending.into_iter().map(|((channel, key), _)| MidiMessage::NoteOff {
                channel,
                key,
                velocity: 0,
            }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_off(at: f64, key: u8) -> ScheduledCommand {
        ScheduledCommand::new(
            HostTime::from_secs_f64(at),
            0.0,
            MidiMessage::NoteOff {
                channel: 0,
                key,
                velocity: 0,
            },
        )
    }

    #[test]
    fn test_memory_sink_collects_batches() {
        let mut sink = MemorySink::new();
        sink.schedule(&[note_off(1.0, 60)]);
        sink.schedule(&[note_off(2.0, 62), note_off(2.5, 64)]);
        assert_eq!(sink.batches().len(), 2);
        assert_eq!(sink.commands().count(), 3);
    }

    #[test]
    fn test_flush_sends_pending_note_offs() {
        let mut sink = MemorySink::new();
        sink.schedule(&[note_off(1.0, 64), note_off(1.0, 60)]);
        sink.flush_pending_note_offs();
        assert_eq!(sink.flush_count(), 1);
        assert_eq!(sink.flushed_note_offs().len(), 2);

        // Nothing left to flush, but the request is still counted
        sink.flush_pending_note_offs();
        assert_eq!(sink.flush_count(), 2);
        assert_eq!(sink.flushed_note_offs().len(), 2);
    }

    #[test]
    fn test_same_sink() {
        let a = shared_sink(MemorySink::new());
        let b = shared_sink(MemorySink::new());
        let a2 = a.clone();
        assert!(same_sink(&a, &a2));
        assert!(!same_sink(&a, &b));
    }
}
