//! Software synth sink.
//!
//! A [`SynthSink`] queues scheduled commands and plays them through a
//! rustysynth [`Synthesizer`]. Rendering happens on the audio thread in
//! blocks of [`BUFFER_SIZE`] frames; before each block, every queued
//! command due by the end of the block is applied.

use crate::midi::MidiMessage;
use crate::scheduler::{CommandSchedulingSink, ScheduledCommand};
use crate::timing::{HostClock, HostTime};
use rodio::Source;
use rustysynth::Synthesizer;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::trace;

/// Sample rate for audio synthesis (44.1 kHz standard).
pub const SAMPLE_RATE: u32 = 44100;

/// Frames rendered per block.
/// Smaller = lower latency but higher CPU usage.
pub const BUFFER_SIZE: usize = 256;

/// Commands waiting for their host time, kept in time order.
#[derive(Debug, Default)]
pub struct EventQueue {
    pending: VecDeque<ScheduledCommand>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Adds commands, keeping the queue ordered by host time. Commands
    /// with the same time keep their arrival order.
    pub fn push(&mut self, commands: &[ScheduledCommand]) {
        for command in commands {
            let index = self.pending.partition_point(|queued| queued.at <= command.at);
            self.pending.insert(index, command.clone());
        }
    }

    /// Removes and returns every command due at or before `until`.
    pub fn take_due(&mut self, until: HostTime) -> Vec<ScheduledCommand> {
        let count = self.pending.partition_point(|queued| queued.at <= until);
        self.pending.drain(..count).collect()
    }

    /// Empties the queue, returning the note-offs it held. Everything else
    /// is dropped.
    pub fn take_note_offs(&mut self) -> Vec<ScheduledCommand> {
        self.pending
            .drain(..)
            .filter(|command| command.message.is_note_off())
            .collect()
    }
}

struct SynthState {
    synth: Synthesizer,
    queue: EventQueue,
}

impl SynthState {
    fn apply(&mut self, message: &MidiMessage) {
        let bytes = message.raw_bytes();
        let Some(&status) = bytes.first() else {
            return;
        };
        if !(0x80..0xF0).contains(&status) {
            return;
        }
        let channel = (status & 0x0F) as i32;
        let command = (status & 0xF0) as i32;
        let data1 = bytes.get(1).copied().unwrap_or(0) as i32;
        let data2 = bytes.get(2).copied().unwrap_or(0) as i32;
        self.synth.process_midi_message(channel, command, data1, data2);
    }

    fn apply_due(&mut self, until: HostTime) {
        for command in self.queue.take_due(until) {
            self.apply(&command.message);
        }
    }
}

/// A sink that plays into a software synthesizer.
///
/// Cloning yields another handle to the same synthesizer.
#[derive(Clone)]
pub struct SynthSink {
    state: Arc<Mutex<SynthState>>,
}

impl SynthSink {
    pub fn new(synth: Synthesizer) -> Self {
        Self {
            state: Arc::new(Mutex::new(SynthState {
                synth,
                queue: EventQueue::new(),
            })),
        }
    }

    /// Applies commands due by `until` and renders one block into the
    /// buffers. Used by the audio source and for offline rendering.
    pub fn render(&self, until: HostTime, left: &mut [f32], right: &mut [f32]) {
        if let Ok(mut state) = self.state.lock() {
            state.apply_due(until);
            state.synth.render(left, right);
        } else {
            left.fill(0.0);
            right.fill(0.0);
        }
    }

    /// A rodio source rendering this synth in real time against `clock`.
    pub fn source(&self, clock: Arc<dyn HostClock>) -> SynthSource {
        SynthSource::new(self.clone(), clock)
    }
}

impl CommandSchedulingSink for SynthSink {
    fn schedule(&mut self, commands: &[ScheduledCommand]) {
        if let Ok(mut state) = self.state.lock() {
            state.queue.push(commands);
        }
    }

    fn flush_pending_note_offs(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            let note_offs = state.queue.take_note_offs();
            trace!(count = note_offs.len(), "flushing note-offs");
            for command in note_offs {
                state.apply(&command.message);
            }
        }
    }
}

/// Audio source that renders a [`SynthSink`].
/// Implements rodio's Source trait for playback.
pub struct SynthSource {
    sink: SynthSink,
    clock: Arc<dyn HostClock>,
    left_buf: Vec<f32>,
    right_buf: Vec<f32>,
    /// Current position in the buffer.
    buf_pos: usize,
    /// Current channel (0 = left, 1 = right).
    channel: usize,
}

impl SynthSource {
    fn new(sink: SynthSink, clock: Arc<dyn HostClock>) -> Self {
        Self {
            sink,
            clock,
            left_buf: vec![0.0; BUFFER_SIZE],
            right_buf: vec![0.0; BUFFER_SIZE],
            buf_pos: BUFFER_SIZE, // Start at end to trigger first render
            channel: 0,
        }
    }

    fn block_duration() -> f64 {
        BUFFER_SIZE as f64 / SAMPLE_RATE as f64
    }
}

impl Iterator for SynthSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.buf_pos >= BUFFER_SIZE {
            let until = self.clock.now().offset_by(Self::block_duration());
            self.sink
                .render(until, &mut self.left_buf, &mut self.right_buf);
            self.buf_pos = 0;
        }

        // Interleave stereo samples: L, R, L, R, ...
        let sample = if self.channel == 0 {
            self.left_buf[self.buf_pos]
        } else {
            self.right_buf[self.buf_pos]
        };

        self.channel = 1 - self.channel;
        if self.channel == 0 {
            self.buf_pos += 1;
        }

        Some(sample)
    }
}

impl Source for SynthSource {
    fn current_frame_len(&self) -> Option<usize> {
        None // Continuous stream
    }

    fn channels(&self) -> u16 {
        2
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(seconds: f64, message: MidiMessage) -> ScheduledCommand {
        ScheduledCommand::new(HostTime::from_secs_f64(seconds), seconds * 2.0, message)
    }

    fn note_on(key: u8) -> MidiMessage {
        MidiMessage::NoteOn {
            channel: 0,
            key,
            velocity: 100,
        }
    }

    fn note_off(key: u8) -> MidiMessage {
        MidiMessage::NoteOff {
            channel: 0,
            key,
            velocity: 0,
        }
    }

    #[test]
    fn test_queue_orders_by_host_time() {
        let mut queue = EventQueue::new();
        queue.push(&[command(1.0, note_on(60)), command(1.5, note_off(60))]);
        queue.push(&[command(0.5, note_on(62)), command(1.0, note_off(62))]);

        let keys: Vec<MidiMessage> = queue
            .take_due(HostTime::from_secs_f64(1.0))
            .into_iter()
            .map(|c| c.message)
            .collect();
        assert_eq!(keys, vec![note_on(62), note_on(60), note_off(62)]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_take_due_leaves_later_commands() {
        let mut queue = EventQueue::new();
        queue.push(&[command(2.0, note_on(60))]);
        assert!(queue.take_due(HostTime::from_secs_f64(1.0)).is_empty());
        assert_eq!(queue.take_due(HostTime::from_secs_f64(2.0)).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_take_note_offs_drops_the_rest() {
        let mut queue = EventQueue::new();
        queue.push(&[
            command(1.0, note_on(60)),
            command(1.5, note_off(60)),
            command(
                1.2,
                MidiMessage::ControlChange {
                    channel: 0,
                    controller: 64,
                    value: 127,
                },
            ),
            command(
                2.0,
                MidiMessage::NoteOn {
                    channel: 1,
                    key: 40,
                    velocity: 0,
                },
            ),
        ]);
        let offs = queue.take_note_offs();
        assert_eq!(offs.len(), 2);
        assert!(offs.iter().all(|c| c.message.is_note_off()));
        assert!(queue.is_empty());
    }
}
