//! Lookahead scheduler.
//!
//! Every tick looks a bounded interval into the future, selects the commands
//! that fall into the matching beat range and hands them to their track's
//! sink ahead of time. Consecutive windows share their boundary beat: a
//! window includes its end and excludes its start, so a command is never
//! dispatched twice.
//!
//! When the beat range crosses the end of an engaged loop the window is
//! split. The part before the loop end is dispatched first, listeners are
//! told about the wrap, the clock anchor is re-based to the loop start at
//! the wrap's host time, and the rest of the window continues from the loop
//! start.

use super::hook::CommandModifier;
use super::sink::{same_sink, ScheduledCommand, SinkFactory, SinkRef};
use crate::midi::{Command, MidiMessage, MusicTimeStamp, RangeBounds, Sequence, TrackId};
use crate::timing::{Clock, ClockAnchor, HostTime, LoopController, TimeConverter};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, trace, warn};

/// Default lookahead in seconds.
pub const DEFAULT_LOOK_AHEAD_INTERVAL: f64 = 0.1;
/// Shortest allowed lookahead in seconds.
pub const MIN_LOOK_AHEAD_INTERVAL: f64 = 0.05;
/// Longest allowed lookahead in seconds.
pub const MAX_LOOK_AHEAD_INTERVAL: f64 = 1.0;

/// Upper bound on loop wraps handled in one window. Only reachable with
/// loops much shorter than the lookahead.
const MAX_WRAPS_PER_TICK: usize = 1024;

/// Published when a loop wrap falls inside the window being scheduled,
/// before anything after the wrap is dispatched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopApproaching {
    pub loop_start: MusicTimeStamp,
    pub loop_end: MusicTimeStamp,
    /// Host time at which playback jumps back to `loop_start`.
    pub wrap_host_time: HostTime,
}

/// A beat range that was scheduled, with the anchor it was timed against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSegment {
    pub from: MusicTimeStamp,
    pub to: MusicTimeStamp,
    pub bounds: RangeBounds,
    pub anchor: ClockAnchor,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Beat ranges scheduled this tick, in playback order.
    pub segments: Vec<ScheduledSegment>,
    /// Number of loop wraps inside this tick's window.
    pub wraps: usize,
    /// Playback has run past the end of the sequence and should stop.
    pub reached_end: bool,
}

/// Per-tick inputs owned by the sequencer.
pub struct TickContext<'a> {
    pub now: HostTime,
    pub clock: &'a mut Clock,
    pub converter: &'a TimeConverter,
    pub loop_controller: &'a mut LoopController,
    pub sequence: &'a Sequence,
    /// Effective sequence length, which may differ from the sequence's own.
    pub sequence_length: MusicTimeStamp,
    /// Recording keeps the transport running past the sequence end.
    pub recording: bool,
}

/// Tracks what has been scheduled and where it goes.
pub struct LookaheadScheduler {
    maximum_look_ahead_interval: f64,
    latest_scheduled_host_time: Option<HostTime>,
    /// Last beat covered by a window.
    scheduled_through: MusicTimeStamp,
    /// Whether the next window includes its start beat.
    include_start: bool,
    transpose: i8,
    modifier: Option<Box<dyn CommandModifier>>,
    bindings: HashMap<TrackId, SinkRef>,
    builtin_sinks: HashMap<TrackId, SinkRef>,
    create_synths_if_needed: bool,
    sink_factory: Option<Box<dyn SinkFactory>>,
    loop_listeners: Vec<Sender<LoopApproaching>>,
}

impl LookaheadScheduler {
    pub fn new() -> Self {
        Self {
            maximum_look_ahead_interval: DEFAULT_LOOK_AHEAD_INTERVAL,
            latest_scheduled_host_time: None,
            scheduled_through: 0.0,
            include_start: true,
            transpose: 0,
            modifier: None,
            bindings: HashMap::new(),
            builtin_sinks: HashMap::new(),
            create_synths_if_needed: true,
            sink_factory: None,
            loop_listeners: Vec::new(),
        }
    }

    pub fn maximum_look_ahead_interval(&self) -> f64 {
        self.maximum_look_ahead_interval
    }

    /// Sets the lookahead, clamped to [`MIN_LOOK_AHEAD_INTERVAL`] ..=
    /// [`MAX_LOOK_AHEAD_INTERVAL`]. Returns the value in effect.
    pub fn set_maximum_look_ahead_interval(&mut self, seconds: f64) -> f64 {
        let clamped = if seconds.is_nan() {
            DEFAULT_LOOK_AHEAD_INTERVAL
        } else {
            seconds.clamp(MIN_LOOK_AHEAD_INTERVAL, MAX_LOOK_AHEAD_INTERVAL)
        };
        if clamped != seconds {
            warn!(requested = seconds, used = clamped, "look-ahead interval clamped");
        }
        self.maximum_look_ahead_interval = clamped;
        clamped
    }

    pub fn latest_scheduled_host_time(&self) -> Option<HostTime> {
        self.latest_scheduled_host_time
    }

    /// Last beat covered by a window, inside the loop when looping.
    pub fn scheduled_through(&self) -> MusicTimeStamp {
        self.scheduled_through
    }

    /// Prepares for a transport start at `beat`, sounding at `host_time`.
    ///
    /// The next window includes commands at `beat` itself.
    pub fn reset(&mut self, beat: MusicTimeStamp, host_time: HostTime) {
        self.scheduled_through = beat;
        self.include_start = true;
        self.latest_scheduled_host_time = Some(host_time);
    }

    pub fn transpose(&self) -> i8 {
        self.transpose
    }

    /// Semitone offset applied to note messages before dispatch.
    pub fn set_transpose(&mut self, semitones: i8) {
        self.transpose = semitones;
    }

    pub fn set_command_modifier(&mut self, modifier: Option<Box<dyn CommandModifier>>) {
        self.modifier = modifier;
    }

    pub fn create_synths_if_needed(&self) -> bool {
        self.create_synths_if_needed
    }

    pub fn set_create_synths_if_needed(&mut self, create: bool) {
        self.create_synths_if_needed = create;
    }

    pub fn set_sink_factory(&mut self, factory: Option<Box<dyn SinkFactory>>) {
        self.sink_factory = factory;
    }

    /// Binds `sink` to `track`, or unbinds it with `None`.
    pub fn set_command_scheduler(&mut self, track: TrackId, sink: Option<SinkRef>) {
        match sink {
            Some(sink) => {
                self.bindings.insert(track, sink);
            }
            None => {
                self.bindings.remove(&track);
            }
        }
    }

    /// The sink explicitly bound to `track`.
    pub fn command_scheduler_for_track(&self, track: TrackId) -> Option<SinkRef> {
        self.bindings.get(&track).cloned()
    }

    /// The default synth sink of `track`, created through the sink factory
    /// on first use.
    pub fn builtin_synthesizer_for_track(&mut self, track: TrackId) -> Option<SinkRef> {
        if let Some(sink) = self.builtin_sinks.get(&track) {
            return Some(sink.clone());
        }
        let sink = self.sink_factory.as_ref()?.create_sink(track)?;
        debug!(%track, "created builtin synthesizer");
        self.builtin_sinks.insert(track, sink.clone());
        Some(sink)
    }

    /// Sink that commands of `track` go to: the bound sink, else the
    /// builtin synth when synth creation is on.
    pub fn resolve_sink(&mut self, track: TrackId) -> Option<SinkRef> {
        if let Some(sink) = self.bindings.get(&track) {
            return Some(sink.clone());
        }
        if self.create_synths_if_needed {
            return self.builtin_synthesizer_for_track(track);
        }
        None
    }

    /// Registers a listener for loop wraps.
    pub fn subscribe_loop_notifications(&mut self) -> Receiver<LoopApproaching> {
        let (sender, receiver) = mpsc::channel();
        self.loop_listeners.push(sender);
        receiver
    }

    fn notify_loop_approaching(&mut self, event: LoopApproaching) {
        debug!(
            loop_start = event.loop_start,
            loop_end = event.loop_end,
            wrap = %event.wrap_host_time,
            "loop approaching"
        );
        // Drop listeners whose receiver is gone
        self.loop_listeners
            .retain(|listener| listener.send(event).is_ok());
    }

    /// Every distinct sink known to the scheduler, plus `extra`.
    pub fn distinct_sinks(&self, extra: Option<&SinkRef>) -> Vec<SinkRef> {
        let mut sinks: Vec<SinkRef> = Vec::new();
        let candidates = self
            .bindings
            .values()
            .chain(self.builtin_sinks.values())
            .chain(extra);
        for sink in candidates {
            if !sinks.iter().any(|known| same_sink(known, sink)) {
                sinks.push(sink.clone());
            }
        }
        sinks
    }

    /// Asks every distinct sink, and `extra`, to flush once.
    pub fn flush_all(&self, extra: Option<&SinkRef>) {
        for sink in self.distinct_sinks(extra) {
            flush_sink(&sink);
        }
    }

    /// Schedules the next window.
    pub fn tick(&mut self, ctx: TickContext<'_>) -> TickReport {
        let mut report = TickReport::default();
        let Some(mut anchor) = ctx.clock.anchor() else {
            return report;
        };
        let sequence_length = ctx.sequence_length;

        let current_beat = ctx.converter.beat_at_host_time(&anchor, ctx.now);
        ctx.loop_controller.advance(current_beat, sequence_length);

        let mut window_end = ctx.now.offset_by(self.maximum_look_ahead_interval);
        if !ctx.loop_controller.is_engaged() && !ctx.recording {
            let end_host = ctx.converter.host_time_for_beat(&anchor, sequence_length);
            if ctx.now >= end_host && self.scheduled_through >= sequence_length {
                report.reached_end = true;
                return report;
            }
            window_end = window_end.min(end_host.max(ctx.now));
        }

        let mut from = self.scheduled_through;
        let mut bounds = RangeBounds::new(self.include_start, true);
        loop {
            let to = ctx.converter.beat_at_host_time(&anchor, window_end);
            if to < from || (to == from && !bounds.include_start) {
                break;
            }

            let region = ctx.loop_controller.region();
            let loop_end = region.effective_end(sequence_length);
            let at_loop_end =
                ctx.loop_controller.is_engaged() && loop_end > region.start && to >= loop_end;
            if at_loop_end && report.wraps >= MAX_WRAPS_PER_TICK {
                // Stop at the loop end; the next tick wraps from there
                warn!(wraps = report.wraps, "loop wrap limit reached in one window");
                if from < loop_end {
                    self.dispatch_segment(
                        &ctx,
                        ScheduledSegment {
                            from,
                            to: loop_end,
                            bounds: RangeBounds::new(bounds.include_start, false),
                            anchor,
                        },
                        &mut report,
                    );
                    from = loop_end;
                    bounds = RangeBounds::AFTER_START;
                }
                break;
            }
            if !at_loop_end {
                self.dispatch_segment(
                    &ctx,
                    ScheduledSegment {
                        from,
                        to,
                        bounds,
                        anchor,
                    },
                    &mut report,
                );
                from = to;
                bounds = RangeBounds::AFTER_START;
                break;
            }

            // Up to the loop end, exclusive
            if from < loop_end {
                self.dispatch_segment(
                    &ctx,
                    ScheduledSegment {
                        from,
                        to: loop_end,
                        bounds: RangeBounds::new(bounds.include_start, false),
                        anchor,
                    },
                    &mut report,
                );
            }

            let wrap_host_time = ctx.converter.host_time_for_beat(&anchor, loop_end);
            report.wraps += 1;
            self.notify_loop_approaching(LoopApproaching {
                loop_start: region.start,
                loop_end,
                wrap_host_time,
            });
            anchor = ClockAnchor::new(wrap_host_time, region.start, anchor.rate);
            ctx.clock.set_anchor(anchor);
            ctx.loop_controller.advance(loop_end, sequence_length);

            from = region.start;
            bounds = RangeBounds::CLOSED;
        }
        if !report.segments.is_empty() {
            self.scheduled_through = from;
            self.include_start = bounds.include_start;
        }
        let latest = self
            .latest_scheduled_host_time
            .map_or(window_end, |t| t.max(window_end));
        self.latest_scheduled_host_time = Some(latest);
        report
    }

    fn dispatch_segment(
        &mut self,
        ctx: &TickContext<'_>,
        segment: ScheduledSegment,
        report: &mut TickReport,
    ) {
        trace!(from = segment.from, to = segment.to, "scheduling segment");
        let clip_at = ctx
            .loop_controller
            .is_engaged()
            .then(|| ctx.loop_controller.region().effective_end(ctx.sequence_length));
        for track in ctx.sequence.playable_tracks() {
            let commands = track.commands_in_range(segment.from, segment.to, segment.bounds);
            if commands.is_empty() {
                continue;
            }
            let batch = self.expand(commands, &segment.anchor, ctx.converter, clip_at);
            self.dispatch(track.id, batch);
        }
        report.segments.push(segment);
    }

    /// Turns commands into host-timed messages. Notes become a note-on and
    /// a note-off; a note-off is moved back to `clip_at` when the note
    /// starts before it and ends after it.
    fn expand(
        &self,
        commands: &[Command],
        anchor: &ClockAnchor,
        converter: &TimeConverter,
        clip_at: Option<MusicTimeStamp>,
    ) -> Vec<ScheduledCommand> {
        let mut batch = Vec::with_capacity(commands.len() * 2);
        for command in commands {
            let at = converter.host_time_for_beat(anchor, command.timestamp);
            match command.message.transposed(self.transpose) {
                MidiMessage::Note {
                    channel,
                    key,
                    velocity,
                } => {
                    let mut end = command.end_timestamp();
                    if let Some(clip) = clip_at {
                        if command.timestamp < clip && end > clip {
                            end = clip;
                        }
                    }
                    batch.push(ScheduledCommand::new(
                        at,
                        command.timestamp,
                        MidiMessage::NoteOn {
                            channel,
                            key,
                            velocity,
                        },
                    ));
                    batch.push(ScheduledCommand::new(
                        converter.host_time_for_beat(anchor, end),
                        end,
                        MidiMessage::NoteOff {
                            channel,
                            key,
                            velocity: 0,
                        },
                    ));
                }
                MidiMessage::Tempo { .. } => {}
                message => batch.push(ScheduledCommand::new(at, command.timestamp, message)),
            }
        }
        batch.sort_by_key(|c| c.at);
        batch
    }

    /// Resolves the track's sink, runs the modifier on the batch for that
    /// sink and sends it.
    pub fn dispatch(&mut self, track: TrackId, batch: Vec<ScheduledCommand>) {
        let Some(sink) = self.resolve_sink(track) else {
            trace!(%track, count = batch.len(), "no sink bound, dropping batch");
            return;
        };
        let batch = match self.modifier.as_mut() {
            Some(modifier) => modifier.modify(track, &sink, batch),
            None => batch,
        };
        if batch.is_empty() {
            return;
        }
        trace!(%track, count = batch.len(), "dispatching batch");
        if let Ok(mut sink) = sink.lock() {
            sink.schedule(&batch);
        };
    }
}

impl Default for LookaheadScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Asks one sink to flush its pending note-offs.
pub fn flush_sink(sink: &SinkRef) {
    if let Ok(mut sink) = sink.lock() {
        sink.flush_pending_note_offs();
    }
}
