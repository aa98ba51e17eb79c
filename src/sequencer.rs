//! The sequencer: transport, configuration and the per-tick entry point.
//!
//! A [`Sequencer`] plays a [`SharedSequence`] through the lookahead
//! scheduler and records into it. It does not own a timer. The host calls
//! [`Sequencer::process_tick`] periodically, typically every few
//! milliseconds, from whatever thread drives playback.
//!
//! # Thread Safety
//! All operations take `&mut self` and run to completion. To drive the
//! sequencer from a tick thread while controlling it from another, share it
//! as `Arc<Mutex<Sequencer>>`. The sequence lock is held only while a
//! window is selected or a command is recorded.

use crate::config::SequencerConfig;
use crate::error::{Result, SequencerError};
use crate::midi::{Command, MusicTimeStamp, Sequence, SharedSequence, TrackId};
use crate::record::{ClickTrackStatus, Metronome, RecordEngine};
use crate::scheduler::{
    flush_sink, CommandModifier, LookaheadScheduler, LoopApproaching, SinkFactory, SinkRef,
    TickContext, TickReport,
};
use crate::timing::{
    Clock, ClockAnchor, ConversionOptions, HostClock, HostTime, LoopController, LoopEnd,
    LoopRegion, LoopState, TimeConverter,
};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, MutexGuard, PoisonError};
use tracing::{debug, info, trace};

/// Transport state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportState {
    #[default]
    Stopped,
    Playing,
    /// Playing and capturing, pre-roll included.
    Recording,
}

impl TransportState {
    /// Check if transport is in a playing state (Playing or Recording)
    pub fn is_playing(&self) -> bool {
        matches!(self, TransportState::Playing | TransportState::Recording)
    }

    pub fn is_recording(&self) -> bool {
        matches!(self, TransportState::Recording)
    }
}

/// Plays and records a sequence against a host clock.
pub struct Sequencer {
    sequence: SharedSequence,
    clock: Clock,
    converter: TimeConverter,
    loop_controller: LoopController,
    scheduler: LookaheadScheduler,
    record_engine: RecordEngine,
    state: TransportState,
    overridden_length: Option<MusicTimeStamp>,
    metronome_sink: Option<SinkRef>,
    /// Position reported while stopped.
    stopped_position: MusicTimeStamp,
}

impl Sequencer {
    /// Creates a sequencer on the monotonic host clock.
    pub fn new(sequence: SharedSequence) -> Self {
        Self::with_clock(sequence, Clock::monotonic())
    }

    /// Creates a sequencer on a given host clock.
    pub fn with_host_clock(sequence: SharedSequence, host_clock: Arc<dyn HostClock>) -> Self {
        Self::with_clock(sequence, Clock::new(host_clock))
    }

    fn with_clock(sequence: SharedSequence, clock: Clock) -> Self {
        let mut sequencer = Self {
            sequence,
            clock,
            converter: TimeConverter::default(),
            loop_controller: LoopController::new(),
            scheduler: LookaheadScheduler::new(),
            record_engine: RecordEngine::new(),
            state: TransportState::Stopped,
            overridden_length: None,
            metronome_sink: None,
            stopped_position: 0.0,
        };
        sequencer.sync_timing();
        sequencer
    }

    /// Creates a sequencer on the monotonic clock and applies `config`.
    pub fn with_config(sequence: SharedSequence, config: &SequencerConfig) -> Result<Self> {
        let mut sequencer = Self::new(sequence);
        sequencer.apply_config(config)?;
        Ok(sequencer)
    }

    /// Applies every setting of `config`.
    ///
    /// Settings are validated before any is applied, so an error leaves the
    /// sequencer unchanged.
    pub fn apply_config(&mut self, config: &SequencerConfig) -> Result<()> {
        let mut converter = self.converter.clone();
        converter.set_rate(config.rate)?;
        converter.set_tempo_override(config.tempo_override)?;
        let region = LoopRegion::new(config.loop_start, config.loop_end)?;
        let mut record_engine = self.record_engine.clone();
        record_engine.set_pre_roll(config.pre_roll)?;
        record_engine.set_click_track_status(config.click_track_status);
        record_engine.set_metronome(Metronome::new(config.beats_per_bar));

        self.converter = converter;
        self.record_engine = record_engine;
        self.scheduler
            .set_maximum_look_ahead_interval(config.maximum_look_ahead_interval);
        self.scheduler
            .set_create_synths_if_needed(config.create_synths_if_needed);
        self.scheduler.set_transpose(config.transpose);

        let position = self.current_time_stamp();
        let length = self.sequence_length();
        self.loop_controller.set_region(region, position, length);
        self.loop_controller.set_enabled(config.looping, position, length);
        self.sync_timing();
        if self.state.is_playing() {
            let anchor = ClockAnchor::new(self.now(), position, self.converter.rate());
            self.clock.set_anchor(anchor);
        }
        Ok(())
    }

    /// The sequence being played.
    pub fn sequence(&self) -> SharedSequence {
        Arc::clone(&self.sequence)
    }

    fn lock_sequence(&self) -> MutexGuard<'_, Sequence> {
        self.sequence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current host time.
    pub fn now(&self) -> HostTime {
        self.clock.now()
    }

    /// Sequence length, or the overridden length when one is set.
    pub fn sequence_length(&self) -> MusicTimeStamp {
        self.overridden_length
            .unwrap_or_else(|| self.lock_sequence().length())
    }

    /// Rebuilds the tempo map from the tempo track if it changed and
    /// refreshes the loop region conversions follow.
    fn sync_timing(&mut self) {
        let (events, length) = {
            let sequence = self.lock_sequence();
            (
                sequence.tempo_events(),
                self.overridden_length.unwrap_or_else(|| sequence.length()),
            )
        };
        self.converter.update_tempo_events(events);
        self.sync_loop_span(length);
    }

    /// Conversions loop whenever looping is on and the region is not empty,
    /// wherever playback currently is.
    fn sync_loop_span(&mut self, length: MusicTimeStamp) {
        let region = self.loop_controller.region();
        let span = (self.loop_controller.is_enabled() && region.length(length) > 0.0)
            .then(|| (region.start, region.effective_end(length)));
        self.converter.set_loop_span(span);
    }

    // --- transport ---

    pub fn transport_state(&self) -> TransportState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state.is_playing()
    }

    pub fn is_recording(&self) -> bool {
        self.state.is_recording()
    }

    /// True once playback is inside an enabled loop.
    pub fn is_looping(&self) -> bool {
        self.is_playing() && self.loop_controller.is_looping()
    }

    pub fn loop_state(&self) -> LoopState {
        self.loop_controller.state()
    }

    /// Starts playback from the beginning of the sequence.
    pub fn start_playback(&mut self) -> Result<()> {
        self.start_playback_at(0.0)
    }

    /// Starts playback from `beat`, now.
    pub fn start_playback_at(&mut self, beat: MusicTimeStamp) -> Result<()> {
        let now = self.now();
        self.start_playback_at_host_time(beat, now)
    }

    /// Starts playback so that `beat` sounds at `host_time`.
    ///
    /// Starting while already playing stops first.
    pub fn start_playback_at_host_time(
        &mut self,
        beat: MusicTimeStamp,
        host_time: HostTime,
    ) -> Result<()> {
        validate_time_stamp(beat)?;
        if self.is_playing() {
            self.stop();
        }
        self.begin(beat, host_time, TransportState::Playing);
        Ok(())
    }

    /// Continues playback from where it last stopped.
    pub fn resume_playback(&mut self) -> Result<()> {
        let position = self.current_time_stamp();
        self.start_playback_at(position)
    }

    /// Starts recording at the beginning of the sequence.
    pub fn start_recording(&mut self) -> Result<()> {
        self.start_recording_at(0.0)
    }

    /// Starts recording at `beat`, with playback starting `pre_roll` beats
    /// earlier.
    pub fn start_recording_at(&mut self, beat: MusicTimeStamp) -> Result<()> {
        let now = self.now();
        self.start_recording_at_host_time(beat, now)
    }

    /// Starts recording at `beat`. Playback starts at `host_time` from
    /// `beat` minus the pre-roll.
    pub fn start_recording_at_host_time(
        &mut self,
        beat: MusicTimeStamp,
        host_time: HostTime,
    ) -> Result<()> {
        validate_time_stamp(beat)?;
        if self.is_playing() {
            self.stop();
        }
        let start = self.record_engine.effective_start(beat);
        self.record_engine.arm(beat);
        self.begin(start, host_time, TransportState::Recording);
        Ok(())
    }

    /// Continues recording from where playback last stopped.
    pub fn resume_recording(&mut self) -> Result<()> {
        let position = self.current_time_stamp();
        self.start_recording_at(position)
    }

    fn begin(&mut self, beat: MusicTimeStamp, host_time: HostTime, state: TransportState) {
        let length = self.sequence_length();
        self.loop_controller.resolve(beat, length);
        self.sync_timing();
        let anchor = ClockAnchor::new(host_time, beat, self.converter.rate());
        self.clock.set_anchor(anchor);
        self.scheduler.reset(beat, host_time);
        self.state = state;
        debug!(?state, beat, host_time = %host_time, loop_state = ?self.loop_controller.state(), "transport started");
    }

    /// Stops playback and recording.
    ///
    /// Every sink known to the sequencer is asked to flush its pending
    /// note-offs, once per call, whether or not anything was playing.
    pub fn stop(&mut self) {
        let position = self.current_time_stamp();
        if self.record_engine.is_recording() {
            let sequence = Arc::clone(&self.sequence);
            let mut sequence = sequence.lock().unwrap_or_else(PoisonError::into_inner);
            self.record_engine.disarm(position, &mut sequence);
        }
        let was = self.state;
        self.state = TransportState::Stopped;
        self.stopped_position = position;
        self.clock.clear_anchor();
        self.scheduler.flush_all(self.metronome_sink.as_ref());
        if was.is_playing() {
            debug!(position, "transport stopped");
        }
    }

    /// Position sounding at `host_time`.
    ///
    /// While looping, positions are folded into the loop region.
    fn position_at(&self, host_time: HostTime) -> MusicTimeStamp {
        let Some(anchor) = self.clock.anchor() else {
            return self.stopped_position;
        };
        let beat = self.converter.beat_at_host_time(&anchor, host_time);
        if !self.loop_controller.is_looping() {
            return beat;
        }
        let Some((start, end)) = self.converter.loop_span() else {
            return beat;
        };
        let length = end - start;
        if host_time < anchor.host_time && beat < start {
            // Before a wrap that has already been scheduled
            beat + length
        } else if beat >= end {
            start + (beat - start).rem_euclid(length)
        } else {
            beat
        }
    }

    /// Current playback position in beats.
    pub fn current_time_stamp(&self) -> MusicTimeStamp {
        if self.is_playing() {
            self.position_at(self.now())
        } else {
            self.stopped_position
        }
    }

    /// Moves the playback position. While playing, playback jumps to
    /// `beat` right away.
    pub fn set_current_time_stamp(&mut self, beat: MusicTimeStamp) -> Result<()> {
        validate_time_stamp(beat)?;
        if !self.is_playing() {
            self.stopped_position = beat;
            return Ok(());
        }
        self.scheduler.flush_all(self.metronome_sink.as_ref());
        let now = self.now();
        let length = self.sequence_length();
        self.loop_controller.resolve(beat, length);
        self.sync_loop_span(length);
        self.clock
            .set_anchor(ClockAnchor::new(now, beat, self.converter.rate()));
        self.scheduler.reset(beat, now);
        debug!(beat, "playback position moved");
        Ok(())
    }

    /// Anchors playback at the current instant after a change to the
    /// beat/seconds mapping. `update` applies the change.
    ///
    /// A loop wrap that is already scheduled moves to the host time at
    /// which the loop end is now reached.
    fn reanchor<F>(&mut self, update: F) -> Result<()>
    where
        F: FnOnce(&mut TimeConverter) -> Result<()>,
    {
        let now = self.now();
        let Some(anchor) = self.clock.anchor() else {
            return update(&mut self.converter);
        };
        let position = self.position_at(now);
        let unfolded = self.converter.beat_at_host_time(&anchor, now);
        let pending_wrap = self
            .converter
            .loop_span()
            .filter(|(start, _)| {
                now < anchor.host_time && self.loop_controller.is_looping() && anchor.beat == *start
            });
        update(&mut self.converter)?;

        let rate = self.converter.rate();
        let anchor = if let Some((start, end)) = pending_wrap {
            let here = ClockAnchor::new(now, position, rate);
            let wrap_host_time = self.converter.host_time_for_beat(&here, end);
            ClockAnchor::new(wrap_host_time, start, rate)
        } else if now < anchor.host_time {
            // Playback has not started yet
            ClockAnchor::new(anchor.host_time, anchor.beat, rate)
        } else {
            ClockAnchor::new(now, unfolded, rate)
        };
        self.clock.set_anchor(anchor);
        Ok(())
    }

    // --- time conversion ---

    /// Seconds from beat 0 to `beat`.
    pub fn seconds_for_beat(&self, beat: MusicTimeStamp, options: ConversionOptions) -> f64 {
        self.converter.seconds_for_beat(beat, options)
    }

    /// Beat reached `seconds` after beat 0.
    pub fn beat_for_seconds(&self, seconds: f64, options: ConversionOptions) -> MusicTimeStamp {
        self.converter.beat_for_seconds(seconds, options)
    }

    /// Beat sounding at `host_time`, or beat 0 with no playback anchor.
    pub fn beat_at_host_time(&self, host_time: HostTime) -> MusicTimeStamp {
        match self.clock.anchor() {
            Some(anchor) => self.converter.beat_at_host_time(&anchor, host_time),
            None => 0.0,
        }
    }

    /// Host time at which `beat` sounds, or now with no playback anchor.
    pub fn host_time_for_beat(&self, beat: MusicTimeStamp) -> HostTime {
        match self.clock.anchor() {
            Some(anchor) => self.converter.host_time_for_beat(&anchor, beat),
            None => self.now(),
        }
    }

    pub fn clock_anchor(&self) -> Option<ClockAnchor> {
        self.clock.anchor()
    }

    pub fn latest_scheduled_host_time(&self) -> Option<HostTime> {
        self.scheduler.latest_scheduled_host_time()
    }

    // --- configuration ---

    pub fn rate(&self) -> f64 {
        self.converter.rate()
    }

    /// Sets the playback rate. While playing, the position carries on from
    /// where it is.
    pub fn set_rate(&mut self, rate: f64) -> Result<()> {
        self.reanchor(|converter| converter.set_rate(rate))?;
        debug!(rate, "rate changed");
        Ok(())
    }

    pub fn tempo_override(&self) -> Option<f64> {
        self.converter.tempo_override()
    }

    /// Sets or clears a flat tempo replacing the tempo track.
    pub fn set_tempo_override(&mut self, bpm: Option<f64>) -> Result<()> {
        self.reanchor(|converter| converter.set_tempo_override(bpm))?;
        debug!(?bpm, "tempo override changed");
        Ok(())
    }

    pub fn overridden_sequence_length(&self) -> Option<MusicTimeStamp> {
        self.overridden_length
    }

    /// Overrides the sequence length, or goes back to the sequence's own
    /// length with `None`.
    pub fn set_overridden_sequence_length(&mut self, length: Option<MusicTimeStamp>) -> Result<()> {
        if let Some(length) = length {
            if !length.is_finite() || length <= 0.0 {
                return Err(SequencerError::InvalidLength(length));
            }
        }
        self.overridden_length = length;
        self.sync_timing();
        Ok(())
    }

    /// Turns looping on or off.
    pub fn set_loop(&mut self, enabled: bool) {
        let position = self.current_time_stamp();
        let length = self.sequence_length();
        self.loop_controller.set_enabled(enabled, position, length);
        self.sync_loop_span(length);
    }

    pub fn loop_region(&self) -> LoopRegion {
        self.loop_controller.region()
    }

    /// Sets the loop region. [`LoopEnd::EndOfSequence`] follows the
    /// sequence length as it changes.
    pub fn set_loop_region(&mut self, start: MusicTimeStamp, end: LoopEnd) -> Result<()> {
        let region = LoopRegion::new(start, end)?;
        let position = self.current_time_stamp();
        let length = self.sequence_length();
        self.loop_controller.set_region(region, position, length);
        self.sync_loop_span(length);
        Ok(())
    }

    /// Binds a sink to a track, or unbinds it with `None`.
    pub fn set_command_scheduler(&mut self, track: TrackId, sink: Option<SinkRef>) -> Result<()> {
        if !self.lock_sequence().contains_track(track) {
            return Err(SequencerError::UnknownTrack(track));
        }
        self.scheduler.set_command_scheduler(track, sink);
        Ok(())
    }

    pub fn command_scheduler_for_track(&self, track: TrackId) -> Option<SinkRef> {
        self.scheduler.command_scheduler_for_track(track)
    }

    /// The builtin synth of a track, created through the sink factory on
    /// first use.
    pub fn builtin_synthesizer_for_track(&mut self, track: TrackId) -> Option<SinkRef> {
        if !self.lock_sequence().contains_track(track) {
            return None;
        }
        self.scheduler.builtin_synthesizer_for_track(track)
    }

    /// Sends a sink's pending note-offs right away.
    pub fn stop_all_playing_notes_for_scheduler(&self, sink: &SinkRef) {
        flush_sink(sink);
    }

    /// Sets the factory builtin synths are created with.
    pub fn set_sink_factory(&mut self, factory: Option<Box<dyn SinkFactory>>) {
        self.scheduler.set_sink_factory(factory);
    }

    pub fn create_synths_if_needed(&self) -> bool {
        self.scheduler.create_synths_if_needed()
    }

    pub fn set_create_synths_if_needed(&mut self, create: bool) {
        self.scheduler.set_create_synths_if_needed(create);
    }

    pub fn maximum_look_ahead_interval(&self) -> f64 {
        self.scheduler.maximum_look_ahead_interval()
    }

    /// Sets the scheduling lookahead in seconds, clamped to 0.05..=1.0.
    /// Returns the value in effect.
    pub fn set_maximum_look_ahead_interval(&mut self, seconds: f64) -> f64 {
        self.scheduler.set_maximum_look_ahead_interval(seconds)
    }

    pub fn set_command_modifier(&mut self, modifier: Option<Box<dyn CommandModifier>>) {
        self.scheduler.set_command_modifier(modifier);
    }

    pub fn set_transpose(&mut self, semitones: i8) {
        self.scheduler.set_transpose(semitones);
    }

    pub fn subscribe_loop_notifications(&mut self) -> Receiver<LoopApproaching> {
        self.scheduler.subscribe_loop_notifications()
    }

    // --- recording ---

    pub fn pre_roll(&self) -> MusicTimeStamp {
        self.record_engine.pre_roll()
    }

    pub fn set_pre_roll(&mut self, beats: MusicTimeStamp) -> Result<()> {
        self.record_engine.set_pre_roll(beats)
    }

    pub fn click_track_status(&self) -> ClickTrackStatus {
        self.record_engine.click_track_status()
    }

    pub fn set_click_track_status(&mut self, status: ClickTrackStatus) {
        self.record_engine.set_click_track_status(status);
    }

    /// Sets the sink clicks are sent to. Without one, clicks are dropped.
    pub fn set_metronome(&mut self, sink: Option<SinkRef>) {
        self.metronome_sink = sink;
    }

    pub fn metronome(&self) -> Option<SinkRef> {
        self.metronome_sink.clone()
    }

    pub fn set_record_enabled_tracks(
        &mut self,
        tracks: impl IntoIterator<Item = TrackId>,
    ) -> Result<()> {
        let tracks: Vec<TrackId> = tracks.into_iter().collect();
        {
            let sequence = self.lock_sequence();
            if let Some(missing) = tracks.iter().find(|id| !sequence.contains_track(**id)) {
                return Err(SequencerError::UnknownTrack(*missing));
            }
        }
        self.record_engine.set_record_enabled_tracks(tracks);
        Ok(())
    }

    pub fn record_enabled_tracks(&self) -> Vec<TrackId> {
        self.record_engine.record_enabled_tracks().collect()
    }

    /// Records `command` at the current position.
    ///
    /// Returns false when nothing was captured: not recording, in the
    /// pre-roll, or an unmatched note-off.
    pub fn record_command(&mut self, command: &Command) -> bool {
        let now = self.now();
        self.record_command_at(command, now)
    }

    /// Records `command` at the position sounding at `host_time`.
    pub fn record_command_at(&mut self, command: &Command, host_time: HostTime) -> bool {
        if !self.is_recording() {
            return false;
        }
        let position = self.position_at(host_time);
        let sequence = Arc::clone(&self.sequence);
        let mut sequence = sequence.lock().unwrap_or_else(PoisonError::into_inner);
        self.record_engine.record(command, position, &mut sequence)
    }

    // --- ticking ---

    /// Schedules the next window as of now.
    pub fn process_tick(&mut self) -> TickReport {
        let now = self.now();
        self.process_tick_at(now)
    }

    /// Schedules the next window as of `now`.
    ///
    /// Does nothing while stopped. Stops the transport once playback has
    /// run past the end of a sequence that is neither looping nor
    /// recording.
    pub fn process_tick_at(&mut self, now: HostTime) -> TickReport {
        if !self.is_playing() {
            return TickReport::default();
        }
        self.sync_timing();
        let length = self.sequence_length();
        let report = {
            let sequence = Arc::clone(&self.sequence);
            let sequence = sequence.lock().unwrap_or_else(PoisonError::into_inner);
            self.scheduler.tick(TickContext {
                now,
                clock: &mut self.clock,
                converter: &self.converter,
                loop_controller: &mut self.loop_controller,
                sequence: &sequence,
                sequence_length: length,
                recording: self.state.is_recording(),
            })
        };
        self.sync_loop_span(length);
        self.schedule_clicks(&report);

        if report.reached_end {
            info!("end of sequence reached");
            self.stop();
            self.stopped_position = length;
        }
        report
    }

    fn schedule_clicks(&self, report: &TickReport) {
        let mut batch = Vec::new();
        for segment in &report.segments {
            batch.extend(self.record_engine.click_commands(segment, &self.converter));
        }
        if batch.is_empty() {
            return;
        }
        match &self.metronome_sink {
            Some(sink) => {
                if let Ok(mut sink) = sink.lock() {
                    sink.schedule(&batch);
                }
            }
            None => trace!(count = batch.len(), "no metronome sink, dropping clicks"),
        }
    }
}

fn validate_time_stamp(beat: MusicTimeStamp) -> Result<()> {
    if !beat.is_finite() || beat < 0.0 {
        return Err(SequencerError::InvalidTimeStamp(beat));
    }
    Ok(())
}
