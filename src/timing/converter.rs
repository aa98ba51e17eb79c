//! Beat/second conversion with tempo override, rate and loop unrolling.
//!
//! Three layers sit on top of the [`TempoMap`]:
//!
//! - a tempo override replaces the whole map with one constant tempo
//! - the playback rate divides elapsed seconds
//! - an engaged loop region unrolls beats past the loop end into repeated
//!   passes of the loop
//!
//! Each layer can be switched off per call with [`ConversionOptions`].

use super::clock::{ClockAnchor, HostTime};
use super::tempo_map::{TempoEvent, TempoMap};
use crate::error::{Result, SequencerError};
use crate::midi::MusicTimeStamp;
use bitflags::bitflags;

bitflags! {
    /// Per-call switches for [`TimeConverter`] conversions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConversionOptions: u8 {
        /// Use the tempo track even when a tempo override is set.
        const IGNORE_TEMPO_OVERRIDE = 0x01;
        /// Convert as if looping were off.
        const IGNORE_LOOPING = 0x02;
        /// Report the position inside the loop instead of the total
        /// elapsed position.
        const DONT_UNROLL_LOOP = 0x04;
        /// Convert at rate 1.0.
        const IGNORE_RATE = 0x08;
    }
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self::empty()
    }
}

/// A loop region with a resolved, positive length.
#[derive(Debug, Clone, Copy, PartialEq)]
struct LoopSpan {
    start: MusicTimeStamp,
    end: MusicTimeStamp,
}

impl LoopSpan {
    fn length(&self) -> MusicTimeStamp {
        self.end - self.start
    }
}

/// Converts between beats, seconds and host time.
#[derive(Debug, Clone)]
pub struct TimeConverter {
    /// Tempo events the map was built from, used to detect changes.
    source_events: Vec<TempoEvent>,
    tempo_map: TempoMap,
    tempo_override: Option<f64>,
    override_map: Option<TempoMap>,
    rate: f64,
    loop_span: Option<LoopSpan>,
}

impl TimeConverter {
    pub fn new(tempo_map: TempoMap) -> Self {
        Self {
            source_events: tempo_map.events().to_vec(),
            tempo_map,
            tempo_override: None,
            override_map: None,
            rate: 1.0,
            loop_span: None,
        }
    }

    /// Converter over the tempo events of a tempo track.
    pub fn from_events(events: Vec<TempoEvent>) -> Self {
        let mut converter = Self::new(TempoMap::default());
        converter.update_tempo_events(events);
        converter
    }

    /// Rebuilds the tempo map if `events` differ from the ones it was built
    /// from.
    pub fn update_tempo_events(&mut self, events: Vec<TempoEvent>) {
        if events != self.source_events {
            self.tempo_map = TempoMap::new(events.iter().copied());
            self.source_events = events;
        }
    }

    pub fn tempo_map(&self) -> &TempoMap {
        &self.tempo_map
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Sets the playback rate. Rejects zero, negative and non-finite rates.
    pub fn set_rate(&mut self, rate: f64) -> Result<()> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(SequencerError::InvalidRate(rate));
        }
        self.rate = rate;
        Ok(())
    }

    pub fn tempo_override(&self) -> Option<f64> {
        self.tempo_override
    }

    /// Sets or clears the tempo override.
    pub fn set_tempo_override(&mut self, bpm: Option<f64>) -> Result<()> {
        match bpm {
            Some(bpm) if !bpm.is_finite() || bpm <= 0.0 => Err(SequencerError::InvalidTempo(bpm)),
            Some(bpm) => {
                self.tempo_override = Some(bpm);
                self.override_map = Some(TempoMap::constant(bpm));
                Ok(())
            }
            None => {
                self.tempo_override = None;
                self.override_map = None;
                Ok(())
            }
        }
    }

    /// Sets the loop region conversions follow, or `None` when the loop is
    /// not engaged. Regions with a length of zero or less count as no loop.
    pub fn set_loop_span(&mut self, span: Option<(MusicTimeStamp, MusicTimeStamp)>) {
        self.loop_span = span
            .map(|(start, end)| LoopSpan { start, end })
            .filter(|span| span.length() > 0.0);
    }

    /// The engaged loop region, if any.
    pub fn loop_span(&self) -> Option<(MusicTimeStamp, MusicTimeStamp)> {
        self.loop_span.map(|span| (span.start, span.end))
    }

    /// Tempo in effect at `beat`, override included.
    pub fn tempo_at(&self, beat: MusicTimeStamp) -> f64 {
        self.map(ConversionOptions::empty()).tempo_at(beat)
    }

    fn map(&self, options: ConversionOptions) -> &TempoMap {
        match &self.override_map {
            Some(map) if !options.contains(ConversionOptions::IGNORE_TEMPO_OVERRIDE) => map,
            _ => &self.tempo_map,
        }
    }

    fn active_loop(&self, options: ConversionOptions) -> Option<LoopSpan> {
        if options.contains(ConversionOptions::IGNORE_LOOPING) {
            None
        } else {
            self.loop_span
        }
    }

    /// Seconds from beat 0 to `beat`.
    ///
    /// With an engaged loop, a beat at or past the loop end counts as that
    /// many beats of repeated loop passes after the first arrival at the loop
    /// end. With [`ConversionOptions::DONT_UNROLL_LOOP`] the beat is first
    /// folded back into the loop instead.
    pub fn seconds_for_beat(&self, beat: MusicTimeStamp, options: ConversionOptions) -> f64 {
        let map = self.map(options);
        let seconds = match self.active_loop(options) {
            Some(span) if beat >= span.end => {
                let length = span.length();
                if options.contains(ConversionOptions::DONT_UNROLL_LOOP) {
                    map.seconds_for_beat(span.start + (beat - span.start).rem_euclid(length))
                } else {
                    let passes = ((beat - span.end) / length).floor();
                    let remainder = (beat - span.end) - passes * length;
                    let start_seconds = map.seconds_for_beat(span.start);
                    let pass_seconds = map.seconds_for_beat(span.end) - start_seconds;
                    map.seconds_for_beat(span.end)
                        + passes * pass_seconds
                        + (map.seconds_for_beat(span.start + remainder) - start_seconds)
                }
            }
            _ => map.seconds_for_beat(beat),
        };
        if options.contains(ConversionOptions::IGNORE_RATE) {
            seconds
        } else {
            seconds / self.rate
        }
    }

    /// Beat reached after `seconds` from beat 0. Inverse of
    /// [`seconds_for_beat`](Self::seconds_for_beat) for the same options.
    pub fn beat_for_seconds(&self, seconds: f64, options: ConversionOptions) -> MusicTimeStamp {
        let map = self.map(options);
        let seconds = if options.contains(ConversionOptions::IGNORE_RATE) {
            seconds
        } else {
            seconds * self.rate
        };
        let Some(span) = self.active_loop(options) else {
            return map.beat_for_seconds(seconds);
        };
        let end_seconds = map.seconds_for_beat(span.end);
        if seconds < end_seconds {
            return map.beat_for_seconds(seconds);
        }
        let start_seconds = map.seconds_for_beat(span.start);
        let pass_seconds = end_seconds - start_seconds;
        let passes = ((seconds - end_seconds) / pass_seconds).floor();
        let remainder = (seconds - end_seconds) - passes * pass_seconds;
        let in_loop = map.beat_for_seconds(start_seconds + remainder);
        if options.contains(ConversionOptions::DONT_UNROLL_LOOP) {
            in_loop
        } else {
            span.end + passes * span.length() + (in_loop - span.start)
        }
    }

    /// Beat sounding at `host_time` for playback anchored at `anchor`.
    ///
    /// Follows the tempo map (override included) from the anchor beat
    /// without wrapping at a loop end.
    pub fn beat_at_host_time(&self, anchor: &ClockAnchor, host_time: HostTime) -> MusicTimeStamp {
        let map = self.map(ConversionOptions::empty());
        let elapsed = host_time.seconds_since(anchor.host_time) * anchor.rate;
        map.beat_for_seconds(map.seconds_for_beat(anchor.beat) + elapsed)
    }

    /// Host time at which `beat` sounds for playback anchored at `anchor`.
    pub fn host_time_for_beat(&self, anchor: &ClockAnchor, beat: MusicTimeStamp) -> HostTime {
        let map = self.map(ConversionOptions::empty());
        let seconds = map.seconds_for_beat(beat) - map.seconds_for_beat(anchor.beat);
        anchor.host_time.offset_by(seconds / anchor.rate)
    }
}

impl Default for TimeConverter {
    fn default() -> Self {
        Self::new(TempoMap::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn looping(start: f64, end: f64) -> TimeConverter {
        let mut converter = TimeConverter::default();
        converter.set_loop_span(Some((start, end)));
        converter
    }

    #[test]
    fn test_loop_unrolling_duality() {
        // Loop [4, 8) at 120 BPM
        let converter = looping(4.0, 8.0);
        let unrolled = converter.seconds_for_beat(20.0, ConversionOptions::empty());
        assert_relative_eq!(unrolled, 10.0);
        let in_loop = converter.seconds_for_beat(20.0, ConversionOptions::DONT_UNROLL_LOOP);
        assert_relative_eq!(in_loop, 2.0);

        let partial = converter.seconds_for_beat(21.5, ConversionOptions::DONT_UNROLL_LOOP);
        assert_relative_eq!(partial, 2.75);
    }

    #[test]
    fn test_loop_unrolling_with_tempo_change_inside_loop() {
        let mut converter = TimeConverter::from_events(vec![
            TempoEvent::new(0.0, 120.0),
            TempoEvent::new(6.0, 60.0),
        ]);
        converter.set_loop_span(Some((4.0, 8.0)));
        // [0,8): 3s + 2s = 5s, one pass is 1s + 2s = 3s
        let options = ConversionOptions::empty();
        assert_relative_eq!(converter.seconds_for_beat(8.0, options), 5.0);
        assert_relative_eq!(converter.seconds_for_beat(12.0, options), 8.0);
        // Beat 15 is 3 beats into the second pass: 1s at 120 then 1s at 60
        assert_relative_eq!(converter.seconds_for_beat(15.0, options), 10.0);
        assert_relative_eq!(converter.beat_for_seconds(10.0, options), 15.0, epsilon = 1e-9);
        assert_relative_eq!(
            converter.beat_for_seconds(10.0, ConversionOptions::DONT_UNROLL_LOOP),
            7.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_loop_round_trip() {
        let mut converter = TimeConverter::from_events(vec![
            TempoEvent::new(0.0, 100.0),
            TempoEvent::new(2.0, 140.0),
            TempoEvent::new(5.0, 70.0),
            TempoEvent::new(7.0, 200.0),
            TempoEvent::new(9.0, 90.0),
        ]);
        converter.set_loop_span(Some((3.0, 8.0)));
        converter.set_rate(1.5).unwrap();
        for options in [
            ConversionOptions::empty(),
            ConversionOptions::IGNORE_LOOPING,
            ConversionOptions::IGNORE_RATE,
        ] {
            let mut beat = 0.0;
            while beat < 40.0 {
                let seconds = converter.seconds_for_beat(beat, options);
                assert_relative_eq!(
                    converter.beat_for_seconds(seconds, options),
                    beat,
                    epsilon = 1e-9
                );
                beat += 0.41;
            }
        }
    }

    #[test]
    fn test_ignore_looping() {
        let converter = looping(4.0, 8.0);
        assert_relative_eq!(
            converter.seconds_for_beat(20.0, ConversionOptions::IGNORE_LOOPING),
            10.0
        );
        assert_relative_eq!(
            converter.seconds_for_beat(20.0, ConversionOptions::IGNORE_LOOPING | ConversionOptions::DONT_UNROLL_LOOP),
            10.0
        );
    }

    #[test]
    fn test_empty_loop_is_ignored() {
        let converter = looping(4.0, 4.0);
        assert!(converter.loop_span().is_none());
        assert_relative_eq!(
            converter.seconds_for_beat(20.0, ConversionOptions::DONT_UNROLL_LOOP),
            10.0
        );
    }

    #[test]
    fn test_rate_scaling() {
        let mut converter = TimeConverter::from_events(vec![
            TempoEvent::new(0.0, 120.0),
            TempoEvent::new(4.0, 90.0),
        ]);
        converter.set_rate(2.0).unwrap();
        for beat in [0.0, 1.0, 3.5, 4.0, 7.25, 12.0] {
            let scaled = converter.seconds_for_beat(beat, ConversionOptions::empty());
            let unscaled = converter.seconds_for_beat(beat, ConversionOptions::IGNORE_RATE);
            assert_relative_eq!(scaled, unscaled / 2.0);
        }
        assert_eq!(converter.set_rate(0.0), Err(SequencerError::InvalidRate(0.0)));
        assert_eq!(converter.rate(), 2.0);
    }

    #[test]
    fn test_tempo_override() {
        let mut converter = TimeConverter::from_events(vec![
            TempoEvent::new(0.0, 120.0),
            TempoEvent::new(4.0, 60.0),
        ]);
        converter.set_tempo_override(Some(60.0)).unwrap();
        assert_relative_eq!(converter.seconds_for_beat(8.0, ConversionOptions::empty()), 8.0);
        assert_relative_eq!(
            converter.seconds_for_beat(8.0, ConversionOptions::IGNORE_TEMPO_OVERRIDE),
            6.0
        );
        assert_eq!(converter.tempo_at(0.0), 60.0);

        assert!(converter.set_tempo_override(Some(-5.0)).is_err());
        assert_eq!(converter.tempo_override(), Some(60.0));

        converter.set_tempo_override(None).unwrap();
        assert_relative_eq!(converter.seconds_for_beat(8.0, ConversionOptions::empty()), 6.0);
    }

    #[test]
    fn test_host_time_mapping() {
        let converter = TimeConverter::from_events(vec![
            TempoEvent::new(0.0, 120.0),
            TempoEvent::new(4.0, 60.0),
        ]);
        let anchor = ClockAnchor::new(HostTime::from_secs_f64(10.0), 2.0, 1.0);
        // Beat 2 -> 4 takes 1s, then 1s per beat
        let host = HostTime::from_secs_f64(12.0);
        assert_relative_eq!(converter.beat_at_host_time(&anchor, host), 5.0, epsilon = 1e-9);
        assert_eq!(converter.host_time_for_beat(&anchor, 5.0), host);

        let fast = ClockAnchor::new(HostTime::from_secs_f64(10.0), 2.0, 2.0);
        assert_relative_eq!(
            converter.beat_at_host_time(&fast, HostTime::from_secs_f64(11.0)),
            5.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_update_tempo_events() {
        let mut converter = TimeConverter::default();
        assert_relative_eq!(converter.seconds_for_beat(4.0, ConversionOptions::empty()), 2.0);
        converter.update_tempo_events(vec![TempoEvent::new(0.0, 60.0)]);
        assert_relative_eq!(converter.seconds_for_beat(4.0, ConversionOptions::empty()), 4.0);
    }
}
