//! Host time source and the host-time/beat anchor.
//!
//! The sequencer never reads wall-clock time directly. It asks a
//! [`HostClock`] for the current [`HostTime`] so offline rendering and tests
//! can step time by hand with a [`ManualClock`].
//!
//! # Thread Safety
//! [`ManualClock`] clones share one atomic counter, so a test or an offline
//! driver can advance time from any thread. [`ClockAnchor`] is a `Copy` value
//! that is always replaced whole.

use crate::midi::MusicTimeStamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

/// A monotonic host time in nanoseconds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct HostTime(u64);

impl HostTime {
    pub const ZERO: HostTime = HostTime(0);

    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Converts seconds to host time. Negative values clamp to zero.
    pub fn from_secs_f64(seconds: f64) -> Self {
        Self((seconds.max(0.0) * NANOS_PER_SECOND).round() as u64)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / NANOS_PER_SECOND
    }

    /// Returns this time moved by `seconds`, which may be negative.
    ///
    /// The result saturates at zero.
    pub fn offset_by(&self, seconds: f64) -> Self {
        let delta = (seconds.abs() * NANOS_PER_SECOND).round() as u64;
        if seconds >= 0.0 {
            Self(self.0.saturating_add(delta))
        } else {
            Self(self.0.saturating_sub(delta))
        }
    }

    /// Signed number of seconds from `earlier` to `self`.
    pub fn seconds_since(&self, earlier: HostTime) -> f64 {
        if self.0 >= earlier.0 {
            (self.0 - earlier.0) as f64 / NANOS_PER_SECOND
        } else {
            -((earlier.0 - self.0) as f64 / NANOS_PER_SECOND)
        }
    }
}

impl fmt::Display for HostTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

/// A monotonic source of host time.
pub trait HostClock: Send + Sync {
    /// Returns the current host time. Never decreases.
    fn now(&self) -> HostTime;
}

/// Host clock backed by [`Instant`], counting from its creation.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for MonotonicClock {
    fn now(&self) -> HostTime {
        HostTime::from_nanos(self.origin.elapsed().as_nanos() as u64)
    }
}

/// Host clock that only moves when told to.
///
/// Clones share the same time, so one handle can be given to a sequencer
/// while another drives it.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the current time. Moving backwards is ignored.
    pub fn set(&self, time: HostTime) {
        self.nanos.fetch_max(time.as_nanos(), Ordering::SeqCst);
    }

    /// Moves time forward by `seconds`.
    pub fn advance(&self, seconds: f64) {
        let delta = (seconds.max(0.0) * NANOS_PER_SECOND).round() as u64;
        self.nanos.fetch_add(delta, Ordering::SeqCst);
    }
}

impl HostClock for ManualClock {
    fn now(&self) -> HostTime {
        HostTime::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Pins a beat position to a host time.
///
/// Every start, resume, loop wrap and rate or tempo-override change replaces
/// the anchor with a new one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockAnchor {
    /// Host time at which `beat` sounds.
    pub host_time: HostTime,
    /// Beat position at `host_time`, inside the loop region when looping.
    pub beat: MusicTimeStamp,
    /// Playback rate in effect from this anchor on.
    pub rate: f64,
}

impl ClockAnchor {
    pub fn new(host_time: HostTime, beat: MusicTimeStamp, rate: f64) -> Self {
        Self {
            host_time,
            beat,
            rate,
        }
    }
}

/// A host clock plus the current anchor, if any.
#[derive(Clone)]
pub struct Clock {
    source: Arc<dyn HostClock>,
    anchor: Option<ClockAnchor>,
}

impl Clock {
    pub fn new(source: Arc<dyn HostClock>) -> Self {
        Self {
            source,
            anchor: None,
        }
    }

    /// Clock over a fresh [`MonotonicClock`].
    pub fn monotonic() -> Self {
        Self::new(Arc::new(MonotonicClock::new()))
    }

    pub fn now(&self) -> HostTime {
        self.source.now()
    }

    pub fn anchor(&self) -> Option<ClockAnchor> {
        self.anchor
    }

    /// Replaces the anchor.
    pub fn set_anchor(&mut self, anchor: ClockAnchor) {
        self.anchor = Some(anchor);
    }

    /// Anchors `beat` at the current host time.
    pub fn anchor_now(&mut self, beat: MusicTimeStamp, rate: f64) -> ClockAnchor {
        let anchor = ClockAnchor::new(self.now(), beat, rate);
        self.anchor = Some(anchor);
        anchor
    }

    pub fn clear_anchor(&mut self) {
        self.anchor = None;
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("now", &self.now())
            .field("anchor", &self.anchor)
            .finish()
    }
}
