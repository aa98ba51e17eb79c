//! Dispatching commands to sinks ahead of time.

mod hook;
mod lookahead;
mod sink;

pub use hook::CommandModifier;
pub use lookahead::{
    flush_sink, LookaheadScheduler, LoopApproaching, ScheduledSegment, TickContext, TickReport,
    DEFAULT_LOOK_AHEAD_INTERVAL, MAX_LOOK_AHEAD_INTERVAL, MIN_LOOK_AHEAD_INTERVAL,
};
pub use sink::{
    same_sink, shared_sink, CommandSchedulingSink, MemorySink, ScheduledCommand, SinkFactory,
    SinkRef,
};
