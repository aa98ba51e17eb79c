//! Command modification hook applied right before dispatch.

use super::sink::{ScheduledCommand, SinkRef};
use crate::midi::TrackId;

/// Rewrites a batch of commands on its way to a sink.
///
/// Called with the track the batch comes from and the sink it is about to
/// be sent to, so the rewrite can depend on the destination. The returned
/// batch replaces the original: commands can be changed, removed or added.
/// An empty batch dispatches nothing.
pub trait CommandModifier: Send {
    fn modify(
        &mut self,
        track: TrackId,
        sink: &SinkRef,
        batch: Vec<ScheduledCommand>,
    ) -> Vec<ScheduledCommand>;
}

impl<F> CommandModifier for F
where
    F: FnMut(TrackId, &SinkRef, Vec<ScheduledCommand>) -> Vec<ScheduledCommand> + Send,
{
    fn modify(
        &mut self,
        track: TrackId,
        sink: &SinkRef,
        batch: Vec<ScheduledCommand>,
    ) -> Vec<ScheduledCommand> {
        self(track, sink, batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::MidiMessage;
    use crate::scheduler::{same_sink, shared_sink, MemorySink};
    use crate::timing::HostTime;

    #[test]
    fn test_closure_modifier() {
        // Low notes only go to the bass sink
        let bass = shared_sink(MemorySink::new());
        let bass_sink = bass.clone();
        let mut drop_low_notes = move |_track: TrackId,
                                       sink: &SinkRef,
                                       batch: Vec<ScheduledCommand>|
              -> Vec<ScheduledCommand> {
            if same_sink(sink, &bass_sink) {
                return batch;
            }
            batch
                .into_iter()
                .filter(|c| !matches!(c.message, MidiMessage::NoteOn { key, .. } if key < 48))
                .collect()
        };
        let batch = vec![
            ScheduledCommand::new(
                HostTime::ZERO,
                0.0,
                MidiMessage::NoteOn {
                    channel: 0,
                    key: 36,
                    velocity: 100,
                },
            ),
            ScheduledCommand::new(
                HostTime::ZERO,
                0.0,
                MidiMessage::NoteOn {
                    channel: 0,
                    key: 60,
                    velocity: 100,
                },
            ),
        ];
        let other = shared_sink(MemorySink::new());
        let kept = drop_low_notes.modify(TrackId::new(), &other, batch.clone());
        assert_eq!(kept.len(), 1);
        let kept = drop_low_notes.modify(TrackId::new(), &bass, batch);
        assert_eq!(kept.len(), 2);
    }
}
