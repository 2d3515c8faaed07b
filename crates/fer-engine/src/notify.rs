//! Reconstruction progress events.
//!
//! Subscribers get a `Start` when a group enters an active rebuild episode,
//! `InProgress` events with a percent that only ever moves forward, and an
//! `End` at 100 when every rebuilding position of the episode finishes.
//!
//! Percent is scaled to the episode's total work: when two positions rebuild
//! concurrently the denominator is the sum of both positions' marked chunks,
//! so a given LBA offset reads roughly half of what a single-position
//! rebuild would report.

use crossbeam_channel::{unbounded, Receiver, Sender};
use fer_types::{ObjectId, PositionIndex};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Phase of a reconstruction episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconstructionPhase {
    Start,
    InProgress,
    End,
}

/// One progress notification for one redundant group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconstructionEvent {
    pub object: ObjectId,
    pub phase: ReconstructionPhase,
    /// 0 at `Start`, strictly increasing through `InProgress`, 100 at `End`.
    pub percent: u8,
}

#[derive(Debug)]
struct Episode {
    /// Chunks marked for rebuild across every active position when each
    /// joined the episode.
    total: u64,
    rebuilt: u64,
    active: BTreeSet<PositionIndex>,
    last_percent: u8,
}

#[derive(Debug, Default)]
struct ObjectChannel {
    senders: Vec<Sender<ReconstructionEvent>>,
    episode: Option<Episode>,
}

/// Fan-out publisher for reconstruction progress.
#[derive(Debug, Default)]
pub struct NotificationPublisher {
    channels: Mutex<BTreeMap<ObjectId, ObjectChannel>>,
}

impl NotificationPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one group's reconstruction events. Dropped receivers are
    /// pruned on the next send.
    pub fn subscribe(&self, object: ObjectId) -> Receiver<ReconstructionEvent> {
        let (tx, rx) = unbounded();
        self.channels.lock().entry(object).or_default().senders.push(tx);
        rx
    }

    pub fn forget(&self, object: ObjectId) {
        self.channels.lock().remove(&object);
    }

    /// A position joined the rebuild episode with `total_chunks` of work.
    /// Opens the episode (and emits `Start` at 0) if none is active.
    pub fn episode_started(&self, object: ObjectId, position: PositionIndex, total_chunks: u64) {
        let mut channels = self.channels.lock();
        let channel = channels.entry(object).or_default();
        let episode = channel.episode.get_or_insert_with(|| Episode {
            total: 0,
            rebuilt: 0,
            active: BTreeSet::new(),
            last_percent: 0,
        });
        let fresh = episode.active.is_empty();
        episode.active.insert(position);
        episode.total = episode.total.saturating_add(total_chunks);
        debug!(%object, %position, total_chunks, "rebuild episode position added");
        if fresh {
            Self::send(channel, object, ReconstructionPhase::Start, 0);
        }
    }

    /// `chunks` more chunks were durably rebuilt. Emits `InProgress` only
    /// when the floor percent moved forward; clamps below 100 so the final
    /// percent is reserved for `End`.
    pub fn chunks_rebuilt(&self, object: ObjectId, chunks: u64) {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get_mut(&object) else {
            return;
        };
        let Some(episode) = channel.episode.as_mut() else {
            return;
        };
        episode.rebuilt = episode.rebuilt.saturating_add(chunks);
        let percent = if episode.total == 0 {
            99
        } else {
            u8::try_from(episode.rebuilt.saturating_mul(100) / episode.total)
                .unwrap_or(99)
                .min(99)
        };
        if percent > episode.last_percent {
            episode.last_percent = percent;
            Self::send(channel, object, ReconstructionPhase::InProgress, percent);
        }
    }

    /// One position finished its rebuild. Closes the episode (emitting `End`
    /// at 100) once no active position remains.
    pub fn position_complete(&self, object: ObjectId, position: PositionIndex) {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get_mut(&object) else {
            return;
        };
        let Some(episode) = channel.episode.as_mut() else {
            return;
        };
        episode.active.remove(&position);
        debug!(%object, %position, remaining = episode.active.len(), "rebuild position complete");
        if episode.active.is_empty() {
            channel.episode = None;
            Self::send(channel, object, ReconstructionPhase::End, 100);
        }
    }

    fn send(
        channel: &mut ObjectChannel,
        object: ObjectId,
        phase: ReconstructionPhase,
        percent: u8,
    ) {
        let event = ReconstructionEvent {
            object,
            phase,
            percent,
        };
        channel.senders.retain(|tx| tx.send(event).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &Receiver<ReconstructionEvent>) -> Vec<ReconstructionEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn single_position_episode_start_progress_end() {
        let publisher = NotificationPublisher::new();
        let id = ObjectId(1);
        let rx = publisher.subscribe(id);

        publisher.episode_started(id, PositionIndex(1), 10);
        publisher.chunks_rebuilt(id, 5);
        publisher.chunks_rebuilt(id, 5);
        publisher.position_complete(id, PositionIndex(1));

        let events = drain(&rx);
        assert_eq!(events[0].phase, ReconstructionPhase::Start);
        assert_eq!(events[0].percent, 0);
        assert_eq!(events[1].phase, ReconstructionPhase::InProgress);
        assert_eq!(events[1].percent, 50);
        // 10/10 clamps to 99; 100 belongs to End alone.
        assert_eq!(events[2].percent, 99);
        assert_eq!(events.last().unwrap().phase, ReconstructionPhase::End);
        assert_eq!(events.last().unwrap().percent, 100);
    }

    #[test]
    fn percent_never_regresses() {
        let publisher = NotificationPublisher::new();
        let id = ObjectId(2);
        let rx = publisher.subscribe(id);

        publisher.episode_started(id, PositionIndex(0), 100);
        publisher.chunks_rebuilt(id, 40);
        // A second position joining grows the denominator; the floor percent
        // drops, so no event fires until progress catches back up.
        publisher.episode_started(id, PositionIndex(2), 100);
        publisher.chunks_rebuilt(id, 10);
        publisher.chunks_rebuilt(id, 50);

        let events = drain(&rx);
        let percents: Vec<u8> = events.iter().map(|e| e.percent).collect();
        for pair in percents.windows(2) {
            assert!(pair[1] >= pair[0], "regressed: {percents:?}");
        }
        assert_eq!(*percents.last().unwrap(), 50); // 100 of 200
    }

    #[test]
    fn concurrent_positions_halve_the_scale() {
        let publisher = NotificationPublisher::new();
        let id = ObjectId(3);
        let rx = publisher.subscribe(id);

        publisher.episode_started(id, PositionIndex(0), 50);
        publisher.episode_started(id, PositionIndex(1), 50);
        publisher.chunks_rebuilt(id, 25);

        let events = drain(&rx);
        // 25 chunks into a 100-chunk episode: 25%, not the 50% a lone
        // position would report.
        assert_eq!(events.last().unwrap().percent, 25);
    }

    #[test]
    fn end_waits_for_every_position() {
        let publisher = NotificationPublisher::new();
        let id = ObjectId(4);
        let rx = publisher.subscribe(id);

        publisher.episode_started(id, PositionIndex(0), 4);
        publisher.episode_started(id, PositionIndex(1), 4);
        publisher.chunks_rebuilt(id, 8);
        publisher.position_complete(id, PositionIndex(0));
        assert!(
            drain(&rx).iter().all(|e| e.phase != ReconstructionPhase::End),
            "ended with a position still rebuilding"
        );

        publisher.position_complete(id, PositionIndex(1));
        let events = drain(&rx);
        assert_eq!(events.last().unwrap().phase, ReconstructionPhase::End);

        // Episode closed: a fresh degradation opens a new one from Start.
        publisher.episode_started(id, PositionIndex(0), 4);
        let events = drain(&rx);
        assert_eq!(events[0].phase, ReconstructionPhase::Start);
        assert_eq!(events[0].percent, 0);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let publisher = NotificationPublisher::new();
        let id = ObjectId(5);
        let rx1 = publisher.subscribe(id);
        let rx2 = publisher.subscribe(id);
        drop(rx1);

        publisher.episode_started(id, PositionIndex(0), 2);
        assert_eq!(drain(&rx2).len(), 1);
    }
}
