#![forbid(unsafe_code)]
//! Simulated array for exercising the recovery engines.
//!
//! [`SimArray`] implements every collaborator seam the service needs:
//! drive/group availability, chunk resync, quiescence, verify reads with
//! injectable issues, and sniff/zeroing media. Knobs let a test yank a
//! drive's availability, hold a chunk un-quiesced, or plant coherency and
//! media errors, then observe exactly which chunks the engines touched.
//!
//! [`SimPeer`] plays the standby controller and asserts the one property
//! that matters on that wire: per (object, operation), the rank of the
//! received checkpoint never decreases, except through the tagged
//! `NotStarted` reset that announces a new pass.

use fer_engine::peersync::{PeerAck, PeerCheckpoint, PeerTransport, SyncOpId};
use fer_engine::{
    CoherencyIssue, DriveLifecycle, DriveMedia, QuiesceControl, ResyncMedia, VerifyMedia,
};
use fer_error::{RecoveryError, Result};
use fer_types::{ChunkIndex, ObjectId, PositionIndex, VerifyKind};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

#[derive(Debug, Default)]
struct SimState {
    groups_down: BTreeSet<ObjectId>,
    positions_missing: BTreeSet<(ObjectId, u8)>,
    quiesce_holds: BTreeSet<(ObjectId, u64)>,
    /// Issues a verify read reports until corrected.
    verify_issues: BTreeMap<(ObjectId, u64), Vec<CoherencyIssue>>,
    /// Issues a sniff read reports (media errors persist across passes).
    sniff_issues: BTreeMap<(ObjectId, u64), Vec<CoherencyIssue>>,
    resync_failures: BTreeSet<(ObjectId, u64)>,
    resynced: Vec<(ObjectId, u8, u64)>,
    metadata_rebuilt: Vec<(ObjectId, u64)>,
    sniffed: Vec<(ObjectId, u64)>,
    zeroed: Vec<(ObjectId, u64)>,
}

/// Simulated drives, media and host-I/O plumbing.
#[derive(Debug, Default)]
pub struct SimArray {
    state: Mutex<SimState>,
}

impl SimArray {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ── Knobs ───────────────────────────────────────────────────────────────

    pub fn set_group_available(&self, object: ObjectId, available: bool) {
        let mut state = self.state.lock();
        if available {
            state.groups_down.remove(&object);
        } else {
            state.groups_down.insert(object);
        }
    }

    pub fn set_position_available(&self, object: ObjectId, position: PositionIndex, available: bool) {
        let mut state = self.state.lock();
        if available {
            state.positions_missing.remove(&(object, position.0));
        } else {
            state.positions_missing.insert((object, position.0));
        }
    }

    /// Hold host I/O open against a chunk so it never quiesces.
    pub fn hold_chunk(&self, object: ObjectId, chunk: ChunkIndex) {
        self.state.lock().quiesce_holds.insert((object, chunk.0));
    }

    pub fn release_chunk(&self, object: ObjectId, chunk: ChunkIndex) {
        self.state.lock().quiesce_holds.remove(&(object, chunk.0));
    }

    /// Plant an issue a verify read will find. Correctable issues disappear
    /// once the engine corrects the chunk.
    pub fn inject_verify_issue(&self, object: ObjectId, chunk: ChunkIndex, issue: CoherencyIssue) {
        self.state
            .lock()
            .verify_issues
            .entry((object, chunk.0))
            .or_default()
            .push(issue);
    }

    pub fn inject_sniff_issue(&self, object: ObjectId, chunk: ChunkIndex, issue: CoherencyIssue) {
        self.state
            .lock()
            .sniff_issues
            .entry((object, chunk.0))
            .or_default()
            .push(issue);
    }

    /// Make resync of one chunk fail until cleared.
    pub fn fail_resync(&self, object: ObjectId, chunk: ChunkIndex) {
        self.state.lock().resync_failures.insert((object, chunk.0));
    }

    pub fn heal_resync(&self, object: ObjectId, chunk: ChunkIndex) {
        self.state.lock().resync_failures.remove(&(object, chunk.0));
    }

    // ── Observations ────────────────────────────────────────────────────────

    /// Chunks resynced for one position, in order.
    #[must_use]
    pub fn resynced_chunks(&self, object: ObjectId, position: PositionIndex) -> Vec<u64> {
        self.state
            .lock()
            .resynced
            .iter()
            .filter(|(id, pos, _)| *id == object && *pos == position.0)
            .map(|(_, _, chunk)| *chunk)
            .collect()
    }

    #[must_use]
    pub fn metadata_chunks(&self, object: ObjectId) -> Vec<u64> {
        self.state
            .lock()
            .metadata_rebuilt
            .iter()
            .filter(|(id, _)| *id == object)
            .map(|(_, chunk)| *chunk)
            .collect()
    }

    #[must_use]
    pub fn zeroed_chunks(&self, object: ObjectId) -> Vec<u64> {
        self.state
            .lock()
            .zeroed
            .iter()
            .filter(|(id, _)| *id == object)
            .map(|(_, chunk)| *chunk)
            .collect()
    }

    #[must_use]
    pub fn sniff_count(&self, object: ObjectId) -> usize {
        self.state
            .lock()
            .sniffed
            .iter()
            .filter(|(id, _)| *id == object)
            .count()
    }
}

impl DriveLifecycle for SimArray {
    fn position_available(&self, object: ObjectId, position: PositionIndex) -> bool {
        !self
            .state
            .lock()
            .positions_missing
            .contains(&(object, position.0))
    }

    fn group_available(&self, object: ObjectId) -> bool {
        !self.state.lock().groups_down.contains(&object)
    }
}

impl ResyncMedia for SimArray {
    fn resync_chunk(
        &self,
        object: ObjectId,
        position: PositionIndex,
        chunk: ChunkIndex,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.resync_failures.contains(&(object, chunk.0)) {
            return Err(RecoveryError::Io(std::io::Error::other(
                "simulated resync failure",
            )));
        }
        trace!(%object, %position, chunk = chunk.0, "sim resync");
        state.resynced.push((object, position.0, chunk.0));
        Ok(())
    }

    fn rebuild_metadata_chunk(&self, object: ObjectId, chunk: ChunkIndex) -> Result<()> {
        self.state.lock().metadata_rebuilt.push((object, chunk.0));
        Ok(())
    }
}

impl QuiesceControl for SimArray {
    fn chunk_quiescent(&self, object: ObjectId, chunk: ChunkIndex) -> bool {
        !self.state.lock().quiesce_holds.contains(&(object, chunk.0))
    }
}

impl VerifyMedia for SimArray {
    fn check_chunk(
        &self,
        object: ObjectId,
        _kind: VerifyKind,
        chunk: ChunkIndex,
    ) -> Result<Vec<CoherencyIssue>> {
        Ok(self
            .state
            .lock()
            .verify_issues
            .get(&(object, chunk.0))
            .cloned()
            .unwrap_or_default())
    }

    fn correct_chunk(&self, object: ObjectId, chunk: ChunkIndex) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(issues) = state.verify_issues.get_mut(&(object, chunk.0)) {
            issues.retain(|i| !i.correctable);
            if issues.is_empty() {
                state.verify_issues.remove(&(object, chunk.0));
            }
        }
        Ok(())
    }
}

impl DriveMedia for SimArray {
    fn sniff_chunk(&self, object: ObjectId, chunk: ChunkIndex) -> Result<Vec<CoherencyIssue>> {
        let mut state = self.state.lock();
        state.sniffed.push((object, chunk.0));
        Ok(state
            .sniff_issues
            .get(&(object, chunk.0))
            .cloned()
            .unwrap_or_default())
    }

    fn zero_chunk(&self, object: ObjectId, chunk: ChunkIndex) -> Result<()> {
        self.state.lock().zeroed.push((object, chunk.0));
        Ok(())
    }
}

// ── Standby controller ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SimPeerState {
    received: BTreeMap<(ObjectId, SyncOpId), u64>,
    regressions: Vec<(ObjectId, SyncOpId, u64, u64)>,
    unreachable: bool,
    batches: u64,
}

/// Standby-controller double that records every received checkpoint and
/// flags any rank regression on the wire.
#[derive(Debug, Default)]
pub struct SimPeer {
    state: Mutex<SimPeerState>,
}

impl SimPeer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Rank regressions observed on the wire; must stay empty.
    #[must_use]
    pub fn regressions(&self) -> Vec<(ObjectId, SyncOpId, u64, u64)> {
        self.state.lock().regressions.clone()
    }

    #[must_use]
    pub fn received_rank(&self, object: ObjectId, op: SyncOpId) -> Option<u64> {
        self.state.lock().received.get(&(object, op)).copied()
    }

    #[must_use]
    pub fn batches(&self) -> u64 {
        self.state.lock().batches
    }
}

impl PeerTransport for SimPeer {
    fn push(&self, batch: &[PeerCheckpoint]) -> Result<PeerAck> {
        let mut state = self.state.lock();
        if state.unreachable {
            return Err(RecoveryError::PeerUnreachable {
                detail: "simulated standby outage".to_owned(),
            });
        }
        for entry in batch {
            let rank = entry.checkpoint.rank();
            let held = state
                .received
                .get(&(entry.object, entry.op))
                .copied()
                .unwrap_or(0);
            // `NotStarted` (rank 0) is the sanctioned new-condition reset;
            // anything else moving backwards is a wire-protocol violation.
            if rank < held && rank != 0 {
                state
                    .regressions
                    .push((entry.object, entry.op, held, rank));
            }
            state.received.insert((entry.object, entry.op), rank);
        }
        state.batches += 1;
        Ok(PeerAck {
            accepted: batch.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fer_state::ErrorCategory;
    use fer_types::{Checkpoint, Lba};

    #[test]
    fn verify_correction_removes_injected_issues() {
        let array = SimArray::new();
        let id = ObjectId(1);
        array.inject_verify_issue(
            id,
            ChunkIndex(4),
            CoherencyIssue {
                category: ErrorCategory::Coherency,
                correctable: true,
            },
        );
        let found = array.check_chunk(id, VerifyKind::Error, ChunkIndex(4)).unwrap();
        assert_eq!(found.len(), 1);

        array.correct_chunk(id, ChunkIndex(4)).unwrap();
        assert!(array
            .check_chunk(id, VerifyKind::Error, ChunkIndex(4))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn peer_flags_rank_regression() {
        let peer = SimPeer::new();
        let entry = |cp| PeerCheckpoint {
            object: ObjectId(1),
            op: SyncOpId::Sniff,
            checkpoint: cp,
        };
        peer.push(&[entry(Checkpoint::InProgress(Lba(100)))]).unwrap();
        assert!(peer.regressions().is_empty());

        peer.push(&[entry(Checkpoint::InProgress(Lba(50)))]).unwrap();
        assert_eq!(peer.regressions().len(), 1);
    }
}
