//! Checkpoint replication to the standby controller.
//!
//! The coordinator reads the last *committed* record (never live memory, so
//! the peer can only lag durability, not lead it), flattens it into one
//! checkpoint entry per (object, operation), and pushes the batch over the
//! transport. A per-entry high-water mark of acknowledged ranks filters out
//! stale mid-progress regressions; only the tagged `NotStarted` reset (a new
//! degraded or dirty condition restarting the pass) may rewind the peer. On
//! failover the standby resumes from its copy, which is the last
//! acknowledged value or older.

use fer_error::Result;
use fer_state::persist::CheckpointStore;
use fer_state::{ObjectState, PersistedState};
use fer_types::{Checkpoint, ObjectId, PositionIndex, VerifyKind};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Which operation a replicated checkpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncOpId {
    MetadataRebuild,
    Rebuild(PositionIndex),
    Verify(VerifyKind),
    Sniff,
    Zeroing,
}

/// One checkpoint entry pushed to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCheckpoint {
    pub object: ObjectId,
    pub op: SyncOpId,
    pub checkpoint: Checkpoint,
}

/// Acknowledgement for one pushed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAck {
    pub accepted: usize,
}

/// Transport to the standby controller.
pub trait PeerTransport: Send + Sync {
    fn push(&self, batch: &[PeerCheckpoint]) -> Result<PeerAck>;
}

pub struct PeerSyncCoordinator {
    store: Arc<dyn CheckpointStore>,
    transport: Arc<dyn PeerTransport>,
    interval: Duration,
    /// Highest acknowledged rank per (object, op); entries below it are
    /// never retransmitted.
    acked: Mutex<BTreeMap<(ObjectId, SyncOpId), u64>>,
    sleep: Mutex<bool>,
    cond: Condvar,
}

impl PeerSyncCoordinator {
    #[must_use]
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        transport: Arc<dyn PeerTransport>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            interval,
            acked: Mutex::new(BTreeMap::new()),
            sleep: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn flatten(record: &PersistedState) -> Vec<PeerCheckpoint> {
        let mut batch = Vec::new();
        for (&object, state) in &record.objects {
            match state {
                ObjectState::Group(group) => {
                    batch.push(PeerCheckpoint {
                        object,
                        op: SyncOpId::MetadataRebuild,
                        checkpoint: group.metadata_rebuild,
                    });
                    for (idx, pos) in group.positions.iter().enumerate() {
                        batch.push(PeerCheckpoint {
                            object,
                            op: SyncOpId::Rebuild(PositionIndex(
                                u8::try_from(idx).unwrap_or(u8::MAX),
                            )),
                            checkpoint: pos.checkpoint,
                        });
                    }
                    for kind in VerifyKind::ALL {
                        batch.push(PeerCheckpoint {
                            object,
                            op: SyncOpId::Verify(kind),
                            checkpoint: group.verify.get(kind).checkpoint,
                        });
                    }
                }
                ObjectState::Drive(drive) => {
                    batch.push(PeerCheckpoint {
                        object,
                        op: SyncOpId::Sniff,
                        checkpoint: drive.sniff_checkpoint,
                    });
                    batch.push(PeerCheckpoint {
                        object,
                        op: SyncOpId::Zeroing,
                        checkpoint: drive.zero_checkpoint,
                    });
                }
            }
        }
        batch
    }

    /// Push the durable checkpoints once. Returns how many entries were
    /// transmitted after regression filtering; `PeerUnreachable` (or any
    /// transport error) leaves the high-water marks untouched for the next
    /// interval's retry.
    pub fn sync_now(&self) -> Result<usize> {
        let Some(record) = self.store.load()? else {
            return Ok(0);
        };
        let batch: Vec<PeerCheckpoint> = {
            let acked = self.acked.lock();
            Self::flatten(&record)
                .into_iter()
                .filter(|entry| {
                    // A mid-progress value lower than what the peer already
                    // acknowledged must never be retransmitted. `NotStarted`
                    // is the one sanctioned reset: it means a new condition
                    // restarted the pass, and the peer must hear about it.
                    matches!(entry.checkpoint, Checkpoint::NotStarted)
                        || acked
                            .get(&(entry.object, entry.op))
                            .is_none_or(|&high| entry.checkpoint.rank() >= high)
                })
                .collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }
        let ack = self.transport.push(&batch)?;
        let mut acked = self.acked.lock();
        for entry in &batch {
            // A `NotStarted` reset rewinds the high-water mark with it.
            acked.insert((entry.object, entry.op), entry.checkpoint.rank());
        }
        debug!(entries = batch.len(), accepted = ack.accepted, "peer sync pushed");
        Ok(batch.len())
    }

    /// Drop high-water marks for a destroyed object so a recreated identity
    /// starts clean.
    pub fn forget(&self, object: ObjectId) {
        self.acked.lock().retain(|(id, _), _| *id != object);
    }

    /// Interrupt the interval wait (e.g. at shutdown).
    pub fn wake(&self) {
        *self.sleep.lock() = true;
        self.cond.notify_all();
    }

    /// Periodic push loop; returns once `stop` is set.
    pub fn run(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::SeqCst) {
            if let Err(err) = self.sync_now() {
                warn!(%err, "peer sync failed, retrying next interval");
            }
            let mut woken = self.sleep.lock();
            if !*woken {
                self.cond.wait_for(&mut woken, self.interval);
            }
            *woken = false;
        }
    }
}
