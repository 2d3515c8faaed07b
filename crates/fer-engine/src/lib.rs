#![forbid(unsafe_code)]
//! Background-operation engines for Ferraid.
//!
//! | Module | Owns |
//! |--------|------|
//! | [`gate`] | Per-object enable/disable bitset for background operations |
//! | [`rebuild`] | Metadata + data rebuild of degraded redundant groups |
//! | [`verify`] | The four verify categories of a redundant group |
//! | [`drive`] | Sniff verify and zeroing on drive extents |
//! | [`notify`] | Reconstruction progress events for subscribers |
//! | [`peersync`] | Checkpoint replication to the standby controller |
//! | [`service`] | Owning facade: registry, engines, and the tick runner |
//!
//! # Tick discipline
//!
//! Every engine advances through the same cooperative step: clone the
//! object's state as scratch, do a bounded batch of chunk work against the
//! scratch copy, merge the scratch with anything committed in the meantime,
//! commit the whole record durably, and only then write the merged state
//! back into the registry. A failed commit leaves memory untouched
//! and the tick reports [`TickOutcome::Deferred`]. Missing dependencies
//! (drive gone, chunk not quiescent) defer the same way instead of erroring.

pub mod drive;
pub mod gate;
pub mod notify;
pub mod peersync;
pub mod rebuild;
pub mod service;
pub mod verify;

use fer_error::Result;
use fer_state::persist::CheckpointStore;
use fer_state::{ErrorCategory, ObjectState, StateRegistry};
use fer_types::{ChunkIndex, ObjectId, PositionIndex, VerifyKind};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

// ── Configuration ───────────────────────────────────────────────────────────

/// Tunables for the recovery engines.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Blocks per chunk for newly created objects.
    pub blocks_per_chunk: u64,
    /// Chunks one engine processes per tick before yielding.
    pub chunks_per_tick: u64,
    /// Whether zeroing starts enabled on newly registered drive extents.
    /// Sniff and the group operations always start enabled.
    pub zeroing_enabled_by_default: bool,
    /// Consecutive failed commits for one object before escalation.
    pub persist_retry_limit: u32,
    /// Interval between checkpoint pushes to the standby controller.
    pub peer_sync_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            blocks_per_chunk: 2048,
            chunks_per_tick: 1,
            zeroing_enabled_by_default: false,
            persist_retry_limit: 5,
            peer_sync_interval: Duration::from_secs(3),
        }
    }
}

// ── Tick outcomes ───────────────────────────────────────────────────────────

/// Why a tick made no progress and should be retried later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// The redundant group itself is not available for background I/O.
    GroupUnavailable,
    /// The replacement drive for a rebuilding position is gone.
    ReplacementMissing,
    /// The next chunk has not quiesced yet.
    QuiescePending,
    /// Data rebuild is pinned until the metadata-rebuild pass completes.
    MetadataRebuildPending,
    /// The durable commit failed; memory was not advanced.
    PersistenceFailed,
    /// Chunk I/O against the media failed; retried next tick.
    MediaError,
}

/// Result of one engine tick against one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to do (idle, disabled, or already complete).
    Idle,
    /// `chunks` chunks were processed and durably checkpointed.
    Advanced { chunks: u64 },
    /// Progress was blocked; re-evaluate on the next wakeup.
    Deferred(DeferReason),
}

impl TickOutcome {
    #[must_use]
    pub fn advanced(&self) -> bool {
        matches!(self, Self::Advanced { .. })
    }
}

// ── Collaborator seams ──────────────────────────────────────────────────────

/// One problem found in a chunk by a verify or sniff read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoherencyIssue {
    pub category: ErrorCategory,
    pub correctable: bool,
}

/// Availability of drives and groups, answered by the topology layer.
pub trait DriveLifecycle: Send + Sync {
    /// Is the drive bound to this position present and usable?
    fn position_available(&self, object: ObjectId, position: PositionIndex) -> bool;

    /// Is the group as a whole available for background I/O?
    fn group_available(&self, object: ObjectId) -> bool;
}

/// Data-path used by the rebuild engine to regenerate chunks.
pub trait ResyncMedia: Send + Sync {
    /// Regenerate one chunk of `position` from the surviving members.
    fn resync_chunk(
        &self,
        object: ObjectId,
        position: PositionIndex,
        chunk: ChunkIndex,
    ) -> Result<()>;

    /// Rebuild one chunk of the group's internal metadata region.
    fn rebuild_metadata_chunk(&self, object: ObjectId, chunk: ChunkIndex) -> Result<()>;
}

/// Host-I/O quiescence oracle: a chunk may only be rebuilt or verified once
/// in-flight writes against it have drained.
pub trait QuiesceControl: Send + Sync {
    fn chunk_quiescent(&self, object: ObjectId, chunk: ChunkIndex) -> bool;
}

/// Data-path used by the verify engine.
pub trait VerifyMedia: Send + Sync {
    /// Read and cross-check one chunk, returning every issue found.
    fn check_chunk(
        &self,
        object: ObjectId,
        kind: VerifyKind,
        chunk: ChunkIndex,
    ) -> Result<Vec<CoherencyIssue>>;

    /// Rewrite one chunk's redundancy from its data members.
    fn correct_chunk(&self, object: ObjectId, chunk: ChunkIndex) -> Result<()>;
}

/// Data-path used by the drive-maintenance engine.
pub trait DriveMedia: Send + Sync {
    /// Media-scan read of one chunk (no host data returned).
    fn sniff_chunk(&self, object: ObjectId, chunk: ChunkIndex) -> Result<Vec<CoherencyIssue>>;

    /// Write zeros over one chunk.
    fn zero_chunk(&self, object: ObjectId, chunk: ChunkIndex) -> Result<()>;
}

/// Sink for conditions the engines cannot resolve by retrying.
pub trait FaultSink: Send + Sync {
    fn escalate(&self, object: ObjectId, detail: &str);
}

/// Audit trail of verify lifecycle transitions.
pub trait AuditSink: Send + Sync {
    fn verify_started(&self, object: ObjectId, kind: VerifyKind);
    fn verify_completed(&self, object: ObjectId, kind: VerifyKind);
}

/// Default fault sink: logs at error level.
#[derive(Debug, Default)]
pub struct TracingFaultSink;

impl FaultSink for TracingFaultSink {
    fn escalate(&self, object: ObjectId, detail: &str) {
        error!(%object, detail, "recovery fault escalated");
    }
}

/// Default audit sink: logs at info level.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn verify_started(&self, object: ObjectId, kind: VerifyKind) {
        tracing::info!(%object, %kind, "verify started");
    }

    fn verify_completed(&self, object: ObjectId, kind: VerifyKind) {
        tracing::info!(%object, %kind, "verify completed");
    }
}

// ── Commit path ─────────────────────────────────────────────────────────────

/// Outcome of a transactional state commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitResult {
    /// Durable and applied to the registry.
    Committed,
    /// The store rejected the write; the registry was not touched.
    Failed,
}

/// Shared commit path for every engine: reconcile against the live state →
/// durable commit → registry write-back. Tracks consecutive failures per
/// object and escalates once the retry limit is crossed.
///
/// Commits are serialized, and each commit three-way merges its scratch
/// against the registry ([`ObjectState::reconcile`]): a write-log mark or
/// control-plane flag committed between an engine's scratch clone and its
/// write-back survives instead of being erased by the whole-object apply.
pub(crate) struct Committer {
    registry: Arc<StateRegistry>,
    store: Arc<dyn CheckpointStore>,
    faults: Arc<dyn FaultSink>,
    retry_limit: u32,
    failures: Mutex<BTreeMap<ObjectId, u32>>,
    serial: Mutex<()>,
}

impl Committer {
    pub(crate) fn new(
        registry: Arc<StateRegistry>,
        store: Arc<dyn CheckpointStore>,
        faults: Arc<dyn FaultSink>,
        retry_limit: u32,
    ) -> Self {
        Self {
            registry,
            store,
            faults,
            retry_limit,
            failures: Mutex::new(BTreeMap::new()),
            serial: Mutex::new(()),
        }
    }

    /// Commit the changes `base` → `updated` as the new durable state of
    /// `id`, then apply the merged result to the registry. On store failure
    /// the registry keeps its old state, so memory never runs ahead of the
    /// record.
    pub(crate) fn commit(
        &self,
        id: ObjectId,
        base: &ObjectState,
        updated: &ObjectState,
    ) -> Result<CommitResult> {
        let _serial = self.serial.lock();
        let live = self.registry.clone_state(id)?;
        let merged = ObjectState::reconcile(base, &live, updated);
        let snapshot = self.registry.snapshot_with(id, &merged)?;
        match self.store.commit(&snapshot) {
            Ok(()) => {
                self.failures.lock().remove(&id);
                self.registry.apply(id, merged)?;
                Ok(CommitResult::Committed)
            }
            Err(err) => {
                let mut failures = self.failures.lock();
                let count = failures.entry(id).or_insert(0);
                *count += 1;
                warn!(object = %id, attempt = *count, %err, "checkpoint commit failed");
                if *count >= self.retry_limit {
                    self.faults
                        .escalate(id, &format!("checkpoint persistence failing: {err}"));
                }
                Ok(CommitResult::Failed)
            }
        }
    }

    /// Commit a whole-registry snapshot (object create/destroy), serialized
    /// with the per-object commits.
    pub(crate) fn commit_snapshot(&self, snapshot: &fer_state::PersistedState) -> Result<()> {
        let _serial = self.serial.lock();
        self.store.commit(snapshot)
    }
}

// ── Tick waker ──────────────────────────────────────────────────────────────

/// Event-driven wakeup for the tick runner: gate flips, lifecycle events and
/// verify initiations notify it instead of the runner polling on a timer.
#[derive(Debug, Default)]
pub struct TickWaker {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl TickWaker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        *self.pending.lock() = true;
        self.cond.notify_all();
    }

    /// Wait until notified or `timeout` elapses. Returns `true` when a
    /// notification was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        let woken = *pending;
        *pending = false;
        woken
    }
}
