//! Verify engine for redundant groups.
//!
//! Four categories (error, read-write, read-only, system) each own an
//! independent checkpoint over the same extent. Initiation is always
//! accepted and queues the pass; only advancement consults the gate, so a
//! pass initiated while its gate is off freezes at its pre-initiation value
//! until re-enable. System verify has no gate bit of its own and rides the
//! error-verify bit, but never shares the error-verify checkpoint.
//!
//! A pass is surfaced as complete only once its checkpoint is `Complete`
//! AND the group's internal event queue has drained.

use crate::gate::OperationGate;
use crate::{
    CommitResult, Committer, CoherencyIssue, DeferReason, DriveLifecycle, QuiesceControl,
    TickOutcome, VerifyMedia,
};
use fer_error::{RecoveryError, Result};
use fer_state::{Lifecycle, ObjectState, RedundantGroupState, StateRegistry, VerifyReport};
use fer_types::{Checkpoint, ChunkIndex, ObjectId, VerifyKind};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::AuditSink;

/// Point-in-time view of one verify channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyStatus {
    pub checkpoint: Checkpoint,
    pub requested: bool,
    /// Checkpoint is `Complete` and completion has been surfaced.
    pub reported_complete: bool,
}

pub struct VerifyEngine {
    registry: Arc<StateRegistry>,
    gate: Arc<OperationGate>,
    committer: Arc<Committer>,
    lifecycle: Arc<dyn DriveLifecycle>,
    media: Arc<dyn VerifyMedia>,
    quiesce: Arc<dyn QuiesceControl>,
    audit: Arc<dyn AuditSink>,
    chunks_per_tick: u64,
}

impl VerifyEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: Arc<StateRegistry>,
        gate: Arc<OperationGate>,
        committer: Arc<Committer>,
        lifecycle: Arc<dyn DriveLifecycle>,
        media: Arc<dyn VerifyMedia>,
        quiesce: Arc<dyn QuiesceControl>,
        audit: Arc<dyn AuditSink>,
        chunks_per_tick: u64,
    ) -> Self {
        Self {
            registry,
            gate,
            committer,
            lifecycle,
            media,
            quiesce,
            audit,
            chunks_per_tick,
        }
    }

    fn group_scratch(&self, object: ObjectId) -> Result<RedundantGroupState> {
        match self.registry.clone_state(object)? {
            ObjectState::Group(group) => Ok(group),
            ObjectState::Drive(_) => Err(RecoveryError::InvalidOpKind {
                object: object.0,
                detail: "verify applies to redundant groups only".to_owned(),
            }),
        }
    }

    /// Queue a verify pass. Always accepted on an active group, whatever the
    /// gate says; a completed checkpoint restarts from `NotStarted`.
    pub fn initiate(&self, object: ObjectId, kind: VerifyKind) -> Result<()> {
        let base = self.group_scratch(object)?;
        let mut group = base.clone();
        if group.lifecycle != Lifecycle::Active {
            return Err(RecoveryError::StateConflict {
                object: object.0,
                detail: "verify initiated while object is being destroyed".to_owned(),
            });
        }
        {
            let vs = group.verify.get_mut(kind);
            if vs.checkpoint.is_complete() {
                vs.checkpoint = Checkpoint::NotStarted;
            }
            vs.requested = true;
            vs.completion_reported = false;
        }
        match self
            .committer
            .commit(object, &ObjectState::Group(base), &ObjectState::Group(group))?
        {
            CommitResult::Committed => {
                self.audit.verify_started(object, kind);
                Ok(())
            }
            CommitResult::Failed => Err(RecoveryError::Persistence {
                detail: format!("verify initiation for {object} not durable"),
            }),
        }
    }

    pub fn status(&self, object: ObjectId, kind: VerifyKind) -> Result<VerifyStatus> {
        let group = self.group_scratch(object)?;
        let vs = group.verify.get(kind);
        Ok(VerifyStatus {
            checkpoint: vs.checkpoint,
            requested: vs.requested,
            reported_complete: vs.checkpoint.is_complete() && vs.completion_reported,
        })
    }

    pub fn report(&self, object: ObjectId) -> Result<VerifyReport> {
        Ok(self.group_scratch(object)?.report)
    }

    pub fn clear_report(&self, object: ObjectId) -> Result<()> {
        let base = self.group_scratch(object)?;
        let mut group = base.clone();
        group.report.clear();
        match self
            .committer
            .commit(object, &ObjectState::Group(base), &ObjectState::Group(group))?
        {
            CommitResult::Committed => Ok(()),
            CommitResult::Failed => Err(RecoveryError::Persistence {
                detail: format!("report clear for {object} not durable"),
            }),
        }
    }

    /// Advance every requested category by at most the per-tick chunk budget
    /// and surface completions whose event queue has drained.
    pub fn tick(&self, object: ObjectId) -> Result<TickOutcome> {
        let base = self.group_scratch(object)?;
        let mut group = base.clone();
        if group.lifecycle != Lifecycle::Active {
            return Ok(TickOutcome::Idle);
        }
        let any_work = VerifyKind::ALL.iter().any(|kind| {
            let vs = group.verify.get(*kind);
            vs.requested || (vs.checkpoint.is_complete() && !vs.completion_reported)
        });
        if !any_work {
            return Ok(TickOutcome::Idle);
        }
        if !self.lifecycle.group_available(object) {
            return Ok(TickOutcome::Deferred(DeferReason::GroupUnavailable));
        }

        let mask = self.gate.mask(object)?;
        let mut dirty = false;
        let mut chunks_done = 0_u64;
        let mut defer: Option<DeferReason> = None;

        for kind in VerifyKind::ALL {
            if !group.verify.get(kind).requested {
                continue;
            }
            if !mask.contains(kind.gate_op()) {
                // Frozen: checkpoint holds its exact value until re-enable.
                continue;
            }
            match self.advance_kind(object, &mut group, kind) {
                Ok(n) => {
                    chunks_done += n;
                    dirty |= n > 0;
                }
                Err(reason) => defer = defer.or(Some(reason)),
            }
        }

        // Completions surface only once the internal event queue is empty.
        let mut completed_kinds = Vec::new();
        if group.event_queue_empty() {
            for kind in VerifyKind::ALL {
                let vs = group.verify.get_mut(kind);
                if vs.checkpoint.is_complete() && !vs.requested && !vs.completion_reported {
                    vs.completion_reported = true;
                    completed_kinds.push(kind);
                    dirty = true;
                }
            }
        }

        if !dirty {
            return Ok(defer.map_or(TickOutcome::Idle, TickOutcome::Deferred));
        }
        match self
            .committer
            .commit(object, &ObjectState::Group(base), &ObjectState::Group(group))?
        {
            CommitResult::Committed => {
                for kind in completed_kinds {
                    info!(%object, %kind, "verify pass complete");
                    self.audit.verify_completed(object, kind);
                }
                Ok(TickOutcome::Advanced {
                    chunks: chunks_done,
                })
            }
            CommitResult::Failed => Ok(TickOutcome::Deferred(DeferReason::PersistenceFailed)),
        }
    }

    fn advance_kind(
        &self,
        object: ObjectId,
        group: &mut RedundantGroupState,
        kind: VerifyKind,
    ) -> std::result::Result<u64, DeferReason> {
        let geometry = group.geometry;
        let mut chunk = match group.verify.get(kind).checkpoint {
            Checkpoint::NotStarted => ChunkIndex(0),
            Checkpoint::InProgress(lba) => match geometry.chunk_of(lba) {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!(%object, %kind, %err, "verify checkpoint out of extent, restarting");
                    ChunkIndex(0)
                }
            },
            Checkpoint::Complete => return Ok(0),
        };
        let mut done = 0_u64;
        while done < self.chunks_per_tick && chunk.0 < geometry.chunk_count() {
            if !self.quiesce.chunk_quiescent(object, chunk) {
                if done == 0 {
                    return Err(DeferReason::QuiescePending);
                }
                break;
            }
            let issues = match self.media.check_chunk(object, kind, chunk) {
                Ok(issues) => issues,
                Err(err) => {
                    warn!(%object, %kind, chunk = chunk.0, %err, "verify read failed");
                    if done == 0 {
                        return Err(DeferReason::MediaError);
                    }
                    break;
                }
            };
            let needs_correction = issues.iter().any(|i| i.correctable);
            if needs_correction {
                if let Err(err) = self.media.correct_chunk(object, chunk) {
                    warn!(%object, %kind, chunk = chunk.0, %err, "chunk correction failed");
                    if done == 0 {
                        return Err(DeferReason::MediaError);
                    }
                    break;
                }
            }
            for CoherencyIssue {
                category,
                correctable,
            } in issues
            {
                group.report.record(category, correctable);
            }
            chunk = ChunkIndex(chunk.0 + 1);
            done += 1;
        }
        if done > 0 {
            let vs = group.verify.get_mut(kind);
            if chunk.0 >= geometry.chunk_count() {
                debug!(%object, %kind, "verify reached extent end");
                vs.checkpoint = Checkpoint::Complete;
                vs.requested = false;
                group.report.pass_count = group.report.pass_count.saturating_add(1);
            } else {
                vs.checkpoint = Checkpoint::InProgress(geometry.chunk_start(chunk));
            }
        }
        Ok(done)
    }
}
