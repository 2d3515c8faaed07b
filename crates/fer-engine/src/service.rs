//! Owning facade over the recovery engines.
//!
//! The service owns the registry, the gate, the three engines, the progress
//! publisher and the peer-sync coordinator; nothing in this crate reaches
//! into ambient global state. It is the single writer of checkpoints: the
//! control plane calls in from any thread, but advancement happens only on
//! the tick runner, which sleeps on the [`TickWaker`] and is notified by
//! gate flips, lifecycle events and verify initiations instead of polling.

use crate::drive::DriveMaintenanceEngine;
use crate::gate::OperationGate;
use crate::notify::{NotificationPublisher, ReconstructionEvent};
use crate::peersync::{PeerSyncCoordinator, PeerTransport};
use crate::rebuild::{RebuildEngine, ReplacementKind};
use crate::verify::{VerifyEngine, VerifyStatus};
use crate::{
    AuditSink, CommitResult, Committer, DriveLifecycle, DriveMedia, FaultSink, QuiesceControl,
    RecoveryConfig, ResyncMedia, TickOutcome, TickWaker, VerifyMedia,
};
use fer_error::{RecoveryError, Result};
use fer_state::persist::CheckpointStore;
use fer_state::{
    DriveExtentState, Lifecycle, ObjectState, RedundantGroupState, StateRegistry, VerifyReport,
};
use fer_types::{
    Checkpoint, ChunkGeometry, ChunkIndex, Lba, ObjectClass, ObjectId, OpKind, PositionIndex,
    VerifyKind,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Seams the service needs from the surrounding array.
#[derive(Clone)]
pub struct Collaborators {
    pub lifecycle: Arc<dyn DriveLifecycle>,
    pub resync: Arc<dyn ResyncMedia>,
    pub quiesce: Arc<dyn QuiesceControl>,
    pub verify_media: Arc<dyn VerifyMedia>,
    pub drive_media: Arc<dyn DriveMedia>,
    pub peer: Arc<dyn PeerTransport>,
    pub faults: Arc<dyn FaultSink>,
    pub audit: Arc<dyn AuditSink>,
}

/// Read-only view of one object's recovery state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtentStateView {
    Group {
        metadata_rebuild: Checkpoint,
        positions: Vec<PositionView>,
        error_verify: Checkpoint,
        read_write_verify: Checkpoint,
        read_only_verify: Checkpoint,
        system_verify: Checkpoint,
        event_queue_empty: bool,
        report: VerifyReport,
    },
    Drive {
        sniff: Checkpoint,
        sniff_pass_count: u32,
        scan_enabled: bool,
        zeroing: Checkpoint,
        report: VerifyReport,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionView {
    pub position: PositionIndex,
    pub degraded: bool,
    pub rb_logging: bool,
    pub checkpoint: Checkpoint,
    pub chunks_pending: u64,
}

pub struct RecoveryService {
    config: RecoveryConfig,
    registry: Arc<StateRegistry>,
    gate: Arc<OperationGate>,
    committer: Arc<Committer>,
    rebuild: RebuildEngine,
    verify: VerifyEngine,
    drive: DriveMaintenanceEngine,
    publisher: Arc<NotificationPublisher>,
    peersync: Arc<PeerSyncCoordinator>,
    waker: Arc<TickWaker>,
}

impl RecoveryService {
    /// Open the service over a checkpoint store. An existing record rebuilds
    /// the registry (the record is the sole source of truth); gate masks are
    /// not persisted and revert to class defaults.
    pub fn open(
        config: RecoveryConfig,
        store: Arc<dyn CheckpointStore>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let registry = Arc::new(match store.load()? {
            Some(record) => {
                info!(objects = record.objects.len(), "recovery state restored from record");
                StateRegistry::from_persisted(record)
            }
            None => StateRegistry::new(),
        });
        let waker = Arc::new(TickWaker::new());
        let gate = Arc::new(OperationGate::new(
            Arc::clone(&waker),
            config.zeroing_enabled_by_default,
        ));
        for id in registry.object_ids() {
            gate.register(id, registry.class_of(id)?);
        }
        let committer = Arc::new(Committer::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&collaborators.faults),
            config.persist_retry_limit,
        ));
        let publisher = Arc::new(NotificationPublisher::new());
        let peersync = Arc::new(PeerSyncCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&collaborators.peer),
            config.peer_sync_interval,
        ));

        let rebuild = RebuildEngine::new(
            Arc::clone(&registry),
            Arc::clone(&gate),
            Arc::clone(&committer),
            Arc::clone(&collaborators.lifecycle),
            Arc::clone(&collaborators.resync),
            Arc::clone(&collaborators.quiesce),
            Arc::clone(&publisher),
            config.chunks_per_tick,
        );
        let verify = VerifyEngine::new(
            Arc::clone(&registry),
            Arc::clone(&gate),
            Arc::clone(&committer),
            Arc::clone(&collaborators.lifecycle),
            Arc::clone(&collaborators.verify_media),
            Arc::clone(&collaborators.quiesce),
            Arc::clone(&collaborators.audit),
            config.chunks_per_tick,
        );
        let drive = DriveMaintenanceEngine::new(
            Arc::clone(&registry),
            Arc::clone(&gate),
            Arc::clone(&committer),
            Arc::clone(&collaborators.drive_media),
            config.chunks_per_tick,
        );

        Ok(Self {
            config,
            registry,
            gate,
            committer,
            rebuild,
            verify,
            drive,
            publisher,
            peersync,
            waker,
        })
    }

    // ── Object management ───────────────────────────────────────────────────

    /// Register a redundant group of `width` positions over `extent_blocks`.
    pub fn create_group(&self, id: ObjectId, extent_blocks: u64, width: u8) -> Result<()> {
        let geometry = Self::geometry(id, extent_blocks, self.config.blocks_per_chunk)?;
        let state = ObjectState::Group(RedundantGroupState::new(geometry, width));
        self.create_object(id, state, ObjectClass::RedundantGroup)
    }

    /// Register a drive extent whose zeroable region starts at
    /// `default_offset` (the reserved-metadata boundary).
    pub fn create_drive(&self, id: ObjectId, extent_blocks: u64, default_offset: Lba) -> Result<()> {
        let geometry = Self::geometry(id, extent_blocks, self.config.blocks_per_chunk)?;
        if !geometry.contains(default_offset) {
            return Err(RecoveryError::StateConflict {
                object: id.0,
                detail: format!("default offset {} outside the extent", default_offset.0),
            });
        }
        let state = ObjectState::Drive(DriveExtentState::new(geometry, default_offset));
        self.create_object(id, state, ObjectClass::DriveExtent)
    }

    fn geometry(id: ObjectId, extent_blocks: u64, blocks_per_chunk: u64) -> Result<ChunkGeometry> {
        ChunkGeometry::new(Lba(0), extent_blocks, blocks_per_chunk).map_err(|err| {
            RecoveryError::StateConflict {
                object: id.0,
                detail: err.to_string(),
            }
        })
    }

    fn create_object(&self, id: ObjectId, state: ObjectState, class: ObjectClass) -> Result<()> {
        self.registry.insert(id, state.clone())?;
        if let Err(err) = self.committer.commit_snapshot(&self.registry.snapshot()) {
            // Roll the registration back; the object never existed durably.
            let _ = self.registry.remove(id);
            return Err(err);
        }
        self.gate.register(id, class);
        info!(object = %id, ?class, "object registered");
        self.waker.notify();
        Ok(())
    }

    /// Tear an object down: mark it destroying (ticks go idle), drop its
    /// gate and subscriptions, and erase it from the durable record.
    pub fn destroy_object(&self, id: ObjectId) -> Result<()> {
        self.registry.with_mut(id, |state| match state {
            ObjectState::Group(g) => g.lifecycle = Lifecycle::Destroying,
            ObjectState::Drive(d) => d.lifecycle = Lifecycle::Destroying,
        })?;
        self.gate.deregister(id);
        self.publisher.forget(id);
        self.peersync.forget(id);
        self.registry.remove(id)?;
        self.committer.commit_snapshot(&self.registry.snapshot())?;
        info!(object = %id, "object destroyed");
        Ok(())
    }

    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.registry.object_ids()
    }

    // ── Gate ────────────────────────────────────────────────────────────────

    pub fn set_enabled(&self, id: ObjectId, op: OpKind, enabled: bool) -> Result<()> {
        self.gate.set_enabled(id, op, enabled)
    }

    pub fn is_enabled(&self, id: ObjectId, op: OpKind) -> Result<bool> {
        self.gate.is_enabled(id, op)
    }

    // ── Rebuild lifecycle ───────────────────────────────────────────────────

    pub fn drive_removed(&self, id: ObjectId, position: PositionIndex) -> Result<()> {
        self.rebuild.drive_removed(id, position)?;
        self.waker.notify();
        Ok(())
    }

    pub fn drive_replaced(
        &self,
        id: ObjectId,
        position: PositionIndex,
        kind: ReplacementKind,
    ) -> Result<()> {
        self.rebuild.drive_replaced(id, position, kind)?;
        self.waker.notify();
        Ok(())
    }

    pub fn mark_write_logged(
        &self,
        id: ObjectId,
        position: PositionIndex,
        chunk: ChunkIndex,
    ) -> Result<()> {
        self.rebuild.mark_write_logged(id, position, chunk)
    }

    // ── Verify ──────────────────────────────────────────────────────────────

    pub fn initiate_verify(&self, id: ObjectId, kind: VerifyKind) -> Result<()> {
        self.verify.initiate(id, kind)?;
        self.waker.notify();
        Ok(())
    }

    pub fn verify_status(&self, id: ObjectId, kind: VerifyKind) -> Result<VerifyStatus> {
        self.verify.status(id, kind)
    }

    pub fn group_report(&self, id: ObjectId) -> Result<VerifyReport> {
        self.verify.report(id)
    }

    pub fn clear_group_report(&self, id: ObjectId) -> Result<()> {
        self.verify.clear_report(id)
    }

    // ── Drive maintenance ───────────────────────────────────────────────────

    pub fn set_scan_enabled(&self, id: ObjectId, enabled: bool) -> Result<()> {
        self.drive.set_scan_enabled(id, enabled)?;
        self.waker.notify();
        Ok(())
    }

    pub fn set_sniff_checkpoint(&self, id: ObjectId, lba: Lba) -> Result<()> {
        self.drive.set_sniff_checkpoint(id, lba)
    }

    pub fn sniff_status(&self, id: ObjectId) -> Result<crate::drive::SniffStatus> {
        self.drive.sniff_status(id)
    }

    pub fn set_zero_checkpoint(&self, id: ObjectId, lba: Lba) -> Result<()> {
        self.drive.set_zero_checkpoint(id, lba)
    }

    pub fn zero_checkpoint(&self, id: ObjectId) -> Result<Checkpoint> {
        self.drive.zero_checkpoint(id)
    }

    pub fn drive_report(&self, id: ObjectId) -> Result<VerifyReport> {
        self.drive.report(id)
    }

    pub fn clear_drive_report(&self, id: ObjectId) -> Result<()> {
        self.drive.clear_report(id)
    }

    // ── Events & notifications ──────────────────────────────────────────────

    /// Subscribe to a group's reconstruction progress events.
    pub fn subscribe(&self, id: ObjectId) -> Result<crossbeam_channel::Receiver<ReconstructionEvent>> {
        match self.registry.class_of(id)? {
            ObjectClass::RedundantGroup => Ok(self.publisher.subscribe(id)),
            ObjectClass::DriveExtent => Err(RecoveryError::InvalidOpKind {
                object: id.0,
                detail: "reconstruction events apply to redundant groups only".to_owned(),
            }),
        }
    }

    /// A group queued an internal event; verify completion is held back
    /// until the queue drains.
    pub fn post_internal_event(&self, id: ObjectId) -> Result<()> {
        self.adjust_pending_events(id, 1)
    }

    /// A group finished processing one internal event.
    pub fn drain_internal_event(&self, id: ObjectId) -> Result<()> {
        self.adjust_pending_events(id, -1)?;
        self.waker.notify();
        Ok(())
    }

    fn adjust_pending_events(&self, id: ObjectId, delta: i64) -> Result<()> {
        let base = self.registry.clone_state(id)?;
        let mut state = base.clone();
        let ObjectState::Group(group) = &mut state else {
            return Err(RecoveryError::InvalidOpKind {
                object: id.0,
                detail: "internal events apply to redundant groups only".to_owned(),
            });
        };
        group.pending_events = if delta >= 0 {
            group.pending_events.saturating_add(delta.unsigned_abs())
        } else {
            group.pending_events.saturating_sub(delta.unsigned_abs())
        };
        match self.committer.commit(id, &base, &state)? {
            CommitResult::Committed => Ok(()),
            CommitResult::Failed => Err(RecoveryError::Persistence {
                detail: format!("event queue update for {id} not durable"),
            }),
        }
    }

    /// Snapshot view of one object's recovery state.
    pub fn extent_state(&self, id: ObjectId) -> Result<ExtentStateView> {
        self.registry.with(id, |state| match state {
            ObjectState::Group(g) => ExtentStateView::Group {
                metadata_rebuild: g.metadata_rebuild,
                positions: g
                    .positions
                    .iter()
                    .enumerate()
                    .map(|(idx, pos)| PositionView {
                        position: PositionIndex(u8::try_from(idx).unwrap_or(u8::MAX)),
                        degraded: pos.degraded,
                        rb_logging: pos.rb_logging,
                        checkpoint: pos.checkpoint,
                        chunks_pending: pos.rebuild_log.count_set(),
                    })
                    .collect(),
                error_verify: g.verify.get(VerifyKind::Error).checkpoint,
                read_write_verify: g.verify.get(VerifyKind::ReadWrite).checkpoint,
                read_only_verify: g.verify.get(VerifyKind::ReadOnly).checkpoint,
                system_verify: g.verify.get(VerifyKind::System).checkpoint,
                event_queue_empty: g.event_queue_empty(),
                report: g.report,
            },
            ObjectState::Drive(d) => ExtentStateView::Drive {
                sniff: d.sniff_checkpoint,
                sniff_pass_count: d.sniff_pass_count,
                scan_enabled: d.scan_enabled,
                zeroing: d.zero_checkpoint,
                report: d.report,
            },
        })
    }

    // ── Ticking ─────────────────────────────────────────────────────────────

    /// Run every engine that applies to `id` once.
    pub fn tick_object(&self, id: ObjectId) -> Result<Vec<TickOutcome>> {
        match self.registry.class_of(id)? {
            ObjectClass::RedundantGroup => {
                Ok(vec![self.rebuild.tick(id)?, self.verify.tick(id)?])
            }
            ObjectClass::DriveExtent => Ok(vec![self.drive.tick(id)?]),
        }
    }

    /// One pass over every object. Returns whether anything advanced.
    pub fn tick_all(&self) -> bool {
        let mut advanced = false;
        for id in self.registry.object_ids() {
            match self.tick_object(id) {
                Ok(outcomes) => advanced |= outcomes.iter().any(TickOutcome::advanced),
                // The object may have been destroyed mid-pass.
                Err(RecoveryError::UnknownObject { .. }) => {}
                Err(err) => warn!(object = %id, %err, "tick failed"),
            }
        }
        advanced
    }

    /// Push durable checkpoints to the standby controller once.
    pub fn sync_peer_now(&self) -> Result<usize> {
        self.peersync.sync_now()
    }

    /// Tick loop: drains work while any engine advances, then sleeps on the
    /// waker until an event arrives or the peer-sync interval expires.
    pub fn run(&self, stop: &AtomicBool) {
        let interval = self.config.peer_sync_interval;
        let mut last_sync = Instant::now();
        while !stop.load(Ordering::SeqCst) {
            // Sniff cycles forever by design, so bound the drain burst to
            // keep the timer and peer sync serviced.
            let mut burst = 0;
            while self.tick_all() {
                burst += 1;
                if burst >= 64 || stop.load(Ordering::SeqCst) {
                    break;
                }
            }
            if stop.load(Ordering::SeqCst) {
                return;
            }
            if last_sync.elapsed() >= interval {
                if let Err(err) = self.peersync.sync_now() {
                    warn!(%err, "peer sync failed, retrying next interval");
                }
                last_sync = Instant::now();
            }
            let wait = interval
                .saturating_sub(last_sync.elapsed())
                .min(Duration::from_millis(100));
            self.waker.wait_timeout(wait.max(Duration::from_millis(1)));
        }
    }

    /// Spawn the tick runner on its own thread.
    pub fn spawn(service: Arc<Self>) -> RunnerHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let waker = Arc::clone(&service.waker);
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("fer-recovery".to_owned())
            .spawn(move || service.run(&thread_stop))
            .expect("spawn recovery runner");
        RunnerHandle {
            stop,
            waker,
            thread: Some(thread),
        }
    }
}

/// Handle to a spawned tick runner.
pub struct RunnerHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<TickWaker>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RunnerHandle {
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.waker.notify();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RunnerHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.waker.notify();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
