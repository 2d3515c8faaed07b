#![forbid(unsafe_code)]
//! Per-object checkpoint and flag state for the Ferraid recovery engine.
//!
//! This crate is pure data plus invariants: the engines in `fer-engine` are
//! the only writers of checkpoints (single-writer discipline), the control
//! plane reads through [`StateRegistry`] accessors, and [`persist`] makes a
//! snapshot of the whole registry durable in one transactional record.
//!
//! # Lifecycle
//!
//! State is created when the owning object becomes active and destroyed with
//! the object. On process start the persisted record is the sole source of
//! truth: the registry is rebuilt from it, and engines never let the
//! in-memory checkpoint run ahead of the last committed record.

pub mod persist;

use fer_error::{RecoveryError, Result};
use fer_types::{
    Checkpoint, ChunkBitmap, ChunkGeometry, Lba, ObjectClass, ObjectId, PositionIndex, VerifyKind,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Verify report ───────────────────────────────────────────────────────────

/// Category of error found by a verify or sniff pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Parity/mirror coherency mismatch.
    Coherency,
    /// Drive media error.
    Media,
    /// Checksum mismatch on a block.
    Crc,
}

/// Per-category error counters plus a monotonically increasing pass counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub correctable_coherency: u64,
    pub uncorrectable_coherency: u64,
    pub correctable_media: u64,
    pub uncorrectable_media: u64,
    pub correctable_crc: u64,
    pub uncorrectable_crc: u64,
    /// Completed passes. Monotonic: survives [`VerifyReport::clear`].
    pub pass_count: u32,
}

impl VerifyReport {
    pub fn record(&mut self, category: ErrorCategory, correctable: bool) {
        let counter = match (category, correctable) {
            (ErrorCategory::Coherency, true) => &mut self.correctable_coherency,
            (ErrorCategory::Coherency, false) => &mut self.uncorrectable_coherency,
            (ErrorCategory::Media, true) => &mut self.correctable_media,
            (ErrorCategory::Media, false) => &mut self.uncorrectable_media,
            (ErrorCategory::Crc, true) => &mut self.correctable_crc,
            (ErrorCategory::Crc, false) => &mut self.uncorrectable_crc,
        };
        *counter = counter.saturating_add(1);
    }

    /// Reset error counters. The pass counter is monotonic and survives.
    pub fn clear(&mut self) {
        let passes = self.pass_count;
        *self = Self::default();
        self.pass_count = passes;
    }

    #[must_use]
    pub fn total_errors(&self) -> u64 {
        self.correctable_coherency
            + self.uncorrectable_coherency
            + self.correctable_media
            + self.uncorrectable_media
            + self.correctable_crc
            + self.uncorrectable_crc
    }
}

// ── Redundant group state ───────────────────────────────────────────────────

/// Lifecycle of a recovery-managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Active,
    Destroying,
}

/// Per-position rebuild state of a redundant group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrivePositionState {
    /// Bound drive is unavailable; writes are being logged.
    pub degraded: bool,
    /// Write-path marking into `rebuild_log` is active.
    pub rb_logging: bool,
    /// Data-rebuild checkpoint for this position.
    pub checkpoint: Checkpoint,
    /// Chunk-granular "needs rebuild" bits; the only authority for which
    /// chunks require differential rebuild.
    pub rebuild_log: ChunkBitmap,
}

impl DrivePositionState {
    #[must_use]
    pub fn healthy(geometry: &ChunkGeometry) -> Self {
        Self {
            degraded: false,
            rb_logging: false,
            checkpoint: Checkpoint::Complete,
            rebuild_log: ChunkBitmap::new(geometry.chunk_count()),
        }
    }

    /// A position needs rebuild work while any log bit is set or its
    /// checkpoint has not reached `Complete`.
    #[must_use]
    pub fn needs_rebuild(&self) -> bool {
        !self.rebuild_log.is_empty() || !self.checkpoint.is_complete()
    }
}

/// One verify category's control state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyState {
    /// An initiate has been accepted and queued; cleared when the pass
    /// finishes.
    pub requested: bool,
    pub checkpoint: Checkpoint,
    /// Completion has been surfaced (status + audit). Only set once the
    /// checkpoint is `Complete` AND the internal event queue is empty.
    pub completion_reported: bool,
}

impl VerifyState {
    #[must_use]
    pub fn idle() -> Self {
        Self {
            requested: false,
            checkpoint: Checkpoint::NotStarted,
            completion_reported: false,
        }
    }
}

/// The four independent verify channels of a redundant group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyChannels {
    pub error: VerifyState,
    pub read_write: VerifyState,
    pub read_only: VerifyState,
    pub system: VerifyState,
}

impl VerifyChannels {
    #[must_use]
    pub fn idle() -> Self {
        Self {
            error: VerifyState::idle(),
            read_write: VerifyState::idle(),
            read_only: VerifyState::idle(),
            system: VerifyState::idle(),
        }
    }

    #[must_use]
    pub fn get(&self, kind: VerifyKind) -> &VerifyState {
        match kind {
            VerifyKind::Error => &self.error,
            VerifyKind::ReadWrite => &self.read_write,
            VerifyKind::ReadOnly => &self.read_only,
            VerifyKind::System => &self.system,
        }
    }

    pub fn get_mut(&mut self, kind: VerifyKind) -> &mut VerifyState {
        match kind {
            VerifyKind::Error => &mut self.error,
            VerifyKind::ReadWrite => &mut self.read_write,
            VerifyKind::ReadOnly => &mut self.read_only,
            VerifyKind::System => &mut self.system,
        }
    }
}

/// Checkpoint/flag registry for one redundant group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundantGroupState {
    pub geometry: ChunkGeometry,
    pub width: u8,
    pub lifecycle: Lifecycle,
    /// Metadata-rebuild pass for the group; data rebuild of a replaced
    /// position stays pinned until this is `Complete`.
    pub metadata_rebuild: Checkpoint,
    pub positions: Vec<DrivePositionState>,
    pub verify: VerifyChannels,
    pub report: VerifyReport,
    /// Depth of the group's internal event queue. A verify is never
    /// reported complete while this is non-zero.
    pub pending_events: u64,
}

impl RedundantGroupState {
    #[must_use]
    pub fn new(geometry: ChunkGeometry, width: u8) -> Self {
        let positions = (0..width)
            .map(|_| DrivePositionState::healthy(&geometry))
            .collect();
        Self {
            geometry,
            width,
            lifecycle: Lifecycle::Active,
            metadata_rebuild: Checkpoint::Complete,
            positions,
            verify: VerifyChannels::idle(),
            report: VerifyReport::default(),
            pending_events: 0,
        }
    }

    pub fn position(&self, index: PositionIndex) -> Result<&DrivePositionState> {
        self.positions
            .get(usize::from(index.0))
            .ok_or(RecoveryError::StateConflict {
                object: 0,
                detail: format!("position {index} out of width {}", self.width),
            })
    }

    pub fn position_mut(&mut self, index: PositionIndex) -> Result<&mut DrivePositionState> {
        let width = self.width;
        self.positions
            .get_mut(usize::from(index.0))
            .ok_or(RecoveryError::StateConflict {
                object: 0,
                detail: format!("position {index} out of width {width}"),
            })
    }

    #[must_use]
    pub fn event_queue_empty(&self) -> bool {
        self.pending_events == 0
    }
}

// ── Drive extent state ──────────────────────────────────────────────────────

/// Checkpoint/flag registry for one drive-extent object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveExtentState {
    pub geometry: ChunkGeometry,
    pub lifecycle: Lifecycle,
    /// Reserved-metadata offset: where zeroing starts (never LBA 0).
    pub default_offset: Lba,
    /// User scan toggle for sniff verify. Distinct from (and ANDed with)
    /// the background-operation gate bit.
    pub scan_enabled: bool,
    pub sniff_checkpoint: Checkpoint,
    pub sniff_pass_count: u32,
    pub report: VerifyReport,
    pub zero_checkpoint: Checkpoint,
}

impl DriveExtentState {
    #[must_use]
    pub fn new(geometry: ChunkGeometry, default_offset: Lba) -> Self {
        Self {
            geometry,
            lifecycle: Lifecycle::Active,
            default_offset,
            scan_enabled: true,
            sniff_checkpoint: Checkpoint::NotStarted,
            sniff_pass_count: 0,
            report: VerifyReport::default(),
            zero_checkpoint: Checkpoint::NotStarted,
        }
    }
}

// ── Object state & registry ─────────────────────────────────────────────────

/// State of one recovery-managed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectState {
    Group(RedundantGroupState),
    Drive(DriveExtentState),
}

impl ObjectState {
    #[must_use]
    pub fn class(&self) -> ObjectClass {
        match self {
            Self::Group(_) => ObjectClass::RedundantGroup,
            Self::Drive(_) => ObjectClass::DriveExtent,
        }
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        match self {
            Self::Group(g) => g.lifecycle,
            Self::Drive(d) => d.lifecycle,
        }
    }
}

// ── Commit reconciliation ───────────────────────────────────────────────────

// Three-way merge rule for the clone → commit → apply cycle: where the
// committer changed a field relative to its scratch base, its change wins;
// everywhere else the live value is taken so a commit that landed between
// the clone and the write-back is not erased. Counters merge by delta.

fn pick<T: PartialEq + Copy>(base: T, live: T, updated: T) -> T {
    if updated != base {
        updated
    } else {
        live
    }
}

fn shift_u64(base: u64, live: u64, updated: u64) -> u64 {
    let merged = i128::from(live) + (i128::from(updated) - i128::from(base));
    u64::try_from(merged.max(0)).unwrap_or(u64::MAX)
}

fn shift_u32(base: u32, live: u32, updated: u32) -> u32 {
    live.wrapping_add(updated.wrapping_sub(base))
}

impl VerifyReport {
    fn reconcile(base: &Self, live: &Self, updated: &Self) -> Self {
        Self {
            correctable_coherency: shift_u64(
                base.correctable_coherency,
                live.correctable_coherency,
                updated.correctable_coherency,
            ),
            uncorrectable_coherency: shift_u64(
                base.uncorrectable_coherency,
                live.uncorrectable_coherency,
                updated.uncorrectable_coherency,
            ),
            correctable_media: shift_u64(
                base.correctable_media,
                live.correctable_media,
                updated.correctable_media,
            ),
            uncorrectable_media: shift_u64(
                base.uncorrectable_media,
                live.uncorrectable_media,
                updated.uncorrectable_media,
            ),
            correctable_crc: shift_u64(
                base.correctable_crc,
                live.correctable_crc,
                updated.correctable_crc,
            ),
            uncorrectable_crc: shift_u64(
                base.uncorrectable_crc,
                live.uncorrectable_crc,
                updated.uncorrectable_crc,
            ),
            pass_count: shift_u32(base.pass_count, live.pass_count, updated.pass_count),
        }
    }
}

impl VerifyState {
    fn reconcile(base: &Self, live: &Self, updated: &Self) -> Self {
        Self {
            requested: pick(base.requested, live.requested, updated.requested),
            checkpoint: pick(base.checkpoint, live.checkpoint, updated.checkpoint),
            completion_reported: pick(
                base.completion_reported,
                live.completion_reported,
                updated.completion_reported,
            ),
        }
    }
}

impl VerifyChannels {
    fn reconcile(base: &Self, live: &Self, updated: &Self) -> Self {
        Self {
            error: VerifyState::reconcile(&base.error, &live.error, &updated.error),
            read_write: VerifyState::reconcile(
                &base.read_write,
                &live.read_write,
                &updated.read_write,
            ),
            read_only: VerifyState::reconcile(
                &base.read_only,
                &live.read_only,
                &updated.read_only,
            ),
            system: VerifyState::reconcile(&base.system, &live.system, &updated.system),
        }
    }
}

impl DrivePositionState {
    fn reconcile(base: &Self, live: &Self, updated: &Self) -> Self {
        Self {
            degraded: pick(base.degraded, live.degraded, updated.degraded),
            rb_logging: pick(base.rb_logging, live.rb_logging, updated.rb_logging),
            checkpoint: pick(base.checkpoint, live.checkpoint, updated.checkpoint),
            rebuild_log: ChunkBitmap::reconcile(
                &base.rebuild_log,
                &live.rebuild_log,
                &updated.rebuild_log,
            ),
        }
    }
}

impl RedundantGroupState {
    fn reconcile(base: &Self, live: &Self, updated: &Self) -> Self {
        let positions = updated
            .positions
            .iter()
            .enumerate()
            .map(|(i, u)| match (base.positions.get(i), live.positions.get(i)) {
                (Some(b), Some(l)) => DrivePositionState::reconcile(b, l, u),
                _ => u.clone(),
            })
            .collect();
        Self {
            geometry: updated.geometry,
            width: updated.width,
            lifecycle: pick(base.lifecycle, live.lifecycle, updated.lifecycle),
            metadata_rebuild: pick(
                base.metadata_rebuild,
                live.metadata_rebuild,
                updated.metadata_rebuild,
            ),
            positions,
            verify: VerifyChannels::reconcile(&base.verify, &live.verify, &updated.verify),
            report: VerifyReport::reconcile(&base.report, &live.report, &updated.report),
            pending_events: shift_u64(
                base.pending_events,
                live.pending_events,
                updated.pending_events,
            ),
        }
    }
}

impl DriveExtentState {
    fn reconcile(base: &Self, live: &Self, updated: &Self) -> Self {
        Self {
            geometry: updated.geometry,
            lifecycle: pick(base.lifecycle, live.lifecycle, updated.lifecycle),
            default_offset: pick(base.default_offset, live.default_offset, updated.default_offset),
            scan_enabled: pick(base.scan_enabled, live.scan_enabled, updated.scan_enabled),
            sniff_checkpoint: pick(
                base.sniff_checkpoint,
                live.sniff_checkpoint,
                updated.sniff_checkpoint,
            ),
            sniff_pass_count: shift_u32(
                base.sniff_pass_count,
                live.sniff_pass_count,
                updated.sniff_pass_count,
            ),
            report: VerifyReport::reconcile(&base.report, &live.report, &updated.report),
            zero_checkpoint: pick(
                base.zero_checkpoint,
                live.zero_checkpoint,
                updated.zero_checkpoint,
            ),
        }
    }
}

impl ObjectState {
    /// Merge a committer's scratch with the live state it may have raced.
    ///
    /// `base` is the clone the committer started from, `live` is the registry
    /// state at commit time and `updated` is the committer's scratch. Fields
    /// the committer changed win; everything else carries the live value, so
    /// a rebuild-log mark or control-plane flag committed between the clone
    /// and this commit survives the write-back.
    #[must_use]
    pub fn reconcile(base: &Self, live: &Self, updated: &Self) -> Self {
        match (base, live, updated) {
            (Self::Group(b), Self::Group(l), Self::Group(u)) => {
                Self::Group(RedundantGroupState::reconcile(b, l, u))
            }
            (Self::Drive(b), Self::Drive(l), Self::Drive(u)) => {
                Self::Drive(DriveExtentState::reconcile(b, l, u))
            }
            _ => updated.clone(),
        }
    }
}

/// Durable image of every object's checkpoints and flags.
///
/// One record covers the whole registry so a checkpoint advance and its
/// rebuild-log bit clear always commit together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub objects: BTreeMap<ObjectId, ObjectState>,
}

/// Owned object → state map. Constructed by the service, handed by reference
/// into every engine; nothing reaches into ambient global state.
#[derive(Debug, Default)]
pub struct StateRegistry {
    objects: RwLock<BTreeMap<ObjectId, ObjectState>>,
}

impl StateRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the registry from the persisted record (process start / SP
    /// failover takeover). The record is the sole source of truth here.
    #[must_use]
    pub fn from_persisted(state: PersistedState) -> Self {
        Self {
            objects: RwLock::new(state.objects),
        }
    }

    pub fn insert(&self, id: ObjectId, state: ObjectState) -> Result<()> {
        let mut objects = self.objects.write();
        if objects.contains_key(&id) {
            return Err(RecoveryError::StateConflict {
                object: id.0,
                detail: "object already registered".to_owned(),
            });
        }
        objects.insert(id, state);
        Ok(())
    }

    pub fn remove(&self, id: ObjectId) -> Result<ObjectState> {
        self.objects
            .write()
            .remove(&id)
            .ok_or(RecoveryError::UnknownObject { object: id.0 })
    }

    #[must_use]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.read().contains_key(&id)
    }

    pub fn class_of(&self, id: ObjectId) -> Result<ObjectClass> {
        self.with(id, ObjectState::class)
    }

    /// Run `f` against the object's state under the read lock.
    pub fn with<R>(&self, id: ObjectId, f: impl FnOnce(&ObjectState) -> R) -> Result<R> {
        let objects = self.objects.read();
        let state = objects
            .get(&id)
            .ok_or(RecoveryError::UnknownObject { object: id.0 })?;
        Ok(f(state))
    }

    /// Run `f` against the object's state under the write lock.
    ///
    /// Control-plane flag mutations only. Engines advancing checkpoints must
    /// go through the clone → commit → [`StateRegistry::apply`] sequence so
    /// memory never runs ahead of the durable record.
    pub fn with_mut<R>(&self, id: ObjectId, f: impl FnOnce(&mut ObjectState) -> R) -> Result<R> {
        let mut objects = self.objects.write();
        let state = objects
            .get_mut(&id)
            .ok_or(RecoveryError::UnknownObject { object: id.0 })?;
        Ok(f(state))
    }

    /// Clone one object's state (tick scratch copy).
    pub fn clone_state(&self, id: ObjectId) -> Result<ObjectState> {
        self.with(id, Clone::clone)
    }

    /// Snapshot of the whole registry.
    #[must_use]
    pub fn snapshot(&self) -> PersistedState {
        PersistedState {
            objects: self.objects.read().clone(),
        }
    }

    /// Snapshot with one object's state replaced — the pre-commit image a
    /// tick writes durably before touching memory.
    pub fn snapshot_with(&self, id: ObjectId, updated: &ObjectState) -> Result<PersistedState> {
        let mut snapshot = self.snapshot();
        if !snapshot.objects.contains_key(&id) {
            return Err(RecoveryError::UnknownObject { object: id.0 });
        }
        snapshot.objects.insert(id, updated.clone());
        Ok(snapshot)
    }

    /// Write back a committed state. Only called after the durable commit
    /// succeeded.
    pub fn apply(&self, id: ObjectId, updated: ObjectState) -> Result<()> {
        let mut objects = self.objects.write();
        if !objects.contains_key(&id) {
            return Err(RecoveryError::UnknownObject { object: id.0 });
        }
        objects.insert(id, updated);
        Ok(())
    }

    #[must_use]
    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.objects.read().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fer_types::ChunkIndex;

    fn geom() -> ChunkGeometry {
        ChunkGeometry::new(Lba(0), 640, 8).expect("geometry")
    }

    #[test]
    fn fresh_group_is_healthy_everywhere() {
        let g = RedundantGroupState::new(geom(), 5);
        assert_eq!(g.positions.len(), 5);
        for pos in &g.positions {
            assert!(!pos.degraded);
            assert!(!pos.needs_rebuild());
            assert!(pos.rebuild_log.is_empty());
        }
        assert!(g.metadata_rebuild.is_complete());
        assert!(g.event_queue_empty());
        for kind in VerifyKind::ALL {
            assert_eq!(g.verify.get(kind).checkpoint, Checkpoint::NotStarted);
            assert!(!g.verify.get(kind).requested);
        }
    }

    #[test]
    fn verify_channels_are_independent() {
        let mut g = RedundantGroupState::new(geom(), 3);
        g.verify.get_mut(VerifyKind::Error).checkpoint = Checkpoint::InProgress(Lba(64));
        g.verify.get_mut(VerifyKind::System).requested = true;

        assert_eq!(
            g.verify.get(VerifyKind::Error).checkpoint,
            Checkpoint::InProgress(Lba(64))
        );
        assert_eq!(
            g.verify.get(VerifyKind::ReadWrite).checkpoint,
            Checkpoint::NotStarted
        );
        assert_eq!(
            g.verify.get(VerifyKind::ReadOnly).checkpoint,
            Checkpoint::NotStarted
        );
        assert!(g.verify.get(VerifyKind::System).requested);
        assert!(!g.verify.get(VerifyKind::Error).requested);
    }

    #[test]
    fn report_clear_preserves_pass_count() {
        let mut report = VerifyReport::default();
        report.record(ErrorCategory::Coherency, true);
        report.record(ErrorCategory::Media, false);
        report.pass_count = 7;
        assert_eq!(report.total_errors(), 2);

        report.clear();
        assert_eq!(report.total_errors(), 0);
        assert_eq!(report.pass_count, 7);
    }

    #[test]
    fn registry_rejects_duplicate_and_unknown() {
        let registry = StateRegistry::new();
        let id = ObjectId(1);
        registry
            .insert(id, ObjectState::Group(RedundantGroupState::new(geom(), 3)))
            .expect("insert");

        let dup = registry.insert(id, ObjectState::Group(RedundantGroupState::new(geom(), 3)));
        assert!(matches!(dup, Err(RecoveryError::StateConflict { .. })));

        let missing = registry.with(ObjectId(99), |_| ());
        assert!(matches!(missing, Err(RecoveryError::UnknownObject { object: 99 })));
    }

    #[test]
    fn snapshot_with_replaces_only_the_target() {
        let registry = StateRegistry::new();
        registry
            .insert(ObjectId(1), ObjectState::Group(RedundantGroupState::new(geom(), 3)))
            .unwrap();
        registry
            .insert(
                ObjectId(2),
                ObjectState::Drive(DriveExtentState::new(geom(), Lba(64))),
            )
            .unwrap();

        let mut updated = registry.clone_state(ObjectId(1)).unwrap();
        if let ObjectState::Group(g) = &mut updated {
            g.pending_events = 9;
        }

        let snap = registry.snapshot_with(ObjectId(1), &updated).unwrap();
        let ObjectState::Group(g) = &snap.objects[&ObjectId(1)] else {
            panic!("group expected");
        };
        assert_eq!(g.pending_events, 9);
        // The live registry is untouched until apply().
        registry
            .with(ObjectId(1), |s| {
                let ObjectState::Group(g) = s else { panic!() };
                assert_eq!(g.pending_events, 0);
            })
            .unwrap();

        registry.apply(ObjectId(1), updated).unwrap();
        registry
            .with(ObjectId(1), |s| {
                let ObjectState::Group(g) = s else { panic!() };
                assert_eq!(g.pending_events, 9);
            })
            .unwrap();
    }

    #[test]
    fn reconcile_keeps_a_mark_made_between_clone_and_commit() {
        let base = RedundantGroupState::new(geom(), 3);

        // The tick's scratch: position 1 rebuilt chunk 4 and advanced.
        let mut updated = base.clone();
        updated.positions[1].rebuild_log.set(ChunkIndex(9));
        let mut tick = updated.clone();
        tick.positions[1].rebuild_log.clear(ChunkIndex(9));
        tick.positions[1].checkpoint = Checkpoint::InProgress(Lba(40));

        // Meanwhile a write-path mark landed on position 2.
        let mut live = updated.clone();
        live.positions[2].rebuild_log.set(ChunkIndex(4));
        live.positions[2].degraded = true;
        live.positions[2].rb_logging = true;

        let merged = RedundantGroupState::reconcile(&updated, &live, &tick);
        assert!(!merged.positions[1].rebuild_log.get(ChunkIndex(9)));
        assert_eq!(
            merged.positions[1].checkpoint,
            Checkpoint::InProgress(Lba(40))
        );
        assert!(merged.positions[2].rebuild_log.get(ChunkIndex(4)));
        assert!(merged.positions[2].degraded);
        assert!(merged.positions[2].rb_logging);
    }

    #[test]
    fn reconcile_merges_event_counter_by_delta() {
        let base = RedundantGroupState::new(geom(), 3);
        let mut updated = base.clone();
        updated.pending_events = 1; // committer posted one event
        let mut live = base.clone();
        live.pending_events = 4; // four others landed in between

        let merged = RedundantGroupState::reconcile(&base, &live, &updated);
        assert_eq!(merged.pending_events, 5);

        // Draining below zero clamps instead of wrapping.
        let mut drained = base.clone();
        drained.pending_events = 0;
        let mut short = base.clone();
        short.pending_events = 0;
        let mut was_one = base.clone();
        was_one.pending_events = 1;
        let merged = RedundantGroupState::reconcile(&was_one, &short, &drained);
        assert_eq!(merged.pending_events, 0);
    }

    #[test]
    fn reconcile_carries_live_scan_toggle_through_a_tick() {
        let base = DriveExtentState::new(geom(), Lba(64));
        let mut tick = base.clone();
        tick.sniff_checkpoint = Checkpoint::InProgress(Lba(128));
        let mut live = base.clone();
        live.scan_enabled = false;

        let merged = DriveExtentState::reconcile(&base, &live, &tick);
        assert!(!merged.scan_enabled);
        assert_eq!(merged.sniff_checkpoint, Checkpoint::InProgress(Lba(128)));
    }

    #[test]
    fn registry_rebuilds_from_persisted_record() {
        let registry = StateRegistry::new();
        registry
            .insert(ObjectId(5), ObjectState::Drive(DriveExtentState::new(geom(), Lba(64))))
            .unwrap();
        registry
            .with_mut(ObjectId(5), |s| {
                let ObjectState::Drive(d) = s else { panic!() };
                d.sniff_checkpoint = Checkpoint::InProgress(Lba(128));
                d.sniff_pass_count = 3;
            })
            .unwrap();

        let snap = registry.snapshot();
        let restored = StateRegistry::from_persisted(snap);
        restored
            .with(ObjectId(5), |s| {
                let ObjectState::Drive(d) = s else { panic!() };
                assert_eq!(d.sniff_checkpoint, Checkpoint::InProgress(Lba(128)));
                assert_eq!(d.sniff_pass_count, 3);
            })
            .unwrap();
    }
}
