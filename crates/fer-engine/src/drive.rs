//! Drive-extent maintenance: sniff verify and zeroing.
//!
//! Sniff is a continuous background media scan: the checkpoint walks the
//! extent, wraps at the end, and a wrapping pass counter records completed
//! cycles. It runs only when BOTH the gate's sniff bit and the per-drive
//! user scan toggle are on. Zeroing is a one-shot pass that starts at the
//! drive's reserved-metadata offset (never LBA 0) and parks at `Complete`.

use crate::gate::OperationGate;
use crate::{CommitResult, Committer, DeferReason, DriveMedia, TickOutcome};
use fer_error::{RecoveryError, Result};
use fer_state::{DriveExtentState, Lifecycle, ObjectState, StateRegistry, VerifyReport};
use fer_types::{Checkpoint, ChunkIndex, Lba, ObjectId, OpKind};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Point-in-time view of a drive's sniff scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SniffStatus {
    pub checkpoint: Checkpoint,
    /// Completed full passes over the extent. Wraps on overflow.
    pub pass_count: u32,
    /// Per-drive user toggle, ANDed with the gate's sniff bit.
    pub scan_enabled: bool,
}

pub struct DriveMaintenanceEngine {
    registry: Arc<StateRegistry>,
    gate: Arc<OperationGate>,
    committer: Arc<Committer>,
    media: Arc<dyn DriveMedia>,
    chunks_per_tick: u64,
}

impl DriveMaintenanceEngine {
    pub(crate) fn new(
        registry: Arc<StateRegistry>,
        gate: Arc<OperationGate>,
        committer: Arc<Committer>,
        media: Arc<dyn DriveMedia>,
        chunks_per_tick: u64,
    ) -> Self {
        Self {
            registry,
            gate,
            committer,
            media,
            chunks_per_tick,
        }
    }

    fn drive_scratch(&self, object: ObjectId) -> Result<DriveExtentState> {
        match self.registry.clone_state(object)? {
            ObjectState::Drive(drive) => Ok(drive),
            ObjectState::Group(_) => Err(RecoveryError::InvalidOpKind {
                object: object.0,
                detail: "drive maintenance applies to drive extents only".to_owned(),
            }),
        }
    }

    fn commit_control(
        &self,
        object: ObjectId,
        base: DriveExtentState,
        drive: DriveExtentState,
    ) -> Result<()> {
        match self
            .committer
            .commit(object, &ObjectState::Drive(base), &ObjectState::Drive(drive))?
        {
            CommitResult::Committed => Ok(()),
            CommitResult::Failed => Err(RecoveryError::Persistence {
                detail: format!("drive control update for {object} not durable"),
            }),
        }
    }

    // ── Control operations ──────────────────────────────────────────────────

    /// Flip the per-drive scan toggle. Distinct from the gate's sniff bit;
    /// the scan advances only when both are on.
    pub fn set_scan_enabled(&self, object: ObjectId, enabled: bool) -> Result<()> {
        let base = self.drive_scratch(object)?;
        if base.scan_enabled == enabled {
            return Ok(());
        }
        let mut drive = base.clone();
        drive.scan_enabled = enabled;
        info!(%object, enabled, "drive scan toggle updated");
        self.commit_control(object, base, drive)
    }

    /// Reposition the sniff scan to `lba` (diagnostics re-scan a region by
    /// pulling the checkpoint back).
    pub fn set_sniff_checkpoint(&self, object: ObjectId, lba: Lba) -> Result<()> {
        let base = self.drive_scratch(object)?;
        if !base.geometry.contains(lba) {
            return Err(RecoveryError::StateConflict {
                object: object.0,
                detail: format!("lba {} outside the drive extent", lba.0),
            });
        }
        let mut drive = base.clone();
        drive.sniff_checkpoint = Checkpoint::InProgress(lba);
        self.commit_control(object, base, drive)
    }

    pub fn sniff_status(&self, object: ObjectId) -> Result<SniffStatus> {
        let drive = self.drive_scratch(object)?;
        Ok(SniffStatus {
            checkpoint: drive.sniff_checkpoint,
            pass_count: drive.sniff_pass_count,
            scan_enabled: drive.scan_enabled,
        })
    }

    pub fn zero_checkpoint(&self, object: ObjectId) -> Result<Checkpoint> {
        Ok(self.drive_scratch(object)?.zero_checkpoint)
    }

    /// Reposition the zeroing pass, e.g. to re-zero after a reformat. The
    /// target must not precede the reserved-metadata offset.
    pub fn set_zero_checkpoint(&self, object: ObjectId, lba: Lba) -> Result<()> {
        let base = self.drive_scratch(object)?;
        if !base.geometry.contains(lba) || lba < base.default_offset {
            return Err(RecoveryError::StateConflict {
                object: object.0,
                detail: format!(
                    "lba {} outside the zeroable region [{}, {})",
                    lba.0,
                    base.default_offset.0,
                    base.geometry.extent_end().0
                ),
            });
        }
        let mut drive = base.clone();
        drive.zero_checkpoint = Checkpoint::InProgress(lba);
        self.commit_control(object, base, drive)
    }

    pub fn report(&self, object: ObjectId) -> Result<VerifyReport> {
        Ok(self.drive_scratch(object)?.report)
    }

    pub fn clear_report(&self, object: ObjectId) -> Result<()> {
        let base = self.drive_scratch(object)?;
        let mut drive = base.clone();
        drive.report.clear();
        self.commit_control(object, base, drive)
    }

    // ── Tick ────────────────────────────────────────────────────────────────

    /// Advance zeroing (if pending) and the sniff scan by at most the
    /// per-tick chunk budget each, committing both in one record write.
    pub fn tick(&self, object: ObjectId) -> Result<TickOutcome> {
        let base = self.drive_scratch(object)?;
        let mut drive = base.clone();
        if drive.lifecycle != Lifecycle::Active {
            return Ok(TickOutcome::Idle);
        }
        let mask = self.gate.mask(object)?;
        let mut dirty = false;
        let mut chunks_done = 0_u64;
        let mut defer: Option<DeferReason> = None;

        if mask.contains(OpKind::Zeroing) && !drive.zero_checkpoint.is_complete() {
            match self.advance_zeroing(object, &mut drive) {
                Ok(n) => {
                    chunks_done += n;
                    dirty |= n > 0;
                }
                Err(reason) => defer = defer.or(Some(reason)),
            }
        }
        if mask.contains(OpKind::Sniff) && drive.scan_enabled {
            match self.advance_sniff(object, &mut drive) {
                Ok(n) => {
                    chunks_done += n;
                    dirty |= n > 0;
                }
                Err(reason) => defer = defer.or(Some(reason)),
            }
        }

        if !dirty {
            return Ok(defer.map_or(TickOutcome::Idle, TickOutcome::Deferred));
        }
        match self
            .committer
            .commit(object, &ObjectState::Drive(base), &ObjectState::Drive(drive))?
        {
            CommitResult::Committed => Ok(TickOutcome::Advanced {
                chunks: chunks_done,
            }),
            CommitResult::Failed => Ok(TickOutcome::Deferred(DeferReason::PersistenceFailed)),
        }
    }

    fn advance_zeroing(
        &self,
        object: ObjectId,
        drive: &mut DriveExtentState,
    ) -> std::result::Result<u64, DeferReason> {
        let geometry = drive.geometry;
        let start_lba = match drive.zero_checkpoint {
            // Zeroing never touches the reserved metadata below the offset.
            Checkpoint::NotStarted => drive.default_offset,
            Checkpoint::InProgress(lba) => lba,
            Checkpoint::Complete => return Ok(0),
        };
        let mut chunk = match geometry.chunk_of(start_lba) {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(%object, %err, "zeroing checkpoint out of extent, restarting");
                match geometry.chunk_of(drive.default_offset) {
                    Ok(chunk) => chunk,
                    Err(_) => return Err(DeferReason::MediaError),
                }
            }
        };
        let mut done = 0_u64;
        while done < self.chunks_per_tick && chunk.0 < geometry.chunk_count() {
            if let Err(err) = self.media.zero_chunk(object, chunk) {
                warn!(%object, chunk = chunk.0, %err, "chunk zeroing failed");
                if done == 0 {
                    return Err(DeferReason::MediaError);
                }
                break;
            }
            chunk = ChunkIndex(chunk.0 + 1);
            done += 1;
        }
        if done > 0 {
            drive.zero_checkpoint = if chunk.0 >= geometry.chunk_count() {
                info!(%object, "drive zeroing complete");
                Checkpoint::Complete
            } else {
                Checkpoint::InProgress(geometry.chunk_start(chunk))
            };
        }
        Ok(done)
    }

    fn advance_sniff(
        &self,
        object: ObjectId,
        drive: &mut DriveExtentState,
    ) -> std::result::Result<u64, DeferReason> {
        let geometry = drive.geometry;
        let mut chunk = match drive.sniff_checkpoint {
            Checkpoint::NotStarted | Checkpoint::Complete => ChunkIndex(0),
            Checkpoint::InProgress(lba) => match geometry.chunk_of(lba) {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!(%object, %err, "sniff checkpoint out of extent, restarting");
                    ChunkIndex(0)
                }
            },
        };
        let mut done = 0_u64;
        let mut wrapped = false;
        while done < self.chunks_per_tick {
            let issues = match self.media.sniff_chunk(object, chunk) {
                Ok(issues) => issues,
                Err(err) => {
                    warn!(%object, chunk = chunk.0, %err, "sniff read failed");
                    if done == 0 {
                        return Err(DeferReason::MediaError);
                    }
                    break;
                }
            };
            for issue in issues {
                drive.report.record(issue.category, issue.correctable);
            }
            chunk = ChunkIndex(chunk.0 + 1);
            done += 1;
            if chunk.0 >= geometry.chunk_count() {
                // End of the extent: count the pass and wrap to the start.
                chunk = ChunkIndex(0);
                wrapped = true;
                drive.sniff_pass_count = drive.sniff_pass_count.wrapping_add(1);
                drive.report.pass_count = drive.report.pass_count.wrapping_add(1);
                debug!(%object, pass = drive.sniff_pass_count, "sniff pass complete");
                break;
            }
        }
        if done > 0 {
            drive.sniff_checkpoint = if wrapped {
                Checkpoint::InProgress(geometry.extent_start())
            } else {
                Checkpoint::InProgress(geometry.chunk_start(chunk))
            };
        }
        Ok(done)
    }
}
