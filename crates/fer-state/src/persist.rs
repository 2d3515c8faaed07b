//! Durable checkpoint store.
//!
//! One [`PersistedState`] record holds every object's tagged checkpoints and
//! rebuild-log bitmaps, so a checkpoint advance and its bitmap clear commit
//! as a single transactional write. Engines commit *before* updating memory;
//! on restart the record is the sole source of truth.
//!
//! # On-disk format
//!
//! ```text
//! +----------------------+---------+
//! | JSON(PersistedState) | N bytes |
//! | crc32c of the JSON   | 4 bytes | little-endian
//! +----------------------+---------+
//! ```
//!
//! Commits go through a temp file + fsync + atomic rename, so a crash leaves
//! either the old record or the new one, never a torn mix.

use crate::PersistedState;
use fer_error::{RecoveryError, Result};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Transactional store for the recovery state record.
///
/// `commit` must be atomic: after it returns `Ok` the full record is durable;
/// after an `Err` the previous record is still intact and the caller must not
/// advance in-memory state.
pub trait CheckpointStore: Send + Sync {
    /// Load the last committed record, or `None` if no record exists yet.
    fn load(&self) -> Result<Option<PersistedState>>;

    /// Durably replace the record.
    fn commit(&self, state: &PersistedState) -> Result<()>;
}

// ── File-backed store ───────────────────────────────────────────────────────

/// File-backed store: JSON record with a CRC32C trailer, committed via
/// temp file + rename.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(state: &PersistedState) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(state).map_err(|e| RecoveryError::Persistence {
            detail: format!("record encode failed: {e}"),
        })?;
        let crc = crc32c::crc32c(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> Result<PersistedState> {
        if bytes.len() < 4 {
            return Err(RecoveryError::Persistence {
                detail: format!("record truncated: {} bytes", bytes.len()),
            });
        }
        let (body, trailer) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let computed = crc32c::crc32c(body);
        if stored != computed {
            return Err(RecoveryError::Persistence {
                detail: format!(
                    "record CRC mismatch: stored {stored:#010x}, computed {computed:#010x}"
                ),
            });
        }
        serde_json::from_slice(body).map_err(|e| RecoveryError::Persistence {
            detail: format!("record decode failed: {e}"),
        })
    }
}

impl CheckpointStore for FileStore {
    fn load(&self) -> Result<Option<PersistedState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let state = Self::decode(&bytes)?;
        debug!(
            path = %self.path.display(),
            objects = state.objects.len(),
            "loaded checkpoint record"
        );
        Ok(Some(state))
    }

    fn commit(&self, state: &PersistedState) -> Result<()> {
        let bytes = Self::encode(state)?;
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            tmp.write_all(&bytes)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        debug!(
            path = %self.path.display(),
            bytes = bytes.len(),
            "committed checkpoint record"
        );
        Ok(())
    }
}

// ── In-memory store ─────────────────────────────────────────────────────────

/// In-memory store with fault injection, for tests and single-process
/// deployments that accept volatility.
#[derive(Debug, Default)]
pub struct MemStore {
    inner: Mutex<MemStoreInner>,
}

#[derive(Debug, Default)]
struct MemStoreInner {
    record: Option<PersistedState>,
    fail_remaining: u32,
    commits: u64,
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a persistence error.
    pub fn fail_next(&self, n: u32) {
        self.inner.lock().fail_remaining = n;
    }

    /// Number of successful commits so far.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.inner.lock().commits
    }
}

impl CheckpointStore for MemStore {
    fn load(&self) -> Result<Option<PersistedState>> {
        Ok(self.inner.lock().record.clone())
    }

    fn commit(&self, state: &PersistedState) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_remaining > 0 {
            inner.fail_remaining -= 1;
            warn!("injected persistence failure");
            return Err(RecoveryError::Persistence {
                detail: "injected failure".to_owned(),
            });
        }
        inner.record = Some(state.clone());
        inner.commits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DriveExtentState, ObjectState, RedundantGroupState};
    use fer_types::{Checkpoint, ChunkGeometry, ChunkIndex, Lba, ObjectId};
    use tempfile::TempDir;

    fn geom() -> ChunkGeometry {
        ChunkGeometry::new(Lba(0), 512, 8).expect("geometry")
    }

    fn sample_state() -> PersistedState {
        let mut state = PersistedState::default();
        let mut group = RedundantGroupState::new(geom(), 3);
        group.positions[1].degraded = true;
        group.positions[1].checkpoint = Checkpoint::InProgress(Lba(256));
        group.positions[1].rebuild_log.set(ChunkIndex(40));
        state
            .objects
            .insert(ObjectId(1), ObjectState::Group(group));
        let mut drive = DriveExtentState::new(geom(), Lba(64));
        drive.zero_checkpoint = Checkpoint::Complete;
        state
            .objects
            .insert(ObjectId(2), ObjectState::Drive(drive));
        state
    }

    #[test]
    fn file_store_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let store = FileStore::new(dir.path().join("recovery.ckpt"));

        assert!(store.load().expect("empty load").is_none());

        let state = sample_state();
        store.commit(&state).expect("commit");
        let loaded = store.load().expect("load").expect("record present");
        assert_eq!(loaded, state);
    }

    #[test]
    fn file_store_commit_replaces_whole_record() {
        let dir = TempDir::new().expect("tempdir");
        let store = FileStore::new(dir.path().join("recovery.ckpt"));

        let mut state = sample_state();
        store.commit(&state).expect("first commit");

        state.objects.remove(&ObjectId(2));
        store.commit(&state).expect("second commit");

        let loaded = store.load().expect("load").expect("record");
        assert_eq!(loaded.objects.len(), 1);
        assert!(loaded.objects.contains_key(&ObjectId(1)));
    }

    #[test]
    fn file_store_detects_corruption() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("recovery.ckpt");
        let store = FileStore::new(&path);
        store.commit(&sample_state()).expect("commit");

        let mut bytes = fs::read(&path).expect("read record");
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        fs::write(&path, &bytes).expect("write corrupted");

        let err = store.load().expect_err("corrupt record must not load");
        assert!(matches!(err, RecoveryError::Persistence { .. }));
    }

    #[test]
    fn file_store_rejects_truncated_record() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("recovery.ckpt");
        fs::write(&path, [0_u8, 1]).expect("write stub");

        let err = FileStore::new(&path)
            .load()
            .expect_err("truncated record must not load");
        assert!(matches!(err, RecoveryError::Persistence { .. }));
    }

    #[test]
    fn mem_store_fault_injection() {
        let store = MemStore::new();
        let state = sample_state();

        store.commit(&state).expect("commit");
        assert_eq!(store.commit_count(), 1);

        store.fail_next(2);
        assert!(store.commit(&state).is_err());
        assert!(store.commit(&state).is_err());
        store.commit(&state).expect("third commit succeeds");
        assert_eq!(store.commit_count(), 2);

        // Failed commits must not have clobbered the record.
        assert_eq!(store.load().unwrap().unwrap(), state);
    }
}
