#![forbid(unsafe_code)]
//! Core types for the Ferraid recovery engine.
//!
//! Everything that crosses a crate boundary lives here: object identities,
//! LBA/chunk arithmetic, the tagged [`Checkpoint`] state, background-operation
//! kinds and their canonical bitset, and the chunk-granular rebuild-log bitmap.
//!
//! # Checkpoint model
//!
//! Progress of a background operation is a tagged state, never a raw LBA:
//!
//! | State | Meaning |
//! |-------|---------|
//! | `NotStarted` | No pass has begun (or a new degraded/dirty condition reset it) |
//! | `InProgress(lba)` | Next LBA the owning engine will process |
//! | `Complete` | The pass covered the whole extent |
//!
//! Overloading an integer sentinel for both "not started" and "complete" is
//! exactly the ambiguity this type exists to rule out.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Identities ──────────────────────────────────────────────────────────────

/// Stable identity of a recovery-managed object (redundant group or drive
/// extent). Assigned by the control plane, unique per array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj{}", self.0)
    }
}

/// Logical block address within an object's extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lba(pub u64);

/// Index of one chunk within an extent (chunk 0 starts at the extent start).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkIndex(pub u64);

/// Member slot of a redundant group, bound to one drive extent at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PositionIndex(pub u8);

impl fmt::Display for PositionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pos{}", self.0)
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("blocks_per_chunk must be > 0")]
    ZeroChunkSize,
    #[error("extent_blocks must be > 0")]
    EmptyExtent,
    #[error("lba {lba} outside extent [{start}, {end})")]
    LbaOutOfExtent { lba: u64, start: u64, end: u64 },
}

/// Fixed chunking of one extent: the unit at which checkpoints advance,
/// persistence commits, and percent-complete is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkGeometry {
    extent_start: Lba,
    extent_blocks: u64,
    blocks_per_chunk: u64,
}

impl ChunkGeometry {
    pub fn new(
        extent_start: Lba,
        extent_blocks: u64,
        blocks_per_chunk: u64,
    ) -> Result<Self, GeometryError> {
        if blocks_per_chunk == 0 {
            return Err(GeometryError::ZeroChunkSize);
        }
        if extent_blocks == 0 {
            return Err(GeometryError::EmptyExtent);
        }
        Ok(Self {
            extent_start,
            extent_blocks,
            blocks_per_chunk,
        })
    }

    #[must_use]
    pub fn extent_start(&self) -> Lba {
        self.extent_start
    }

    /// First LBA past the extent.
    #[must_use]
    pub fn extent_end(&self) -> Lba {
        Lba(self.extent_start.0.saturating_add(self.extent_blocks))
    }

    #[must_use]
    pub fn extent_blocks(&self) -> u64 {
        self.extent_blocks
    }

    #[must_use]
    pub fn blocks_per_chunk(&self) -> u64 {
        self.blocks_per_chunk
    }

    /// Number of chunks covering the extent (last chunk may be short).
    #[must_use]
    pub fn chunk_count(&self) -> u64 {
        self.extent_blocks.div_ceil(self.blocks_per_chunk)
    }

    /// Starting LBA of a chunk. Saturates at the extent end for out-of-range
    /// indices so `chunk_start(chunk_count())` is the natural end marker.
    #[must_use]
    pub fn chunk_start(&self, chunk: ChunkIndex) -> Lba {
        let offset = chunk.0.saturating_mul(self.blocks_per_chunk);
        Lba(self
            .extent_start
            .0
            .saturating_add(offset.min(self.extent_blocks)))
    }

    /// Chunk containing `lba`.
    pub fn chunk_of(&self, lba: Lba) -> Result<ChunkIndex, GeometryError> {
        if lba < self.extent_start || lba >= self.extent_end() {
            return Err(GeometryError::LbaOutOfExtent {
                lba: lba.0,
                start: self.extent_start.0,
                end: self.extent_end().0,
            });
        }
        Ok(ChunkIndex((lba.0 - self.extent_start.0) / self.blocks_per_chunk))
    }

    #[must_use]
    pub fn contains(&self, lba: Lba) -> bool {
        lba >= self.extent_start && lba < self.extent_end()
    }
}

// ── Checkpoint ──────────────────────────────────────────────────────────────

/// Tagged progress state of one background operation over one extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    NotStarted,
    InProgress(Lba),
    Complete,
}

impl Checkpoint {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        !matches!(self, Self::NotStarted)
    }

    /// Total order used for monotonicity checks and the peer regression
    /// filter: `NotStarted < InProgress(lba) < Complete`, with `InProgress`
    /// ordered by LBA.
    #[must_use]
    pub fn rank(&self) -> u64 {
        match self {
            Self::NotStarted => 0,
            Self::InProgress(lba) => lba.0.saturating_add(1),
            Self::Complete => u64::MAX,
        }
    }

    /// True if moving from `self` to `next` never loses progress.
    #[must_use]
    pub fn advances_to(&self, next: Checkpoint) -> bool {
        next.rank() >= self.rank()
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::InProgress(lba) => write!(f, "in_progress@{}", lba.0),
            Self::Complete => write!(f, "complete"),
        }
    }
}

// ── Background-operation kinds ──────────────────────────────────────────────

/// Object class an operation kind applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    RedundantGroup,
    DriveExtent,
}

/// Background operation kinds gated per object.
///
/// `All` is a derived query/setter over the canonical bitset of the object's
/// class; it is never stored or persisted as its own bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    // Redundant-group scope.
    MetadataRebuild,
    Rebuild,
    ErrorVerify,
    ReadWriteVerify,
    ReadOnlyVerify,
    Copy,
    // Drive-extent scope.
    Sniff,
    Zeroing,
    // Derived over the object's class bits.
    All,
}

impl OpKind {
    /// Class this kind belongs to; `None` for the derived `All`.
    #[must_use]
    pub fn class(&self) -> Option<ObjectClass> {
        match self {
            Self::MetadataRebuild
            | Self::Rebuild
            | Self::ErrorVerify
            | Self::ReadWriteVerify
            | Self::ReadOnlyVerify
            | Self::Copy => Some(ObjectClass::RedundantGroup),
            Self::Sniff | Self::Zeroing => Some(ObjectClass::DriveExtent),
            Self::All => None,
        }
    }

    fn bit(&self) -> Option<u8> {
        match self {
            Self::MetadataRebuild => Some(1 << 0),
            Self::Rebuild => Some(1 << 1),
            Self::ErrorVerify => Some(1 << 2),
            Self::ReadWriteVerify => Some(1 << 3),
            Self::ReadOnlyVerify => Some(1 << 4),
            Self::Copy => Some(1 << 5),
            Self::Sniff => Some(1 << 6),
            Self::Zeroing => Some(1 << 7),
            Self::All => None,
        }
    }

    /// Every individual kind of a class, in bit order.
    #[must_use]
    pub fn kinds_for(class: ObjectClass) -> &'static [OpKind] {
        match class {
            ObjectClass::RedundantGroup => &[
                OpKind::MetadataRebuild,
                OpKind::Rebuild,
                OpKind::ErrorVerify,
                OpKind::ReadWriteVerify,
                OpKind::ReadOnlyVerify,
                OpKind::Copy,
            ],
            ObjectClass::DriveExtent => &[OpKind::Sniff, OpKind::Zeroing],
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MetadataRebuild => "metadata_rebuild",
            Self::Rebuild => "rebuild",
            Self::ErrorVerify => "error_verify",
            Self::ReadWriteVerify => "read_write_verify",
            Self::ReadOnlyVerify => "read_only_verify",
            Self::Copy => "copy",
            Self::Sniff => "sniff",
            Self::Zeroing => "zeroing",
            Self::All => "all",
        };
        f.write_str(s)
    }
}

/// Canonical enable/disable bitset for one object's background operations.
///
/// Holds only individual bits; `All` is answered by [`OpMask::all_enabled`]
/// and written by fanning out over [`OpKind::kinds_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpMask(u8);

impl OpMask {
    #[must_use]
    pub fn empty() -> Self {
        Self(0)
    }

    /// Mask with every kind of `class` enabled.
    #[must_use]
    pub fn full(class: ObjectClass) -> Self {
        let mut mask = Self::empty();
        for kind in OpKind::kinds_for(class) {
            mask.set(*kind, true);
        }
        mask
    }

    /// Set or clear one individual kind. `All` must be fanned out by the
    /// caller (the gate), not stored.
    pub fn set(&mut self, kind: OpKind, enabled: bool) {
        let Some(bit) = kind.bit() else { return };
        if enabled {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    #[must_use]
    pub fn contains(&self, kind: OpKind) -> bool {
        kind.bit().is_some_and(|bit| self.0 & bit != 0)
    }

    /// Derived `All` predicate: true iff every individual kind of `class`
    /// is enabled.
    #[must_use]
    pub fn all_enabled(&self, class: ObjectClass) -> bool {
        OpKind::kinds_for(class).iter().all(|k| self.contains(*k))
    }
}

// ── Verify kinds ────────────────────────────────────────────────────────────

/// Verify categories of a redundant group. Each owns an independent
/// checkpoint; operations on one must never touch another's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyKind {
    Error,
    ReadWrite,
    ReadOnly,
    System,
}

impl VerifyKind {
    pub const ALL: [VerifyKind; 4] = [
        VerifyKind::Error,
        VerifyKind::ReadWrite,
        VerifyKind::ReadOnly,
        VerifyKind::System,
    ];

    /// Gate bit controlling advancement of this category. System verify has
    /// no user-visible bit of its own and rides the error-verify gate.
    #[must_use]
    pub fn gate_op(&self) -> OpKind {
        match self {
            Self::Error | Self::System => OpKind::ErrorVerify,
            Self::ReadWrite => OpKind::ReadWriteVerify,
            Self::ReadOnly => OpKind::ReadOnlyVerify,
        }
    }
}

impl fmt::Display for VerifyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::ReadWrite => "read_write",
            Self::ReadOnly => "read_only",
            Self::System => "system",
        };
        f.write_str(s)
    }
}

// ── Rebuild-log bitmap ──────────────────────────────────────────────────────

/// Chunk-granular "needs rebuild" bitmap for one position.
///
/// This is the only authority for which chunks require differential rebuild.
/// The API is strictly per-chunk read-modify-write: there is deliberately no
/// whole-bitmap replacement, so a write-path marking and an engine clearing
/// can interleave without losing dirty chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkBitmap {
    words: Vec<u64>,
    chunks: u64,
}

impl ChunkBitmap {
    /// Empty bitmap covering `chunks` chunks.
    #[must_use]
    pub fn new(chunks: u64) -> Self {
        let words = vec![0_u64; usize::try_from(chunks.div_ceil(64)).unwrap_or(0)];
        Self { words, chunks }
    }

    #[must_use]
    pub fn chunk_capacity(&self) -> u64 {
        self.chunks
    }

    pub fn set(&mut self, chunk: ChunkIndex) {
        if chunk.0 >= self.chunks {
            return;
        }
        let (word, bit) = Self::locate(chunk);
        if let Some(w) = self.words.get_mut(word) {
            *w |= 1 << bit;
        }
    }

    pub fn clear(&mut self, chunk: ChunkIndex) {
        if chunk.0 >= self.chunks {
            return;
        }
        let (word, bit) = Self::locate(chunk);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !(1 << bit);
        }
    }

    #[must_use]
    pub fn get(&self, chunk: ChunkIndex) -> bool {
        if chunk.0 >= self.chunks {
            return false;
        }
        let (word, bit) = Self::locate(chunk);
        self.words.get(word).is_some_and(|w| w >> bit & 1 == 1)
    }

    /// Mark every chunk (full rebuild of the extent).
    pub fn set_all(&mut self) {
        for chunk in 0..self.chunks {
            self.set(ChunkIndex(chunk));
        }
    }

    /// Lowest set chunk at or after `start`, if any.
    #[must_use]
    pub fn first_set_at_or_after(&self, start: ChunkIndex) -> Option<ChunkIndex> {
        (start.0..self.chunks)
            .map(ChunkIndex)
            .find(|c| self.get(*c))
    }

    /// Lowest set chunk overall.
    #[must_use]
    pub fn first_set(&self) -> Option<ChunkIndex> {
        self.first_set_at_or_after(ChunkIndex(0))
    }

    #[must_use]
    pub fn count_set(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    /// Three-way bit merge for concurrent read-modify-write commits.
    ///
    /// Where `updated` differs from `base` the updater's own set/clear wins;
    /// every other bit is taken from `live`, carrying marks made by another
    /// writer between the updater's clone and its commit. A clear in
    /// `updated` therefore never resurrects, and a concurrent set is never
    /// erased by a whole-bitmap write-back.
    #[must_use]
    pub fn reconcile(base: &Self, live: &Self, updated: &Self) -> Self {
        let words = updated
            .words
            .iter()
            .enumerate()
            .map(|(i, &u)| {
                let b = base.words.get(i).copied().unwrap_or(0);
                let l = live.words.get(i).copied().unwrap_or(0);
                let changed = b ^ u;
                (changed & u) | (!changed & l)
            })
            .collect();
        Self {
            words,
            chunks: updated.chunks,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    fn locate(chunk: ChunkIndex) -> (usize, u32) {
        (
            usize::try_from(chunk.0 / 64).unwrap_or(usize::MAX),
            u32::try_from(chunk.0 % 64).unwrap_or(0),
        )
    }
}
