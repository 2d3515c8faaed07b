#![forbid(unsafe_code)]
//! Error types for Ferraid.
//!
//! # Taxonomy
//!
//! | Variant | Class | Surfaced |
//! |---------|-------|----------|
//! | `UnknownObject` | configuration | synchronously, no state change |
//! | `InvalidOpKind` | configuration | synchronously, no state change |
//! | `StateConflict` | lifecycle | synchronously, no state change |
//! | `Persistence` | durability | tick becomes a no-op, retried, escalated on repeat |
//! | `PeerUnreachable` | replication | retried on the next sync interval |
//! | `Io` | environment | wrapped wherever the OS surfaces it |
//!
//! Dependency unavailability (drive gone, quiesce pending) is deliberately
//! NOT an error: engines defer the tick and re-evaluate on the next wakeup.
//!
//! # Design constraints
//!
//! - `fer-error` depends on nothing else in the workspace (no cycles), so
//!   object identities appear as raw `u64` here; callers format through
//!   `ObjectId` before constructing a variant.
//! - String payloads are owned to avoid lifetime entanglement across the
//!   service boundary.

use thiserror::Error;

/// Unified error type for all Ferraid control operations.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Object identity not present in the registry.
    #[error("unknown object {object}")]
    UnknownObject { object: u64 },

    /// Operation kind does not apply to the object's class (e.g. `Sniff`
    /// requested against a redundant group).
    #[error("invalid op kind for object {object}: {detail}")]
    InvalidOpKind { object: u64, detail: String },

    /// Object is not in a lifecycle state that permits the request
    /// (e.g. verify initiated against an object mid-destroy).
    #[error("state conflict on object {object}: {detail}")]
    StateConflict { object: u64, detail: String },

    /// Durable checkpoint write failed. The in-memory value must not have
    /// advanced when this is returned.
    #[error("checkpoint persistence failed: {detail}")]
    Persistence { detail: String },

    /// Push to the standby controller failed; retried on the next interval.
    #[error("peer unreachable: {detail}")]
    PeerUnreachable { detail: String },

    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecoveryError {
    /// True for errors rejected synchronously with no state change
    /// (configuration and lifecycle errors).
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownObject { .. } | Self::InvalidOpKind { .. } | Self::StateConflict { .. }
        )
    }
}

/// Result alias using `RecoveryError`.
pub type Result<T> = std::result::Result<T, RecoveryError>;
