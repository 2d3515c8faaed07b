//! Background-operation gate.
//!
//! One [`OpMask`] per registered object decides which background operations
//! the engines may advance. `set_enabled` returns as soon as the bit is
//! flipped; a running operation observes the change at its next tick
//! boundary, it is never interrupted mid-chunk. Disabling never discards
//! progress state: checkpoints, rebuild logs and verify requests all stay
//! put, frozen until re-enable.
//!
//! `All` is derived: setting it fans out over every individual kind of the
//! object's class, querying it ANDs them. No `All` bit is ever stored.

use crate::TickWaker;
use fer_error::{RecoveryError, Result};
use fer_types::{ObjectClass, ObjectId, OpKind, OpMask};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Per-object enable/disable bitset for background operations.
pub struct OperationGate {
    masks: RwLock<BTreeMap<ObjectId, GateEntry>>,
    waker: Arc<TickWaker>,
    zeroing_default: bool,
}

#[derive(Debug, Clone, Copy)]
struct GateEntry {
    class: ObjectClass,
    mask: OpMask,
}

impl OperationGate {
    #[must_use]
    pub fn new(waker: Arc<TickWaker>, zeroing_default: bool) -> Self {
        Self {
            masks: RwLock::new(BTreeMap::new()),
            waker,
            zeroing_default,
        }
    }

    /// Register an object with its class defaults: every group operation
    /// enabled; sniff enabled; zeroing per configuration.
    pub fn register(&self, id: ObjectId, class: ObjectClass) {
        let mask = match class {
            ObjectClass::RedundantGroup => OpMask::full(class),
            ObjectClass::DriveExtent => {
                let mut mask = OpMask::empty();
                mask.set(OpKind::Sniff, true);
                mask.set(OpKind::Zeroing, self.zeroing_default);
                mask
            }
        };
        self.masks.write().insert(id, GateEntry { class, mask });
    }

    pub fn deregister(&self, id: ObjectId) {
        self.masks.write().remove(&id);
    }

    /// Flip one operation kind (or fan `All` out over the object's class).
    /// Returns once the bit is updated; engines observe it at the next tick.
    pub fn set_enabled(&self, id: ObjectId, op: OpKind, enabled: bool) -> Result<()> {
        let mut masks = self.masks.write();
        let entry = masks
            .get_mut(&id)
            .ok_or(RecoveryError::UnknownObject { object: id.0 })?;
        match op.class() {
            Some(class) if class == entry.class => entry.mask.set(op, enabled),
            Some(_) => {
                return Err(RecoveryError::InvalidOpKind {
                    object: id.0,
                    detail: format!("{op} does not apply to a {:?}", entry.class),
                })
            }
            // `All`: fan out over the class, never store a bit of its own.
            None => {
                for kind in OpKind::kinds_for(entry.class) {
                    entry.mask.set(*kind, enabled);
                }
            }
        }
        debug!(object = %id, %op, enabled, "gate updated");
        drop(masks);
        self.waker.notify();
        Ok(())
    }

    /// Query one kind, or the derived `All` conjunction.
    pub fn is_enabled(&self, id: ObjectId, op: OpKind) -> Result<bool> {
        let masks = self.masks.read();
        let entry = masks
            .get(&id)
            .ok_or(RecoveryError::UnknownObject { object: id.0 })?;
        match op.class() {
            Some(class) if class == entry.class => Ok(entry.mask.contains(op)),
            Some(_) => Err(RecoveryError::InvalidOpKind {
                object: id.0,
                detail: format!("{op} does not apply to a {:?}", entry.class),
            }),
            None => Ok(entry.mask.all_enabled(entry.class)),
        }
    }

    /// Whole mask for one object, read once per tick by the engines.
    pub fn mask(&self, id: ObjectId) -> Result<OpMask> {
        self.masks
            .read()
            .get(&id)
            .map(|e| e.mask)
            .ok_or(RecoveryError::UnknownObject { object: id.0 })
    }
}
