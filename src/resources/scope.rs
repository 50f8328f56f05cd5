//! Borrow tokens and the per-call scope that invalidates them.
//!
//! Every host call opens a frame. Borrows lifted during the call are
//! recorded in that frame and cleared when it closes, whether the call
//! returned, failed or trapped.

use crate::error::TableError;
use crate::resources::{ResourceId, ResourceKind};
use std::cell::Cell;
use std::rc::Rc;

/// A borrow of a guest-held resource, valid only for the host call it was
/// created in.
///
/// The token shares its origin handle with the [`BorrowScope`] of the call.
/// When the call ends the scope clears it, so a token stashed away by the
/// host can never reach the object afterwards.
#[derive(Clone, Debug)]
pub struct BorrowAny {
    kind: ResourceKind,
    rep: ResourceId,
    handle: Rc<Cell<Option<u32>>>,
}

impl BorrowAny {
    pub(crate) fn new(kind: ResourceKind, rep: ResourceId, handle: u32) -> BorrowAny {
        BorrowAny {
            kind,
            rep,
            handle: Rc::new(Cell::new(Some(handle))),
        }
    }

    /// The kind of the borrowed resource.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// The representation of the borrowed resource.
    pub fn rep(&self) -> ResourceId {
        self.rep
    }

    /// The guest handle this borrow was lifted from, or `None` once the call
    /// that created it has returned.
    pub fn handle(&self) -> Option<u32> {
        self.handle.get()
    }

    /// Whether the originating call is still in progress.
    pub fn is_live(&self) -> bool {
        self.handle.get().is_some()
    }

    pub(crate) fn check_live(&self) -> Result<(), TableError> {
        if self.is_live() {
            Ok(())
        } else {
            Err(TableError::BorrowExpired(self.rep))
        }
    }
}

impl PartialEq for BorrowAny {
    fn eq(&self, other: &BorrowAny) -> bool {
        self.kind == other.kind && self.rep == other.rep
    }
}

/// A borrowed handle lent to the guest for the duration of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Lent {
    pub kind: ResourceKind,
    pub handle: u32,
    pub rep: ResourceId,
}

/// Call-scoped bookkeeping of borrows.
///
/// One scope is pushed per in-flight call. Borrow tokens lifted from the
/// guest and borrowed handles lowered into the guest during that call are
/// recorded in it, and all of them are invalidated when the call exits,
/// whether it succeeded or not.
#[derive(Default, Debug)]
pub struct BorrowScope {
    scopes: Vec<CallScope>,
}

#[derive(Default, Debug)]
struct CallScope {
    borrows: Vec<Rc<Cell<Option<u32>>>>,
    lent: Vec<Lent>,
}

impl BorrowScope {
    /// Starts a new call scope.
    pub fn enter(&mut self) {
        self.scopes.push(CallScope::default());
    }

    /// Number of calls currently in flight.
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Number of borrow tokens live in the innermost scope.
    pub fn live_borrows(&self) -> usize {
        self.scopes.last().map_or(0, |s| s.borrows.len())
    }

    fn current(&mut self) -> Result<&mut CallScope, TableError> {
        self.scopes.last_mut().ok_or(TableError::NoActiveCall)
    }

    pub(crate) fn record_borrow(&mut self, borrow: &BorrowAny) -> Result<(), TableError> {
        self.current()?.borrows.push(borrow.handle.clone());
        Ok(())
    }

    pub(crate) fn record_lent(&mut self, lent: Lent) -> Result<(), TableError> {
        self.current()?.lent.push(lent);
        Ok(())
    }

    /// Ends the innermost call scope, clearing every borrow token created in
    /// it, and returns the handles that were lent to the guest so the caller
    /// can reclaim them.
    pub(crate) fn exit(&mut self) -> Result<Vec<Lent>, TableError> {
        let scope = self.scopes.pop().ok_or(TableError::NoActiveCall)?;
        for borrow in scope.borrows {
            borrow.set(None);
        }
        Ok(scope.lent)
    }
}
