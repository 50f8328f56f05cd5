//! Resource handles, host object registries and call-scoped borrows.
//!
//! Each resource kind owns a [`HandleTable`] mapping guest handles to
//! representations and a [`CaptureRegistry`] mapping representations to host
//! objects. [`ResourceState`] bundles those for every kind together with the
//! [`BorrowScope`] and implements the canonical `lift`/`lower` operations for
//! `own` and `borrow` values on top of them.
//!
//! Host code sees resources as:
//!
//! * [`ResourceAny`] - the dynamic form carried inside [`Val`](crate::Val).
//! * [`Resource<T>`] - an owned host object, either not yet handed to the
//!   guest or already captured under a [`ResourceId`].
//! * [`Borrow<T>`] - a borrow valid for the duration of one host call.

use crate::error::TableError;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

mod registry;
mod scope;
mod table;

pub use self::registry::CaptureRegistry;
pub use self::scope::{BorrowAny, BorrowScope};
pub use self::table::{HandleEntry, HandleTable, MAX_RESOURCE_HANDLE};
use self::scope::Lent;

/// Names one resource kind (`input-stream`, `fields`, ...). Each kind has its
/// own handle space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKind(u32);

impl ResourceKind {
    /// Creates the kind with the given index.
    pub const fn new(index: u32) -> ResourceKind {
        ResourceKind(index)
    }

    /// Index of this kind.
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// A host type which is handed to the guest as a resource of one fixed kind.
///
/// Typed host functions check `Resource<T>` and `Borrow<T>` parameters and
/// results against `T::KIND`.
pub trait HostResource: Any {
    const KIND: ResourceKind;
}

/// Host-side identity of one captured object of a given kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u32);

impl ResourceId {
    /// Wraps a raw representation.
    pub const fn from_u32(rep: u32) -> ResourceId {
        ResourceId(rep)
    }

    /// The raw representation.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A dynamically typed resource value.
pub enum ResourceAny {
    /// A host object not yet known to any registry. Lowering it captures the
    /// object and allocates an owning handle; lifting an `own` handle yields
    /// this variant after taking the object out of its registry.
    Host(Box<dyn Any>),

    /// An object already present in the registry of the destination kind.
    Captured(ResourceId),

    /// A borrow scoped to the current call.
    Borrow(BorrowAny),
}

impl ResourceAny {
    /// The representation of this resource, if it has one.
    pub fn rep(&self) -> Option<ResourceId> {
        match self {
            ResourceAny::Host(_) => None,
            ResourceAny::Captured(rep) => Some(*rep),
            ResourceAny::Borrow(b) => Some(b.rep()),
        }
    }
}

impl fmt::Debug for ResourceAny {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceAny::Host(_) => f.write_str("Host(..)"),
            ResourceAny::Captured(rep) => f.debug_tuple("Captured").field(rep).finish(),
            ResourceAny::Borrow(b) => f.debug_tuple("Borrow").field(b).finish(),
        }
    }
}

/// Captured resources compare by representation and borrows by kind and
/// representation. Uncaptured host objects are never equal to anything.
impl PartialEq for ResourceAny {
    fn eq(&self, other: &ResourceAny) -> bool {
        match (self, other) {
            (ResourceAny::Captured(a), ResourceAny::Captured(b)) => a == b,
            (ResourceAny::Borrow(a), ResourceAny::Borrow(b)) => a == b,
            _ => false,
        }
    }
}

/// An owned resource of host type `T`.
pub struct Resource<T> {
    repr: Repr<T>,
}

enum Repr<T> {
    Host(Box<T>),
    Captured(ResourceId),
}

impl<T: Any> Resource<T> {
    /// Wraps a host object which will be captured when handed to the guest.
    pub fn new(value: T) -> Resource<T> {
        Resource {
            repr: Repr::Host(Box::new(value)),
        }
    }

    /// Refers to an object already captured under `rep`. Handing it to the
    /// guest reuses the handle it was last published under.
    pub fn captured(rep: ResourceId) -> Resource<T> {
        Resource {
            repr: Repr::Captured(rep),
        }
    }

    /// The representation, if the object is held by a registry.
    pub fn rep(&self) -> Option<ResourceId> {
        match &self.repr {
            Repr::Host(_) => None,
            Repr::Captured(rep) => Some(*rep),
        }
    }

    /// Borrows the host object if this resource holds it directly.
    pub fn get(&self) -> Option<&T> {
        match &self.repr {
            Repr::Host(value) => Some(value),
            Repr::Captured(_) => None,
        }
    }

    /// Takes the host object out of this resource.
    ///
    /// Owned resources received from the guest always hold their object, the
    /// guest handle having been given up.
    pub fn into_inner(self) -> Result<T, TableError> {
        match self.repr {
            Repr::Host(value) => Ok(*value),
            Repr::Captured(rep) => Err(TableError::StillCaptured(rep)),
        }
    }

    pub(crate) fn into_any(self) -> ResourceAny {
        match self.repr {
            Repr::Host(value) => ResourceAny::Host(value),
            Repr::Captured(rep) => ResourceAny::Captured(rep),
        }
    }

    pub(crate) fn from_any(any: ResourceAny) -> Result<Resource<T>, TableError> {
        let repr = match any {
            ResourceAny::Host(value) => match value.downcast() {
                Ok(value) => Repr::Host(value),
                Err(_) => return Err(TableError::WrongHostType),
            },
            ResourceAny::Captured(rep) => Repr::Captured(rep),
            ResourceAny::Borrow(_) => return Err(TableError::BorrowAsOwn),
        };
        Ok(Resource { repr })
    }
}

impl<T> fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Host(_) => f.write_str("Resource(host)"),
            Repr::Captured(rep) => write!(f, "Resource({rep})"),
        }
    }
}

/// A borrow of a guest-held resource of host type `T`.
pub struct Borrow<T> {
    inner: BorrowAny,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Borrow<T> {
    /// The representation of the borrowed object.
    pub fn rep(&self) -> ResourceId {
        self.inner.rep()
    }

    /// The kind of the borrowed object.
    pub fn kind(&self) -> ResourceKind {
        self.inner.kind()
    }

    /// Whether the call this borrow was created in is still running.
    pub fn is_live(&self) -> bool {
        self.inner.is_live()
    }

    /// The untyped token.
    pub fn as_any(&self) -> &BorrowAny {
        &self.inner
    }

    pub(crate) fn from_any(inner: BorrowAny) -> Borrow<T> {
        Borrow {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for Borrow<T> {
    fn clone(&self) -> Borrow<T> {
        Borrow::from_any(self.inner.clone())
    }
}

impl<T> fmt::Debug for Borrow<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Borrow").field(&self.inner).finish()
    }
}

struct KindState {
    handles: HandleTable,
    captures: CaptureRegistry,
}

/// Handle tables, capture registries and the borrow scope of one store.
pub struct ResourceState {
    kinds: Vec<KindState>,
    scope: BorrowScope,
    max_handle: u32,
}

impl Default for ResourceState {
    fn default() -> ResourceState {
        ResourceState::new()
    }
}

impl ResourceState {
    /// Creates empty state with the default handle cap.
    pub fn new() -> ResourceState {
        ResourceState::with_max_handle(MAX_RESOURCE_HANDLE)
    }

    /// Creates empty state whose tables hand out handles below `max_handle`.
    pub fn with_max_handle(max_handle: u32) -> ResourceState {
        ResourceState {
            kinds: Vec::new(),
            scope: BorrowScope::default(),
            max_handle,
        }
    }

    fn kind_mut(&mut self, kind: ResourceKind) -> &mut KindState {
        let idx = kind.index() as usize;
        while self.kinds.len() <= idx {
            self.kinds.push(KindState {
                handles: HandleTable::with_max_handle(self.max_handle),
                captures: CaptureRegistry::new(),
            });
        }
        &mut self.kinds[idx]
    }

    fn kind(&self, kind: ResourceKind) -> Option<&KindState> {
        self.kinds.get(kind.index() as usize)
    }

    /// The handle table of `kind`, if anything of that kind was ever created.
    pub fn handles(&self, kind: ResourceKind) -> Option<&HandleTable> {
        self.kind(kind).map(|k| &k.handles)
    }

    /// The capture registry of `kind`, if anything of that kind was ever
    /// created.
    pub fn captures(&self, kind: ResourceKind) -> Option<&CaptureRegistry> {
        self.kind(kind).map(|k| &k.captures)
    }

    /// The borrow scope of in-flight calls.
    pub fn borrow_scope(&self) -> &BorrowScope {
        &self.scope
    }

    /// Captures `value` as a new object of `kind` without publishing a handle.
    pub fn capture(
        &mut self,
        kind: ResourceKind,
        value: Box<dyn Any>,
    ) -> Result<ResourceId, TableError> {
        self.kind_mut(kind).captures.capture(value)
    }

    /// Borrows the captured object `rep` of `kind`.
    pub fn get<T: Any>(&self, kind: ResourceKind, rep: ResourceId) -> Result<&T, TableError> {
        self.kind(kind)
            .ok_or(TableError::NotCaptured(rep))?
            .captures
            .get(rep)
    }

    /// Mutably borrows the captured object `rep` of `kind`.
    pub fn get_mut<T: Any>(
        &mut self,
        kind: ResourceKind,
        rep: ResourceId,
    ) -> Result<&mut T, TableError> {
        self.kind_mut(kind).captures.get_mut(rep)
    }

    /// Borrows the object behind a live borrow token.
    pub fn borrowed<T: Any>(&self, borrow: &BorrowAny) -> Result<&T, TableError> {
        borrow.check_live()?;
        self.get(borrow.kind(), borrow.rep())
    }

    /// Mutably borrows the object behind a live borrow token.
    pub fn borrowed_mut<T: Any>(&mut self, borrow: &BorrowAny) -> Result<&mut T, TableError> {
        borrow.check_live()?;
        self.get_mut(borrow.kind(), borrow.rep())
    }

    /// Publishes `value` to the guest as an owning handle of `kind`.
    ///
    /// An uncaptured host object is captured first. An already captured
    /// object reuses the handle it was last published under, if that handle
    /// still refers to it.
    pub fn lower_own(&mut self, kind: ResourceKind, value: ResourceAny) -> Result<u32, TableError> {
        let state = self.kind_mut(kind);
        let rep = match value {
            ResourceAny::Host(value) => state.captures.capture(value)?,
            ResourceAny::Captured(rep) => {
                if !state.captures.contains(rep) {
                    return Err(TableError::NotCaptured(rep));
                }
                if let Some(handle) = state.captures.handle_of(rep) {
                    match state.handles.get(handle) {
                        Ok(entry) if entry.rep == rep && entry.owned => return Ok(handle),
                        _ => {}
                    }
                }
                rep
            }
            ResourceAny::Borrow(_) => return Err(TableError::BorrowAsOwn),
        };
        let handle = state.handles.create_own(rep)?;
        state.captures.set_handle(rep, handle)?;
        Ok(handle)
    }

    /// Takes an owning handle of `kind` away from the guest along with the
    /// host object behind it.
    ///
    /// This is the first half of moving an object between kinds: nothing is
    /// left behind in the source table or registry, and a second attempt
    /// with the same handle fails. On error nothing is modified.
    pub fn lift_own(&mut self, kind: ResourceKind, handle: u32) -> Result<ResourceAny, TableError> {
        let state = self.kind_mut(kind);
        let entry = state.handles.get(handle)?;
        if !entry.owned {
            return Err(TableError::NotOwned(handle));
        }
        if !state.captures.contains(entry.rep) {
            return Err(TableError::NotCaptured(entry.rep));
        }
        state.handles.remove(handle)?;
        let value = state.captures.remove(entry.rep)?;
        Ok(ResourceAny::Host(value))
    }

    /// Creates a borrow token for `handle` of `kind`, valid until the current
    /// call scope exits.
    pub fn lift_borrow(
        &mut self,
        kind: ResourceKind,
        handle: u32,
    ) -> Result<BorrowAny, TableError> {
        let state = self.kind_mut(kind);
        let entry = state.handles.get(handle)?;
        if !state.captures.contains(entry.rep) {
            return Err(TableError::NotCaptured(entry.rep));
        }
        let token = BorrowAny::new(kind, entry.rep, handle);
        self.scope.record_borrow(&token)?;
        Ok(token)
    }

    /// Lends a captured object to the guest as a borrowed handle which is
    /// reclaimed when the current call scope exits.
    pub fn lower_borrow(
        &mut self,
        kind: ResourceKind,
        value: &ResourceAny,
    ) -> Result<u32, TableError> {
        let rep = match value {
            ResourceAny::Captured(rep) => *rep,
            ResourceAny::Borrow(b) => {
                b.check_live()?;
                b.rep()
            }
            ResourceAny::Host(_) => return Err(TableError::UncapturedBorrow),
        };
        let state = self.kind_mut(kind);
        if !state.captures.contains(rep) {
            return Err(TableError::NotCaptured(rep));
        }
        let handle = state.handles.create_borrow(rep)?;
        self.scope.record_lent(Lent { kind, handle, rep })?;
        Ok(handle)
    }

    /// Implements `[resource-drop]` for `kind`.
    ///
    /// Dropping an owning handle removes the object from the registry and
    /// returns it so the caller can dispose of it. Dropping a borrowed handle
    /// returns `None`. On error nothing is modified.
    pub fn drop_handle(
        &mut self,
        kind: ResourceKind,
        handle: u32,
    ) -> Result<Option<Box<dyn Any>>, TableError> {
        let state = self.kind_mut(kind);
        let entry = state.handles.get(handle)?;
        if entry.owned && !state.captures.contains(entry.rep) {
            return Err(TableError::NotCaptured(entry.rep));
        }
        state.handles.remove(handle)?;
        if entry.owned {
            Ok(Some(state.captures.remove(entry.rep)?))
        } else {
            Ok(None)
        }
    }

    /// Starts a call scope.
    pub fn enter_call(&mut self) {
        self.scope.enter();
    }

    /// Ends the innermost call scope: every borrow token lifted during the
    /// call is invalidated and every borrowed handle lent to the guest that
    /// it has not dropped itself is reclaimed.
    pub fn exit_call(&mut self) -> Result<(), TableError> {
        for lent in self.scope.exit()? {
            let state = self.kind_mut(lent.kind);
            let expected = HandleEntry {
                rep: lent.rep,
                owned: false,
            };
            if state.handles.get(lent.handle) == Ok(expected) {
                state.handles.remove(lent.handle)?;
            }
        }
        Ok(())
    }
}
