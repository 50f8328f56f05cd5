//! Error types.
//!
//! Three layers of failure exist:
//!
//! * Decoding and handle errors ([`DecodeError`], [`TableError`]) mean the
//!   guest broke the protocol. They are fatal to the call in progress.
//! * Capability errors are ordinary values of the operation's `result` type.
//!   Host implementations raise them through [`TrappableError`], and the
//!   trampoline lowers them as the `err` case instead of trapping.
//! * Linking errors ([`LinkError`]) are fatal before any entry point exists.

use crate::linker::LinkStage;
use crate::resources::ResourceId;
use std::error::Error;
use std::fmt;
use std::marker::PhantomData;

/// Errors from handle tables, capture registries and borrow scopes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("cannot allocate another handle: index overflow")]
    Full,
    #[error("unknown handle index {0}")]
    UnknownHandle(u32),
    #[error("handle index {0} has already been dropped")]
    FreedHandle(u32),
    #[error("cannot lift own resource from borrow handle {0}")]
    NotOwned(u32),
    #[error("resource {0} is not present in its capture registry")]
    NotCaptured(ResourceId),
    #[error("resource {0} is not of the requested host type")]
    WrongType(ResourceId),
    #[error("host object is not of the requested type")]
    WrongHostType,
    #[error("resource {0} is still held by its capture registry")]
    StillCaptured(ResourceId),
    #[error("borrow of resource {0} used after its call returned")]
    BorrowExpired(ResourceId),
    #[error("a borrow cannot be transferred as an owned resource")]
    BorrowAsOwn,
    #[error("a host object must be captured before it can be lent")]
    UncapturedBorrow,
    #[error("no call is in progress")]
    NoActiveCall,
}

/// Malformed data read from the guest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("{what} pointer/length out of bounds of memory")]
    OutOfBounds { what: &'static str },
    #[error("{what} pointer is not aligned to {align}")]
    Misaligned { what: &'static str, align: u32 },
    #[error("discriminant {discriminant} out of range [0..{cases}) for {ty}")]
    Discriminant {
        ty: &'static str,
        discriminant: u32,
        cases: usize,
    },
    #[error("string is not valid utf-8")]
    Utf8,
    #[error("invalid `char` value {0:#x}")]
    Char(u32),
    #[error("`{case}` is not a case of this {ty}")]
    Case { ty: &'static str, case: String },
    #[error("not enough core values to lift {0}")]
    Truncated(&'static str),
    #[error("{0} requires a linear memory and none has been linked")]
    NoMemory(&'static str),
    #[error("realloc returned a pointer not aligned to {align}")]
    ReallocMisaligned { align: u32 },
    #[error("realloc returned a region beyond the end of memory")]
    ReallocOutOfBounds,
}

/// Errors raised while linking core modules together.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("module `{module}` imports `{import_module}`#`{name}` which nothing provides")]
    MissingImport {
        module: String,
        import_module: String,
        name: String,
    },
    #[error(
        "import `{import_module}`#`{name}` of module `{module}` has type {expected} \
         but is provided with type {found}"
    )]
    SignatureMismatch {
        module: String,
        import_module: String,
        name: String,
        expected: String,
        found: String,
    },
    #[error("instance `{instance}` has no export named `{name}`")]
    MissingExport { instance: String, name: String },
    #[error("no module named `{0}` is part of the link plan")]
    UnknownModule(String),
    #[error("instance `{0}` is not instantiated yet, later instances are reached through shim slots")]
    NotInstantiated(String),
    #[error("export `{name}` of instance `{instance}` has type {found} but {expected} is required")]
    ExportMismatch {
        instance: String,
        name: String,
        expected: String,
        found: String,
    },
    #[error("shim slot {0} is not defined")]
    UnknownSlot(u32),
    #[error("the link plan has no primary module")]
    NoPrimary,
    #[error("failed to compile module `{module}`")]
    Compile {
        module: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to instantiate module `{module}`")]
    Instantiate {
        module: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("linking is at stage {found:?} but {expected:?} is required")]
    Stage {
        expected: LinkStage,
        found: LinkStage,
    },
}

/// An error returned by a host implementation that is either a capability
/// error of type `E` or a trap.
///
/// Capability errors are lowered into the guest as the `err` case of the
/// operation's result. Anything else aborts the call.
#[repr(transparent)]
pub struct TrappableError<E> {
    err: anyhow::Error,
    _marker: PhantomData<fn() -> E>,
}

impl<E> TrappableError<E>
where
    E: Error + Send + Sync + 'static,
{
    /// Wraps an error which must abort the call.
    pub fn trap(err: impl Into<anyhow::Error>) -> TrappableError<E> {
        TrappableError {
            err: err.into(),
            _marker: PhantomData,
        }
    }

    /// Recovers the capability error, or the trap if this is not one.
    pub fn downcast(self) -> anyhow::Result<E> {
        self.err.downcast()
    }

    /// Borrows the capability error if this is one.
    pub fn downcast_ref(&self) -> Option<&E> {
        self.err.downcast_ref()
    }
}

impl<E> From<E> for TrappableError<E>
where
    E: Error + Send + Sync + 'static,
{
    fn from(error: E) -> TrappableError<E> {
        TrappableError {
            err: error.into(),
            _marker: PhantomData,
        }
    }
}

impl<E> fmt::Debug for TrappableError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.err.fmt(f)
    }
}

impl<E> fmt::Display for TrappableError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.err.fmt(f)
    }
}

impl<E> Error for TrappableError<E> {}
