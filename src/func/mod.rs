//! Host operations and the trampoline that adapts them to the core ABI.
//!
//! Every imported operation goes through the same steps, parameterized only
//! by its [`Operation`] descriptor:
//!
//! 1. lift the core arguments into [`Val`]s (borrowed handles become
//!    call-scoped [`Borrow`] tokens),
//! 2. invoke the host implementation,
//! 3. invalidate every borrow created in step 1, whatever the outcome,
//! 4. lower the result, either as flat core values or through the
//!    caller-provided return pointer.

use crate::error::{DecodeError, TableError};
use crate::memory::{GuestStore, LiftContext, LowerContext};
use crate::resources::{Borrow, ResourceKind, ResourceState};
use crate::types::{Context, FuncType, Signature, Type};
use crate::values::{Val, ValRaw};
use anyhow::{Result, anyhow, bail};
use std::any::Any;
use std::fmt;

mod typed;

pub use self::typed::{
    ComponentParams, ComponentValue, Payload, take_enum, take_flags, take_record, take_variant,
    typecheck_enum, typecheck_flags, typecheck_record, typecheck_variant,
};

/// Describes one operation of the host capability surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    /// Interface the operation is imported from, e.g.
    /// `wasi:io/streams@0.2.2`.
    pub interface: String,
    /// Import name within the interface, e.g. `[method]input-stream.read`.
    pub name: String,
    /// Component-level signature.
    pub ty: FuncType,
}

impl Operation {
    pub fn new(
        interface: &str,
        name: &str,
        params: impl IntoIterator<Item = Type>,
        result: Option<Type>,
    ) -> Operation {
        Operation {
            interface: interface.to_string(),
            name: name.to_string(),
            ty: FuncType::new(params, result),
        }
    }

    /// The `[resource-drop]` operation of a resource kind. Its only
    /// parameter is the raw handle.
    pub fn resource_drop(interface: &str, resource: &str) -> Operation {
        Operation::new(
            interface,
            &format!("[resource-drop]{resource}"),
            [Type::U32],
            None,
        )
    }

    /// Core signature of this operation when imported by a guest.
    pub fn signature(&self) -> Signature {
        self.ty.signature(Context::Lower)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.interface, self.name)
    }
}

/// The view of the store given to host implementations.
pub struct HostContext<'a, T> {
    data: &'a mut T,
    resources: &'a mut ResourceState,
}

impl<'a, T> HostContext<'a, T> {
    pub fn new(data: &'a mut T, resources: &'a mut ResourceState) -> HostContext<'a, T> {
        HostContext { data, resources }
    }

    /// The embedder's data.
    pub fn data(&self) -> &T {
        self.data
    }

    /// The embedder's data, mutably.
    pub fn data_mut(&mut self) -> &mut T {
        self.data
    }

    /// Resolves a borrow received by the current call.
    pub fn get<R: Any>(&self, borrow: &Borrow<R>) -> Result<&R, TableError> {
        self.resources.borrowed(borrow.as_any())
    }

    /// Mutably resolves a borrow received by the current call.
    pub fn get_mut<R: Any>(&mut self, borrow: &Borrow<R>) -> Result<&mut R, TableError> {
        self.resources.borrowed_mut(borrow.as_any())
    }

    /// Handle tables and capture registries.
    pub fn resources(&mut self) -> &mut ResourceState {
        self.resources
    }
}

type HostFn<T> = dyn Fn(&mut HostContext<'_, T>, Vec<Val>) -> Result<Option<Val>> + Send + Sync;

/// A host implementation bound to its operation descriptor.
pub struct HostFunc<T> {
    op: Operation,
    sig: Signature,
    func: Box<HostFn<T>>,
}

impl<T> HostFunc<T> {
    /// Creates a dynamically typed host function.
    ///
    /// `func` receives the lifted parameters and must return a value of the
    /// operation's result type, or `None` if it has none. Returning `Err`
    /// traps.
    pub fn new<F>(op: Operation, func: F) -> HostFunc<T>
    where
        F: Fn(&mut HostContext<'_, T>, Vec<Val>) -> Result<Option<Val>> + Send + Sync + 'static,
    {
        HostFunc {
            sig: op.signature(),
            op,
            func: Box::new(func),
        }
    }

    /// The `[resource-drop]` trampoline for `kind`.
    ///
    /// Dropping an owned handle removes the host object from its registry and
    /// disposes of it. Dropping a borrowed handle only frees the handle.
    pub fn resource_drop(interface: &str, resource: &str, kind: ResourceKind) -> HostFunc<T> {
        HostFunc::new(
            Operation::resource_drop(interface, resource),
            move |cx, params| {
                let handle = match params.as_slice() {
                    [Val::U32(handle)] => *handle,
                    _ => bail!("resource drop expects a single handle"),
                };
                if let Some(value) = cx.resources().drop_handle(kind, handle)? {
                    tracing::trace!(kind = kind.index(), handle, "disposing resource");
                    drop(value);
                }
                Ok(None)
            },
        )
    }

    /// The operation this implements.
    pub fn operation(&self) -> &Operation {
        &self.op
    }

    /// Core signature of the guest import.
    pub fn signature(&self) -> &Signature {
        &self.sig
    }

    /// Runs the trampoline: lifts `args`, invokes the implementation and
    /// lowers its result. The returned values are the core results.
    pub fn call<G>(&self, guest: &mut G, args: &[ValRaw]) -> Result<Vec<ValRaw>>
    where
        G: GuestStore<Data = T>,
    {
        tracing::trace!(operation = %self.op, "host call");
        guest.resources().enter_call();
        let ret = self.lift_and_invoke(guest, args);
        let exit = guest.resources().exit_call();
        let ret = ret?;
        exit?;
        self.lower_result(guest, args, ret)
    }

    fn lift_and_invoke<G>(&self, guest: &mut G, args: &[ValRaw]) -> Result<Option<Val>>
    where
        G: GuestStore<Data = T>,
    {
        let params = {
            let mut cx = LiftContext::new(guest);
            if self.sig.params_indirect {
                let ptr = args
                    .first()
                    .ok_or_else(|| anyhow!(DecodeError::Truncated("parameters")))?
                    .get_u32();
                load_params(&mut cx, &self.op.ty, ptr)?
            } else {
                let mut src = args.iter();
                self.op
                    .ty
                    .params
                    .iter()
                    .map(|ty| Val::lift(&mut cx, ty, &mut src))
                    .collect::<Result<Vec<_>>>()?
            }
        };
        let mut host = guest.host();
        (self.func)(&mut host, params)
    }

    fn lower_result<G>(
        &self,
        guest: &mut G,
        args: &[ValRaw],
        ret: Option<Val>,
    ) -> Result<Vec<ValRaw>>
    where
        G: GuestStore<Data = T>,
    {
        match (&self.op.ty.result, ret) {
            (None, None) => Ok(Vec::new()),
            (Some(ty), Some(val)) => {
                let mut cx = LowerContext::new(guest);
                if self.sig.results_indirect {
                    let retptr = args
                        .last()
                        .ok_or_else(|| anyhow!(DecodeError::Truncated("return pointer")))?
                        .get_u32();
                    let abi = ty.abi();
                    cx.check("return", retptr, u64::from(abi.size32), abi.align32)?;
                    val.store(&mut cx, ty, retptr)?;
                    Ok(Vec::new())
                } else {
                    let mut dst = Vec::new();
                    val.lower(&mut cx, ty, &mut dst)?;
                    Ok(dst)
                }
            }
            (Some(_), None) => bail!("`{}` must return a value", self.op),
            (None, Some(_)) => bail!("`{}` does not return a value", self.op),
        }
    }
}

impl<T> fmt::Debug for HostFunc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunc")
            .field("op", &self.op)
            .field("sig", &self.sig)
            .finish_non_exhaustive()
    }
}

/// Loads a parameter list that spilled into linear memory at `ptr`.
pub(crate) fn load_params(cx: &mut LiftContext<'_>, ty: &FuncType, ptr: u32) -> Result<Vec<Val>> {
    let abi = ty.params_abi();
    cx.check("parameters", ptr, u64::from(abi.size32), abi.align32)?;
    let abis = ty.params.iter().map(|t| t.abi()).collect::<Vec<_>>();
    ty.params
        .iter()
        .zip(crate::types::CanonicalAbiInfo::record_offsets(&abis))
        .map(|(ty, offset)| Val::load(cx, ty, ptr + offset))
        .collect()
}

/// Stores a parameter list into linear memory at `ptr`.
pub(crate) fn store_params(
    cx: &mut LowerContext<'_>,
    ty: &FuncType,
    ptr: u32,
    params: Vec<Val>,
) -> Result<()> {
    if params.len() != ty.params.len() {
        bail!(
            "expected {} parameters, found {}",
            ty.params.len(),
            params.len()
        );
    }
    let abis = ty.params.iter().map(|t| t.abi()).collect::<Vec<_>>();
    for ((ty, val), offset) in ty
        .params
        .iter()
        .zip(params)
        .zip(crate::types::CanonicalAbiInfo::record_offsets(&abis))
    {
        val.store(cx, ty, ptr + offset)?;
    }
    Ok(())
}
