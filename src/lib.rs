//! Canonical ABI glue for running core wasm modules against typed host
//! capabilities.
//!
//! Core wasm only speaks integers, floats and linear memory. This crate
//! supplies the layer above that which lets core modules produced by
//! component toolchains exchange structured values and resource handles
//! with a host:
//!
//! * [`types`] describes value shapes and computes their canonical size,
//!   alignment and flattening once.
//! * [`Val`] lifts and lowers values between the host and a guest's linear
//!   memory, calling the guest's allocator when memory is needed.
//! * [`resources`] maps guest handles onto host objects with per-kind handle
//!   tables, capture registries and call-scoped borrows.
//! * [`HostFunc`] turns a host closure and an [`Operation`] descriptor into
//!   a core function with the lowered signature.
//! * [`ComponentLinker`] instantiates several core modules whose imports
//!   refer to each other, breaking cycles with a generated indirection
//!   module, and hands out typed entry points.
//! * [`wasi`] describes the WASI 0.2.2 surface so that embedders only need
//!   to supply implementations.
//!
//! Execution of wasm itself is delegated to [`wasmtime`]'s core API.
//!
//! ```ignore
//! let engine = wasmtime::Engine::default();
//! let mut linker = ComponentLinker::<MyHost>::new(&engine);
//! wasi::add_resources(&mut linker)?;
//! linker.func_wrap(
//!     wasi::operation(wasi::random::RANDOM_INTERFACE, "get-random-u64")?,
//!     |cx, ()| Ok(cx.data_mut().rng.next_u64()),
//! )?;
//!
//! let mut plan = LinkPlan::new();
//! plan.module("main", ModuleRole::Primary, wasm)
//!     .export("ping", FuncType::new([Type::String], Some(Type::String)));
//!
//! let mut store = wasmtime::Store::new(&engine, LinkerState::new(MyHost::default()));
//! let component = linker.instantiate(&mut store, plan)?;
//! let pong: String = component.call_typed(&mut store, "ping", ("hi".to_string(),))?;
//! ```

mod config;
mod error;
mod func;
mod linker;
pub mod memory;
pub mod resources;
pub mod types;
mod values;
pub mod wasi;

pub use crate::config::Config;
pub use crate::error::{DecodeError, LinkError, TableError, TrappableError};
pub use crate::func::{
    ComponentParams, ComponentValue, HostContext, HostFunc, Operation, Payload, take_enum,
    take_flags, take_record, take_variant, typecheck_enum, typecheck_flags, typecheck_record,
    typecheck_variant,
};
pub use crate::linker::{
    ComponentLinker, CoreSignature, ExportRef, ImportSource, Instantiator, LinkPlan, LinkStage,
    LinkedComponent, LinkerState, ModuleRole, SlotSource,
};
pub use crate::resources::{
    Borrow, HostResource, Resource, ResourceAny, ResourceId, ResourceKind,
};
pub use crate::types::{FuncType, Type};
pub use crate::values::{Val, ValRaw};
