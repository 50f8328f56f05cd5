//! Linking several core modules into one running component.
//!
//! A [`ComponentLinker`] holds the host operations; a [`LinkPlan`] describes
//! the core modules, how their imports are wired and which exports are entry
//! points. Instantiation walks through the [`LinkStage`]s in order:
//!
//! ```text
//! Unlinked -> ModulesCompiled -> CoreInstantiated -> AdapterInstantiated -> ShimWired -> Ready
//! ```
//!
//! Any failure on the way is a [`LinkError`] and no entry point is handed
//! out. [`Instantiator`] exposes the stages one at a time; most embedders use
//! [`ComponentLinker::instantiate`] which runs them all.

use crate::config::Config;
use crate::error::{DecodeError, LinkError, TrappableError};
use crate::func::{ComponentParams, HostContext, HostFunc, Operation, Payload, store_params};
use crate::memory::{GuestMemory, GuestStore, LiftContext, LowerContext};
use crate::resources::{ResourceKind, ResourceState};
use crate::types::{Context as AbiContext, FlatType, FuncType, Signature};
use crate::values::{Val, ValRaw};
use anyhow::{Result, anyhow, bail};
use indexmap::IndexMap;
use std::error::Error;
use std::sync::Arc;
use wasmtime::{
    AsContext, AsContextMut, Caller, Engine, Extern, ExternType, Func, ImportType, Instance, Memory,
    Module, StoreContextMut, TypedFunc,
};

mod shim;

pub use self::shim::CoreSignature;

type Realloc = TypedFunc<(u32, u32, u32, u32), u32>;

const SHIM: &str = "<indirection>";
const FIXUP: &str = "<fixup>";

/// The data of a [`Store`](wasmtime::Store) running a linked component.
///
/// Besides the embedder's `T` this holds the resource tables and the linear
/// memory and allocators captured while linking. One store runs one linked
/// component.
pub struct LinkerState<T> {
    data: T,
    resources: ResourceState,
    memory: Option<Memory>,
    reallocs: Vec<Option<Realloc>>,
}

impl<T> LinkerState<T> {
    pub fn new(data: T) -> LinkerState<T> {
        LinkerState::with_config(data, &Config::new())
    }

    pub fn with_config(data: T, config: &Config) -> LinkerState<T> {
        LinkerState {
            data,
            resources: ResourceState::with_max_handle(config.get_max_handles()),
            memory: None,
            reallocs: Vec::new(),
        }
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }

    pub fn resources(&self) -> &ResourceState {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceState {
        &mut self.resources
    }

    /// The linear memory shared by every trampoline, once captured.
    pub fn memory(&self) -> Option<Memory> {
        self.memory
    }
}

/// [`GuestMemory`] over a wasmtime store.
struct WasmGuest<'a, T: 'static> {
    store: StoreContextMut<'a, LinkerState<T>>,
    realloc: Option<usize>,
}

impl<'a, T: 'static> WasmGuest<'a, T> {
    fn new(store: StoreContextMut<'a, LinkerState<T>>, realloc: Option<usize>) -> Self {
        WasmGuest { store, realloc }
    }
}

impl<T: 'static> GuestMemory for WasmGuest<'_, T> {
    fn memory(&self) -> Result<&[u8]> {
        let memory = self
            .store
            .data()
            .memory
            .ok_or(DecodeError::NoMemory("reading guest memory"))?;
        Ok(memory.data(&self.store))
    }

    fn memory_mut(&mut self) -> Result<&mut [u8]> {
        let memory = self
            .store
            .data()
            .memory
            .ok_or(DecodeError::NoMemory("writing guest memory"))?;
        Ok(memory.data_mut(&mut self.store))
    }

    fn realloc(&mut self, old_ptr: u32, old_size: u32, align: u32, new_size: u32) -> Result<u32> {
        let Some(index) = self.realloc else {
            bail!("no allocator is available to this call");
        };
        let func = match self.store.data().reallocs.get(index) {
            Some(Some(func)) => func.clone(),
            _ => bail!("allocator {index} has not been linked"),
        };
        func.call(&mut self.store, (old_ptr, old_size, align, new_size))
    }

    fn resources(&mut self) -> &mut ResourceState {
        &mut self.store.data_mut().resources
    }
}

impl<T: 'static> GuestStore for WasmGuest<'_, T> {
    type Data = T;

    fn host(&mut self) -> HostContext<'_, T> {
        let state = self.store.data_mut();
        HostContext::new(&mut state.data, &mut state.resources)
    }
}

fn to_wasm(raw: ValRaw, ty: FlatType) -> wasmtime::Val {
    match ty {
        FlatType::I32 => wasmtime::Val::I32(raw.get_i32()),
        FlatType::I64 => wasmtime::Val::I64(raw.get_i64()),
        FlatType::F32 => wasmtime::Val::F32(raw.get_f32()),
        FlatType::F64 => wasmtime::Val::F64(raw.get_f64()),
    }
}

fn from_wasm(val: &wasmtime::Val) -> Result<ValRaw> {
    Ok(match val {
        wasmtime::Val::I32(i) => ValRaw::i32(*i),
        wasmtime::Val::I64(i) => ValRaw::i64(*i),
        wasmtime::Val::F32(bits) => ValRaw::f32(*bits),
        wasmtime::Val::F64(bits) => ValRaw::f64(*bits),
        _ => bail!("only numeric core values cross the boundary"),
    })
}

fn core_signature(sig: &Signature) -> CoreSignature {
    CoreSignature::new(sig.params.clone(), sig.results.clone())
}

/// Wraps a trampoline into a wasmtime function allocating with `realloc`.
fn trampoline<T: 'static>(
    store: &mut StoreContextMut<'_, LinkerState<T>>,
    func: &Arc<HostFunc<T>>,
    realloc: Option<usize>,
) -> Func {
    let ty = core_signature(func.signature()).to_wasmtime(store.engine());
    let func = func.clone();
    Func::new(
        &mut *store,
        ty,
        move |mut caller: Caller<'_, LinkerState<T>>, params, results| {
            let args = params.iter().map(from_wasm).collect::<Result<Vec<_>>>()?;
            let mut guest = WasmGuest::new(caller.as_context_mut(), realloc);
            let ret = func.call(&mut guest, &args)?;
            for ((dst, raw), ty) in results.iter_mut().zip(ret).zip(&func.signature().results) {
                *dst = to_wasm(raw, *ty);
            }
            Ok(())
        },
    )
}

/// Host operations available to linked components.
pub struct ComponentLinker<T> {
    engine: Engine,
    config: Config,
    funcs: IndexMap<String, Arc<HostFunc<T>>>,
    allow_shadowing: bool,
}

fn key(interface: &str, name: &str) -> String {
    format!("{interface}#{name}")
}

impl<T: 'static> ComponentLinker<T> {
    /// Creates an empty linker with the default [`Config`].
    pub fn new(engine: &Engine) -> ComponentLinker<T> {
        ComponentLinker::with_config(engine, Config::new())
    }

    pub fn with_config(engine: &Engine, config: Config) -> ComponentLinker<T> {
        ComponentLinker {
            engine: engine.clone(),
            config,
            funcs: IndexMap::new(),
            allow_shadowing: false,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Configures whether defining the same operation twice replaces the
    /// first definition instead of failing.
    pub fn allow_shadowing(&mut self, allow: bool) -> &mut Self {
        self.allow_shadowing = allow;
        self
    }

    /// Defines a host function under its operation's interface and name.
    pub fn define(&mut self, func: HostFunc<T>) -> Result<()> {
        let op = func.operation();
        let key = key(&op.interface, &op.name);
        if !self.allow_shadowing && self.funcs.contains_key(&key) {
            bail!("import `{key}` has already been defined");
        }
        log::trace!("defining `{key}`");
        self.funcs.insert(key, Arc::new(func));
        Ok(())
    }

    /// Defines a host function using dynamic values.
    ///
    /// `func` must return a value of `op`'s result type, or `None` if it has
    /// none.
    pub fn func_new<F>(&mut self, op: Operation, func: F) -> Result<()>
    where
        F: Fn(&mut HostContext<'_, T>, Vec<Val>) -> Result<Option<Val>> + Send + Sync + 'static,
    {
        self.define(HostFunc::new(op, func))
    }

    /// Defines a statically typed host function. `Params` and `Return` are
    /// checked against `op` here rather than when a guest calls it.
    pub fn func_wrap<Params, Return, F>(&mut self, op: Operation, func: F) -> Result<()>
    where
        Params: ComponentParams,
        Return: Payload,
        F: Fn(&mut HostContext<'_, T>, Params) -> Result<Return> + Send + Sync + 'static,
    {
        self.define(HostFunc::wrap(op, func)?)
    }

    /// Defines a statically typed host function returning `result<R, E>`
    /// whose capability errors are delivered to the guest.
    pub fn func_wrap_fallible<Params, R, E, F>(&mut self, op: Operation, func: F) -> Result<()>
    where
        Params: ComponentParams,
        R: Payload,
        E: Payload + Error + Send + Sync + 'static,
        F: Fn(&mut HostContext<'_, T>, Params) -> Result<R, TrappableError<E>>
            + Send
            + Sync
            + 'static,
    {
        self.define(HostFunc::wrap_fallible(op, func)?)
    }

    /// Declares the resource `name` of `interface` as `kind`, defining its
    /// `[resource-drop]` import.
    pub fn resource(&mut self, interface: &str, name: &str, kind: ResourceKind) -> Result<()> {
        self.define(HostFunc::resource_drop(interface, name, kind))
    }

    /// Looks up the host function for an import.
    pub fn get(&self, interface: &str, name: &str) -> Option<&HostFunc<T>> {
        self.funcs.get(&key(interface, name)).map(|f| &**f)
    }

    /// Starts a step-by-step instantiation of `plan`.
    pub fn instantiator(&self, plan: LinkPlan) -> Instantiator<'_, T> {
        Instantiator {
            linker: self,
            plan,
            stage: LinkStage::Unlinked,
            modules: Vec::new(),
            shim: None,
            shim_instance: None,
            instances: IndexMap::new(),
            memory: None,
            memory_required: false,
            reallocs: Vec::new(),
        }
    }

    /// Compiles, instantiates and wires every module of `plan`.
    pub fn instantiate(
        &self,
        mut store: impl AsContextMut<Data = LinkerState<T>>,
        plan: LinkPlan,
    ) -> Result<LinkedComponent> {
        let mut store = store.as_context_mut();
        let mut instantiator = self.instantiator(plan);
        instantiator.compile()?;
        instantiator.instantiate_core(&mut store)?;
        instantiator.instantiate_adapters(&mut store)?;
        instantiator.wire_shim(&mut store)?;
        instantiator.finish(&mut store)
    }
}

/// How a core module takes part in linking.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ModuleRole {
    /// Instantiated right after the indirection module. The first primary
    /// module provides the default memory and allocator.
    Primary,
    /// Instantiated after every primary module, typically adapting an older
    /// calling convention.
    Adapter,
}

/// Where an import of a core module comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportSource {
    /// The stub for the numbered slot of the indirection module.
    Slot(u32),
    /// An export of an instance created earlier.
    Export { instance: String, name: String },
    /// A host operation other than the one named by the import.
    Host {
        interface: String,
        name: String,
        realloc: Option<usize>,
    },
}

/// What a slot of the indirection module is eventually filled with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlotSource {
    /// A host operation allocating through the numbered allocator.
    Host {
        interface: String,
        name: String,
        realloc: Option<usize>,
    },
    /// An export of any instance, including ones created after the
    /// importer.
    Export { instance: String, name: String },
}

/// Names an export of an instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportRef {
    pub instance: String,
    pub name: String,
}

struct PlannedModule {
    name: String,
    role: ModuleRole,
    bytes: Vec<u8>,
}

struct Binding {
    module: String,
    import_module: String,
    name: String,
    source: ImportSource,
}

struct PlannedExport {
    name: String,
    instance: Option<String>,
    ty: FuncType,
}

/// Everything needed to instantiate one component out of core modules.
#[derive(Default)]
pub struct LinkPlan {
    modules: Vec<PlannedModule>,
    bindings: Vec<Binding>,
    slots: Vec<SlotSource>,
    indirection: Option<(Vec<u8>, Vec<u8>)>,
    memory: Option<ExportRef>,
    reallocs: Vec<ExportRef>,
    exports: Vec<PlannedExport>,
}

impl LinkPlan {
    pub fn new() -> LinkPlan {
        LinkPlan::default()
    }

    /// Adds a core module, in binary or text form. Modules of the same role
    /// are instantiated in the order they are added.
    pub fn module(&mut self, name: &str, role: ModuleRole, bytes: impl Into<Vec<u8>>) -> &mut Self {
        self.modules.push(PlannedModule {
            name: name.to_string(),
            role,
            bytes: bytes.into(),
        });
        self
    }

    /// Binds the import `import_module`#`name` of `module` to `source`.
    ///
    /// Imports without a binding resolve to the host operation of the same
    /// interface and name.
    pub fn bind(
        &mut self,
        module: &str,
        import_module: &str,
        name: &str,
        source: ImportSource,
    ) -> &mut Self {
        self.bindings.push(Binding {
            module: module.to_string(),
            import_module: import_module.to_string(),
            name: name.to_string(),
            source,
        });
        self
    }

    /// Adds a slot to the indirection module, returning its number.
    pub fn slot(&mut self, source: SlotSource) -> u32 {
        self.slots.push(source);
        (self.slots.len() - 1) as u32
    }

    /// Uses precompiled indirection and fixup modules instead of generating
    /// them from the slots.
    pub fn indirection(
        &mut self,
        shim: impl Into<Vec<u8>>,
        fixup: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.indirection = Some((shim.into(), fixup.into()));
        self
    }

    /// Selects the linear memory used by every trampoline. Defaults to the
    /// primary module's memory export, if it has one.
    pub fn memory(&mut self, instance: &str, name: &str) -> &mut Self {
        self.memory = Some(ExportRef {
            instance: instance.to_string(),
            name: name.to_string(),
        });
        self
    }

    /// Adds an allocator, returning its number. Without any, the primary
    /// module's allocator export is allocator 0.
    pub fn realloc(&mut self, instance: &str, name: &str) -> usize {
        self.reallocs.push(ExportRef {
            instance: instance.to_string(),
            name: name.to_string(),
        });
        self.reallocs.len() - 1
    }

    /// Declares an entry point exported by the primary module.
    pub fn export(&mut self, name: &str, ty: FuncType) -> &mut Self {
        self.exports.push(PlannedExport {
            name: name.to_string(),
            instance: None,
            ty,
        });
        self
    }

    /// Declares an entry point exported by `instance`.
    pub fn export_from(&mut self, instance: &str, name: &str, ty: FuncType) -> &mut Self {
        self.exports.push(PlannedExport {
            name: name.to_string(),
            instance: Some(instance.to_string()),
            ty,
        });
        self
    }

    fn primary(&self) -> Option<&PlannedModule> {
        self.modules.iter().find(|m| m.role == ModuleRole::Primary)
    }

    fn binding(&self, module: &str, import: &ImportType<'_>) -> Option<&ImportSource> {
        self.bindings
            .iter()
            .find(|b| {
                b.module == module
                    && b.import_module == import.module()
                    && b.name == import.name()
            })
            .map(|b| &b.source)
    }
}

/// Progress of an [`Instantiator`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkStage {
    Unlinked,
    ModulesCompiled,
    CoreInstantiated,
    AdapterInstantiated,
    ShimWired,
    Ready,
}

/// Step-by-step instantiation of a [`LinkPlan`].
///
/// Each step must be taken in order, and entry points only exist on the
/// [`LinkedComponent`] returned by [`Instantiator::finish`].
pub struct Instantiator<'a, T> {
    linker: &'a ComponentLinker<T>,
    plan: LinkPlan,
    stage: LinkStage,
    modules: Vec<Module>,
    shim: Option<(Module, Module)>,
    shim_instance: Option<Instance>,
    instances: IndexMap<String, Instance>,
    memory: Option<ExportRef>,
    memory_required: bool,
    reallocs: Vec<ExportRef>,
}

impl<'a, T: 'static> Instantiator<'a, T> {
    pub fn stage(&self) -> LinkStage {
        self.stage
    }

    /// An instance created so far.
    pub fn instance(&self, name: &str) -> Option<Instance> {
        self.instances.get(name).copied()
    }

    fn advance(&mut self, expected: LinkStage, next: LinkStage) -> Result<()> {
        if self.stage != expected {
            return Err(LinkError::Stage {
                expected,
                found: self.stage,
            }
            .into());
        }
        log::debug!("link stage {:?} -> {:?}", self.stage, next);
        self.stage = next;
        Ok(())
    }

    fn check_stage(&self, expected: LinkStage) -> Result<()> {
        if self.stage != expected {
            return Err(LinkError::Stage {
                expected,
                found: self.stage,
            }
            .into());
        }
        Ok(())
    }

    /// Compiles every module and the indirection and fixup modules.
    pub fn compile(&mut self) -> Result<()> {
        self.check_stage(LinkStage::Unlinked)?;
        let engine = self.linker.engine();
        let primary = self.plan.primary().ok_or(LinkError::NoPrimary)?;
        let primary_name = primary.name.clone();

        let mut modules = Vec::with_capacity(self.plan.modules.len());
        for planned in &self.plan.modules {
            log::trace!("compiling `{}`", planned.name);
            let module = Module::new(engine, &planned.bytes).map_err(|source| LinkError::Compile {
                module: planned.name.clone(),
                source,
            })?;
            modules.push(module);
        }
        self.modules = modules;

        self.shim = match &self.plan.indirection {
            Some((shim, fixup)) => Some((
                compile(engine, SHIM, shim)?,
                compile(engine, FIXUP, fixup)?,
            )),
            None if self.plan.slots.is_empty() => None,
            None => {
                let sigs = self.slot_signatures()?;
                let table = self.linker.config().get_shim_table_export();
                let shim = wat::parse_str(shim::indirection_wat(table, &sigs))?;
                let fixup = wat::parse_str(shim::fixup_wat(table, &sigs))?;
                Some((compile(engine, SHIM, &shim)?, compile(engine, FIXUP, &fixup)?))
            }
        };

        let primary_module = &self.modules[self.module_index(&primary_name)?];
        let config = self.linker.config();
        self.memory_required = self.plan.memory.is_some();
        self.memory = match &self.plan.memory {
            Some(memory) => Some(memory.clone()),
            None => primary_module
                .get_export(config.get_memory_export())
                .filter(|ty| matches!(ty, ExternType::Memory(_)))
                .map(|_| ExportRef {
                    instance: primary_name.clone(),
                    name: config.get_memory_export().to_string(),
                }),
        };
        self.reallocs = if self.plan.reallocs.is_empty() {
            primary_module
                .get_export(config.get_realloc_export())
                .map(|_| ExportRef {
                    instance: primary_name.clone(),
                    name: config.get_realloc_export().to_string(),
                })
                .into_iter()
                .collect()
        } else {
            self.plan.reallocs.clone()
        };

        self.advance(LinkStage::Unlinked, LinkStage::ModulesCompiled)
    }

    fn module_index(&self, name: &str) -> Result<usize> {
        self.plan
            .modules
            .iter()
            .position(|m| m.name == name)
            .ok_or_else(|| LinkError::UnknownModule(name.to_string()).into())
    }

    fn slot_signatures(&self) -> Result<Vec<CoreSignature>> {
        let mut sigs = Vec::with_capacity(self.plan.slots.len());
        for slot in &self.plan.slots {
            let sig = match slot {
                SlotSource::Host {
                    interface, name, ..
                } => {
                    let func = self.linker.get(interface, name).ok_or_else(|| {
                        LinkError::MissingImport {
                            module: SHIM.to_string(),
                            import_module: interface.clone(),
                            name: name.clone(),
                        }
                    })?;
                    core_signature(func.signature())
                }
                SlotSource::Export { instance, name } => {
                    let module = &self.modules[self.module_index(instance)?];
                    let missing = || LinkError::MissingExport {
                        instance: instance.clone(),
                        name: name.clone(),
                    };
                    match module.get_export(name) {
                        Some(ExternType::Func(ty)) => {
                            CoreSignature::from_wasmtime(&ty).ok_or_else(missing)?
                        }
                        _ => return Err(missing().into()),
                    }
                }
            };
            sigs.push(sig);
        }
        Ok(sigs)
    }

    /// Instantiates the indirection module followed by every primary module.
    pub fn instantiate_core(
        &mut self,
        mut store: impl AsContextMut<Data = LinkerState<T>>,
    ) -> Result<()> {
        self.check_stage(LinkStage::ModulesCompiled)?;
        let mut store = store.as_context_mut();
        store.data_mut().reallocs = vec![None; self.reallocs.len()];
        if let Some((shim, _)) = &self.shim {
            log::trace!("instantiating the indirection module");
            let instance = Instance::new(&mut store, shim, &[]).map_err(|source| {
                LinkError::Instantiate {
                    module: SHIM.to_string(),
                    source,
                }
            })?;
            self.shim_instance = Some(instance);
        }
        self.instantiate_role(&mut store, ModuleRole::Primary)?;
        self.advance(LinkStage::ModulesCompiled, LinkStage::CoreInstantiated)
    }

    /// Instantiates every adapter module.
    pub fn instantiate_adapters(
        &mut self,
        mut store: impl AsContextMut<Data = LinkerState<T>>,
    ) -> Result<()> {
        self.check_stage(LinkStage::CoreInstantiated)?;
        self.instantiate_role(&mut store.as_context_mut(), ModuleRole::Adapter)?;
        self.advance(LinkStage::CoreInstantiated, LinkStage::AdapterInstantiated)
    }

    fn instantiate_role(
        &mut self,
        store: &mut StoreContextMut<'_, LinkerState<T>>,
        role: ModuleRole,
    ) -> Result<()> {
        for index in 0..self.plan.modules.len() {
            if self.plan.modules[index].role != role {
                continue;
            }
            let externs = self.resolve_imports(store, index)?;
            let name = self.plan.modules[index].name.clone();
            log::trace!("instantiating `{name}` with {} imports", externs.len());
            let instance = Instance::new(&mut *store, &self.modules[index], &externs)
                .map_err(|source| LinkError::Instantiate {
                    module: name.clone(),
                    source,
                })?;
            self.instances.insert(name, instance);
            self.capture(store)?;
        }
        Ok(())
    }

    fn resolve_imports(
        &self,
        store: &mut StoreContextMut<'_, LinkerState<T>>,
        index: usize,
    ) -> Result<Vec<Extern>> {
        let module_name = &self.plan.modules[index].name;
        let mut externs = Vec::new();
        for import in self.modules[index].imports() {
            let ext = match self.plan.binding(module_name, &import) {
                Some(ImportSource::Slot(slot)) => self.slot_export(store, *slot)?,
                Some(ImportSource::Export { instance, name }) => {
                    self.instance_export(store, instance, name)?
                }
                Some(ImportSource::Host {
                    interface,
                    name,
                    realloc,
                }) => self.host_import(store, module_name, &import, interface, name, *realloc)?,
                None => self.host_import(
                    store,
                    module_name,
                    &import,
                    import.module(),
                    import.name(),
                    Some(0),
                )?,
            };
            externs.push(ext);
        }
        Ok(externs)
    }

    fn slot_export(
        &self,
        store: &mut StoreContextMut<'_, LinkerState<T>>,
        slot: u32,
    ) -> Result<Extern> {
        let shim = self.shim_instance.ok_or(LinkError::UnknownSlot(slot))?;
        shim.get_export(&mut *store, &slot.to_string())
            .ok_or_else(|| LinkError::UnknownSlot(slot).into())
    }

    fn instance_export(
        &self,
        store: &mut StoreContextMut<'_, LinkerState<T>>,
        instance: &str,
        name: &str,
    ) -> Result<Extern> {
        let Some(found) = self.instances.get(instance) else {
            self.module_index(instance)?;
            return Err(LinkError::NotInstantiated(instance.to_string()).into());
        };
        found.get_export(&mut *store, name).ok_or_else(|| {
            LinkError::MissingExport {
                instance: instance.to_string(),
                name: name.to_string(),
            }
            .into()
        })
    }

    fn host_import(
        &self,
        store: &mut StoreContextMut<'_, LinkerState<T>>,
        module: &str,
        import: &ImportType<'_>,
        interface: &str,
        name: &str,
        realloc: Option<usize>,
    ) -> Result<Extern> {
        let func = self
            .linker
            .funcs
            .get(&key(interface, name))
            .ok_or_else(|| LinkError::MissingImport {
                module: module.to_string(),
                import_module: import.module().to_string(),
                name: import.name().to_string(),
            })?;
        let provided = core_signature(func.signature());
        let expected = match import.ty() {
            ExternType::Func(ty) => CoreSignature::from_wasmtime(&ty),
            _ => None,
        };
        if expected.as_ref() != Some(&provided) {
            return Err(LinkError::SignatureMismatch {
                module: module.to_string(),
                import_module: import.module().to_string(),
                name: import.name().to_string(),
                expected: match expected {
                    Some(sig) => sig.to_string(),
                    None => format!("{:?}", import.ty()),
                },
                found: provided.to_string(),
            }
            .into());
        }
        Ok(trampoline(store, func, realloc).into())
    }

    /// Captures the memory and allocators once their instances exist.
    fn capture(&self, store: &mut StoreContextMut<'_, LinkerState<T>>) -> Result<()> {
        if store.data().memory.is_none() {
            if let Some(memory) = &self.memory {
                if let Some(instance) = self.instances.get(&memory.instance) {
                    let found = instance.get_memory(&mut *store, &memory.name).ok_or_else(|| {
                        LinkError::MissingExport {
                            instance: memory.instance.clone(),
                            name: memory.name.clone(),
                        }
                    })?;
                    log::debug!("captured memory `{}` of `{}`", memory.name, memory.instance);
                    store.data_mut().memory = Some(found);
                }
            }
        }
        for (index, realloc) in self.reallocs.iter().enumerate() {
            if store.data().reallocs[index].is_some() {
                continue;
            }
            let Some(instance) = self.instances.get(&realloc.instance) else {
                continue;
            };
            let func = typed_export(&mut *store, instance, &realloc.instance, &realloc.name)?;
            log::debug!(
                "captured allocator {index} `{}` of `{}`",
                realloc.name,
                realloc.instance
            );
            store.data_mut().reallocs[index] = Some(func);
        }
        Ok(())
    }

    /// Instantiates the fixup module, filling every slot of the indirection
    /// module with its implementation.
    pub fn wire_shim(&mut self, mut store: impl AsContextMut<Data = LinkerState<T>>) -> Result<()> {
        self.check_stage(LinkStage::AdapterInstantiated)?;
        let mut store = store.as_context_mut();
        if let (Some((_, fixup)), Some(shim)) = (&self.shim, self.shim_instance) {
            let table = self.linker.config().get_shim_table_export();
            let mut externs = Vec::new();
            for import in fixup.imports() {
                let ext = if import.name() == table {
                    shim.get_export(&mut store, table).ok_or_else(|| LinkError::MissingExport {
                        instance: SHIM.to_string(),
                        name: table.to_string(),
                    })?
                } else {
                    let slot = import
                        .name()
                        .parse::<usize>()
                        .ok()
                        .and_then(|n| self.plan.slots.get(n));
                    match slot {
                        Some(SlotSource::Host {
                            interface,
                            name,
                            realloc,
                        }) => {
                            self.host_import(&mut store, FIXUP, &import, interface, name, *realloc)?
                        }
                        Some(SlotSource::Export { instance, name }) => {
                            self.instance_export(&mut store, instance, name)?
                        }
                        None => {
                            return Err(LinkError::MissingImport {
                                module: FIXUP.to_string(),
                                import_module: import.module().to_string(),
                                name: import.name().to_string(),
                            }
                            .into());
                        }
                    }
                };
                externs.push(ext);
            }
            log::trace!("wiring {} shim slots", externs.len().saturating_sub(1));
            Instance::new(&mut store, fixup, &externs).map_err(|source| LinkError::Instantiate {
                module: FIXUP.to_string(),
                source,
            })?;
        }
        self.advance(LinkStage::AdapterInstantiated, LinkStage::ShimWired)
    }

    /// Resolves the entry points, completing linking.
    pub fn finish(
        mut self,
        mut store: impl AsContextMut<Data = LinkerState<T>>,
    ) -> Result<LinkedComponent> {
        self.check_stage(LinkStage::ShimWired)?;
        let mut store = store.as_context_mut();
        if self.memory_required && store.data().memory.is_none() {
            if let Some(memory) = &self.memory {
                return Err(LinkError::NotInstantiated(memory.instance.clone()).into());
            }
        }
        let primary = self
            .plan
            .primary()
            .map(|m| m.name.clone())
            .ok_or(LinkError::NoPrimary)?;
        let prefix = self.linker.config().get_post_return_prefix();
        let mut exports = IndexMap::new();
        for export in &self.plan.exports {
            let instance_name = export.instance.as_deref().unwrap_or(&primary);
            let instance = self
                .instances
                .get(instance_name)
                .ok_or_else(|| LinkError::NotInstantiated(instance_name.to_string()))?;
            let func = instance.get_func(&mut store, &export.name).ok_or_else(|| {
                LinkError::MissingExport {
                    instance: instance_name.to_string(),
                    name: export.name.clone(),
                }
            })?;
            let sig = export.ty.signature(AbiContext::Lift);
            let expected = core_signature(&sig);
            check_signature(&store, &func, instance_name, &export.name, &expected)?;
            let post_name = format!("{prefix}{}", export.name);
            let post_return = instance.get_func(&mut store, &post_name);
            if let Some(post) = &post_return {
                // Post-return receives exactly what the entry point returned.
                let expected = CoreSignature::new(sig.results.clone(), Vec::new());
                check_signature(&store, post, instance_name, &post_name, &expected)?;
            }
            exports.insert(
                export.name.clone(),
                EntryPoint {
                    func,
                    post_return,
                    ty: export.ty.clone(),
                    sig,
                },
            );
        }
        self.advance(LinkStage::ShimWired, LinkStage::Ready)?;
        Ok(LinkedComponent {
            exports,
            instances: self.instances,
        })
    }
}

fn compile(engine: &Engine, name: &str, bytes: &[u8]) -> Result<Module> {
    Module::new(engine, bytes).map_err(|source| {
        LinkError::Compile {
            module: name.to_string(),
            source,
        }
        .into()
    })
}

fn typed_export<T: 'static>(
    store: &mut StoreContextMut<'_, LinkerState<T>>,
    instance: &Instance,
    instance_name: &str,
    name: &str,
) -> Result<Realloc> {
    let func = instance
        .get_func(&mut *store, name)
        .ok_or_else(|| LinkError::MissingExport {
            instance: instance_name.to_string(),
            name: name.to_string(),
        })?;
    func.typed(&*store).map_err(|_| {
        let expected = CoreSignature::new(vec![FlatType::I32; 4], vec![FlatType::I32]);
        mismatch(&*store, &func, instance_name, name, &expected).into()
    })
}

fn check_signature(
    store: impl AsContext,
    func: &Func,
    instance: &str,
    name: &str,
    expected: &CoreSignature,
) -> Result<(), LinkError> {
    let found = CoreSignature::from_wasmtime(&func.ty(&store));
    if found.as_ref() == Some(expected) {
        return Ok(());
    }
    Err(mismatch(store, func, instance, name, expected))
}

fn mismatch(
    store: impl AsContext,
    func: &Func,
    instance: &str,
    name: &str,
    expected: &CoreSignature,
) -> LinkError {
    LinkError::ExportMismatch {
        instance: instance.to_string(),
        name: name.to_string(),
        expected: expected.to_string(),
        found: CoreSignature::from_wasmtime(&func.ty(&store))
            .map_or_else(|| "a non-numeric function".to_string(), |s| s.to_string()),
    }
}

#[derive(Debug)]
struct EntryPoint {
    func: Func,
    post_return: Option<Func>,
    ty: FuncType,
    sig: Signature,
}

impl EntryPoint {
    fn call<T: 'static>(
        &self,
        store: &mut StoreContextMut<'_, LinkerState<T>>,
        params: Vec<Val>,
    ) -> Result<Option<Val>> {
        if params.len() != self.ty.params.len() {
            bail!(
                "expected {} arguments, found {}",
                self.ty.params.len(),
                params.len()
            );
        }
        let raw = {
            let mut guest = WasmGuest::new(store.as_context_mut(), Some(0));
            let mut cx = LowerContext::new(&mut guest);
            if self.sig.params_indirect {
                let abi = self.ty.params_abi();
                let ptr = cx.realloc(0, 0, abi.align32, abi.size32)?;
                store_params(&mut cx, &self.ty, ptr, params)?;
                vec![ValRaw::u32(ptr)]
            } else {
                let mut raw = Vec::new();
                for (ty, val) in self.ty.params.iter().zip(params) {
                    val.lower(&mut cx, ty, &mut raw)?;
                }
                raw
            }
        };
        let args = raw
            .iter()
            .zip(&self.sig.params)
            .map(|(raw, ty)| to_wasm(*raw, *ty))
            .collect::<Vec<_>>();
        let mut results = self
            .sig
            .results
            .iter()
            .map(|ty| to_wasm(ValRaw::default(), *ty))
            .collect::<Vec<_>>();
        self.func.call(&mut *store, &args, &mut results)?;

        let ret = match &self.ty.result {
            None => None,
            Some(ty) => {
                let raw = results.iter().map(from_wasm).collect::<Result<Vec<_>>>()?;
                let mut guest = WasmGuest::new(store.as_context_mut(), Some(0));
                let mut cx = LiftContext::new(&mut guest);
                Some(if self.sig.results_indirect {
                    let ptr = raw
                        .first()
                        .ok_or(DecodeError::Truncated("return pointer"))?
                        .get_u32();
                    let abi = ty.abi();
                    cx.check("return", ptr, u64::from(abi.size32), abi.align32)?;
                    Val::load(&mut cx, ty, ptr)?
                } else {
                    Val::lift(&mut cx, ty, &mut raw.iter())?
                })
            }
        };
        if let Some(post_return) = &self.post_return {
            post_return.call(&mut *store, &results, &mut [])?;
        }
        Ok(ret)
    }
}

/// A fully linked component.
#[derive(Debug)]
pub struct LinkedComponent {
    exports: IndexMap<String, EntryPoint>,
    instances: IndexMap<String, Instance>,
}

impl LinkedComponent {
    /// Calls the entry point `name`.
    ///
    /// Arguments are lowered into the guest, results are lifted out of it and
    /// then the entry point's post-return function, if any, is called. Borrows
    /// lent to the guest for the call are reclaimed afterwards.
    pub fn call<T: 'static>(
        &self,
        mut store: impl AsContextMut<Data = LinkerState<T>>,
        name: &str,
        params: Vec<Val>,
    ) -> Result<Option<Val>> {
        let entry = self.entry(name)?;
        let mut store = store.as_context_mut();
        tracing::trace!(name, "calling entry point");
        store.data_mut().resources.enter_call();
        let ret = entry.call(&mut store, params);
        let exit = store.data_mut().resources.exit_call();
        let ret = ret?;
        exit?;
        Ok(ret)
    }

    /// Calls the entry point `name` with statically typed arguments and
    /// result.
    pub fn call_typed<T: 'static, Params, Return>(
        &self,
        store: impl AsContextMut<Data = LinkerState<T>>,
        name: &str,
        params: Params,
    ) -> Result<Return>
    where
        Params: ComponentParams,
        Return: Payload,
    {
        let entry = self.entry(name)?;
        Params::typecheck_params(&entry.ty.params)?;
        Return::typecheck_payload(entry.ty.result.as_ref())?;
        let ret = self.call(store, name, params.into_vals())?;
        Return::from_payload(ret)
    }

    fn entry(&self, name: &str) -> Result<&EntryPoint> {
        self.exports
            .get(name)
            .ok_or_else(|| anyhow!("no entry point named `{name}`"))
    }

    /// The component-level type of the entry point `name`.
    pub fn func_type(&self, name: &str) -> Option<&FuncType> {
        self.exports.get(name).map(|e| &e.ty)
    }

    /// Names of every entry point.
    pub fn entry_points(&self) -> impl Iterator<Item = &str> + '_ {
        self.exports.keys().map(|s| s.as_str())
    }

    /// A core instance created while linking.
    pub fn instance(&self, name: &str) -> Option<Instance> {
        self.instances.get(name).copied()
    }
}
