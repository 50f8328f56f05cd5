use super::{engine, guest};
use anyhow::Result;
use wasmtime::Store;
use wasmtime_glue::wasi::{self, random::RANDOM_INTERFACE};
use wasmtime_glue::{
    ComponentLinker, FuncType, ImportSource, LinkError, LinkPlan, LinkStage, LinkerState,
    ModuleRole, SlotSource, Type,
};

const MAIN_IMPORTS: &str = r#"
    (import "adapter" "fill" (func $fill (param i32) (result i32)))
"#;

const MAIN_BODY: &str = r#"
    (func (export "fill") (param i32) (result i32)
        local.get 0
        call $fill)
"#;

// Shares the main module's memory but allocates from its own region.
const ADAPTER: &str = r#"
(module
    (import "env" "memory" (memory 1))
    (import "wasi:random/random@0.2.2" "get-random-bytes" (func $bytes (param i64 i32)))
    (global $heap (mut i32) (i32.const 4096))
    (func (export "cabi_import_realloc") (param i32 i32 i32 i32) (result i32)
        (local $ptr i32)
        global.get $heap
        local.set $ptr
        global.get $heap
        local.get 3
        i32.add
        global.set $heap
        local.get $ptr)
    (func (export "fill") (param $len i32) (result i32)
        local.get $len
        i64.extend_i32_u
        i32.const 64
        call $bytes
        i32.const 64
        i32.load)
)
"#;

fn linker() -> Result<ComponentLinker<()>> {
    let mut linker = ComponentLinker::new(&engine());
    linker.func_wrap(
        wasi::operation(RANDOM_INTERFACE, "get-random-bytes")?,
        |_, (len,): (u64,)| Ok(vec![7u8; len as usize]),
    )?;
    linker.func_wrap(
        wasi::operation(RANDOM_INTERFACE, "get-random-u64")?,
        |_, ()| Ok(4u64),
    )?;
    Ok(linker)
}

fn export(instance: &str, name: &str) -> ImportSource {
    ImportSource::Export {
        instance: instance.to_string(),
        name: name.to_string(),
    }
}

/// The main module calls forward into the adapter through the shim, and the
/// adapter's host import allocates through the adapter's own allocator.
fn adapter_plan() -> LinkPlan {
    let mut plan = LinkPlan::new();
    let slot = plan.slot(SlotSource::Export {
        instance: "adapter".to_string(),
        name: "fill".to_string(),
    });
    plan.module("main", ModuleRole::Primary, guest(MAIN_IMPORTS, MAIN_BODY))
        .module("adapter", ModuleRole::Adapter, ADAPTER)
        .bind("main", "adapter", "fill", ImportSource::Slot(slot))
        .bind("adapter", "env", "memory", export("main", "memory"))
        .export("fill", FuncType::new([Type::U32], Some(Type::U32)));
    plan.realloc("main", "cabi_realloc");
    let realloc = plan.realloc("adapter", "cabi_import_realloc");
    plan.bind(
        "adapter",
        RANDOM_INTERFACE,
        "get-random-bytes",
        ImportSource::Host {
            interface: RANDOM_INTERFACE.to_string(),
            name: "get-random-bytes".to_string(),
            realloc: Some(realloc),
        },
    );
    plan
}

#[test]
fn adapters_are_reached_through_the_shim() -> Result<()> {
    let linker = linker()?;
    let mut store = Store::new(linker.engine(), LinkerState::new(()));
    let component = linker.instantiate(&mut store, adapter_plan())?;

    let ptr: u32 = component.call_typed(&mut store, "fill", (5u32,))?;
    assert!(ptr >= 4096, "allocated by the adapter: {ptr}");
    let memory = store.data().memory().unwrap();
    let ptr = ptr as usize;
    assert_eq!(&memory.data(&store)[ptr..ptr + 5], &[7; 5]);
    Ok(())
}

#[test]
fn shim_slots_trap_until_wired() -> Result<()> {
    let linker = linker()?;
    let mut store = Store::new(linker.engine(), LinkerState::new(()));
    let mut instantiator = linker.instantiator(adapter_plan());
    assert_eq!(instantiator.stage(), LinkStage::Unlinked);
    instantiator.compile()?;
    assert_eq!(instantiator.stage(), LinkStage::ModulesCompiled);
    instantiator.instantiate_core(&mut store)?;
    assert!(instantiator.instance("adapter").is_none());

    let fill = instantiator
        .instance("main")
        .unwrap()
        .get_typed_func::<i32, i32>(&mut store, "fill")?;
    assert!(fill.call(&mut store, 1).is_err());
    instantiator.instantiate_adapters(&mut store)?;
    assert!(fill.call(&mut store, 1).is_err());

    instantiator.wire_shim(&mut store)?;
    assert!(fill.call(&mut store, 1)? >= 4096);
    let component = instantiator.finish(&mut store)?;
    assert_eq!(component.entry_points().collect::<Vec<_>>(), ["fill"]);
    Ok(())
}

#[test]
fn stages_run_in_order() -> Result<()> {
    let linker = linker()?;
    let mut store = Store::new(linker.engine(), LinkerState::new(()));
    let mut instantiator = linker.instantiator(adapter_plan());

    let err = instantiator.wire_shim(&mut store).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LinkError>(),
        Some(LinkError::Stage {
            expected: LinkStage::AdapterInstantiated,
            found: LinkStage::Unlinked,
        })
    ));
    instantiator.compile()?;
    assert!(instantiator.compile().is_err());
    assert!(instantiator.instantiate_adapters(&mut store).is_err());
    assert_eq!(instantiator.stage(), LinkStage::ModulesCompiled);
    Ok(())
}

#[test]
fn precompiled_indirection_modules() -> Result<()> {
    let shim = r#"
        (module
            (type $t (func (param i32) (result i32)))
            (table (export "$imports") 1 1 funcref)
            (func (export "0") (type $t)
                local.get 0
                i32.const 0
                call_indirect (type $t)))
    "#;
    let fixup = r#"
        (module
            (type $t (func (param i32) (result i32)))
            (import "" "$imports" (table 1 1 funcref))
            (import "" "0" (func $f (type $t)))
            (elem (i32.const 0) func $f))
    "#;
    let linker = linker()?;
    let mut store = Store::new(linker.engine(), LinkerState::new(()));
    let mut plan = adapter_plan();
    plan.indirection(shim, fixup);
    let component = linker.instantiate(&mut store, plan)?;
    let ptr: u32 = component.call_typed(&mut store, "fill", (2u32,))?;
    assert!(ptr >= 4096);
    Ok(())
}

#[test]
fn forward_references_need_a_slot() -> Result<()> {
    let linker = linker()?;
    let mut store = Store::new(linker.engine(), LinkerState::new(()));
    let mut plan = LinkPlan::new();
    plan.module("main", ModuleRole::Primary, guest(MAIN_IMPORTS, MAIN_BODY))
        .module("adapter", ModuleRole::Adapter, ADAPTER)
        .bind("main", "adapter", "fill", export("adapter", "fill"));
    let err = linker.instantiate(&mut store, plan).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LinkError>(),
        Some(LinkError::NotInstantiated(name)) if name == "adapter"
    ));
    Ok(())
}

#[test]
fn host_imports_are_checked() -> Result<()> {
    let imports = r#"
        (import "wasi:random/random@0.2.2" "get-random-u64" (func (result i32)))
    "#;
    let mut plan = LinkPlan::new();
    plan.module("main", ModuleRole::Primary, guest(imports, ""));
    let linker = linker()?;
    let mut store = Store::new(linker.engine(), LinkerState::new(()));
    let err = linker.instantiate(&mut store, plan).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LinkError>(),
        Some(LinkError::SignatureMismatch { .. })
    ));
    assert!(
        err.to_string()
            .contains("has type () -> (i32) but is provided with type () -> (i64)"),
        "{err}"
    );

    let imports = r#"
        (import "wasi:random/insecure@0.2.2" "get-insecure-random-u64" (func (result i64)))
    "#;
    let mut plan = LinkPlan::new();
    plan.module("main", ModuleRole::Primary, guest(imports, ""));
    let err = linker.instantiate(&mut store, plan).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LinkError>(),
        Some(LinkError::MissingImport { name, .. }) if name == "get-insecure-random-u64"
    ));
    Ok(())
}

#[test]
fn entry_points_are_checked() -> Result<()> {
    let linker = linker()?;
    let mut store = Store::new(linker.engine(), LinkerState::new(()));
    let mut plan = adapter_plan();
    plan.export("fill-string", FuncType::new([Type::String], Some(Type::U32)));
    let err = linker.instantiate(&mut store, plan).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LinkError>(),
        Some(LinkError::MissingExport { name, .. }) if name == "fill-string"
    ));

    let mut store = Store::new(linker.engine(), LinkerState::new(()));
    let mut plan = LinkPlan::new();
    plan.module("main", ModuleRole::Primary, guest(MAIN_IMPORTS, MAIN_BODY))
        .module("adapter", ModuleRole::Adapter, ADAPTER)
        .export_from(
            "main",
            "fill",
            FuncType::new([Type::String], Some(Type::U32)),
        );
    let slot = plan.slot(SlotSource::Export {
        instance: "adapter".to_string(),
        name: "fill".to_string(),
    });
    plan.bind("main", "adapter", "fill", ImportSource::Slot(slot))
        .bind("adapter", "env", "memory", export("main", "memory"));
    let err = linker.instantiate(&mut store, plan).unwrap_err();
    assert_eq!(
        err.to_string(),
        "export `fill` of instance `main` has type (i32) -> (i32) but (i32, i32) -> (i32) is required"
    );

    let mut plan = LinkPlan::new();
    plan.module("adapter", ModuleRole::Adapter, ADAPTER);
    let err = linker.instantiate(&mut store, plan).unwrap_err();
    assert!(matches!(err.downcast_ref::<LinkError>(), Some(LinkError::NoPrimary)));
    Ok(())
}
