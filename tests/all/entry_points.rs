use super::{engine, guest};
use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use wasmtime::Store;
use wasmtime_glue::wasi::{self, http};
use wasmtime_glue::{
    ComponentLinker, Config, FuncType, HostResource, LinkError, LinkPlan, LinkerState, ModuleRole,
    Resource, ResourceKind, Type, Val,
};

// The result area is cleared by post-return, so reading it afterwards would
// yield an empty string.
const PING: &str = r#"
    (global $posts (mut i32) (i32.const 0))
    (func (export "ping") (param $ptr i32) (param $len i32) (result i32)
        i32.const 16
        local.get $ptr
        i32.store
        i32.const 20
        local.get $len
        i32.store
        i32.const 16)
    (func (export "cabi_post_ping") (param i32)
        local.get 0
        i64.const 0
        i64.store
        global.get $posts
        i32.const 1
        i32.add
        global.set $posts)
    (func (export "post-ping") (param i32)
        global.get $posts
        i32.const 100
        i32.add
        global.set $posts)
    (func (export "posts") (result i32)
        global.get $posts)
"#;

fn ping_plan() -> LinkPlan {
    let mut plan = LinkPlan::new();
    plan.module("main", ModuleRole::Primary, guest("", PING))
        .export("ping", FuncType::new([Type::String], Some(Type::String)));
    plan
}

#[test]
fn strings_round_trip_and_post_return_runs_after_lifting() -> Result<()> {
    let engine = engine();
    let linker = ComponentLinker::<()>::new(&engine);
    let mut store = Store::new(&engine, LinkerState::new(()));
    let component = linker.instantiate(&mut store, ping_plan())?;

    let pong: String = component.call_typed(&mut store, "ping", ("hello".to_string(),))?;
    assert_eq!(pong, "hello");
    let pong = component.call(&mut store, "ping", vec![Val::String(String::new())])?;
    assert_eq!(pong, Some(Val::String(String::new())));

    let posts = component
        .instance("main")
        .unwrap()
        .get_typed_func::<(), i32>(&mut store, "posts")?;
    assert_eq!(posts.call(&mut store, ())?, 2);
    Ok(())
}

#[test]
fn post_return_prefix_is_configurable() -> Result<()> {
    let engine = engine();
    let mut config = Config::new();
    config.post_return_prefix("post-");
    let linker = ComponentLinker::<()>::with_config(&engine, config);
    let mut store = Store::new(&engine, LinkerState::new(()));
    let component = linker.instantiate(&mut store, ping_plan())?;

    let pong: String = component.call_typed(&mut store, "ping", ("x".to_string(),))?;
    assert_eq!(pong, "x");
    let posts = component
        .instance("main")
        .unwrap()
        .get_typed_func::<(), i32>(&mut store, "posts")?;
    assert_eq!(posts.call(&mut store, ())?, 100);
    Ok(())
}

#[test]
fn post_return_signature_is_checked_at_link_time() -> Result<()> {
    let body = r#"
        (func (export "ping") (param i32 i32) (result i32)
            i32.const 16)
        (func (export "cabi_post_ping") (param i64))
    "#;
    let engine = engine();
    let linker = ComponentLinker::<()>::new(&engine);
    let mut plan = LinkPlan::new();
    plan.module("main", ModuleRole::Primary, guest("", body))
        .export("ping", FuncType::new([Type::String], Some(Type::String)));
    let mut store = Store::new(&engine, LinkerState::new(()));
    let err = linker.instantiate(&mut store, plan).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LinkError>(),
        Some(LinkError::ExportMismatch { name, expected, found, .. })
            if name == "cabi_post_ping" && expected == "(i32) -> ()" && found == "(i64) -> ()"
    ));
    Ok(())
}

#[test]
fn mistyped_calls_are_rejected() -> Result<()> {
    let engine = engine();
    let linker = ComponentLinker::<()>::new(&engine);
    let mut store = Store::new(&engine, LinkerState::new(()));
    let component = linker.instantiate(&mut store, ping_plan())?;

    assert!(
        component
            .call_typed::<(), (u32,), String>(&mut store, "ping", (1,))
            .is_err()
    );
    assert!(
        component
            .call_typed::<(), (String,), u32>(&mut store, "ping", ("a".to_string(),))
            .is_err()
    );
    let err = component.call(&mut store, "ping", vec![]).unwrap_err();
    assert_eq!(err.to_string(), "expected 1 arguments, found 0");
    let err = component.call(&mut store, "pong", vec![]).unwrap_err();
    assert_eq!(err.to_string(), "no entry point named `pong`");
    assert_eq!(component.entry_points().collect::<Vec<_>>(), ["ping"]);
    Ok(())
}

#[test]
fn many_parameters_are_passed_through_memory() -> Result<()> {
    let body = r#"
        (func (export "sum") (param $p i32) (result i32)
            (local $i i32) (local $acc i32)
            (loop $next
                local.get $acc
                local.get $p
                local.get $i
                i32.const 4
                i32.mul
                i32.add
                i32.load
                i32.add
                local.set $acc
                local.get $i
                i32.const 1
                i32.add
                local.tee $i
                i32.const 17
                i32.lt_u
                br_if $next)
            local.get $acc)
    "#;
    let engine = engine();
    let linker = ComponentLinker::<()>::new(&engine);
    let mut plan = LinkPlan::new();
    plan.module("main", ModuleRole::Primary, guest("", body))
        .export("sum", FuncType::new(vec![Type::U32; 17], Some(Type::U32)));
    let mut store = Store::new(&engine, LinkerState::new(()));
    let component = linker.instantiate(&mut store, plan)?;

    let ret = component.call(&mut store, "sum", (0..17).map(Val::U32).collect())?;
    assert_eq!(ret, Some(Val::U32(136)));
    Ok(())
}

struct Tracked(Arc<AtomicUsize>);

impl HostResource for Tracked {
    const KIND: ResourceKind = http::FIELDS;
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn guest_drops_resources_it_was_given() -> Result<()> {
    let imports = r#"
        (import "wasi:http/types@0.2.2" "[resource-drop]fields" (func $drop (param i32)))
    "#;
    let body = r#"
        (func (export "consume") (param i32)
            local.get 0
            call $drop)
    "#;
    let engine = engine();
    let mut linker = ComponentLinker::<()>::new(&engine);
    wasi::add_resources(&mut linker)?;
    let mut plan = LinkPlan::new();
    plan.module("main", ModuleRole::Primary, guest(imports, body))
        .export("consume", FuncType::new([Type::own(http::FIELDS)], None));
    let mut store = Store::new(&engine, LinkerState::new(()));
    let component = linker.instantiate(&mut store, plan)?;

    let drops = Arc::new(AtomicUsize::new(0));
    let () = component.call_typed(
        &mut store,
        "consume",
        (Resource::new(Tracked(drops.clone())),),
    )?;
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    let captures = store.data().resources().captures(http::FIELDS);
    assert_eq!(captures.map_or(0, |c| c.len()), 0);
    Ok(())
}
