mod entry_points;
mod http;
mod linking;

use wasmtime::Engine;

/// A bump allocator exported as `cabi_realloc`, plus the memory it carves
/// up. Allocations start at 1024 and are never freed.
pub(crate) const ALLOCATOR: &str = r#"
    (memory (export "memory") 1)
    (global $heap (mut i32) (i32.const 1024))
    (func (export "cabi_realloc")
        (param $old i32) (param $old_size i32) (param $align i32) (param $new_size i32)
        (result i32)
        (local $ptr i32)
        global.get $heap
        local.get $align
        i32.add
        i32.const 1
        i32.sub
        i32.const 0
        local.get $align
        i32.sub
        i32.and
        local.set $ptr
        local.get $ptr
        local.get $new_size
        i32.add
        global.set $heap
        local.get $ptr)
"#;

/// Assembles a guest module. Imports have to come before any definition.
pub(crate) fn guest(imports: &str, body: &str) -> String {
    format!("(module {imports} {ALLOCATOR} {body})")
}

pub(crate) fn engine() -> Engine {
    let _ = env_logger::try_init();
    Engine::default()
}
