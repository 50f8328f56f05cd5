//! The indirection and fixup modules.
//!
//! Modules that import each other cannot be instantiated in any order. The
//! indirection ("shim") module breaks the cycle: it is instantiated first and
//! exports one stub per numbered slot, each of which forwards through an
//! exported funcref table. Once every other instance exists the fixup
//! module is instantiated with the real implementations as imports, and its
//! active element segment fills the table. Calling a stub before that traps
//! on the null table entry.

use crate::types::FlatType;
use std::fmt::{self, Write};
use wasmtime::ValType;

/// A core function type made only of numeric types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreSignature {
    pub params: Vec<FlatType>,
    pub results: Vec<FlatType>,
}

impl CoreSignature {
    pub fn new(params: Vec<FlatType>, results: Vec<FlatType>) -> CoreSignature {
        CoreSignature { params, results }
    }

    /// Converts a wasmtime function type, returning `None` if it uses
    /// anything besides numeric types.
    pub fn from_wasmtime(ty: &wasmtime::FuncType) -> Option<CoreSignature> {
        Some(CoreSignature {
            params: ty.params().map(flat_type).collect::<Option<_>>()?,
            results: ty.results().map(flat_type).collect::<Option<_>>()?,
        })
    }

    /// The equivalent wasmtime function type.
    pub fn to_wasmtime(&self, engine: &wasmtime::Engine) -> wasmtime::FuncType {
        wasmtime::FuncType::new(
            engine,
            self.params.iter().map(|t| val_type(*t)),
            self.results.iter().map(|t| val_type(*t)),
        )
    }

    fn write_wat(&self, dst: &mut String) {
        for param in &self.params {
            let _ = write!(dst, " (param {param})");
        }
        for result in &self.results {
            let _ = write!(dst, " (result {result})");
        }
    }
}

impl fmt::Display for CoreSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        f.write_str(") -> (")?;
        for (i, result) in self.results.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{result}")?;
        }
        f.write_str(")")
    }
}

pub fn flat_type(ty: ValType) -> Option<FlatType> {
    match ty {
        ValType::I32 => Some(FlatType::I32),
        ValType::I64 => Some(FlatType::I64),
        ValType::F32 => Some(FlatType::F32),
        ValType::F64 => Some(FlatType::F64),
        _ => None,
    }
}

pub fn val_type(ty: FlatType) -> ValType {
    match ty {
        FlatType::I32 => ValType::I32,
        FlatType::I64 => ValType::I64,
        FlatType::F32 => ValType::F32,
        FlatType::F64 => ValType::F64,
    }
}

/// Module name under which the fixup module imports the table and the slot
/// implementations.
pub const FIXUP_IMPORT_MODULE: &str = "";

/// Generates the indirection module for `slots`. Slot `n` is exported as a
/// function named `n`, the table as `table`.
pub fn indirection_wat(table: &str, slots: &[CoreSignature]) -> String {
    let mut wat = String::from("(module\n");
    for (i, sig) in slots.iter().enumerate() {
        let _ = write!(wat, "  (type $t{i} (func");
        sig.write_wat(&mut wat);
        wat.push_str("))\n");
    }
    let _ = writeln!(
        wat,
        "  (table (export {table:?}) {n} {n} funcref)",
        n = slots.len()
    );
    for (i, sig) in slots.iter().enumerate() {
        let _ = write!(wat, "  (func (export \"{i}\") (type $t{i})");
        sig.write_wat(&mut wat);
        wat.push('\n');
        for param in 0..sig.params.len() {
            let _ = writeln!(wat, "    local.get {param}");
        }
        let _ = writeln!(wat, "    i32.const {i}");
        let _ = writeln!(wat, "    call_indirect (type $t{i}))");
    }
    wat.push(')');
    wat
}

/// Generates the fixup module for `slots`, which fills the table exported by
/// the indirection module.
pub fn fixup_wat(table: &str, slots: &[CoreSignature]) -> String {
    let mut wat = String::from("(module\n");
    let _ = writeln!(
        wat,
        "  (import {FIXUP_IMPORT_MODULE:?} {table:?} (table {n} {n} funcref))",
        n = slots.len()
    );
    for (i, sig) in slots.iter().enumerate() {
        let _ = write!(wat, "  (import {FIXUP_IMPORT_MODULE:?} \"{i}\" (func");
        sig.write_wat(&mut wat);
        wat.push_str("))\n");
    }
    wat.push_str("  (elem (i32.const 0) func");
    for i in 0..slots.len() {
        let _ = write!(wat, " {i}");
    }
    wat.push_str("))");
    wat
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Engine, Instance, Module, Store};

    fn slots() -> Vec<CoreSignature> {
        vec![
            CoreSignature::new(vec![FlatType::I32, FlatType::I32], vec![FlatType::I32]),
            CoreSignature::new(vec![FlatType::I64], vec![]),
            CoreSignature::new(vec![FlatType::F32, FlatType::F64], vec![FlatType::F64]),
        ]
    }

    #[test]
    fn signatures_display_like_core_types() {
        assert_eq!(slots()[0].to_string(), "(i32, i32) -> (i32)");
        assert_eq!(slots()[1].to_string(), "(i64) -> ()");
    }

    #[test]
    fn generated_modules_validate() {
        let engine = Engine::default();
        let shim = Module::new(&engine, indirection_wat("$imports", &slots())).unwrap();
        assert!(shim.get_export("$imports").is_some());
        for i in 0..3 {
            assert!(shim.get_export(&i.to_string()).is_some());
        }
        let fixup = Module::new(&engine, fixup_wat("$imports", &slots())).unwrap();
        assert_eq!(fixup.imports().len(), 4);

        let ty = match shim.get_export("0") {
            Some(wasmtime::ExternType::Func(ty)) => ty,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(CoreSignature::from_wasmtime(&ty), Some(slots()[0].clone()));
    }

    #[test]
    fn stubs_trap_until_filled() {
        let engine = Engine::default();
        let shim = Module::new(&engine, indirection_wat("$imports", &slots()[..1])).unwrap();
        let mut store = Store::new(&engine, ());
        let instance = Instance::new(&mut store, &shim, &[]).unwrap();
        let stub = instance
            .get_typed_func::<(i32, i32), i32>(&mut store, "0")
            .unwrap();
        assert!(stub.call(&mut store, (1, 2)).is_err());

        let add = Module::new(
            &engine,
            r#"(module (func (export "add") (param i32 i32) (result i32)
                local.get 0 local.get 1 i32.add))"#,
        )
        .unwrap();
        let add = Instance::new(&mut store, &add, &[]).unwrap();
        let fixup = Module::new(&engine, fixup_wat("$imports", &slots()[..1])).unwrap();
        let table = instance.get_export(&mut store, "$imports").unwrap();
        let func = add.get_export(&mut store, "add").unwrap();
        Instance::new(&mut store, &fixup, &[table, func]).unwrap();
        assert_eq!(stub.call(&mut store, (1, 2)).unwrap(), 3);
    }
}
