//! Descriptors for the WASI 0.2.2 capability surface.
//!
//! Nothing in here implements a capability. Each submodule lists the
//! operations of its interfaces as [`Operation`]s, declares the resource
//! kinds they traffic in and provides Rust types for the structured values
//! crossing them. Embedders register implementations against these
//! descriptors with [`ComponentLinker::func_wrap`] and friends; registration
//! fails if an implementation disagrees with the descriptor.
//!
//! Resource kinds keep a fixed numbering so that handle spaces are stable
//! across embeddings:
//!
//! | kind | resource |
//! |---|---|
//! | 0 | `wasi:io/error.error` |
//! | 1 | `wasi:io/poll.pollable` |
//! | 2 | `wasi:io/streams.input-stream` |
//! | 3 | `wasi:io/streams.output-stream` |
//! | 4 | `wasi:cli/terminal-input.terminal-input` |
//! | 5 | `wasi:cli/terminal-output.terminal-output` |
//! | 6 | `wasi:filesystem/types.descriptor` |
//! | 7..=16 | `wasi:http/types` resources |

use crate::func::Operation;
use crate::linker::ComponentLinker;
use crate::resources::ResourceKind;
use anyhow::{Result, anyhow};
use indexmap::IndexMap;
use std::sync::LazyLock;

/// Implements [`ComponentValue`](crate::ComponentValue) for a struct mapped
/// field by field onto a record.
macro_rules! wit_record {
    ($name:ident { $($field:ident: $ty:ty = $wit:literal,)* }) => {
        impl $crate::func::ComponentValue for $name {
            fn typecheck(ty: &$crate::types::Type) -> ::anyhow::Result<()> {
                let [$($field,)*] = $crate::func::typecheck_record(ty, [$($wit,)*])?;
                $(<$ty as $crate::func::ComponentValue>::typecheck($field)?;)*
                Ok(())
            }

            fn into_val(self) -> $crate::values::Val {
                $crate::values::Val::Record(vec![$(
                    ($wit.to_string(), $crate::func::ComponentValue::into_val(self.$field)),
                )*])
            }

            fn from_val(val: $crate::values::Val) -> ::anyhow::Result<$name> {
                let [$($field,)*] = $crate::func::take_record(val, [$($wit,)*])?;
                Ok($name {
                    $($field: <$ty as $crate::func::ComponentValue>::from_val($field)?,)*
                })
            }
        }
    };
}

/// Defines a fieldless Rust enum mapped case by case onto a WIT enum.
macro_rules! wit_enum {
    (
        $(#[$attr:meta])*
        pub enum $name:ident = $wit:literal {
            $($(#[$case_attr:meta])* $case:ident = $case_name:literal,)*
        }
    ) => {
        $(#[$attr])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$case_attr])* $case,)*
        }

        impl $name {
            /// Case names in declaration order.
            pub const NAMES: &'static [&'static str] = &[$($case_name,)*];

            /// The WIT name of this case.
            pub fn name(self) -> &'static str {
                match self {
                    $($name::$case => $case_name,)*
                }
            }

            /// Looks up a case by its WIT name.
            pub fn from_name(name: &str) -> Option<$name> {
                match name {
                    $($case_name => Some($name::$case),)*
                    _ => None,
                }
            }

            /// The type descriptor.
            pub fn ty() -> $crate::types::Type {
                static TY: ::std::sync::LazyLock<$crate::types::Type> =
                    ::std::sync::LazyLock::new(|| {
                        $crate::types::Type::enumeration($name::NAMES.iter().copied())
                    });
                TY.clone()
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.name())
            }
        }

        impl $crate::func::ComponentValue for $name {
            fn typecheck(ty: &$crate::types::Type) -> ::anyhow::Result<()> {
                $crate::func::typecheck_enum(ty, $name::NAMES)
            }

            fn into_val(self) -> $crate::values::Val {
                $crate::values::Val::Enum(self.name().to_string())
            }

            fn from_val(val: $crate::values::Val) -> ::anyhow::Result<$name> {
                let case = $crate::func::take_enum(val)?;
                $name::from_name(&case)
                    .ok_or_else(|| ::anyhow::anyhow!("unknown case `{case}` of {}", $wit))
            }
        }
    };
}

pub mod cli;
pub mod clocks;
pub mod filesystem;
pub mod http;
pub mod io;
pub mod random;

/// The WASI release every descriptor in this module belongs to.
pub const VERSION: &str = "0.2.2";

/// A resource type declared by a WASI interface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ResourceDecl {
    pub interface: &'static str,
    pub name: &'static str,
    pub kind: ResourceKind,
}

const fn decl(interface: &'static str, name: &'static str, kind: ResourceKind) -> ResourceDecl {
    ResourceDecl {
        interface,
        name,
        kind,
    }
}

/// Every resource type, ordered by kind.
pub const RESOURCES: &[ResourceDecl] = &[
    decl(io::ERROR_INTERFACE, "error", io::ERROR),
    decl(io::POLL_INTERFACE, "pollable", io::POLLABLE),
    decl(io::STREAMS_INTERFACE, "input-stream", io::INPUT_STREAM),
    decl(io::STREAMS_INTERFACE, "output-stream", io::OUTPUT_STREAM),
    decl(cli::TERMINAL_INPUT_INTERFACE, "terminal-input", cli::TERMINAL_INPUT),
    decl(cli::TERMINAL_OUTPUT_INTERFACE, "terminal-output", cli::TERMINAL_OUTPUT),
    decl(filesystem::TYPES_INTERFACE, "descriptor", filesystem::DESCRIPTOR),
    decl(http::TYPES_INTERFACE, "fields", http::FIELDS),
    decl(http::TYPES_INTERFACE, "incoming-request", http::INCOMING_REQUEST),
    decl(http::TYPES_INTERFACE, "incoming-body", http::INCOMING_BODY),
    decl(http::TYPES_INTERFACE, "outgoing-request", http::OUTGOING_REQUEST),
    decl(http::TYPES_INTERFACE, "outgoing-body", http::OUTGOING_BODY),
    decl(http::TYPES_INTERFACE, "response-outparam", http::RESPONSE_OUTPARAM),
    decl(http::TYPES_INTERFACE, "outgoing-response", http::OUTGOING_RESPONSE),
    decl(http::TYPES_INTERFACE, "incoming-response", http::INCOMING_RESPONSE),
    decl(
        http::TYPES_INTERFACE,
        "future-incoming-response",
        http::FUTURE_INCOMING_RESPONSE,
    ),
    decl(http::TYPES_INTERFACE, "request-options", http::REQUEST_OPTIONS),
];

/// Looks up the kind of a resource by interface and name.
pub fn resource_kind(interface: &str, name: &str) -> Option<ResourceKind> {
    RESOURCES
        .iter()
        .find(|r| r.interface == interface && r.name == name)
        .map(|r| r.kind)
}

static CATALOG: LazyLock<IndexMap<String, Operation>> = LazyLock::new(|| {
    let ops = RESOURCES
        .iter()
        .map(|r| Operation::resource_drop(r.interface, r.name))
        .chain(io::operations())
        .chain(clocks::operations())
        .chain(random::operations())
        .chain(cli::operations())
        .chain(filesystem::operations())
        .chain(http::operations());
    ops.map(|op| (op.to_string(), op)).collect()
});

/// Every operation of the surface, `[resource-drop]` imports included.
pub fn operations() -> impl ExactSizeIterator<Item = &'static Operation> {
    CATALOG.values()
}

/// Looks up the descriptor of `name` in `interface`.
pub fn operation(interface: &str, name: &str) -> Result<Operation> {
    CATALOG
        .get(&format!("{interface}#{name}"))
        .cloned()
        .ok_or_else(|| anyhow!("`{interface}#{name}` is not a WASI {VERSION} operation"))
}

/// Defines the `[resource-drop]` import of every resource type in `linker`.
///
/// Dropping a handle releases it and drops the host object it owned.
pub fn add_resources<T: 'static>(linker: &mut ComponentLinker<T>) -> Result<()> {
    for r in RESOURCES {
        linker.resource(r.interface, r.name, r.kind)?;
    }
    log::debug!("defined drops for {} WASI resource types", RESOURCES.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Context, Type};

    #[test]
    fn kinds_are_dense() {
        for (i, r) in RESOURCES.iter().enumerate() {
            assert_eq!(r.kind.index() as usize, i, "{}", r.name);
        }
        assert_eq!(
            resource_kind(http::TYPES_INTERFACE, "fields"),
            Some(http::FIELDS)
        );
        assert_eq!(resource_kind(io::POLL_INTERFACE, "fields"), None);
    }

    #[test]
    fn operation_names_are_unique() {
        let count = RESOURCES.len()
            + io::operations().len()
            + clocks::operations().len()
            + random::operations().len()
            + cli::operations().len()
            + filesystem::operations().len()
            + http::operations().len();
        assert_eq!(operations().len(), count);
    }

    #[test]
    fn lookup() {
        let op = operation(io::STREAMS_INTERFACE, "[method]input-stream.read").unwrap();
        assert_eq!(op.ty.params[1], Type::U64);
        let drop = operation(http::TYPES_INTERFACE, "[resource-drop]fields").unwrap();
        assert_eq!(drop.ty.params[..], [Type::U32]);
        let err = operation(io::STREAMS_INTERFACE, "read").unwrap_err();
        assert_eq!(
            err.to_string(),
            "`wasi:io/streams@0.2.2#read` is not a WASI 0.2.2 operation"
        );
    }

    #[test]
    fn every_operation_fits_a_core_signature() {
        for op in operations() {
            let sig = op.ty.signature(Context::Lower);
            assert!(sig.params.len() <= 16, "{op}");
            assert!(sig.results.len() <= 1, "{op}");
        }
    }

    #[test]
    fn drops_are_defined_once() {
        let engine = wasmtime::Engine::default();
        let mut linker = ComponentLinker::<()>::new(&engine);
        add_resources(&mut linker).unwrap();
        assert!(linker.get(io::POLL_INTERFACE, "[resource-drop]pollable").is_some());
        assert!(add_resources(&mut linker).is_err());
    }
}
