//! `wasi:random/random`.

use crate::func::Operation;
use crate::types::Type;

pub const RANDOM_INTERFACE: &str = "wasi:random/random@0.2.2";

pub fn operations() -> Vec<Operation> {
    vec![
        Operation::new(
            RANDOM_INTERFACE,
            "get-random-bytes",
            [Type::U64],
            Some(Type::list(Type::U8)),
        ),
        Operation::new(RANDOM_INTERFACE, "get-random-u64", [], Some(Type::U64)),
    ]
}
