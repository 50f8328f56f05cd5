//! `wasi:cli`: standard streams and terminals.

use super::io::{INPUT_STREAM, OUTPUT_STREAM};
use crate::func::Operation;
use crate::resources::ResourceKind;
use crate::types::Type;

pub const STDIN_INTERFACE: &str = "wasi:cli/stdin@0.2.2";
pub const STDOUT_INTERFACE: &str = "wasi:cli/stdout@0.2.2";
pub const STDERR_INTERFACE: &str = "wasi:cli/stderr@0.2.2";
pub const TERMINAL_INPUT_INTERFACE: &str = "wasi:cli/terminal-input@0.2.2";
pub const TERMINAL_OUTPUT_INTERFACE: &str = "wasi:cli/terminal-output@0.2.2";
pub const TERMINAL_STDIN_INTERFACE: &str = "wasi:cli/terminal-stdin@0.2.2";
pub const TERMINAL_STDOUT_INTERFACE: &str = "wasi:cli/terminal-stdout@0.2.2";
pub const TERMINAL_STDERR_INTERFACE: &str = "wasi:cli/terminal-stderr@0.2.2";

pub const TERMINAL_INPUT: ResourceKind = ResourceKind::new(4);
pub const TERMINAL_OUTPUT: ResourceKind = ResourceKind::new(5);

pub fn operations() -> Vec<Operation> {
    vec![
        Operation::new(STDIN_INTERFACE, "get-stdin", [], Some(Type::own(INPUT_STREAM))),
        Operation::new(STDOUT_INTERFACE, "get-stdout", [], Some(Type::own(OUTPUT_STREAM))),
        Operation::new(STDERR_INTERFACE, "get-stderr", [], Some(Type::own(OUTPUT_STREAM))),
        Operation::new(
            TERMINAL_STDIN_INTERFACE,
            "get-terminal-stdin",
            [],
            Some(Type::option(Type::own(TERMINAL_INPUT))),
        ),
        Operation::new(
            TERMINAL_STDOUT_INTERFACE,
            "get-terminal-stdout",
            [],
            Some(Type::option(Type::own(TERMINAL_OUTPUT))),
        ),
        Operation::new(
            TERMINAL_STDERR_INTERFACE,
            "get-terminal-stderr",
            [],
            Some(Type::option(Type::own(TERMINAL_OUTPUT))),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::HostFunc;
    use crate::memory::{GuestMemory, VecGuest};
    use crate::resources::{HostResource, Resource};
    use crate::values::ValRaw;

    struct Stdout;

    impl HostResource for Stdout {
        const KIND: ResourceKind = OUTPUT_STREAM;
    }

    struct Terminal;

    impl HostResource for Terminal {
        const KIND: ResourceKind = TERMINAL_OUTPUT;
    }

    #[test]
    fn stdout_is_captured_once_per_call() {
        let op = crate::wasi::operation(STDOUT_INTERFACE, "get-stdout").unwrap();
        let get = HostFunc::<()>::wrap(op, |_, ()| Ok(Resource::new(Stdout))).unwrap();
        let mut guest = VecGuest::new(64, ());
        let first = get.call(&mut guest, &[]).unwrap()[0].get_u32();
        let second = get.call(&mut guest, &[]).unwrap()[0].get_u32();
        assert_eq!((first, second), (1, 2));
        assert_eq!(guest.resources().captures(OUTPUT_STREAM).unwrap().len(), 2);
    }

    #[test]
    fn missing_terminal_lowers_to_none() {
        let op = crate::wasi::operation(TERMINAL_STDOUT_INTERFACE, "get-terminal-stdout").unwrap();
        let get = HostFunc::<bool>::wrap(op, |cx, ()| {
            Ok(cx.data().then(|| Resource::new(Terminal)))
        })
        .unwrap();

        let mut guest = VecGuest::new(64, false);
        get.call(&mut guest, &[ValRaw::u32(8)]).unwrap();
        assert_eq!(guest.bytes()[8], 0);

        *guest.data_mut() = true;
        get.call(&mut guest, &[ValRaw::u32(8)]).unwrap();
        assert_eq!(guest.bytes()[8], 1);
        assert_eq!(guest.bytes()[12..16], 1u32.to_le_bytes());
    }
}
