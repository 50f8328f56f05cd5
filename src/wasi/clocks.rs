//! `wasi:clocks`: the monotonic and wall clocks.

use super::io::POLLABLE;
use crate::func::Operation;
use crate::types::Type;
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

pub const MONOTONIC_CLOCK_INTERFACE: &str = "wasi:clocks/monotonic-clock@0.2.2";
pub const WALL_CLOCK_INTERFACE: &str = "wasi:clocks/wall-clock@0.2.2";

/// A wall clock time: seconds and nanoseconds since the Unix epoch.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Datetime {
    pub seconds: u64,
    pub nanoseconds: u32,
}

wit_record!(Datetime {
    seconds: u64 = "seconds",
    nanoseconds: u32 = "nanoseconds",
});

impl Datetime {
    /// The `datetime` record.
    pub fn ty() -> Type {
        static TY: LazyLock<Type> = LazyLock::new(|| {
            Type::record([("seconds", Type::U64), ("nanoseconds", Type::U32)])
        });
        TY.clone()
    }
}

impl From<Duration> for Datetime {
    fn from(duration: Duration) -> Datetime {
        Datetime {
            seconds: duration.as_secs(),
            nanoseconds: duration.subsec_nanos(),
        }
    }
}

impl TryFrom<SystemTime> for Datetime {
    type Error = anyhow::Error;

    fn try_from(time: SystemTime) -> anyhow::Result<Datetime> {
        Ok(time.duration_since(SystemTime::UNIX_EPOCH)?.into())
    }
}

/// Operations of both clock interfaces. Monotonic instants and durations
/// are nanoseconds.
pub fn operations() -> Vec<Operation> {
    vec![
        Operation::new(MONOTONIC_CLOCK_INTERFACE, "now", [], Some(Type::U64)),
        Operation::new(MONOTONIC_CLOCK_INTERFACE, "resolution", [], Some(Type::U64)),
        Operation::new(
            MONOTONIC_CLOCK_INTERFACE,
            "subscribe-instant",
            [Type::U64],
            Some(Type::own(POLLABLE)),
        ),
        Operation::new(WALL_CLOCK_INTERFACE, "now", [], Some(Datetime::ty())),
        Operation::new(WALL_CLOCK_INTERFACE, "resolution", [], Some(Datetime::ty())),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::{ComponentValue, HostFunc};
    use crate::memory::VecGuest;
    use crate::values::ValRaw;

    #[test]
    fn datetime_from_system_time() {
        let time = SystemTime::UNIX_EPOCH + Duration::new(1_700_000_000, 42);
        assert_eq!(
            Datetime::try_from(time).unwrap(),
            Datetime {
                seconds: 1_700_000_000,
                nanoseconds: 42
            }
        );
        let before = SystemTime::UNIX_EPOCH - Duration::from_secs(1);
        assert!(Datetime::try_from(before).is_err());
    }

    #[test]
    fn wall_clock_now_is_returned_through_memory() {
        let op = crate::wasi::operation(WALL_CLOCK_INTERFACE, "now").unwrap();
        assert!(op.signature().results_indirect);
        let now = HostFunc::<Datetime>::wrap(op, |cx, ()| Ok(*cx.data())).unwrap();
        let mut guest = VecGuest::new(
            64,
            Datetime {
                seconds: 7,
                nanoseconds: 9,
            },
        );
        assert!(now.call(&mut guest, &[ValRaw::u32(16)]).unwrap().is_empty());
        assert_eq!(guest.bytes()[16..24], 7u64.to_le_bytes());
        assert_eq!(guest.bytes()[24..28], 9u32.to_le_bytes());
        assert!(Datetime::typecheck(&Type::record([("seconds", Type::U64)])).is_err());
    }
}
