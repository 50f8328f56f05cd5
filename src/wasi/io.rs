//! `wasi:io`: errors, polling and byte streams.

use crate::func::{ComponentValue, Operation, Payload, take_variant, typecheck_variant};
use crate::resources::{HostResource, Resource, ResourceKind};
use crate::types::Type;
use crate::values::Val;
use anyhow::{Result, bail};
use std::fmt;
use std::sync::LazyLock;

pub const ERROR_INTERFACE: &str = "wasi:io/error@0.2.2";
pub const POLL_INTERFACE: &str = "wasi:io/poll@0.2.2";
pub const STREAMS_INTERFACE: &str = "wasi:io/streams@0.2.2";

pub const ERROR: ResourceKind = ResourceKind::new(0);
pub const POLLABLE: ResourceKind = ResourceKind::new(1);
pub const INPUT_STREAM: ResourceKind = ResourceKind::new(2);
pub const OUTPUT_STREAM: ResourceKind = ResourceKind::new(3);

/// Error reported by a stream operation.
///
/// The `error` resource handed to the guest with
/// [`StreamError::LastOperationFailed`] is a plain [`anyhow::Error`] on the
/// host side.
#[derive(Debug)]
pub enum StreamError {
    LastOperationFailed(Resource<anyhow::Error>),
    Closed,
}

impl HostResource for anyhow::Error {
    const KIND: ResourceKind = ERROR;
}

impl StreamError {
    /// A failure carrying `err` to the guest as an `error` resource.
    pub fn failed(err: impl Into<anyhow::Error>) -> StreamError {
        StreamError::LastOperationFailed(Resource::new(err.into()))
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::LastOperationFailed(err) => match err.get() {
                Some(err) => write!(f, "last operation failed: {err:#}"),
                None => write!(f, "last operation failed"),
            },
            StreamError::Closed => write!(f, "stream closed"),
        }
    }
}

impl std::error::Error for StreamError {}

/// The `stream-error` variant.
pub fn stream_error() -> Type {
    static TY: LazyLock<Type> = LazyLock::new(|| {
        Type::variant([
            ("last-operation-failed", Some(Type::own(ERROR))),
            ("closed", None),
        ])
    });
    TY.clone()
}

impl ComponentValue for StreamError {
    fn typecheck(ty: &Type) -> Result<()> {
        let [failed, closed] = typecheck_variant(ty, ["last-operation-failed", "closed"])?;
        <Resource<anyhow::Error>>::typecheck_payload(failed)?;
        <()>::typecheck_payload(closed)
    }

    fn into_val(self) -> Val {
        match self {
            StreamError::LastOperationFailed(err) => {
                Val::Variant("last-operation-failed".into(), Some(Box::new(err.into_val())))
            }
            StreamError::Closed => Val::Variant("closed".into(), None),
        }
    }

    fn from_val(val: Val) -> Result<StreamError> {
        let (case, payload) = take_variant(val)?;
        match case.as_str() {
            "last-operation-failed" => Ok(StreamError::LastOperationFailed(
                Payload::from_payload(payload)?,
            )),
            "closed" => {
                <()>::from_payload(payload)?;
                Ok(StreamError::Closed)
            }
            other => bail!("unknown case `{other}` of stream-error"),
        }
    }
}

fn stream_result(ok: Option<Type>) -> Option<Type> {
    Some(Type::result(ok, Some(stream_error())))
}

/// Operations of `wasi:io/poll` and `wasi:io/streams`.
pub fn operations() -> Vec<Operation> {
    let input = || Type::borrow(INPUT_STREAM);
    let output = || Type::borrow(OUTPUT_STREAM);
    let bytes = || Type::list(Type::U8);
    vec![
        Operation::new(
            POLL_INTERFACE,
            "poll",
            [Type::list(Type::borrow(POLLABLE))],
            Some(Type::list(Type::U32)),
        ),
        Operation::new(
            STREAMS_INTERFACE,
            "[method]input-stream.read",
            [input(), Type::U64],
            stream_result(Some(bytes())),
        ),
        Operation::new(
            STREAMS_INTERFACE,
            "[method]input-stream.subscribe",
            [input()],
            Some(Type::own(POLLABLE)),
        ),
        Operation::new(
            STREAMS_INTERFACE,
            "[method]output-stream.check-write",
            [output()],
            stream_result(Some(Type::U64)),
        ),
        Operation::new(
            STREAMS_INTERFACE,
            "[method]output-stream.write",
            [output(), bytes()],
            stream_result(None),
        ),
        Operation::new(
            STREAMS_INTERFACE,
            "[method]output-stream.blocking-write-and-flush",
            [output(), bytes()],
            stream_result(None),
        ),
        Operation::new(
            STREAMS_INTERFACE,
            "[method]output-stream.blocking-flush",
            [output()],
            stream_result(None),
        ),
        Operation::new(
            STREAMS_INTERFACE,
            "[method]output-stream.subscribe",
            [output()],
            Some(Type::own(POLLABLE)),
        ),
    ]
}
