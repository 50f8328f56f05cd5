use super::{engine, guest};
use anyhow::Result;
use wasmtime::Store;
use wasmtime_glue::wasi::{self, http};
use wasmtime_glue::wasi::http::{ErrorCode, HeaderError};
use wasmtime_glue::{
    Borrow, ComponentLinker, FuncType, HostResource, LinkPlan, LinkedComponent, LinkerState,
    ModuleRole, Resource, ResourceKind, TrappableError, Type,
};

struct Headers(Vec<(String, Vec<u8>)>);

impl HostResource for Headers {
    const KIND: ResourceKind = http::FIELDS;
}

struct Request {
    headers: Headers,
}

impl HostResource for Request {
    const KIND: ResourceKind = http::OUTGOING_REQUEST;
}

struct Options;

impl HostResource for Options {
    const KIND: ResourceKind = http::REQUEST_OPTIONS;
}

struct FutureResponse;

impl HostResource for FutureResponse {
    const KIND: ResourceKind = http::FUTURE_INCOMING_RESPONSE;
}

const IMPORTS: &str = r#"
    (import "wasi:http/types@0.2.2" "[constructor]fields" (func $fields (result i32)))
    (import "wasi:http/types@0.2.2" "[method]fields.append"
        (func $append (param i32 i32 i32 i32 i32 i32)))
    (import "wasi:http/types@0.2.2" "[method]fields.has"
        (func $has (param i32 i32 i32) (result i32)))
    (import "wasi:http/types@0.2.2" "[resource-drop]fields" (func $drop-fields (param i32)))
    (import "wasi:http/types@0.2.2" "[constructor]outgoing-request"
        (func $request (param i32) (result i32)))
    (import "wasi:http/types@0.2.2" "[resource-drop]outgoing-request"
        (func $drop-request (param i32)))
    (import "wasi:http/outgoing-handler@0.2.2" "handle"
        (func $handle (param i32 i32 i32 i32)))
"#;

const BODY: &str = r#"
    (data (i32.const 100) "content-type")
    (data (i32.const 120) "text/plain")
    (data (i32.const 140) "host")

    (func (export "append-and-check") (result i32)
        (local $h i32)
        call $fields
        local.set $h
        local.get $h
        i32.const 100
        i32.const 12
        i32.const 120
        i32.const 10
        i32.const 200
        call $append
        i32.const 200
        i32.load8_u
        if
            unreachable
        end
        local.get $h
        i32.const 100
        i32.const 12
        call $has
        local.get $h
        call $drop-fields)

    (func (export "append-forbidden") (result i32)
        (local $h i32)
        call $fields
        local.set $h
        local.get $h
        i32.const 140
        i32.const 4
        i32.const 120
        i32.const 10
        i32.const 200
        call $append
        local.get $h
        call $drop-fields
        i32.const 200)

    (func (export "rehome-twice")
        (local $h i32)
        call $fields
        local.tee $h
        call $request
        call $drop-request
        local.get $h
        call $request
        drop)

    (func (export "send") (result i32)
        call $fields
        call $request
        i32.const 0
        i32.const 0
        i32.const 256
        call $handle
        i32.const 256)
"#;

fn linker() -> Result<ComponentLinker<()>> {
    let mut linker = ComponentLinker::new(&engine());
    wasi::add_resources(&mut linker)?;
    let types = |name: &str| wasi::operation(http::TYPES_INTERFACE, name);

    linker.func_wrap(types("[constructor]fields")?, |_, ()| {
        Ok(Resource::new(Headers(Vec::new())))
    })?;
    linker.func_wrap_fallible(
        types("[method]fields.append")?,
        |cx,
         (this, name, value): (Borrow<Headers>, String, Vec<u8>)|
         -> Result<(), TrappableError<HeaderError>> {
            if name.is_empty() {
                return Err(HeaderError::InvalidSyntax.into());
            }
            if name.eq_ignore_ascii_case("host") {
                return Err(HeaderError::Forbidden.into());
            }
            let headers = cx.get_mut(&this).map_err(TrappableError::trap)?;
            headers.0.push((name, value));
            Ok(())
        },
    )?;
    linker.func_wrap(
        types("[method]fields.has")?,
        |cx, (this, name): (Borrow<Headers>, String)| {
            Ok(cx.get(&this)?.0.iter().any(|(n, _)| *n == name))
        },
    )?;
    linker.func_wrap(
        types("[constructor]outgoing-request")?,
        |_, (headers,): (Resource<Headers>,)| {
            Ok(Resource::new(Request {
                headers: headers.into_inner()?,
            }))
        },
    )?;
    linker.func_wrap_fallible(
        wasi::operation(http::OUTGOING_HANDLER_INTERFACE, "handle")?,
        |_,
         (request, _options): (Resource<Request>, Option<Resource<Options>>)|
         -> Result<Resource<FutureResponse>, TrappableError<ErrorCode>> {
            let request = request.into_inner().map_err(TrappableError::trap)?;
            if request.headers.0.is_empty() {
                return Err(ErrorCode::DestinationNotFound.into());
            }
            Ok(Resource::new(FutureResponse))
        },
    )?;
    Ok(linker)
}

fn instantiate() -> Result<(Store<LinkerState<()>>, LinkedComponent)> {
    let linker = linker()?;
    let mut plan = LinkPlan::new();
    plan.module("main", ModuleRole::Primary, guest(IMPORTS, BODY))
        .export("append-and-check", FuncType::new([], Some(Type::Bool)))
        .export(
            "append-forbidden",
            FuncType::new([], Some(Type::result(None, Some(HeaderError::ty())))),
        )
        .export("rehome-twice", FuncType::new([], None))
        .export(
            "send",
            FuncType::new(
                [],
                Some(Type::result(
                    Some(Type::own(http::FUTURE_INCOMING_RESPONSE)),
                    Some(ErrorCode::ty()),
                )),
            ),
        );
    let mut store = Store::new(linker.engine(), LinkerState::new(()));
    let component = linker.instantiate(&mut store, plan)?;
    Ok((store, component))
}

fn captured(store: &Store<LinkerState<()>>, kind: wasmtime_glue::ResourceKind) -> usize {
    store
        .data()
        .resources()
        .captures(kind)
        .map_or(0, |c| c.len())
}

#[test]
fn headers_are_appended_through_borrows() -> Result<()> {
    let (mut store, component) = instantiate()?;
    let found: bool = component.call_typed(&mut store, "append-and-check", ())?;
    assert!(found);
    assert_eq!(captured(&store, http::FIELDS), 0);
    let scope = store.data().resources().borrow_scope();
    assert_eq!(scope.depth(), 0);
    assert_eq!(scope.live_borrows(), 0);
    Ok(())
}

#[test]
fn header_errors_reach_the_guest() -> Result<()> {
    let (mut store, component) = instantiate()?;
    let ret: Result<(), HeaderError> = component.call_typed(&mut store, "append-forbidden", ())?;
    assert!(matches!(ret, Err(HeaderError::Forbidden)));
    assert_eq!(captured(&store, http::FIELDS), 0);
    assert_eq!(store.data().resources().borrow_scope().live_borrows(), 0);
    Ok(())
}

#[test]
fn owned_handles_move_once() -> Result<()> {
    let (mut store, component) = instantiate()?;
    let err = component
        .call(&mut store, "rehome-twice", vec![])
        .unwrap_err();
    assert!(format!("{err:?}").contains("handle index 1"), "{err:?}");
    assert_eq!(captured(&store, http::OUTGOING_REQUEST), 0);
    assert_eq!(store.data().resources().borrow_scope().depth(), 0);
    Ok(())
}

#[test]
fn error_codes_are_written_to_guest_memory() -> Result<()> {
    let (mut store, component) = instantiate()?;
    let ret: Result<Resource<FutureResponse>, ErrorCode> =
        component.call_typed(&mut store, "send", ())?;
    assert!(matches!(ret, Err(ErrorCode::DestinationNotFound)));

    let memory = store.data().memory().unwrap();
    let bytes = &memory.data(&store)[256..272];
    assert_eq!(bytes[0], 1, "err");
    assert_eq!(bytes[8], 2, "destination-not-found");
    assert!(bytes[9..].iter().all(|b| *b == 0));
    assert_eq!(captured(&store, http::OUTGOING_REQUEST), 0);
    assert_eq!(captured(&store, http::FIELDS), 0);
    Ok(())
}
