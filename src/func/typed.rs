//! Statically typed host functions.
//!
//! [`ComponentValue`] maps Rust types onto [`Val`]s of a given [`Type`]. The
//! mapping is checked once, when a host function is registered, so that a
//! mismatch between an implementation and its operation descriptor is
//! reported before any guest runs.

use super::{HostContext, HostFunc, Operation};
use crate::error::TrappableError;
use crate::resources::{Borrow, HostResource, Resource, ResourceAny, ResourceKind};
use crate::types::Type;
use crate::values::Val;
use anyhow::{Context as _, Result, anyhow, bail};
use std::error::Error;

/// A Rust type which corresponds to a component value type.
pub trait ComponentValue: Sized {
    /// Checks that `ty` is the type this Rust type maps to.
    fn typecheck(ty: &Type) -> Result<()>;

    /// Converts into the dynamic representation.
    fn into_val(self) -> Val;

    /// Converts from the dynamic representation.
    fn from_val(val: Val) -> Result<Self>;
}

/// The optional payload of a `result` or variant case. `()` stands for no
/// payload.
pub trait Payload: Sized {
    fn typecheck_payload(ty: Option<&Type>) -> Result<()>;
    fn into_payload(self) -> Option<Val>;
    fn from_payload(val: Option<Val>) -> Result<Self>;
}

impl Payload for () {
    fn typecheck_payload(ty: Option<&Type>) -> Result<()> {
        match ty {
            None => Ok(()),
            Some(ty) => bail!("expected no payload, found `{}`", ty.desc()),
        }
    }

    fn into_payload(self) -> Option<Val> {
        None
    }

    fn from_payload(val: Option<Val>) -> Result<()> {
        match val {
            None => Ok(()),
            Some(val) => bail!("expected no payload, found `{}`", val.desc()),
        }
    }
}

impl<T: ComponentValue> Payload for T {
    fn typecheck_payload(ty: Option<&Type>) -> Result<()> {
        match ty {
            Some(ty) => T::typecheck(ty),
            None => bail!("expected a payload, found none"),
        }
    }

    fn into_payload(self) -> Option<Val> {
        Some(self.into_val())
    }

    fn from_payload(val: Option<Val>) -> Result<T> {
        match val {
            Some(val) => T::from_val(val),
            None => bail!("expected a payload, found none"),
        }
    }
}

fn mismatch<T>(expected: &str, found: &str) -> Result<T> {
    bail!("type mismatch: expected {expected}, found {found}")
}

macro_rules! primitives {
    ($($rust:ty => $variant:ident, $desc:tt;)*) => {$(
        impl ComponentValue for $rust {
            fn typecheck(ty: &Type) -> Result<()> {
                match ty {
                    Type::$variant => Ok(()),
                    other => mismatch($desc, other.desc()),
                }
            }

            fn into_val(self) -> Val {
                Val::$variant(self)
            }

            fn from_val(val: Val) -> Result<Self> {
                match val {
                    Val::$variant(v) => Ok(v),
                    other => mismatch($desc, other.desc()),
                }
            }
        }
    )*};
}

primitives! {
    bool => Bool, "bool";
    i8 => S8, "s8";
    u8 => U8, "u8";
    i16 => S16, "s16";
    u16 => U16, "u16";
    i32 => S32, "s32";
    u32 => U32, "u32";
    i64 => S64, "s64";
    u64 => U64, "u64";
    f32 => Float32, "f32";
    f64 => Float64, "f64";
    char => Char, "char";
    String => String, "string";
}

impl ComponentValue for Val {
    fn typecheck(_: &Type) -> Result<()> {
        Ok(())
    }

    fn into_val(self) -> Val {
        self
    }

    fn from_val(val: Val) -> Result<Val> {
        Ok(val)
    }
}

impl<T: ComponentValue> ComponentValue for Vec<T> {
    fn typecheck(ty: &Type) -> Result<()> {
        match ty {
            Type::List(list) => T::typecheck(&list.element),
            other => mismatch("list", other.desc()),
        }
    }

    fn into_val(self) -> Val {
        Val::List(self.into_iter().map(T::into_val).collect())
    }

    fn from_val(val: Val) -> Result<Vec<T>> {
        match val {
            Val::List(items) => items.into_iter().map(T::from_val).collect(),
            other => mismatch("list", other.desc()),
        }
    }
}

impl<T: ComponentValue> ComponentValue for Option<T> {
    fn typecheck(ty: &Type) -> Result<()> {
        match ty {
            Type::Option(option) => T::typecheck(&option.ty),
            other => mismatch("option", other.desc()),
        }
    }

    fn into_val(self) -> Val {
        Val::Option(self.map(|v| Box::new(v.into_val())))
    }

    fn from_val(val: Val) -> Result<Option<T>> {
        match val {
            Val::Option(v) => v.map(|v| T::from_val(*v)).transpose(),
            other => mismatch("option", other.desc()),
        }
    }
}

impl<T: Payload, E: Payload> ComponentValue for Result<T, E> {
    fn typecheck(ty: &Type) -> Result<()> {
        match ty {
            Type::Result(result) => {
                T::typecheck_payload(result.ok.as_ref()).context("type mismatch for ok type")?;
                E::typecheck_payload(result.err.as_ref()).context("type mismatch for err type")
            }
            other => mismatch("result", other.desc()),
        }
    }

    fn into_val(self) -> Val {
        Val::Result(match self {
            Ok(v) => Ok(v.into_payload().map(Box::new)),
            Err(e) => Err(e.into_payload().map(Box::new)),
        })
    }

    fn from_val(val: Val) -> Result<Result<T, E>> {
        match val {
            Val::Result(Ok(v)) => Ok(Ok(T::from_payload(v.map(|v| *v))?)),
            Val::Result(Err(e)) => Ok(Err(E::from_payload(e.map(|e| *e))?)),
            other => mismatch("result", other.desc()),
        }
    }
}

fn check_kind(expected: ResourceKind, found: ResourceKind) -> Result<()> {
    if expected != found {
        bail!(
            "resource kind mismatch: expected {}, found {}",
            expected.index(),
            found.index()
        );
    }
    Ok(())
}

impl<T: HostResource> ComponentValue for Resource<T> {
    fn typecheck(ty: &Type) -> Result<()> {
        match ty {
            Type::Own(kind) => check_kind(T::KIND, *kind),
            other => mismatch("own", other.desc()),
        }
    }

    fn into_val(self) -> Val {
        Val::Resource(self.into_any())
    }

    fn from_val(val: Val) -> Result<Resource<T>> {
        match val {
            Val::Resource(any) => Ok(Resource::from_any(any)?),
            other => mismatch("own", other.desc()),
        }
    }
}

impl<T: HostResource> ComponentValue for Borrow<T> {
    fn typecheck(ty: &Type) -> Result<()> {
        match ty {
            Type::Borrow(kind) => check_kind(T::KIND, *kind),
            other => mismatch("borrow", other.desc()),
        }
    }

    fn into_val(self) -> Val {
        Val::Resource(ResourceAny::Borrow(self.as_any().clone()))
    }

    fn from_val(val: Val) -> Result<Borrow<T>> {
        match val {
            Val::Resource(ResourceAny::Borrow(b)) => Ok(Borrow::from_any(b)),
            other => mismatch("borrow", other.desc()),
        }
    }
}

macro_rules! tuples {
    ($($n:tt => ($($t:ident)*);)*) => {$(
        #[allow(non_snake_case, reason = "bindings are named after their type parameter")]
        impl<$($t: ComponentValue,)*> ComponentValue for ($($t,)*) {
            fn typecheck(ty: &Type) -> Result<()> {
                match ty {
                    Type::Tuple(tuple) => {
                        if tuple.types.len() != $n {
                            bail!("expected {}-tuple, found {}-tuple", $n, tuple.types.len());
                        }
                        let mut types = tuple.types.iter();
                        $(
                            $t::typecheck(types.next().ok_or_else(|| anyhow!("missing tuple element"))?)?;
                        )*
                        Ok(())
                    }
                    other => mismatch("tuple", other.desc()),
                }
            }

            fn into_val(self) -> Val {
                let ($($t,)*) = self;
                Val::Tuple(vec![$($t.into_val(),)*])
            }

            fn from_val(val: Val) -> Result<Self> {
                match val {
                    Val::Tuple(items) => {
                        if items.len() != $n {
                            bail!("expected {}-tuple, found {}-tuple", $n, items.len());
                        }
                        let mut items = items.into_iter();
                        Ok(($(
                            $t::from_val(items.next().ok_or_else(|| anyhow!("missing tuple element"))?)?,
                        )*))
                    }
                    other => mismatch("tuple", other.desc()),
                }
            }
        }
    )*};
}

tuples! {
    1 => (A);
    2 => (A B);
    3 => (A B C);
    4 => (A B C D);
}

/// The parameter list of a statically typed host function.
pub trait ComponentParams: Sized {
    fn typecheck_params(params: &[Type]) -> Result<()>;
    fn from_vals(vals: Vec<Val>) -> Result<Self>;
    fn into_vals(self) -> Vec<Val>;
}

macro_rules! params {
    ($($n:tt => ($($t:ident)*);)*) => {$(
        #[allow(
            non_snake_case,
            unused_mut,
            unused_variables,
            reason = "shared by the empty parameter list"
        )]
        impl<$($t: ComponentValue,)*> ComponentParams for ($($t,)*) {
            fn typecheck_params(params: &[Type]) -> Result<()> {
                if params.len() != $n {
                    bail!("expected {} parameters, found {}", $n, params.len());
                }
                let mut params = params.iter().enumerate();
                $(
                    let (i, ty) = params.next().ok_or_else(|| anyhow!("missing parameter"))?;
                    $t::typecheck(ty).with_context(|| format!("type mismatch with parameter {i}"))?;
                )*
                Ok(())
            }

            fn from_vals(vals: Vec<Val>) -> Result<Self> {
                let mut vals = vals.into_iter();
                Ok(($(
                    $t::from_val(vals.next().ok_or_else(|| anyhow!("missing parameter"))?)?,
                )*))
            }

            fn into_vals(self) -> Vec<Val> {
                let ($($t,)*) = self;
                vec![$($t.into_val(),)*]
            }
        }
    )*};
}

params! {
    0 => ();
    1 => (A);
    2 => (A B);
    3 => (A B C);
    4 => (A B C D);
    5 => (A B C D E);
    6 => (A B C D E F);
}

/// Checks that `ty` is a record with exactly the fields `names`, in order,
/// and returns their types.
pub fn typecheck_record<'a, const N: usize>(
    ty: &'a Type,
    names: [&str; N],
) -> Result<[&'a Type; N]> {
    let Type::Record(record) = ty else {
        return mismatch("record", ty.desc());
    };
    if record.fields.len() != N {
        bail!("expected {N} fields, found {}", record.fields.len());
    }
    for (field, name) in record.fields.iter().zip(names) {
        if field.name != name {
            bail!("expected field `{name}`, found `{}`", field.name);
        }
    }
    Ok(std::array::from_fn(|i| &record.fields[i].ty))
}

/// Checks that `ty` is a variant with exactly the cases `names`, in order,
/// and returns their payload types.
pub fn typecheck_variant<'a, const N: usize>(
    ty: &'a Type,
    names: [&str; N],
) -> Result<[Option<&'a Type>; N]> {
    let Type::Variant(variant) = ty else {
        return mismatch("variant", ty.desc());
    };
    if variant.cases.len() != N {
        bail!("expected {N} cases, found {}", variant.cases.len());
    }
    for (case, name) in variant.cases.keys().zip(names) {
        if case != name {
            bail!("expected case `{name}`, found `{case}`");
        }
    }
    let payloads = variant.cases.values().collect::<Vec<_>>();
    Ok(std::array::from_fn(|i| payloads[i].as_ref()))
}

/// Checks that `ty` is an enum with exactly the cases `names`, in order.
pub fn typecheck_enum(ty: &Type, names: &[&str]) -> Result<()> {
    let Type::Enum(enum_) = ty else {
        return mismatch("enum", ty.desc());
    };
    if !enum_.names.iter().eq(names.iter().copied()) {
        bail!("expected enum cases {names:?}");
    }
    Ok(())
}

/// Checks that `ty` is a flags type with exactly the flags `names`, in order.
pub fn typecheck_flags(ty: &Type, names: &[&str]) -> Result<()> {
    let Type::Flags(flags) = ty else {
        return mismatch("flags", ty.desc());
    };
    if !flags.names.iter().eq(names.iter().copied()) {
        bail!("expected flags {names:?}");
    }
    Ok(())
}

/// Takes apart a record value with the fields `names`.
pub fn take_record<const N: usize>(val: Val, names: [&str; N]) -> Result<[Val; N]> {
    let Val::Record(fields) = val else {
        return mismatch("record", val.desc());
    };
    if fields.len() != N {
        bail!("expected {N} fields, found {}", fields.len());
    }
    let mut vals = Vec::with_capacity(N);
    for ((found, val), name) in fields.into_iter().zip(names) {
        if found != name {
            bail!("expected field `{name}`, found `{found}`");
        }
        vals.push(val);
    }
    vals.try_into().map_err(|_| anyhow!("expected {N} fields"))
}

/// Takes apart a variant value into its case name and payload.
pub fn take_variant(val: Val) -> Result<(String, Option<Val>)> {
    match val {
        Val::Variant(case, payload) => Ok((case, payload.map(|p| *p))),
        other => mismatch("variant", other.desc()),
    }
}

/// The case name of an enum value.
pub fn take_enum(val: Val) -> Result<String> {
    match val {
        Val::Enum(case) => Ok(case),
        other => mismatch("enum", other.desc()),
    }
}

/// The set flags of a flags value.
pub fn take_flags(val: Val) -> Result<Vec<String>> {
    match val {
        Val::Flags(names) => Ok(names),
        other => mismatch("flags", other.desc()),
    }
}

impl<T> HostFunc<T> {
    /// Creates a host function from a statically typed closure.
    ///
    /// Fails if `P` and `R` do not match the parameters and result of `op`.
    /// Returning `Err` from `func` traps.
    pub fn wrap<P, R, F>(op: Operation, func: F) -> Result<HostFunc<T>>
    where
        P: ComponentParams,
        R: Payload,
        F: Fn(&mut HostContext<'_, T>, P) -> Result<R> + Send + Sync + 'static,
    {
        P::typecheck_params(&op.ty.params).with_context(|| format!("cannot wrap `{op}`"))?;
        R::typecheck_payload(op.ty.result.as_ref())
            .with_context(|| format!("type mismatch with result of `{op}`"))?;
        Ok(HostFunc::new(op, move |cx, params| {
            let params = P::from_vals(params)?;
            Ok(func(cx, params)?.into_payload())
        }))
    }

    /// Creates a host function whose result is `result<R, E>` from a closure
    /// that can fail with a capability error.
    ///
    /// A capability error is lowered into the guest as the `err` case. Any
    /// other error traps.
    pub fn wrap_fallible<P, R, E, F>(op: Operation, func: F) -> Result<HostFunc<T>>
    where
        P: ComponentParams,
        R: Payload,
        E: Payload + Error + Send + Sync + 'static,
        F: Fn(&mut HostContext<'_, T>, P) -> Result<R, TrappableError<E>> + Send + Sync + 'static,
    {
        P::typecheck_params(&op.ty.params).with_context(|| format!("cannot wrap `{op}`"))?;
        match &op.ty.result {
            Some(ty) => <Result<R, E>>::typecheck(ty)
                .with_context(|| format!("type mismatch with result of `{op}`"))?,
            None => bail!("`{op}` has no result to carry its error"),
        }
        Ok(HostFunc::new(op, move |cx, params| {
            let params = P::from_vals(params)?;
            let result: Result<R, E> = match func(cx, params) {
                Ok(value) => Ok(value),
                Err(e) => Err(e.downcast()?),
            };
            Ok(Some(result.into_val()))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Datetime {
        seconds: u64,
        nanoseconds: u32,
    }

    impl ComponentValue for Datetime {
        fn typecheck(ty: &Type) -> Result<()> {
            let [seconds, nanoseconds] = typecheck_record(ty, ["seconds", "nanoseconds"])?;
            u64::typecheck(seconds)?;
            u32::typecheck(nanoseconds)
        }

        fn into_val(self) -> Val {
            Val::Record(vec![
                ("seconds".into(), Val::U64(self.seconds)),
                ("nanoseconds".into(), Val::U32(self.nanoseconds)),
            ])
        }

        fn from_val(val: Val) -> Result<Datetime> {
            let [seconds, nanoseconds] = take_record(val, ["seconds", "nanoseconds"])?;
            Ok(Datetime {
                seconds: u64::from_val(seconds)?,
                nanoseconds: u32::from_val(nanoseconds)?,
            })
        }
    }

    fn datetime() -> Type {
        Type::record([("seconds", Type::U64), ("nanoseconds", Type::U32)])
    }

    #[test]
    fn records_typecheck_by_name_and_order() {
        assert!(Datetime::typecheck(&datetime()).is_ok());
        let swapped = Type::record([("nanoseconds", Type::U32), ("seconds", Type::U64)]);
        let err = Datetime::typecheck(&swapped).unwrap_err();
        assert_eq!(err.to_string(), "expected field `seconds`, found `nanoseconds`");
        let wrong = Type::record([("seconds", Type::U32), ("nanoseconds", Type::U32)]);
        let err = Datetime::typecheck(&wrong).unwrap_err();
        assert_eq!(err.to_string(), "type mismatch: expected u64, found u32");
    }

    #[test]
    fn records_convert_both_ways() {
        let now = Datetime {
            seconds: 1_700_000_000,
            nanoseconds: 5,
        };
        assert_eq!(Datetime::from_val(now.into_val()).unwrap(), now);
    }

    #[test]
    fn results_check_both_payloads() {
        let ty = Type::result(Some(Type::list(Type::U8)), None);
        assert!(<Result<Vec<u8>, ()>>::typecheck(&ty).is_ok());
        assert!(<Result<(), ()>>::typecheck(&ty).is_err());
        assert!(<Result<Vec<u8>, u32>>::typecheck(&ty).is_err());
        let val = <Result<Vec<u8>, ()>>::into_val(Err(()));
        assert_eq!(val, Val::Result(Err(None)));
    }

    struct Stream;

    impl HostResource for Stream {
        const KIND: ResourceKind = ResourceKind::new(2);
    }

    struct Pollable;

    impl HostResource for Pollable {
        const KIND: ResourceKind = ResourceKind::new(1);
    }

    #[test]
    fn params_are_checked_positionally() {
        let params = [Type::borrow(Stream::KIND), Type::U64];
        assert!(<(Borrow<Stream>, u64)>::typecheck_params(&params).is_ok());
        let err = <(Borrow<Stream>, u32)>::typecheck_params(&params).unwrap_err();
        assert_eq!(err.to_string(), "type mismatch with parameter 1");
        assert!(<(Borrow<Stream>,)>::typecheck_params(&params).is_err());
        assert!(<()>::typecheck_params(&[]).is_ok());
    }

    #[test]
    fn resources_are_checked_by_kind() {
        assert!(<Resource<Stream>>::typecheck(&Type::own(Stream::KIND)).is_ok());
        let err = <Resource<Pollable>>::typecheck(&Type::own(Stream::KIND)).unwrap_err();
        assert_eq!(err.to_string(), "resource kind mismatch: expected 1, found 2");
        assert!(<Borrow<Pollable>>::typecheck(&Type::borrow(Stream::KIND)).is_err());
        assert!(<Borrow<Stream>>::typecheck(&Type::own(Stream::KIND)).is_err());

        let params = [Type::borrow(Stream::KIND)];
        let err = <(Borrow<Pollable>,)>::typecheck_params(&params).unwrap_err();
        assert_eq!(err.to_string(), "type mismatch with parameter 0");
    }

    #[test]
    fn wrapping_rejects_mismatched_signatures() {
        let op = Operation::new("wasi:clocks/wall-clock@0.2.2", "now", [], Some(datetime()));
        let ok = HostFunc::<()>::wrap(op.clone(), |_, ()| {
            Ok(Datetime {
                seconds: 0,
                nanoseconds: 0,
            })
        });
        assert!(ok.is_ok());
        let err = HostFunc::<()>::wrap(op, |_, ()| Ok(0u64)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "type mismatch with result of `wasi:clocks/wall-clock@0.2.2#now`"
        );
    }

    #[test]
    fn options_and_tuples() {
        let ty = Type::option(Type::tuple([Type::String, Type::U32]));
        assert!(<Option<(String, u32)>>::typecheck(&ty).is_ok());
        let val = Some(("a".to_string(), 1u32)).into_val();
        assert_eq!(
            <Option<(String, u32)>>::from_val(val).unwrap(),
            Some(("a".to_string(), 1))
        );
        assert!(<Option<(String,)>>::typecheck(&ty).is_err());
    }
}
