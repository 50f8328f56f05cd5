//! The byte-layout codec.
//!
//! [`Val`] is the dynamic representation of every value that can cross the
//! boundary. It is lifted from / lowered to either a sequence of flat core
//! values ([`ValRaw`]) or a region of guest linear memory, driven by a
//! [`Type`] descriptor. Lowering consumes the value since owned resources
//! move into the guest's handle tables.

use crate::error::DecodeError;
use crate::memory::{LiftContext, LowerContext};
use crate::resources::ResourceAny;
use crate::types::{
    CanonicalAbiInfo, DiscriminantSize, FlagsSize, FlagsType, Type, VariantInfo,
};
use anyhow::{Result, anyhow, bail};
use std::slice::Iter;

/// One untyped flat core value.
///
/// Every core type is stored as raw bits in a `u64`: 32-bit values are zero
/// extended and floats are stored as their bit patterns. This is what makes
/// joined variant payload slots free: an `f32` payload in an `i32` slot or an
/// `i32` payload in an `i64` slot is the same bits either way.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ValRaw(u64);

impl ValRaw {
    pub fn i32(i: i32) -> ValRaw {
        ValRaw(u64::from(i as u32))
    }

    pub fn u32(i: u32) -> ValRaw {
        ValRaw(u64::from(i))
    }

    pub fn i64(i: i64) -> ValRaw {
        ValRaw(i as u64)
    }

    pub fn u64(i: u64) -> ValRaw {
        ValRaw(i)
    }

    pub fn f32(bits: u32) -> ValRaw {
        ValRaw(u64::from(bits))
    }

    pub fn f64(bits: u64) -> ValRaw {
        ValRaw(bits)
    }

    pub fn get_i32(self) -> i32 {
        self.0 as u32 as i32
    }

    pub fn get_u32(self) -> u32 {
        self.0 as u32
    }

    pub fn get_i64(self) -> i64 {
        self.0 as i64
    }

    pub fn get_u64(self) -> u64 {
        self.0
    }

    pub fn get_f32(self) -> u32 {
        self.0 as u32
    }

    pub fn get_f64(self) -> u64 {
        self.0
    }
}

/// A dynamically typed value.
///
/// `Val` only carries enough information to be checked against a [`Type`]:
/// a `Val::Enum` names its case but not the enum it belongs to, for example.
#[derive(Debug, PartialEq)]
#[allow(missing_docs, reason = "variants are named after their shape")]
pub enum Val {
    Bool(bool),
    S8(i8),
    U8(u8),
    S16(i16),
    U16(u16),
    S32(i32),
    U32(u32),
    S64(i64),
    U64(u64),
    Float32(f32),
    Float64(f64),
    Char(char),
    String(String),
    List(Vec<Val>),
    Record(Vec<(String, Val)>),
    Tuple(Vec<Val>),
    Variant(String, Option<Box<Val>>),
    Enum(String),
    Option(Option<Box<Val>>),
    Result(Result<Option<Box<Val>>, Option<Box<Val>>>),
    Flags(Vec<String>),
    Resource(ResourceAny),
}

fn next<'a>(src: &mut Iter<'a, ValRaw>, ty: &Type) -> Result<ValRaw> {
    src.next()
        .copied()
        .ok_or_else(|| anyhow!(DecodeError::Truncated(ty.desc())))
}

impl Val {
    /// Lifts a value of type `ty` from flat core values.
    pub fn lift(cx: &mut LiftContext<'_>, ty: &Type, src: &mut Iter<'_, ValRaw>) -> Result<Val> {
        Ok(match ty {
            Type::Bool => Val::Bool(next(src, ty)?.get_i32() != 0),
            Type::S8 => Val::S8(next(src, ty)?.get_i32() as i8),
            Type::U8 => Val::U8(next(src, ty)?.get_u32() as u8),
            Type::S16 => Val::S16(next(src, ty)?.get_i32() as i16),
            Type::U16 => Val::U16(next(src, ty)?.get_u32() as u16),
            Type::S32 => Val::S32(next(src, ty)?.get_i32()),
            Type::U32 => Val::U32(next(src, ty)?.get_u32()),
            Type::S64 => Val::S64(next(src, ty)?.get_i64()),
            Type::U64 => Val::U64(next(src, ty)?.get_u64()),
            Type::Float32 => Val::Float32(f32::from_bits(next(src, ty)?.get_f32())),
            Type::Float64 => Val::Float64(f64::from_bits(next(src, ty)?.get_f64())),
            Type::Char => Val::Char(lift_char(next(src, ty)?.get_u32())?),
            Type::String => {
                let ptr = next(src, ty)?.get_u32();
                let len = next(src, ty)?.get_u32();
                Val::String(load_string(cx, ptr, len)?)
            }
            Type::List(list) => {
                let ptr = next(src, ty)?.get_u32();
                let len = next(src, ty)?.get_u32();
                load_list(cx, &list.element, ptr, len)?
            }
            Type::Record(record) => Val::Record(
                record
                    .fields
                    .iter()
                    .map(|field| Ok((field.name.clone(), Val::lift(cx, &field.ty, src)?)))
                    .collect::<Result<_>>()?,
            ),
            Type::Tuple(tuple) => Val::Tuple(
                tuple
                    .types
                    .iter()
                    .map(|ty| Val::lift(cx, ty, src))
                    .collect::<Result<_>>()?,
            ),
            Type::Variant(variant) => {
                let cases = variant.cases.values().map(|c| c.as_ref());
                let (index, payload) = lift_variant(cx, ty, cases, src)?;
                let (name, _) = variant.cases.get_index(index).ok_or_else(|| {
                    discriminant_out_of_range(ty, index as u32, variant.cases.len())
                })?;
                Val::Variant(name.clone(), payload)
            }
            Type::Enum(enum_) => {
                let (index, _) = lift_variant(cx, ty, enum_.names.iter().map(|_| None), src)?;
                Val::Enum(enum_.names[index].clone())
            }
            Type::Option(option) => {
                let (index, payload) = lift_variant(cx, ty, [None, Some(&option.ty)], src)?;
                Val::Option(if index == 0 { None } else { payload })
            }
            Type::Result(result) => {
                let cases = [result.ok.as_ref(), result.err.as_ref()];
                let (index, payload) = lift_variant(cx, ty, cases, src)?;
                Val::Result(if index == 0 { Ok(payload) } else { Err(payload) })
            }
            Type::Flags(flags) => {
                let mut names = Vec::new();
                for word in 0..ty.flat_len() {
                    push_flags(flags, &mut names, word as u32 * 32, next(src, ty)?.get_u32());
                }
                Val::Flags(names)
            }
            Type::Own(kind) => {
                let handle = next(src, ty)?.get_u32();
                Val::Resource(cx.resources().lift_own(*kind, handle)?)
            }
            Type::Borrow(kind) => {
                let handle = next(src, ty)?.get_u32();
                Val::Resource(ResourceAny::Borrow(
                    cx.resources().lift_borrow(*kind, handle)?,
                ))
            }
        })
    }

    /// Loads a value of type `ty` from linear memory at `offset`.
    pub fn load(cx: &mut LiftContext<'_>, ty: &Type, offset: u32) -> Result<Val> {
        Ok(match ty {
            Type::Bool => Val::Bool(cx.read::<1>(offset)?[0] != 0),
            Type::S8 => Val::S8(i8::from_le_bytes(cx.read(offset)?)),
            Type::U8 => Val::U8(u8::from_le_bytes(cx.read(offset)?)),
            Type::S16 => Val::S16(i16::from_le_bytes(cx.read(offset)?)),
            Type::U16 => Val::U16(u16::from_le_bytes(cx.read(offset)?)),
            Type::S32 => Val::S32(i32::from_le_bytes(cx.read(offset)?)),
            Type::U32 => Val::U32(u32::from_le_bytes(cx.read(offset)?)),
            Type::S64 => Val::S64(i64::from_le_bytes(cx.read(offset)?)),
            Type::U64 => Val::U64(u64::from_le_bytes(cx.read(offset)?)),
            Type::Float32 => Val::Float32(f32::from_le_bytes(cx.read(offset)?)),
            Type::Float64 => Val::Float64(f64::from_le_bytes(cx.read(offset)?)),
            Type::Char => Val::Char(lift_char(u32::from_le_bytes(cx.read(offset)?))?),
            Type::String => {
                let (ptr, len) = load_pointer_pair(cx, offset)?;
                Val::String(load_string(cx, ptr, len)?)
            }
            Type::List(list) => {
                let (ptr, len) = load_pointer_pair(cx, offset)?;
                load_list(cx, &list.element, ptr, len)?
            }
            Type::Record(record) => {
                let abis = record.fields.iter().map(|f| f.ty.abi()).collect::<Vec<_>>();
                let offsets = CanonicalAbiInfo::record_offsets(&abis);
                Val::Record(
                    record
                        .fields
                        .iter()
                        .zip(offsets)
                        .map(|(field, field_offset)| {
                            Ok((
                                field.name.clone(),
                                Val::load(cx, &field.ty, offset + field_offset)?,
                            ))
                        })
                        .collect::<Result<_>>()?,
                )
            }
            Type::Tuple(tuple) => {
                let abis = tuple.types.iter().map(|t| t.abi()).collect::<Vec<_>>();
                let offsets = CanonicalAbiInfo::record_offsets(&abis);
                Val::Tuple(
                    tuple
                        .types
                        .iter()
                        .zip(offsets)
                        .map(|(ty, field_offset)| Val::load(cx, ty, offset + field_offset))
                        .collect::<Result<_>>()?,
                )
            }
            Type::Variant(variant) => {
                let cases = variant.cases.values().map(|c| c.as_ref());
                let (index, payload) = load_variant(cx, ty, &variant.info, cases, offset)?;
                let (name, _) = variant.cases.get_index(index).ok_or_else(|| {
                    discriminant_out_of_range(ty, index as u32, variant.cases.len())
                })?;
                Val::Variant(name.clone(), payload)
            }
            Type::Enum(enum_) => {
                let cases = enum_.names.iter().map(|_| None);
                let (index, _) = load_variant(cx, ty, &enum_.info, cases, offset)?;
                Val::Enum(enum_.names[index].clone())
            }
            Type::Option(option) => {
                let cases = [None, Some(&option.ty)];
                let (index, payload) = load_variant(cx, ty, &option.info, cases, offset)?;
                Val::Option(if index == 0 { None } else { payload })
            }
            Type::Result(result) => {
                let cases = [result.ok.as_ref(), result.err.as_ref()];
                let (index, payload) = load_variant(cx, ty, &result.info, cases, offset)?;
                Val::Result(if index == 0 { Ok(payload) } else { Err(payload) })
            }
            Type::Flags(flags) => {
                let mut names = Vec::new();
                match flags.size() {
                    FlagsSize::Size0 => {}
                    FlagsSize::Size1 => {
                        let bits = u8::from_le_bytes(cx.read(offset)?);
                        push_flags(flags, &mut names, 0, u32::from(bits));
                    }
                    FlagsSize::Size2 => {
                        let bits = u16::from_le_bytes(cx.read(offset)?);
                        push_flags(flags, &mut names, 0, u32::from(bits));
                    }
                    FlagsSize::Size4Plus(n) => {
                        for word in 0..u32::from(n) {
                            let bits = u32::from_le_bytes(cx.read(offset + word * 4)?);
                            push_flags(flags, &mut names, word * 32, bits);
                        }
                    }
                }
                Val::Flags(names)
            }
            Type::Own(kind) => {
                let handle = u32::from_le_bytes(cx.read(offset)?);
                Val::Resource(cx.resources().lift_own(*kind, handle)?)
            }
            Type::Borrow(kind) => {
                let handle = u32::from_le_bytes(cx.read(offset)?);
                Val::Resource(ResourceAny::Borrow(
                    cx.resources().lift_borrow(*kind, handle)?,
                ))
            }
        })
    }

    /// Lowers this value as type `ty` into flat core values appended to
    /// `dst`.
    pub fn lower(self, cx: &mut LowerContext<'_>, ty: &Type, dst: &mut Vec<ValRaw>) -> Result<()> {
        match (ty, self) {
            (Type::Bool, Val::Bool(b)) => dst.push(ValRaw::u32(u32::from(b))),
            (Type::S8, Val::S8(i)) => dst.push(ValRaw::i32(i32::from(i))),
            (Type::U8, Val::U8(i)) => dst.push(ValRaw::u32(u32::from(i))),
            (Type::S16, Val::S16(i)) => dst.push(ValRaw::i32(i32::from(i))),
            (Type::U16, Val::U16(i)) => dst.push(ValRaw::u32(u32::from(i))),
            (Type::S32, Val::S32(i)) => dst.push(ValRaw::i32(i)),
            (Type::U32, Val::U32(i)) => dst.push(ValRaw::u32(i)),
            (Type::S64, Val::S64(i)) => dst.push(ValRaw::i64(i)),
            (Type::U64, Val::U64(i)) => dst.push(ValRaw::u64(i)),
            (Type::Float32, Val::Float32(f)) => dst.push(ValRaw::f32(f.to_bits())),
            (Type::Float64, Val::Float64(f)) => dst.push(ValRaw::f64(f.to_bits())),
            (Type::Char, Val::Char(c)) => dst.push(ValRaw::u32(u32::from(c))),
            (Type::String, Val::String(s)) => {
                let (ptr, len) = lower_string(cx, &s)?;
                dst.extend([ValRaw::u32(ptr), ValRaw::u32(len)]);
            }
            (Type::List(list), Val::List(items)) => {
                let (ptr, len) = lower_list(cx, &list.element, items)?;
                dst.extend([ValRaw::u32(ptr), ValRaw::u32(len)]);
            }
            (Type::Record(record), Val::Record(values)) => {
                check_record_arity(record.fields.len(), values.len())?;
                for (field, (name, value)) in record.fields.iter().zip(values) {
                    check_field_name(&field.name, &name)?;
                    value.lower(cx, &field.ty, dst)?;
                }
            }
            (Type::Tuple(tuple), Val::Tuple(values)) => {
                check_record_arity(tuple.types.len(), values.len())?;
                for (ty, value) in tuple.types.iter().zip(values) {
                    value.lower(cx, ty, dst)?;
                }
            }
            (Type::Variant(variant), Val::Variant(name, payload)) => {
                let index = case_index(ty, variant.cases.get_index_of(&name), name)?;
                let case_ty = variant.cases[index].as_ref();
                lower_variant(cx, ty, index, case_ty, payload, dst)?;
            }
            (Type::Enum(enum_), Val::Enum(name)) => {
                let index = case_index(ty, enum_.names.get_index_of(&name), name)?;
                lower_variant(cx, ty, index, None, None, dst)?;
            }
            (Type::Option(option), Val::Option(value)) => match value {
                None => lower_variant(cx, ty, 0, None, None, dst)?,
                Some(v) => lower_variant(cx, ty, 1, Some(&option.ty), Some(v), dst)?,
            },
            (Type::Result(result), Val::Result(value)) => match value {
                Ok(v) => lower_variant(cx, ty, 0, result.ok.as_ref(), v, dst)?,
                Err(v) => lower_variant(cx, ty, 1, result.err.as_ref(), v, dst)?,
            },
            (Type::Flags(flags), Val::Flags(names)) => {
                let words = flags_to_words(flags, &names)?;
                match flags.size() {
                    FlagsSize::Size0 => {}
                    _ => dst.extend(words.into_iter().map(ValRaw::u32)),
                }
            }
            (Type::Own(kind), Val::Resource(resource)) => {
                let handle = cx.resources().lower_own(*kind, resource)?;
                dst.push(ValRaw::u32(handle));
            }
            (Type::Borrow(kind), Val::Resource(resource)) => {
                let handle = cx.resources().lower_borrow(*kind, &resource)?;
                dst.push(ValRaw::u32(handle));
            }
            (ty, val) => return unexpected(ty, &val),
        }
        Ok(())
    }

    /// Stores this value as type `ty` into linear memory at `offset`.
    pub fn store(self, cx: &mut LowerContext<'_>, ty: &Type, offset: u32) -> Result<()> {
        match (ty, self) {
            (Type::Bool, Val::Bool(b)) => cx.write(offset, &[u8::from(b)])?,
            (Type::S8, Val::S8(i)) => cx.write(offset, &i.to_le_bytes())?,
            (Type::U8, Val::U8(i)) => cx.write(offset, &i.to_le_bytes())?,
            (Type::S16, Val::S16(i)) => cx.write(offset, &i.to_le_bytes())?,
            (Type::U16, Val::U16(i)) => cx.write(offset, &i.to_le_bytes())?,
            (Type::S32, Val::S32(i)) => cx.write(offset, &i.to_le_bytes())?,
            (Type::U32, Val::U32(i)) => cx.write(offset, &i.to_le_bytes())?,
            (Type::S64, Val::S64(i)) => cx.write(offset, &i.to_le_bytes())?,
            (Type::U64, Val::U64(i)) => cx.write(offset, &i.to_le_bytes())?,
            (Type::Float32, Val::Float32(f)) => cx.write(offset, &f.to_le_bytes())?,
            (Type::Float64, Val::Float64(f)) => cx.write(offset, &f.to_le_bytes())?,
            (Type::Char, Val::Char(c)) => cx.write(offset, &u32::from(c).to_le_bytes())?,
            (Type::String, Val::String(s)) => {
                let (ptr, len) = lower_string(cx, &s)?;
                store_pointer_pair(cx, offset, ptr, len)?;
            }
            (Type::List(list), Val::List(items)) => {
                let (ptr, len) = lower_list(cx, &list.element, items)?;
                store_pointer_pair(cx, offset, ptr, len)?;
            }
            (Type::Record(record), Val::Record(values)) => {
                check_record_arity(record.fields.len(), values.len())?;
                let abis = record.fields.iter().map(|f| f.ty.abi()).collect::<Vec<_>>();
                let offsets = CanonicalAbiInfo::record_offsets(&abis);
                for ((field, (name, value)), field_offset) in
                    record.fields.iter().zip(values).zip(offsets)
                {
                    check_field_name(&field.name, &name)?;
                    value.store(cx, &field.ty, offset + field_offset)?;
                }
            }
            (Type::Tuple(tuple), Val::Tuple(values)) => {
                check_record_arity(tuple.types.len(), values.len())?;
                let abis = tuple.types.iter().map(|t| t.abi()).collect::<Vec<_>>();
                let offsets = CanonicalAbiInfo::record_offsets(&abis);
                for ((ty, value), field_offset) in tuple.types.iter().zip(values).zip(offsets) {
                    value.store(cx, ty, offset + field_offset)?;
                }
            }
            (Type::Variant(variant), Val::Variant(name, payload)) => {
                let index = case_index(ty, variant.cases.get_index_of(&name), name)?;
                let case_ty = variant.cases[index].as_ref();
                store_variant(cx, &variant.info, offset, index, case_ty, payload)?;
            }
            (Type::Enum(enum_), Val::Enum(name)) => {
                let index = case_index(ty, enum_.names.get_index_of(&name), name)?;
                store_variant(cx, &enum_.info, offset, index, None, None)?;
            }
            (Type::Option(option), Val::Option(value)) => match value {
                None => store_variant(cx, &option.info, offset, 0, None, None)?,
                Some(v) => store_variant(cx, &option.info, offset, 1, Some(&option.ty), Some(v))?,
            },
            (Type::Result(result), Val::Result(value)) => match value {
                Ok(v) => store_variant(cx, &result.info, offset, 0, result.ok.as_ref(), v)?,
                Err(v) => store_variant(cx, &result.info, offset, 1, result.err.as_ref(), v)?,
            },
            (Type::Flags(flags), Val::Flags(names)) => {
                let words = flags_to_words(flags, &names)?;
                match flags.size() {
                    FlagsSize::Size0 => {}
                    FlagsSize::Size1 => cx.write(offset, &[words[0] as u8])?,
                    FlagsSize::Size2 => cx.write(offset, &(words[0] as u16).to_le_bytes())?,
                    FlagsSize::Size4Plus(_) => {
                        for (i, word) in words.iter().enumerate() {
                            cx.write(offset + 4 * i as u32, &word.to_le_bytes())?;
                        }
                    }
                }
            }
            (Type::Own(kind), Val::Resource(resource)) => {
                let handle = cx.resources().lower_own(*kind, resource)?;
                cx.write(offset, &handle.to_le_bytes())?;
            }
            (Type::Borrow(kind), Val::Resource(resource)) => {
                let handle = cx.resources().lower_borrow(*kind, &resource)?;
                cx.write(offset, &handle.to_le_bytes())?;
            }
            (ty, val) => return unexpected(ty, &val),
        }
        Ok(())
    }

    /// Short description of the shape of this value used in error messages.
    pub fn desc(&self) -> &'static str {
        match self {
            Val::Bool(_) => "bool",
            Val::U8(_) => "u8",
            Val::S8(_) => "s8",
            Val::U16(_) => "u16",
            Val::S16(_) => "s16",
            Val::U32(_) => "u32",
            Val::S32(_) => "s32",
            Val::U64(_) => "u64",
            Val::S64(_) => "s64",
            Val::Float32(_) => "f32",
            Val::Float64(_) => "f64",
            Val::Char(_) => "char",
            Val::List(_) => "list",
            Val::String(_) => "string",
            Val::Record(_) => "record",
            Val::Enum(_) => "enum",
            Val::Variant(..) => "variant",
            Val::Tuple(_) => "tuple",
            Val::Option(_) => "option",
            Val::Result(_) => "result",
            Val::Resource(_) => "resource",
            Val::Flags(_) => "flags",
        }
    }
}

fn unexpected<T>(ty: &Type, val: &Val) -> Result<T> {
    bail!(
        "type mismatch: expected {}, found {}",
        ty.desc(),
        val.desc()
    )
}

fn check_record_arity(expected: usize, found: usize) -> Result<()> {
    if expected != found {
        bail!("expected {expected} fields, got {found}");
    }
    Ok(())
}

fn check_field_name(expected: &str, found: &str) -> Result<()> {
    if expected != found {
        bail!("expected field `{expected}`, got `{found}`");
    }
    Ok(())
}

fn lift_char(bits: u32) -> Result<char> {
    char::from_u32(bits).ok_or_else(|| anyhow!(DecodeError::Char(bits)))
}

fn load_pointer_pair(cx: &mut LiftContext<'_>, offset: u32) -> Result<(u32, u32)> {
    let ptr = u32::from_le_bytes(cx.read(offset)?);
    let len = u32::from_le_bytes(cx.read(offset + 4)?);
    Ok((ptr, len))
}

fn store_pointer_pair(cx: &mut LowerContext<'_>, offset: u32, ptr: u32, len: u32) -> Result<()> {
    cx.write(offset, &ptr.to_le_bytes())?;
    cx.write(offset + 4, &len.to_le_bytes())
}

fn load_string(cx: &mut LiftContext<'_>, ptr: u32, len: u32) -> Result<String> {
    if len == 0 {
        return Ok(String::new());
    }
    let bytes = cx.bytes("string", ptr, len)?;
    String::from_utf8(bytes).map_err(|_| anyhow!(DecodeError::Utf8))
}

fn load_list(cx: &mut LiftContext<'_>, element: &Type, ptr: u32, len: u32) -> Result<Val> {
    let abi = element.abi();
    let total = u64::from(len) * u64::from(abi.size32);
    cx.check("list", ptr, total, abi.align32)?;
    if let Type::U8 = element {
        let bytes = cx.bytes("list", ptr, len)?;
        return Ok(Val::List(bytes.into_iter().map(Val::U8).collect()));
    }
    Ok(Val::List(
        (0..len)
            .map(|index| Val::load(cx, element, ptr + index * abi.size32))
            .collect::<Result<_>>()?,
    ))
}

fn discriminant_out_of_range(ty: &Type, discriminant: u32, cases: usize) -> anyhow::Error {
    anyhow!(DecodeError::Discriminant {
        ty: ty.desc(),
        discriminant,
        cases,
    })
}

fn case_index(ty: &Type, index: Option<usize>, case: String) -> Result<usize> {
    index.ok_or_else(|| {
        anyhow!(DecodeError::Case {
            ty: ty.desc(),
            case,
        })
    })
}

fn lift_variant<'t>(
    cx: &mut LiftContext<'_>,
    ty: &Type,
    cases: impl IntoIterator<Item = Option<&'t Type>>,
    src: &mut Iter<'_, ValRaw>,
) -> Result<(usize, Option<Box<Val>>)> {
    let discriminant = next(src, ty)?.get_u32();
    let payload = (1..ty.flat_len())
        .map(|_| next(src, ty))
        .collect::<Result<Vec<_>>>()?;
    let cases = cases.into_iter().collect::<Vec<_>>();
    let case_ty = cases
        .get(discriminant as usize)
        .ok_or_else(|| discriminant_out_of_range(ty, discriminant, cases.len()))?;
    let value = match case_ty {
        Some(case_ty) => Some(Box::new(Val::lift(cx, case_ty, &mut payload.iter())?)),
        None => None,
    };
    Ok((discriminant as usize, value))
}

fn load_variant<'t>(
    cx: &mut LiftContext<'_>,
    ty: &Type,
    info: &VariantInfo,
    cases: impl IntoIterator<Item = Option<&'t Type>>,
    offset: u32,
) -> Result<(usize, Option<Box<Val>>)> {
    let discriminant = match info.size {
        DiscriminantSize::Size1 => u32::from(u8::from_le_bytes(cx.read(offset)?)),
        DiscriminantSize::Size2 => u32::from(u16::from_le_bytes(cx.read(offset)?)),
        DiscriminantSize::Size4 => u32::from_le_bytes(cx.read(offset)?),
    };
    let cases = cases.into_iter().collect::<Vec<_>>();
    let case_ty = cases
        .get(discriminant as usize)
        .ok_or_else(|| discriminant_out_of_range(ty, discriminant, cases.len()))?;
    let value = match case_ty {
        Some(case_ty) => Some(Box::new(Val::load(
            cx,
            case_ty,
            offset + info.payload_offset32,
        )?)),
        None => None,
    };
    Ok((discriminant as usize, value))
}

fn lower_variant(
    cx: &mut LowerContext<'_>,
    ty: &Type,
    index: usize,
    case_ty: Option<&Type>,
    payload: Option<Box<Val>>,
    dst: &mut Vec<ValRaw>,
) -> Result<()> {
    let start = dst.len();
    dst.push(ValRaw::u32(u32::try_from(index)?));
    match (case_ty, payload) {
        (Some(case_ty), Some(payload)) => (*payload).lower(cx, case_ty, dst)?,
        (None, None) => {}
        (Some(_), None) => bail!("variant case {index} requires a payload"),
        (None, Some(_)) => bail!("variant case {index} does not take a payload"),
    }
    // Pad out to the widest case; unused slots are zero.
    dst.resize(start + ty.flat_len(), ValRaw::default());
    Ok(())
}

fn store_variant(
    cx: &mut LowerContext<'_>,
    info: &VariantInfo,
    offset: u32,
    index: usize,
    case_ty: Option<&Type>,
    payload: Option<Box<Val>>,
) -> Result<()> {
    let index = u32::try_from(index)?;
    match info.size {
        DiscriminantSize::Size1 => cx.write(offset, &[u8::try_from(index)?])?,
        DiscriminantSize::Size2 => cx.write(offset, &u16::try_from(index)?.to_le_bytes())?,
        DiscriminantSize::Size4 => cx.write(offset, &index.to_le_bytes())?,
    }
    match (case_ty, payload) {
        (Some(case_ty), Some(payload)) => {
            (*payload).store(cx, case_ty, offset + info.payload_offset32)
        }
        (None, None) => Ok(()),
        (Some(_), None) => bail!("variant case {index} requires a payload"),
        (None, Some(_)) => bail!("variant case {index} does not take a payload"),
    }
}

/// Lowers a string into guest memory.
///
/// The empty string is never allocated: it is passed as a zero length at the
/// non-null address 1.
fn lower_string(cx: &mut LowerContext<'_>, s: &str) -> Result<(u32, u32)> {
    if s.is_empty() {
        return Ok((1, 0));
    }
    let len = u32::try_from(s.len()).map_err(|_| anyhow!("string length overflow"))?;
    let ptr = cx.realloc(0, 0, 1, len)?;
    cx.write(ptr, s.as_bytes())?;
    Ok((ptr, len))
}

fn lower_list(cx: &mut LowerContext<'_>, element: &Type, items: Vec<Val>) -> Result<(u32, u32)> {
    let abi = element.abi();
    let len = u32::try_from(items.len())?;
    let size = len
        .checked_mul(abi.size32)
        .ok_or_else(|| anyhow!("size overflow copying a list"))?;
    let ptr = cx.realloc(0, 0, abi.align32, size)?;
    if let Type::U8 = element {
        let bytes = items
            .into_iter()
            .map(|item| match item {
                Val::U8(b) => Ok(b),
                other => unexpected(element, &other),
            })
            .collect::<Result<Vec<u8>>>()?;
        cx.write(ptr, &bytes)?;
        return Ok((ptr, len));
    }
    let mut element_ptr = ptr;
    for item in items {
        item.store(cx, element, element_ptr)?;
        element_ptr += abi.size32;
    }
    Ok((ptr, len))
}

fn push_flags(ty: &FlagsType, flags: &mut Vec<String>, mut offset: u32, mut bits: u32) {
    while bits > 0 {
        if bits & 1 != 0 {
            if let Some(name) = ty.names.get_index(offset as usize) {
                flags.push(name.clone());
            }
        }
        bits >>= 1;
        offset += 1;
    }
}

fn flags_to_words(ty: &FlagsType, names: &[String]) -> Result<Vec<u32>> {
    let mut words = vec![0u32; ty.names.len().div_ceil(32).max(1)];
    for name in names {
        let index = ty
            .names
            .get_index_of(name.as_str())
            .ok_or_else(|| {
                anyhow!(DecodeError::Case {
                    ty: "flags",
                    case: name.clone(),
                })
            })?;
        words[index / 32] |= 1 << (index % 32);
    }
    Ok(words)
}
