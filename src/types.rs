//! Layout descriptors for values crossing the guest/host boundary.
//!
//! Every composite descriptor computes its size, alignment and flattened core
//! representation once, at construction time. Descriptors are immutable
//! afterwards and cheap to clone since the composite payloads live behind an
//! `Arc`.

use crate::resources::ResourceKind;
use indexmap::{IndexMap, IndexSet};
use std::fmt;
use std::sync::Arc;

/// Maximum number of flat core values used to pass parameters before they
/// spill into linear memory.
pub const MAX_FLAT_PARAMS: usize = 16;

/// Maximum number of flat core values used for results before they spill into
/// linear memory.
pub const MAX_FLAT_RESULTS: usize = 1;

/// A core wasm value type as used by the flattened representation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FlatType {
    I32,
    I64,
    F32,
    F64,
}

impl FlatType {
    /// Joins two flat types occupying the same slot of a variant payload.
    ///
    /// `i32` and `f32` share an `i32` slot, every other mix widens to `i64`.
    pub fn join(self, other: FlatType) -> FlatType {
        if self == other {
            return self;
        }
        match (self, other) {
            (FlatType::I32, FlatType::F32) | (FlatType::F32, FlatType::I32) => FlatType::I32,
            _ => FlatType::I64,
        }
    }
}

impl fmt::Display for FlatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlatType::I32 => "i32",
            FlatType::I64 => "i64",
            FlatType::F32 => "f32",
            FlatType::F64 => "f64",
        })
    }
}

/// Size and alignment of a type in linear memory along with the number of
/// core values it flattens to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CanonicalAbiInfo {
    /// Size in bytes in linear memory.
    pub size32: u32,
    /// Alignment in bytes in linear memory.
    pub align32: u32,
    /// Number of flat values, or `None` if more than [`MAX_FLAT_PARAMS`].
    pub flat_count: Option<u8>,
}

impl CanonicalAbiInfo {
    /// Layout of zero-sized values such as empty records and empty flags.
    pub const ZERO: CanonicalAbiInfo = CanonicalAbiInfo {
        size32: 0,
        align32: 1,
        flat_count: Some(0),
    };

    /// Layout of one-byte scalars.
    pub const SCALAR1: CanonicalAbiInfo = CanonicalAbiInfo::scalar(1);
    /// Layout of two-byte scalars.
    pub const SCALAR2: CanonicalAbiInfo = CanonicalAbiInfo::scalar(2);
    /// Layout of four-byte scalars.
    pub const SCALAR4: CanonicalAbiInfo = CanonicalAbiInfo::scalar(4);
    /// Layout of eight-byte scalars.
    pub const SCALAR8: CanonicalAbiInfo = CanonicalAbiInfo::scalar(8);

    /// Layout of strings and lists: a 32-bit pointer and length pair.
    pub const POINTER_PAIR: CanonicalAbiInfo = CanonicalAbiInfo {
        size32: 8,
        align32: 4,
        flat_count: Some(2),
    };

    const fn scalar(size: u32) -> CanonicalAbiInfo {
        CanonicalAbiInfo {
            size32: size,
            align32: size,
            flat_count: Some(1),
        }
    }

    /// Computes the layout of fields laid out one after another.
    pub fn record<'a>(fields: impl IntoIterator<Item = &'a CanonicalAbiInfo>) -> CanonicalAbiInfo {
        let mut ret = CanonicalAbiInfo::ZERO;
        for field in fields {
            ret.size32 = align_to(ret.size32, field.align32) + field.size32;
            ret.align32 = ret.align32.max(field.align32);
            ret.flat_count = add_flat(ret.flat_count, field.flat_count);
        }
        ret.size32 = align_to(ret.size32, ret.align32);
        ret
    }

    /// Returns the offset of each field of a record with the given fields.
    pub fn record_offsets<'a>(
        fields: impl IntoIterator<Item = &'a CanonicalAbiInfo>,
    ) -> impl Iterator<Item = u32> {
        let mut offset = 0;
        fields.into_iter().map(move |field| {
            let field_offset = align_to(offset, field.align32);
            offset = field_offset + field.size32;
            field_offset
        })
    }

    /// Computes the layout of a discriminated union of the given cases.
    pub fn variant<'a, I>(cases: I) -> (CanonicalAbiInfo, VariantInfo)
    where
        I: IntoIterator<Item = Option<&'a CanonicalAbiInfo>>,
        I::IntoIter: ExactSizeIterator,
    {
        let cases = cases.into_iter();
        let discrim_size = DiscriminantSize::from_count(cases.len());
        let mut max_size = 0;
        let mut max_align = discrim_size.byte_size();
        let mut max_case_count = Some(0);
        for case in cases.flatten() {
            max_size = max_size.max(case.size32);
            max_align = max_align.max(case.align32);
            max_case_count = max_flat(max_case_count, case.flat_count);
        }
        let payload_offset32 = align_to(discrim_size.byte_size(), max_align);
        let abi = CanonicalAbiInfo {
            size32: align_to(payload_offset32 + max_size, max_align),
            align32: max_align,
            flat_count: add_flat(max_case_count, Some(1)),
        };
        let info = VariantInfo {
            size: discrim_size,
            payload_offset32,
        };
        (abi, info)
    }

    /// Computes the layout of a set of named flags.
    pub fn flags(count: usize) -> CanonicalAbiInfo {
        match FlagsSize::from_count(count) {
            FlagsSize::Size0 => CanonicalAbiInfo::ZERO,
            FlagsSize::Size1 => CanonicalAbiInfo::SCALAR1,
            FlagsSize::Size2 => CanonicalAbiInfo::SCALAR2,
            FlagsSize::Size4Plus(n) => CanonicalAbiInfo {
                size32: 4 * u32::from(n),
                align32: 4,
                flat_count: if usize::from(n) > MAX_FLAT_PARAMS {
                    None
                } else {
                    Some(n)
                },
            },
        }
    }
}

fn add_flat(a: Option<u8>, b: Option<u8>) -> Option<u8> {
    let sum = a?.checked_add(b?)?;
    if usize::from(sum) > MAX_FLAT_PARAMS {
        None
    } else {
        Some(sum)
    }
}

fn max_flat(a: Option<u8>, b: Option<u8>) -> Option<u8> {
    Some(a?.max(b?))
}

/// Rounds `n` up to the next multiple of `align`.
pub fn align_to(n: u32, align: u32) -> u32 {
    assert!(align.is_power_of_two());
    (n + (align - 1)) & !(align - 1)
}

/// Width of the discriminant stored in front of a variant payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DiscriminantSize {
    Size1,
    Size2,
    Size4,
}

impl DiscriminantSize {
    /// Picks the narrowest discriminant able to number `count` cases.
    pub fn from_count(count: usize) -> DiscriminantSize {
        if count <= 1 << 8 {
            DiscriminantSize::Size1
        } else if count <= 1 << 16 {
            DiscriminantSize::Size2
        } else {
            DiscriminantSize::Size4
        }
    }

    /// Number of bytes occupied in linear memory.
    pub const fn byte_size(self) -> u32 {
        match self {
            DiscriminantSize::Size1 => 1,
            DiscriminantSize::Size2 => 2,
            DiscriminantSize::Size4 => 4,
        }
    }
}

/// Storage used for a set of flags.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlagsSize {
    /// No flags at all, nothing is stored.
    Size0,
    /// Up to 8 flags, stored in one byte.
    Size1,
    /// Up to 16 flags, stored in two bytes.
    Size2,
    /// More than 16 flags, stored in this many 32-bit words.
    Size4Plus(u8),
}

impl FlagsSize {
    /// Picks the storage for `count` flags.
    pub fn from_count(count: usize) -> FlagsSize {
        if count == 0 {
            FlagsSize::Size0
        } else if count <= 8 {
            FlagsSize::Size1
        } else if count <= 16 {
            FlagsSize::Size2
        } else {
            let words = count.div_ceil(32);
            FlagsSize::Size4Plus(u8::try_from(words).unwrap_or(u8::MAX))
        }
    }
}

/// Discriminant width and payload position of a variant-shaped type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VariantInfo {
    /// Width of the discriminant.
    pub size: DiscriminantSize,
    /// Offset of the payload from the start of the value.
    pub payload_offset32: u32,
}

/// A value shape that may cross the boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs, reason = "variants are named after their shape")]
pub enum Type {
    Bool,
    S8,
    U8,
    S16,
    U16,
    S32,
    U32,
    S64,
    U64,
    Float32,
    Float64,
    Char,
    String,
    List(Arc<ListType>),
    Record(Arc<RecordType>),
    Tuple(Arc<TupleType>),
    Variant(Arc<VariantType>),
    Enum(Arc<EnumType>),
    Option(Arc<OptionType>),
    Result(Arc<ResultType>),
    Flags(Arc<FlagsType>),
    Own(ResourceKind),
    Borrow(ResourceKind),
}

/// `list<T>`
#[derive(Debug, PartialEq, Eq)]
pub struct ListType {
    pub element: Type,
}

/// A named field of a record.
#[derive(Debug, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub ty: Type,
}

/// `record { ... }`
#[derive(Debug, PartialEq, Eq)]
pub struct RecordType {
    pub fields: Box<[Field]>,
    pub abi: CanonicalAbiInfo,
    flat: Box<[FlatType]>,
}

/// `tuple<...>`
#[derive(Debug, PartialEq, Eq)]
pub struct TupleType {
    pub types: Box<[Type]>,
    pub abi: CanonicalAbiInfo,
    flat: Box<[FlatType]>,
}

/// `variant { ... }`
#[derive(Debug, PartialEq, Eq)]
pub struct VariantType {
    pub cases: IndexMap<String, Option<Type>>,
    pub abi: CanonicalAbiInfo,
    pub info: VariantInfo,
    flat: Box<[FlatType]>,
}

/// `enum { ... }`
#[derive(Debug, PartialEq, Eq)]
pub struct EnumType {
    pub names: IndexSet<String>,
    pub abi: CanonicalAbiInfo,
    pub info: VariantInfo,
}

/// `option<T>`
#[derive(Debug, PartialEq, Eq)]
pub struct OptionType {
    pub ty: Type,
    pub abi: CanonicalAbiInfo,
    pub info: VariantInfo,
    flat: Box<[FlatType]>,
}

/// `result<T, E>`, either side possibly absent.
#[derive(Debug, PartialEq, Eq)]
pub struct ResultType {
    pub ok: Option<Type>,
    pub err: Option<Type>,
    pub abi: CanonicalAbiInfo,
    pub info: VariantInfo,
    flat: Box<[FlatType]>,
}

/// `flags { ... }`
#[derive(Debug, PartialEq, Eq)]
pub struct FlagsType {
    pub names: IndexSet<String>,
    pub abi: CanonicalAbiInfo,
}

impl FlagsType {
    /// Storage used for these flags.
    pub fn size(&self) -> FlagsSize {
        FlagsSize::from_count(self.names.len())
    }
}

impl Type {
    /// `list<element>`
    pub fn list(element: Type) -> Type {
        Type::List(Arc::new(ListType { element }))
    }

    /// `record { name: ty, ... }`
    pub fn record<'a>(fields: impl IntoIterator<Item = (&'a str, Type)>) -> Type {
        let fields: Box<[Field]> = fields
            .into_iter()
            .map(|(name, ty)| Field {
                name: name.to_string(),
                ty,
            })
            .collect();
        let abis = fields.iter().map(|f| f.ty.abi()).collect::<Vec<_>>();
        let mut flat = Vec::new();
        for field in fields.iter() {
            field.ty.push_flat(&mut flat);
        }
        Type::Record(Arc::new(RecordType {
            abi: CanonicalAbiInfo::record(&abis),
            fields,
            flat: flat.into(),
        }))
    }

    /// `tuple<...>`
    pub fn tuple(types: impl IntoIterator<Item = Type>) -> Type {
        let types: Box<[Type]> = types.into_iter().collect();
        let abis = types.iter().map(|t| t.abi()).collect::<Vec<_>>();
        let mut flat = Vec::new();
        for ty in types.iter() {
            ty.push_flat(&mut flat);
        }
        Type::Tuple(Arc::new(TupleType {
            abi: CanonicalAbiInfo::record(&abis),
            types,
            flat: flat.into(),
        }))
    }

    /// `variant { case(payload), ... }`
    pub fn variant<'a>(cases: impl IntoIterator<Item = (&'a str, Option<Type>)>) -> Type {
        let cases: IndexMap<String, Option<Type>> = cases
            .into_iter()
            .map(|(name, ty)| (name.to_string(), ty))
            .collect();
        let abis = cases
            .values()
            .map(|ty| ty.as_ref().map(|t| t.abi()))
            .collect::<Vec<_>>();
        let (abi, info) = CanonicalAbiInfo::variant(abis.iter().map(|a| a.as_ref()));
        let flat = flatten_variant(cases.values().map(|t| t.as_ref()));
        Type::Variant(Arc::new(VariantType {
            cases,
            abi,
            info,
            flat,
        }))
    }

    /// `enum { name, ... }`
    pub fn enumeration<'a>(names: impl IntoIterator<Item = &'a str>) -> Type {
        let names: IndexSet<String> = names.into_iter().map(|n| n.to_string()).collect();
        let (abi, info) = CanonicalAbiInfo::variant(names.iter().map(|_| None));
        Type::Enum(Arc::new(EnumType { names, abi, info }))
    }

    /// `option<ty>`
    pub fn option(ty: Type) -> Type {
        let payload = ty.abi();
        let (abi, info) = CanonicalAbiInfo::variant([None, Some(&payload)]);
        let flat = flatten_variant([None, Some(&ty)]);
        Type::Option(Arc::new(OptionType { ty, abi, info, flat }))
    }

    /// `result<ok, err>`
    pub fn result(ok: Option<Type>, err: Option<Type>) -> Type {
        let ok_abi = ok.as_ref().map(|t| t.abi());
        let err_abi = err.as_ref().map(|t| t.abi());
        let (abi, info) = CanonicalAbiInfo::variant([ok_abi.as_ref(), err_abi.as_ref()]);
        let flat = flatten_variant([ok.as_ref(), err.as_ref()]);
        Type::Result(Arc::new(ResultType {
            ok,
            err,
            abi,
            info,
            flat,
        }))
    }

    /// `flags { name, ... }`
    pub fn flags<'a>(names: impl IntoIterator<Item = &'a str>) -> Type {
        let names: IndexSet<String> = names.into_iter().map(|n| n.to_string()).collect();
        Type::Flags(Arc::new(FlagsType {
            abi: CanonicalAbiInfo::flags(names.len()),
            names,
        }))
    }

    /// `own<kind>`
    pub fn own(kind: ResourceKind) -> Type {
        Type::Own(kind)
    }

    /// `borrow<kind>`
    pub fn borrow(kind: ResourceKind) -> Type {
        Type::Borrow(kind)
    }

    /// Size, alignment and flat count of this type.
    pub fn abi(&self) -> CanonicalAbiInfo {
        match self {
            Type::Bool | Type::S8 | Type::U8 => CanonicalAbiInfo::SCALAR1,
            Type::S16 | Type::U16 => CanonicalAbiInfo::SCALAR2,
            Type::S32 | Type::U32 | Type::Float32 | Type::Char => CanonicalAbiInfo::SCALAR4,
            Type::Own(_) | Type::Borrow(_) => CanonicalAbiInfo::SCALAR4,
            Type::S64 | Type::U64 | Type::Float64 => CanonicalAbiInfo::SCALAR8,
            Type::String | Type::List(_) => CanonicalAbiInfo::POINTER_PAIR,
            Type::Record(r) => r.abi,
            Type::Tuple(t) => t.abi,
            Type::Variant(v) => v.abi,
            Type::Enum(e) => e.abi,
            Type::Option(o) => o.abi,
            Type::Result(r) => r.abi,
            Type::Flags(f) => f.abi,
        }
    }

    /// Discriminant layout of variant-shaped types.
    pub fn variant_info(&self) -> Option<&VariantInfo> {
        match self {
            Type::Variant(v) => Some(&v.info),
            Type::Enum(e) => Some(&e.info),
            Type::Option(o) => Some(&o.info),
            Type::Result(r) => Some(&r.info),
            _ => None,
        }
    }

    /// Appends the flattened core representation of this type to `dst`.
    pub fn push_flat(&self, dst: &mut Vec<FlatType>) {
        match self {
            Type::Bool
            | Type::S8
            | Type::U8
            | Type::S16
            | Type::U16
            | Type::S32
            | Type::U32
            | Type::Char
            | Type::Own(_)
            | Type::Borrow(_) => dst.push(FlatType::I32),
            Type::S64 | Type::U64 => dst.push(FlatType::I64),
            Type::Float32 => dst.push(FlatType::F32),
            Type::Float64 => dst.push(FlatType::F64),
            Type::String | Type::List(_) => dst.extend([FlatType::I32, FlatType::I32]),
            Type::Record(r) => dst.extend_from_slice(&r.flat),
            Type::Tuple(t) => dst.extend_from_slice(&t.flat),
            Type::Variant(v) => dst.extend_from_slice(&v.flat),
            Type::Option(o) => dst.extend_from_slice(&o.flat),
            Type::Result(r) => dst.extend_from_slice(&r.flat),
            Type::Enum(_) => dst.push(FlatType::I32),
            Type::Flags(f) => match f.size() {
                FlagsSize::Size0 => {}
                FlagsSize::Size1 | FlagsSize::Size2 => dst.push(FlatType::I32),
                FlagsSize::Size4Plus(n) => {
                    dst.extend((0..n).map(|_| FlatType::I32));
                }
            },
        }
    }

    /// Number of flat core values this type occupies, without the
    /// [`MAX_FLAT_PARAMS`] cutoff.
    pub fn flat_len(&self) -> usize {
        match self {
            Type::String | Type::List(_) => 2,
            Type::Record(r) => r.flat.len(),
            Type::Tuple(t) => t.flat.len(),
            Type::Variant(v) => v.flat.len(),
            Type::Option(o) => o.flat.len(),
            Type::Result(r) => r.flat.len(),
            Type::Flags(f) => match f.size() {
                FlagsSize::Size0 => 0,
                FlagsSize::Size1 | FlagsSize::Size2 => 1,
                FlagsSize::Size4Plus(n) => usize::from(n),
            },
            _ => 1,
        }
    }

    /// Returns the flattened core representation of this type.
    pub fn flatten(&self) -> Vec<FlatType> {
        let mut dst = Vec::new();
        self.push_flat(&mut dst);
        dst
    }

    /// Short human readable description used in error messages.
    pub fn desc(&self) -> &'static str {
        match self {
            Type::Bool => "bool",
            Type::S8 => "s8",
            Type::U8 => "u8",
            Type::S16 => "s16",
            Type::U16 => "u16",
            Type::S32 => "s32",
            Type::U32 => "u32",
            Type::S64 => "s64",
            Type::U64 => "u64",
            Type::Float32 => "f32",
            Type::Float64 => "f64",
            Type::Char => "char",
            Type::String => "string",
            Type::List(_) => "list",
            Type::Record(_) => "record",
            Type::Tuple(_) => "tuple",
            Type::Variant(_) => "variant",
            Type::Enum(_) => "enum",
            Type::Option(_) => "option",
            Type::Result(_) => "result",
            Type::Flags(_) => "flags",
            Type::Own(_) => "own",
            Type::Borrow(_) => "borrow",
        }
    }
}

fn flatten_variant<'a>(cases: impl IntoIterator<Item = Option<&'a Type>>) -> Box<[FlatType]> {
    let mut payload: Vec<FlatType> = Vec::new();
    let mut scratch = Vec::new();
    for ty in cases.into_iter().flatten() {
        scratch.clear();
        ty.push_flat(&mut scratch);
        for (i, flat) in scratch.iter().enumerate() {
            match payload.get_mut(i) {
                Some(slot) => *slot = slot.join(*flat),
                None => payload.push(*flat),
            }
        }
    }
    let mut ret = Vec::with_capacity(payload.len() + 1);
    ret.push(FlatType::I32);
    ret.extend(payload);
    ret.into()
}

/// The component-level signature of an imported or exported operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FuncType {
    /// Parameter types in order.
    pub params: Box<[Type]>,
    /// The single result, if any.
    pub result: Option<Type>,
}

/// Which side of the boundary a core signature is computed for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Context {
    /// A guest export being lifted for the host to call. Spilled results are
    /// returned by pointer.
    Lift,
    /// A host operation lowered into a guest import. Spilled results are
    /// written through a trailing return-pointer parameter.
    Lower,
}

/// Core wasm signature of a lifted or lowered function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    /// Core parameters.
    pub params: Vec<FlatType>,
    /// Core results.
    pub results: Vec<FlatType>,
    /// Whether parameters are passed through a pointer into linear memory.
    pub params_indirect: bool,
    /// Whether the result is passed through linear memory.
    pub results_indirect: bool,
}

impl FuncType {
    /// Creates a new function type.
    pub fn new(params: impl IntoIterator<Item = Type>, result: Option<Type>) -> FuncType {
        FuncType {
            params: params.into_iter().collect(),
            result,
        }
    }

    /// Layout of the parameters as one tuple, used when they spill into
    /// memory.
    pub fn params_abi(&self) -> CanonicalAbiInfo {
        let abis = self.params.iter().map(|t| t.abi()).collect::<Vec<_>>();
        CanonicalAbiInfo::record(&abis)
    }

    /// Computes the core signature of this function in `context`.
    pub fn signature(&self, context: Context) -> Signature {
        let mut params = Vec::new();
        for ty in self.params.iter() {
            ty.push_flat(&mut params);
        }
        let params_indirect = params.len() > MAX_FLAT_PARAMS;
        if params_indirect {
            params = vec![FlatType::I32];
        }

        let mut results = Vec::new();
        if let Some(ty) = &self.result {
            ty.push_flat(&mut results);
        }
        let results_indirect = results.len() > MAX_FLAT_RESULTS;
        if results_indirect {
            match context {
                Context::Lift => results = vec![FlatType::I32],
                Context::Lower => {
                    results.clear();
                    params.push(FlatType::I32);
                }
            }
        }
        Signature {
            params,
            results,
            params_indirect,
            results_indirect,
        }
    }
}
