//! Value descriptions, structural copies and kernel parameter types.
//!
//! A [`ValueDescription`] is the runtime layout of a value: its size,
//! alignment and either a primitive kind or a list of named fields. Scalars
//! cross the binding boundary as raw bytes plus a description and are copied
//! field by field into the native parameter, so two structs with different
//! layouts but the same field names convert into one another.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::expr::Expr;

/// Whether a parameter may be written by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    /// Parse a declaration string: `"r"`, `"w"` or `"rw"`.
    ///
    /// Write-only is not modelled separately and maps to read-write.
    pub fn parse(access: &str) -> Result<Self> {
        match access.trim() {
            "r" => Ok(AccessMode::ReadOnly),
            "w" | "rw" => Ok(AccessMode::ReadWrite),
            other => Err(Error::InvalidTypeExpression {
                expr: other.to_string(),
                reason: "access must be one of r, w, rw".to_string(),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::ReadOnly => "r",
            AccessMode::ReadWrite => "rw",
        }
    }

    pub fn is_writable(self) -> bool {
        self == AccessMode::ReadWrite
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primitive scalar kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Primitive {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl Primitive {
    pub fn name(self) -> &'static str {
        match self {
            Primitive::U8 => "u8",
            Primitive::U16 => "u16",
            Primitive::U32 => "u32",
            Primitive::U64 => "u64",
            Primitive::I8 => "i8",
            Primitive::I16 => "i16",
            Primitive::I32 => "i32",
            Primitive::I64 => "i64",
            Primitive::F32 => "f32",
            Primitive::F64 => "f64",
        }
    }

    pub fn size(self) -> usize {
        match self {
            Primitive::U8 | Primitive::I8 => 1,
            Primitive::U16 | Primitive::I16 => 2,
            Primitive::U32 | Primitive::I32 | Primitive::F32 => 4,
            Primitive::U64 | Primitive::I64 | Primitive::F64 => 8,
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, Primitive::F32 | Primitive::F64)
    }

    pub const ALL: [Primitive; 10] = [
        Primitive::U8,
        Primitive::U16,
        Primitive::U32,
        Primitive::U64,
        Primitive::I8,
        Primitive::I16,
        Primitive::I32,
        Primitive::I64,
        Primitive::F32,
        Primitive::F64,
    ];
}

/// A named field inside a struct description
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    pub offset: usize,
    pub desc: Arc<ValueDescription>,
}

impl FieldDescription {
    pub fn new(name: impl Into<String>, offset: usize, desc: Arc<ValueDescription>) -> Self {
        Self {
            name: name.into(),
            offset,
            desc,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
    Primitive(Primitive),
    Struct(Vec<FieldDescription>),
    Array { element: Arc<ValueDescription>, len: usize },
}

/// Runtime layout of a value
#[derive(Debug, Clone, PartialEq)]
pub struct ValueDescription {
    pub type_name: String,
    pub size: usize,
    pub align: usize,
    pub kind: ValueKind,
}

impl ValueDescription {
    pub fn primitive(primitive: Primitive) -> Self {
        Self {
            type_name: primitive.name().to_string(),
            size: primitive.size(),
            align: primitive.size(),
            kind: ValueKind::Primitive(primitive),
        }
    }

    pub fn structure(
        type_name: impl Into<String>,
        size: usize,
        align: usize,
        fields: Vec<FieldDescription>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            size,
            align,
            kind: ValueKind::Struct(fields),
        }
    }

    pub fn array(element: Arc<ValueDescription>, len: usize) -> Self {
        Self {
            type_name: format!("[{}; {}]", element.type_name, len),
            size: element.size * len,
            align: element.align,
            kind: ValueKind::Array { element, len },
        }
    }

    pub fn as_primitive(&self) -> Option<Primitive> {
        match self.kind {
            ValueKind::Primitive(p) => Some(p),
            _ => None,
        }
    }

    /// Bytes a buffer must hold to be decoded or encoded with this layout.
    fn required_len(&self) -> usize {
        match self.kind {
            ValueKind::Primitive(p) => self.size.max(p.size()),
            _ => self.size,
        }
    }

    fn layout_error(&self, offset: usize, available: usize) -> Error {
        Error::conversion(
            &self.type_name,
            &self.type_name,
            format!("member at byte {offset} lies outside the {available} available bytes"),
        )
    }

    /// Decode `bytes` (at least `self.size` long) into a [`Value`] tree.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        if bytes.len() < self.required_len() {
            return Err(Error::conversion(
                &self.type_name,
                &self.type_name,
                format!("need {} bytes but only {} were provided", self.required_len(), bytes.len()),
            ));
        }
        let value = match &self.kind {
            ValueKind::Primitive(p) => decode_primitive(*p, bytes),
            ValueKind::Struct(fields) => Value::Struct(
                fields
                    .iter()
                    .map(|field| {
                        let tail = bytes
                            .get(field.offset..)
                            .ok_or_else(|| self.layout_error(field.offset, bytes.len()))?;
                        Ok((field.name.clone(), field.desc.decode(tail)?))
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            ValueKind::Array { element, len } => Value::Array(
                (0..*len)
                    .map(|i| {
                        let offset = i.saturating_mul(element.size);
                        let tail = bytes.get(offset..).ok_or_else(|| self.layout_error(offset, bytes.len()))?;
                        element.decode(tail)
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
        };
        Ok(value)
    }

    /// Encode `value` into `out` using this description's layout.
    pub fn encode(&self, value: &Value, out: &mut [u8]) -> Result<()> {
        if out.len() < self.required_len() {
            return Err(Error::conversion(
                value.kind_name(),
                &self.type_name,
                "output buffer too small",
            ));
        }
        match (&self.kind, value) {
            (ValueKind::Primitive(p), _) => encode_primitive(*p, value, out),
            (ValueKind::Struct(fields), Value::Struct(source)) => {
                for field in fields {
                    let (_, field_value) = source.iter().find(|(name, _)| *name == field.name).ok_or_else(|| {
                        Error::conversion(value.kind_name(), &self.type_name, format!("missing field '{}'", field.name))
                    })?;
                    let available = out.len();
                    let tail = out
                        .get_mut(field.offset..)
                        .ok_or_else(|| self.layout_error(field.offset, available))?;
                    field.desc.encode(field_value, tail)?;
                }
                Ok(())
            }
            (ValueKind::Array { element, len }, Value::Array(items)) => {
                if items.len() != *len {
                    return Err(Error::conversion(
                        format!("array of {}", items.len()),
                        &self.type_name,
                        "length differs",
                    ));
                }
                for (i, item) in items.iter().enumerate() {
                    let offset = i.saturating_mul(element.size);
                    let available = out.len();
                    let tail = out.get_mut(offset..).ok_or_else(|| self.layout_error(offset, available))?;
                    element.encode(item, tail)?;
                }
                Ok(())
            }
            _ => Err(Error::conversion(value.kind_name(), &self.type_name, "shapes differ")),
        }
    }
}

impl fmt::Display for ValueDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.type_name)
    }
}

/// Decoded value, independent of layout
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Struct(Vec<(String, Value)>),
    Array(Vec<Value>),
}

impl Value {
    fn kind_name(&self) -> &'static str {
        match self {
            Value::Unsigned(_) => "unsigned integer",
            Value::Signed(_) => "signed integer",
            Value::Float(_) => "float",
            Value::Struct(_) => "struct",
            Value::Array(_) => "array",
        }
    }

    /// Integer view used by kernel size expressions.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Unsigned(v) => i64::try_from(v).ok(),
            Value::Signed(v) => Some(v),
            _ => None,
        }
    }
}

fn decode_primitive(p: Primitive, bytes: &[u8]) -> Value {
    match p {
        Primitive::U8 => Value::Unsigned(bytes[0] as u64),
        Primitive::U16 => Value::Unsigned(bytemuck::pod_read_unaligned::<u16>(&bytes[..2]) as u64),
        Primitive::U32 => Value::Unsigned(bytemuck::pod_read_unaligned::<u32>(&bytes[..4]) as u64),
        Primitive::U64 => Value::Unsigned(bytemuck::pod_read_unaligned::<u64>(&bytes[..8])),
        Primitive::I8 => Value::Signed(bytes[0] as i8 as i64),
        Primitive::I16 => Value::Signed(bytemuck::pod_read_unaligned::<i16>(&bytes[..2]) as i64),
        Primitive::I32 => Value::Signed(bytemuck::pod_read_unaligned::<i32>(&bytes[..4]) as i64),
        Primitive::I64 => Value::Signed(bytemuck::pod_read_unaligned::<i64>(&bytes[..8])),
        Primitive::F32 => Value::Float(bytemuck::pod_read_unaligned::<f32>(&bytes[..4]) as f64),
        Primitive::F64 => Value::Float(bytemuck::pod_read_unaligned::<f64>(&bytes[..8])),
    }
}

fn inexact(value: &Value, p: Primitive) -> Error {
    Error::conversion(
        format!("{value:?}"),
        p.name(),
        "value is not exactly representable",
    )
}

fn to_u64(value: &Value, p: Primitive) -> Result<u64> {
    match *value {
        Value::Unsigned(v) => Ok(v),
        Value::Signed(v) => u64::try_from(v).map_err(|_| inexact(value, p)),
        Value::Float(v) if v.fract() == 0.0 && v >= 0.0 && v < u64::MAX as f64 => Ok(v as u64),
        _ => Err(inexact(value, p)),
    }
}

fn to_i64(value: &Value, p: Primitive) -> Result<i64> {
    match *value {
        Value::Unsigned(v) => i64::try_from(v).map_err(|_| inexact(value, p)),
        Value::Signed(v) => Ok(v),
        Value::Float(v) if v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64 => Ok(v as i64),
        _ => Err(inexact(value, p)),
    }
}

fn to_f64(value: &Value, p: Primitive) -> Result<f64> {
    match *value {
        Value::Unsigned(v) if (v as f64) as u64 == v => Ok(v as f64),
        Value::Signed(v) if (v as f64) as i64 == v => Ok(v as f64),
        Value::Float(v) => Ok(v),
        _ => Err(inexact(value, p)),
    }
}

fn write<T: bytemuck::Pod>(out: &mut [u8], value: T) {
    out[..std::mem::size_of::<T>()].copy_from_slice(bytemuck::bytes_of(&value));
}

fn encode_primitive(p: Primitive, value: &Value, out: &mut [u8]) -> Result<()> {
    macro_rules! narrow {
        ($wide:expr, $ty:ty) => {
            write(out, <$ty>::try_from($wide).map_err(|_| inexact(value, p))?)
        };
    }
    match p {
        Primitive::U8 => narrow!(to_u64(value, p)?, u8),
        Primitive::U16 => narrow!(to_u64(value, p)?, u16),
        Primitive::U32 => narrow!(to_u64(value, p)?, u32),
        Primitive::U64 => write(out, to_u64(value, p)?),
        Primitive::I8 => narrow!(to_i64(value, p)?, i8),
        Primitive::I16 => narrow!(to_i64(value, p)?, i16),
        Primitive::I32 => narrow!(to_i64(value, p)?, i32),
        Primitive::I64 => write(out, to_i64(value, p)?),
        Primitive::F32 => {
            let v = to_f64(value, p)?;
            let narrowed = v as f32;
            if (narrowed as f64) != v && !v.is_nan() {
                return Err(inexact(value, p));
            }
            write(out, narrowed)
        }
        Primitive::F64 => write(out, to_f64(value, p)?),
    }
    Ok(())
}

/// Copy a value from one layout to another by matching structure.
///
/// Struct fields are matched by name; numbers convert only when exact.
pub fn copy_using_description(
    from: &ValueDescription,
    bytes: &[u8],
    to: &ValueDescription,
    out: &mut [u8],
) -> Result<()> {
    let value = from.decode(bytes)?;
    to.encode(&value, out).map_err(|err| match err {
        Error::TypeConversion { reason, .. } => Error::conversion(&from.type_name, &to.type_name, reason),
        other => other,
    })
}

/// Types with a runtime [`ValueDescription`].
pub trait Describe: 'static {
    fn describe() -> Arc<ValueDescription>;
}

macro_rules! describe_primitive {
    ($($ty:ty => $prim:ident),+ $(,)?) => {
        $(
            impl Describe for $ty {
                fn describe() -> Arc<ValueDescription> {
                    static DESC: OnceLock<Arc<ValueDescription>> = OnceLock::new();
                    DESC.get_or_init(|| Arc::new(ValueDescription::primitive(Primitive::$prim))).clone()
                }
            }
        )+
    };
}

describe_primitive! {
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    f32 => F32, f64 => F64,
}

impl<T: Describe, const N: usize> Describe for [T; N] {
    fn describe() -> Arc<ValueDescription> {
        Arc::new(ValueDescription::array(T::describe(), N))
    }
}

/// Implement [`Describe`] and scalar marshaling for a `#[repr(C)]` Pod struct.
///
/// ```rust
/// use compute_kernel::describe_struct;
///
/// #[repr(C)]
/// #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
/// struct TreeInfo {
///     nodes: u32,
///     depth: u32,
/// }
///
/// describe_struct!(TreeInfo { nodes: u32, depth: u32 });
/// ```
#[macro_export]
macro_rules! describe_struct {
    ($ty:ident { $($field:ident : $fty:ty),+ $(,)? }) => {
        impl $crate::types::Describe for $ty {
            fn describe() -> ::std::sync::Arc<$crate::types::ValueDescription> {
                static DESC: ::std::sync::OnceLock<::std::sync::Arc<$crate::types::ValueDescription>> =
                    ::std::sync::OnceLock::new();
                DESC.get_or_init(|| {
                    ::std::sync::Arc::new($crate::types::ValueDescription::structure(
                        stringify!($ty),
                        ::std::mem::size_of::<$ty>(),
                        ::std::mem::align_of::<$ty>(),
                        vec![$(
                            $crate::types::FieldDescription::new(
                                stringify!($field),
                                ::std::mem::offset_of!($ty, $field),
                                <$fty as $crate::types::Describe>::describe(),
                            )
                        ),+],
                    ))
                })
                .clone()
            }
        }

        impl $crate::marshal::KernelArg for $ty {
            fn kernel_type() -> $crate::types::KernelType {
                $crate::types::KernelType::scalar::<$ty>()
            }

            fn marshal(
                op: &str,
                arg: &$crate::memory::Argument,
                _ctx: &dyn $crate::context::ComputeContext,
            ) -> $crate::error::Result<(Self, Option<$crate::memory::Pin>)> {
                Ok(($crate::marshal::marshal_scalar::<$ty>(op, arg)?, None))
            }
        }
    };
}

fn type_registry() -> &'static RwLock<HashMap<String, Arc<ValueDescription>>> {
    static TYPES: OnceLock<RwLock<HashMap<String, Arc<ValueDescription>>>> = OnceLock::new();
    TYPES.get_or_init(|| {
        let mut types = HashMap::new();
        for p in Primitive::ALL {
            types.insert(p.name().to_string(), Arc::new(ValueDescription::primitive(p)));
        }
        RwLock::new(types)
    })
}

/// Make `desc` resolvable by name in parameter type expressions.
///
/// Registering an identical description twice is allowed.
pub fn register_type(desc: Arc<ValueDescription>) -> Result<()> {
    let mut types = type_registry().write();
    match types.get(&desc.type_name) {
        Some(existing) if **existing == *desc => Ok(()),
        Some(_) => Err(Error::DuplicateRegistration {
            registry: "value type".to_string(),
            name: desc.type_name.clone(),
        }),
        None => {
            types.insert(desc.type_name.clone(), desc);
            Ok(())
        }
    }
}

pub fn register_type_of<T: Describe>() -> Result<()> {
    register_type(T::describe())
}

pub fn lookup_type(name: &str) -> Result<Arc<ValueDescription>> {
    type_registry()
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| Error::UnknownType(name.to_string()))
}

/// Length declaration of an array parameter
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayLength {
    /// `T[]`, or inferred from a native span type
    Unbounded,
    /// `T[expr]`: at least `expr` elements
    Bounded(Expr),
    /// `T[=expr]`: exactly `expr` elements
    Exact(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Scalar,
    Array(ArrayLength),
}

/// Abstract type of a kernel parameter
#[derive(Debug, Clone, PartialEq)]
pub struct KernelType {
    pub base: Arc<ValueDescription>,
    pub shape: Shape,
    pub access: AccessMode,
}

impl KernelType {
    pub fn scalar<T: Describe>() -> Self {
        Self {
            base: T::describe(),
            shape: Shape::Scalar,
            access: AccessMode::ReadOnly,
        }
    }

    pub fn array<T: Describe>(access: AccessMode) -> Self {
        Self {
            base: T::describe(),
            shape: Shape::Array(ArrayLength::Unbounded),
            access,
        }
    }

    /// Parse a parameter type expression such as `u32`, `f32[]`,
    /// `u32[nf + 1]` or `TreeInfo[=1]`.
    pub fn parse(type_expr: &str, access: AccessMode) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidTypeExpression {
            expr: type_expr.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = type_expr.trim();
        let (base_name, shape) = match trimmed.find('[') {
            None => (trimmed, Shape::Scalar),
            Some(open) => {
                let inner = trimmed[open + 1..]
                    .strip_suffix(']')
                    .ok_or_else(|| invalid("array length must end with ']'"))?
                    .trim();
                let length = if inner.is_empty() {
                    ArrayLength::Unbounded
                } else if let Some(exact) = inner.strip_prefix('=') {
                    ArrayLength::Exact(Expr::parse(exact)?)
                } else {
                    ArrayLength::Bounded(Expr::parse(inner)?)
                };
                (trimmed[..open].trim(), Shape::Array(length))
            }
        };
        if base_name.is_empty() {
            return Err(invalid("missing base type"));
        }
        if shape == Shape::Scalar && access.is_writable() {
            return Err(invalid("scalar parameters are passed by value and cannot be written"));
        }
        Ok(Self {
            base: lookup_type(base_name)?,
            shape,
            access,
        })
    }

    pub fn is_array(&self) -> bool {
        matches!(self.shape, Shape::Array(_))
    }

    /// Check that a native parameter of type `native` may serve a parameter
    /// declared as `self`. Returns the reason when it may not.
    pub fn accepts(&self, native: &KernelType) -> std::result::Result<(), String> {
        // scalars are copied structurally, so only arrays need identical element types
        if self.is_array() && native.is_array() && self.base.type_name != native.base.type_name {
            return Err(format!("declared {} elements but native type holds {}", self.base, native.base));
        }
        if self.is_array() != native.is_array() {
            return Err(format!(
                "declared {} but native type is {}",
                if self.is_array() { "an array" } else { "a scalar" },
                if native.is_array() { "an array" } else { "a scalar" },
            ));
        }
        if native.access.is_writable() && !self.access.is_writable() {
            return Err("native type would write a read-only parameter".to_string());
        }
        Ok(())
    }
}

impl fmt::Display for KernelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.access, self.base)?;
        match &self.shape {
            Shape::Scalar => Ok(()),
            Shape::Array(ArrayLength::Unbounded) => f.write_str("[]"),
            Shape::Array(ArrayLength::Bounded(expr)) => write!(f, "[{expr}]"),
            Shape::Array(ArrayLength::Exact(expr)) => write!(f, "[={expr}]"),
        }
    }
}
