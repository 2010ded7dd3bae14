//! Value model shared by both ends of a session.
//!
//! `ValueType` describes a parameter as the signature token spells it.
//! `Scalar` carries one primitive value with its exact bit pattern.
//! Arrays come in two flavours: `ArrayMut` borrows caller memory on the
//! client, `ArrayBuffer` owns the server's fresh copy.

use crate::error::{OffloadError, Result};
use crate::hexfloat::{convert_bits, FloatLayout};

/// Primitive element kinds that can cross the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    /// Integer of the given bit width.
    Integer(u32),
    Float,
    Double,
    /// x87 80-bit extended precision (`long double` on x86).
    X86Fp80,
    /// IEEE binary128.
    Fp128,
}

impl ScalarType {
    /// Width in bits as declared by the signature.
    pub fn bit_width(&self) -> u32 {
        match self {
            ScalarType::Integer(bits) => *bits,
            ScalarType::Float => 32,
            ScalarType::Double => 64,
            ScalarType::X86Fp80 => 80,
            ScalarType::Fp128 => 128,
        }
    }

    /// Bytes occupied by one native value of this type.
    ///
    /// Integer widths outside 8/16/32/64 are carried as a C `int`.
    pub fn storage_bytes(&self) -> usize {
        match self {
            ScalarType::Integer(bits) => int_storage_bits(*bits) as usize / 8,
            ScalarType::Float => 4,
            ScalarType::Double => 8,
            ScalarType::X86Fp80 | ScalarType::Fp128 => 16,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, ScalarType::Integer(_))
    }

    /// Extended formats carried as raw bits in an `ExtendedFloat`.
    pub fn extended_format(&self) -> Option<ExtendedFormat> {
        match self {
            ScalarType::X86Fp80 => Some(ExtendedFormat::X87),
            ScalarType::Fp128 => Some(ExtendedFormat::Quad),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScalarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarType::Integer(bits) => write!(f, "i{}", bits),
            ScalarType::Float => write!(f, "float"),
            ScalarType::Double => write!(f, "double"),
            ScalarType::X86Fp80 => write!(f, "x86_fp80"),
            ScalarType::Fp128 => write!(f, "fp128"),
        }
    }
}

/// Storage width for an integer of `bits` declared bits.
pub fn int_storage_bits(bits: u32) -> u32 {
    match bits {
        8 | 16 | 32 | 64 => bits,
        _ => 32,
    }
}

/// Whether `value` is representable at `bits`, read as signed or unsigned.
fn int_fits(bits: u32, value: i64) -> bool {
    let width = int_storage_bits(bits);
    if width == 64 {
        return true;
    }
    let min = -(1i64 << (width - 1));
    let max = (1i64 << width) - 1;
    (min..=max).contains(&value)
}

fn int_mask(bits: u32) -> u64 {
    match int_storage_bits(bits) {
        64 => u64::MAX,
        n => (1u64 << n) - 1,
    }
}

/// Type of a return value or parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    Void,
    Scalar(ScalarType),
    Pointer(Box<ValueType>),
    /// Fixed-size array, only meaningful inside a pointee chain.
    Array(Box<ValueType>),
}

impl ValueType {
    pub fn pointer_to(inner: ValueType) -> Self {
        ValueType::Pointer(Box::new(inner))
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, ValueType::Pointer(_))
    }

    /// Effective scalar element, walking through pointer and array wrappers.
    pub fn element(&self) -> Option<ScalarType> {
        match self {
            ValueType::Void => None,
            ValueType::Scalar(s) => Some(*s),
            ValueType::Pointer(inner) | ValueType::Array(inner) => inner.element(),
        }
    }

    pub fn as_scalar(&self) -> Option<ScalarType> {
        match self {
            ValueType::Scalar(s) => Some(*s),
            _ => None,
        }
    }
}

impl From<ScalarType> for ValueType {
    fn from(s: ScalarType) -> Self {
        ValueType::Scalar(s)
    }
}

/// Wide floating formats with no native Rust type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtendedFormat {
    X87,
    Quad,
}

impl ExtendedFormat {
    pub fn layout(&self) -> FloatLayout {
        match self {
            ExtendedFormat::X87 => FloatLayout::X87,
            ExtendedFormat::Quad => FloatLayout::QUAD,
        }
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            ExtendedFormat::X87 => ScalarType::X86Fp80,
            ExtendedFormat::Quad => ScalarType::Fp128,
        }
    }
}

/// Bit-exact storage for an extended-precision value.
///
/// x87 values occupy the low 80 bits, like a C `long double` in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtendedFloat {
    pub format: ExtendedFormat,
    pub bits: u128,
}

impl ExtendedFloat {
    pub fn from_bits(format: ExtendedFormat, bits: u128) -> Self {
        Self { format, bits }
    }

    /// Exact widening from a double.
    pub fn from_f64(format: ExtendedFormat, value: f64) -> Self {
        Self {
            format,
            bits: convert_bits(FloatLayout::F64, format.layout(), value.to_bits() as u128),
        }
    }

    /// Round to the nearest double.
    pub fn to_f64(&self) -> f64 {
        f64::from_bits(convert_bits(self.format.layout(), FloatLayout::F64, self.bits) as u64)
    }

    pub fn convert(&self, format: ExtendedFormat) -> Self {
        if format == self.format {
            return *self;
        }
        Self {
            format,
            bits: convert_bits(self.format.layout(), format.layout(), self.bits),
        }
    }
}

/// One primitive value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    /// Integer bit pattern truncated to its storage width.
    Int { bits: u32, value: u64 },
    Float(f32),
    Double(f64),
    Extended(ExtendedFloat),
}

impl Scalar {
    /// Integer of `bits` declared bits from a signed value.
    pub fn int(bits: u32, value: i64) -> Self {
        Scalar::Int {
            bits,
            value: value as u64 & int_mask(bits),
        }
    }

    pub fn i32(value: i32) -> Self {
        Scalar::int(32, value as i64)
    }

    pub fn i64(value: i64) -> Self {
        Scalar::int(64, value)
    }

    pub fn zero(ty: ScalarType) -> Self {
        match ty {
            ScalarType::Integer(bits) => Scalar::int(bits, 0),
            ScalarType::Float => Scalar::Float(0.0),
            ScalarType::Double => Scalar::Double(0.0),
            ScalarType::X86Fp80 => {
                Scalar::Extended(ExtendedFloat::from_bits(ExtendedFormat::X87, 0))
            }
            ScalarType::Fp128 => {
                Scalar::Extended(ExtendedFloat::from_bits(ExtendedFormat::Quad, 0))
            }
        }
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Scalar::Int { bits, .. } => ScalarType::Integer(*bits),
            Scalar::Float(_) => ScalarType::Float,
            Scalar::Double(_) => ScalarType::Double,
            Scalar::Extended(e) => e.format.scalar_type(),
        }
    }

    /// Sign-extended integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int { bits, value } => {
                let width = int_storage_bits(*bits);
                let shift = 64 - width;
                Some(((*value << shift) as i64) >> shift)
            }
            _ => None,
        }
    }

    /// Floating value rounded to a double.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Float(v) => Some(*v as f64),
            Scalar::Double(v) => Some(*v),
            Scalar::Extended(e) => Some(e.to_f64()),
            Scalar::Int { .. } => None,
        }
    }

    /// Raw bit pattern, zero-extended.
    pub fn to_bits(&self) -> u128 {
        match self {
            Scalar::Int { value, .. } => *value as u128,
            Scalar::Float(v) => v.to_bits() as u128,
            Scalar::Double(v) => v.to_bits() as u128,
            Scalar::Extended(e) => e.bits,
        }
    }

    /// Same type and same bit pattern (NaN compares equal to itself).
    pub fn bit_eq(&self, other: &Scalar) -> bool {
        self.scalar_type() == other.scalar_type() && self.to_bits() == other.to_bits()
    }

    /// Convert to `target`, the type the signature declares.
    ///
    /// Integers are re-truncated to the target width; floating kinds convert
    /// through exact widening or nearest-even narrowing. Mixing integer and
    /// floating kinds is an argument mismatch.
    pub fn coerce(self, target: ScalarType) -> Result<Scalar> {
        if self.scalar_type() == target {
            return Ok(self);
        }
        let converted = match (self, target) {
            (Scalar::Int { .. }, ScalarType::Integer(bits)) => {
                let value = self.as_i64().filter(|v| int_fits(bits, *v)).ok_or_else(|| {
                    OffloadError::argument(format!("{:?} does not fit in {}", self, target))
                })?;
                Some(Scalar::int(bits, value))
            }
            (Scalar::Float(v), ScalarType::Double) => Some(Scalar::Double(v as f64)),
            (Scalar::Double(v), ScalarType::Float) => Some(Scalar::Float(v as f32)),
            (Scalar::Float(v), t) if t.extended_format().is_some() => t
                .extended_format()
                .map(|fmt| Scalar::Extended(ExtendedFloat::from_f64(fmt, v as f64))),
            (Scalar::Double(v), t) if t.extended_format().is_some() => t
                .extended_format()
                .map(|fmt| Scalar::Extended(ExtendedFloat::from_f64(fmt, v))),
            (Scalar::Extended(e), ScalarType::Double) => Some(Scalar::Double(e.to_f64())),
            (Scalar::Extended(e), ScalarType::Float) => Some(Scalar::Float(e.to_f64() as f32)),
            (Scalar::Extended(e), t) => t
                .extended_format()
                .map(|fmt| Scalar::Extended(e.convert(fmt))),
            _ => None,
        };
        converted.ok_or_else(|| {
            OffloadError::argument(format!(
                "cannot pass {} value as {}",
                self.scalar_type(),
                target
            ))
        })
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::i32(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::i64(v)
    }
}

impl From<f32> for Scalar {
    fn from(v: f32) -> Self {
        Scalar::Float(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Double(v)
    }
}

/// Borrowed caller memory behind a pointer argument.
#[derive(Debug)]
pub enum ArrayMut<'a> {
    I8(&'a mut [i8]),
    I16(&'a mut [i16]),
    I32(&'a mut [i32]),
    I64(&'a mut [i64]),
    F32(&'a mut [f32]),
    F64(&'a mut [f64]),
    Extended(ExtendedFormat, &'a mut [u128]),
}

/// Owned array on the receiving side of a call.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayBuffer {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Extended(ExtendedFormat, Vec<u128>),
}

macro_rules! array_from_slice {
    ($($ty:ty => $variant:ident),*) => {
        $(
            impl<'a> From<&'a mut [$ty]> for ArrayMut<'a> {
                fn from(slice: &'a mut [$ty]) -> Self {
                    ArrayMut::$variant(slice)
                }
            }

            impl<'a, const N: usize> From<&'a mut [$ty; N]> for ArrayMut<'a> {
                fn from(slice: &'a mut [$ty; N]) -> Self {
                    ArrayMut::$variant(slice.as_mut_slice())
                }
            }

            impl<'a> From<&'a mut Vec<$ty>> for ArrayMut<'a> {
                fn from(v: &'a mut Vec<$ty>) -> Self {
                    ArrayMut::$variant(v.as_mut_slice())
                }
            }
        )*
    };
}

array_from_slice!(i8 => I8, i16 => I16, i32 => I32, i64 => I64, f32 => F32, f64 => F64);

impl<'a> ArrayMut<'a> {
    pub fn len(&self) -> usize {
        match self {
            ArrayMut::I8(s) => s.len(),
            ArrayMut::I16(s) => s.len(),
            ArrayMut::I32(s) => s.len(),
            ArrayMut::I64(s) => s.len(),
            ArrayMut::F32(s) => s.len(),
            ArrayMut::F64(s) => s.len(),
            ArrayMut::Extended(_, s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this memory can hold elements of `element`.
    pub fn holds(&self, element: ScalarType) -> bool {
        match (self, element) {
            (ArrayMut::I8(_), ScalarType::Integer(bits)) => int_storage_bits(bits) == 8,
            (ArrayMut::I16(_), ScalarType::Integer(bits)) => int_storage_bits(bits) == 16,
            (ArrayMut::I32(_), ScalarType::Integer(bits)) => int_storage_bits(bits) == 32,
            (ArrayMut::I64(_), ScalarType::Integer(bits)) => int_storage_bits(bits) == 64,
            (ArrayMut::F32(_), ScalarType::Float) => true,
            (ArrayMut::F64(_), ScalarType::Double) => true,
            (ArrayMut::Extended(fmt, _), t) => t.extended_format() == Some(*fmt),
            _ => false,
        }
    }

    /// Element `i` as a scalar of the given element type.
    pub fn get(&self, i: usize, element: ScalarType) -> Scalar {
        let bits = element.bit_width();
        match self {
            ArrayMut::I8(s) => Scalar::int(bits, s[i] as i64),
            ArrayMut::I16(s) => Scalar::int(bits, s[i] as i64),
            ArrayMut::I32(s) => Scalar::int(bits, s[i] as i64),
            ArrayMut::I64(s) => Scalar::int(bits, s[i]),
            ArrayMut::F32(s) => Scalar::Float(s[i]),
            ArrayMut::F64(s) => Scalar::Double(s[i]),
            ArrayMut::Extended(fmt, s) => Scalar::Extended(ExtendedFloat::from_bits(*fmt, s[i])),
        }
    }

    /// Overwrite element `i`; the scalar must already match the element kind.
    pub fn set(&mut self, i: usize, value: Scalar) -> Result<()> {
        match (self, value) {
            (ArrayMut::I8(s), Scalar::Int { .. }) => s[i] = value.as_i64().unwrap_or(0) as i8,
            (ArrayMut::I16(s), Scalar::Int { .. }) => s[i] = value.as_i64().unwrap_or(0) as i16,
            (ArrayMut::I32(s), Scalar::Int { .. }) => s[i] = value.as_i64().unwrap_or(0) as i32,
            (ArrayMut::I64(s), Scalar::Int { .. }) => s[i] = value.as_i64().unwrap_or(0),
            (ArrayMut::F32(s), Scalar::Float(v)) => s[i] = v,
            (ArrayMut::F64(s), Scalar::Double(v)) => s[i] = v,
            (ArrayMut::Extended(fmt, s), Scalar::Extended(e)) if e.format == *fmt => s[i] = e.bits,
            (_, other) => {
                return Err(OffloadError::argument(format!(
                    "cannot store {} value in array element",
                    other.scalar_type()
                )))
            }
        }
        Ok(())
    }
}

impl ArrayBuffer {
    /// Zero-filled buffer of `len` elements of `element`.
    pub fn zeroed(element: ScalarType, len: usize) -> Self {
        match element {
            ScalarType::Integer(bits) => match int_storage_bits(bits) {
                8 => ArrayBuffer::I8(vec![0; len]),
                16 => ArrayBuffer::I16(vec![0; len]),
                64 => ArrayBuffer::I64(vec![0; len]),
                _ => ArrayBuffer::I32(vec![0; len]),
            },
            ScalarType::Float => ArrayBuffer::F32(vec![0.0; len]),
            ScalarType::Double => ArrayBuffer::F64(vec![0.0; len]),
            ScalarType::X86Fp80 => ArrayBuffer::Extended(ExtendedFormat::X87, vec![0; len]),
            ScalarType::Fp128 => ArrayBuffer::Extended(ExtendedFormat::Quad, vec![0; len]),
        }
    }

    /// Mutable element view, shared with caller-side arrays.
    pub fn view_mut(&mut self) -> ArrayMut<'_> {
        match self {
            ArrayBuffer::I8(v) => ArrayMut::I8(v.as_mut_slice()),
            ArrayBuffer::I16(v) => ArrayMut::I16(v.as_mut_slice()),
            ArrayBuffer::I32(v) => ArrayMut::I32(v.as_mut_slice()),
            ArrayBuffer::I64(v) => ArrayMut::I64(v.as_mut_slice()),
            ArrayBuffer::F32(v) => ArrayMut::F32(v.as_mut_slice()),
            ArrayBuffer::F64(v) => ArrayMut::F64(v.as_mut_slice()),
            ArrayBuffer::Extended(fmt, v) => ArrayMut::Extended(*fmt, v.as_mut_slice()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayBuffer::I8(v) => v.len(),
            ArrayBuffer::I16(v) => v.len(),
            ArrayBuffer::I32(v) => v.len(),
            ArrayBuffer::I64(v) => v.len(),
            ArrayBuffer::F32(v) => v.len(),
            ArrayBuffer::F64(v) => v.len(),
            ArrayBuffer::Extended(_, v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_f64_mut(&mut self) -> Option<&mut [f64]> {
        match self {
            ArrayBuffer::F64(v) => Some(v.as_mut_slice()),
            _ => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match self {
            ArrayBuffer::F32(v) => Some(v.as_mut_slice()),
            _ => None,
        }
    }

    pub fn as_i32_mut(&mut self) -> Option<&mut [i32]> {
        match self {
            ArrayBuffer::I32(v) => Some(v.as_mut_slice()),
            _ => None,
        }
    }

    pub fn as_i64_mut(&mut self) -> Option<&mut [i64]> {
        match self {
            ArrayBuffer::I64(v) => Some(v.as_mut_slice()),
            _ => None,
        }
    }
}

/// A caller-side argument, in call-site order.
#[derive(Debug)]
pub enum Arg<'a> {
    Scalar(Scalar),
    /// Pointer to caller memory; must be followed by its element count.
    Array(ArrayMut<'a>),
}

impl<'a> Arg<'a> {
    pub fn scalar(value: impl Into<Scalar>) -> Self {
        Arg::Scalar(value.into())
    }

    pub fn array(memory: impl Into<ArrayMut<'a>>) -> Self {
        Arg::Array(memory.into())
    }

    /// Element count argument for the preceding pointer.
    ///
    /// Held at 64 bits; marshaling narrows it to the declared count type
    /// and rejects counts that do not fit.
    pub fn count(n: usize) -> Self {
        Arg::Scalar(Scalar::i64(i64::try_from(n).unwrap_or(i64::MAX)))
    }

    pub fn as_scalar(&self) -> Option<Scalar> {
        match self {
            Arg::Scalar(s) => Some(*s),
            Arg::Array(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_scalar().and_then(|s| s.as_i64())
    }

    pub fn as_f64_mut(&mut self) -> Option<&mut [f64]> {
        match self {
            Arg::Array(ArrayMut::F64(s)) => Some(&mut s[..]),
            _ => None,
        }
    }
}

/// A server-side argument or return value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Scalar(Scalar),
    Array(ArrayBuffer),
}

impl Value {
    pub fn as_scalar(&self) -> Option<Scalar> {
        match self {
            Value::Scalar(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_scalar().and_then(|s| s.as_i64())
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_scalar().and_then(|s| s.as_f64())
    }

    pub fn array_mut(&mut self) -> Option<&mut ArrayBuffer> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }
}

impl From<Scalar> for Value {
    fn from(s: Scalar) -> Self {
        Value::Scalar(s)
    }
}
