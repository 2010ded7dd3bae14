//! Compact signature tokens.
//!
//! A token names a function and spells out its full type in ASCII:
//!
//! ```text
//! RetType[;RetBitwidth]:FuncName[:ArgType[;ArgBitwidth][;PointeeType[;PointeeBitwidth]]]*
//!
//! 5;32:add:5;32:5;32        i32 add(i32, i32)
//! 0:scale:9;2:5;32          void scale(double *, i32)
//! ```
//!
//! Type tags: `0` void, `1` float, `2` double, `3` x86_fp80, `4` fp128,
//! `5;<bits>` integer, `8;<inner>` array, `9;<pointee>` pointer. Pointer and
//! array tags nest, so `9;9;2` is a pointer to a pointer to double.

use crate::error::{OffloadError, Result};
use crate::types::{ScalarType, ValueType};

const TAG_VOID: u32 = 0;
const TAG_FLOAT: u32 = 1;
const TAG_DOUBLE: u32 = 2;
const TAG_X86_FP80: u32 = 3;
const TAG_FP128: u32 = 4;
const TAG_INTEGER: u32 = 5;
const TAG_ARRAY: u32 = 8;
const TAG_POINTER: u32 = 9;

/// A decoded function signature.
///
/// Construction validates the calling convention: every pointer parameter
/// is immediately followed by an integer element count.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionSignature {
    ret: ValueType,
    name: String,
    params: Vec<ValueType>,
}

impl FunctionSignature {
    pub fn new(ret: ValueType, name: impl Into<String>, params: Vec<ValueType>) -> Result<Self> {
        let sig = Self {
            ret,
            name: name.into(),
            params,
        };
        sig.validate()?;
        Ok(sig)
    }

    pub fn ret(&self) -> &ValueType {
        &self.ret
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    /// Scalar return type, `None` for void.
    pub fn ret_scalar(&self) -> Option<ScalarType> {
        self.ret.as_scalar()
    }

    /// Element type of the pointer at `index`.
    pub fn pointee(&self, index: usize) -> Option<ScalarType> {
        match self.params.get(index) {
            Some(ValueType::Pointer(inner)) => inner.element(),
            _ => None,
        }
    }

    /// Indices of pointer parameters, in order.
    pub fn pointer_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_pointer())
            .map(|(i, _)| i)
    }

    /// Encode as a signature token.
    pub fn token(&self) -> String {
        SignatureCodec::encode(self)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty()
            || self
                .name
                .chars()
                .any(|c| c == ':' || c == ';' || c.is_whitespace() || c == '\0')
        {
            return Err(OffloadError::MalformedSignature {
                token: self.name.clone(),
                message: "invalid function name".to_string(),
            });
        }

        match &self.ret {
            ValueType::Void | ValueType::Scalar(_) => {}
            other => {
                return Err(OffloadError::UnsupportedType(format!(
                    "return type {:?} of {}",
                    other, self.name
                )))
            }
        }

        for (index, param) in self.params.iter().enumerate() {
            match param {
                ValueType::Scalar(_) => {}
                ValueType::Pointer(inner) => {
                    if inner.element().is_none() {
                        return Err(OffloadError::UnsupportedType(format!(
                            "pointer to void at parameter {} of {}",
                            index, self.name
                        )));
                    }
                    match self.params.get(index + 1) {
                        Some(ValueType::Scalar(ScalarType::Integer(_))) => {}
                        _ => return Err(OffloadError::MissingElementCount { index }),
                    }
                }
                other => {
                    return Err(OffloadError::UnsupportedType(format!(
                        "parameter {} of {}: {:?}",
                        index, self.name, other
                    )))
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.token())
    }
}

impl std::str::FromStr for FunctionSignature {
    type Err = OffloadError;

    fn from_str(s: &str) -> Result<Self> {
        SignatureCodec::decode(s)
    }
}

/// Encoder/decoder for signature tokens.
pub struct SignatureCodec;

impl SignatureCodec {
    /// Encode a signature as a token.
    pub fn encode(sig: &FunctionSignature) -> String {
        let mut token = Self::encode_type(&sig.ret);
        token.push(':');
        token.push_str(&sig.name);
        for param in &sig.params {
            token.push(':');
            token.push_str(&Self::encode_type(param));
        }
        token
    }

    /// Encode one type as its `;`-separated sub-field list.
    pub fn encode_type(ty: &ValueType) -> String {
        match ty {
            ValueType::Void => TAG_VOID.to_string(),
            ValueType::Scalar(ScalarType::Float) => TAG_FLOAT.to_string(),
            ValueType::Scalar(ScalarType::Double) => TAG_DOUBLE.to_string(),
            ValueType::Scalar(ScalarType::X86Fp80) => TAG_X86_FP80.to_string(),
            ValueType::Scalar(ScalarType::Fp128) => TAG_FP128.to_string(),
            ValueType::Scalar(ScalarType::Integer(bits)) => format!("{};{}", TAG_INTEGER, bits),
            ValueType::Array(inner) => format!("{};{}", TAG_ARRAY, Self::encode_type(inner)),
            ValueType::Pointer(inner) => format!("{};{}", TAG_POINTER, Self::encode_type(inner)),
        }
    }

    /// Decode a token into a validated signature.
    pub fn decode(token: &str) -> Result<FunctionSignature> {
        let malformed = |message: &str| OffloadError::MalformedSignature {
            token: token.to_string(),
            message: message.to_string(),
        };

        let mut fields = token.split(':');
        let ret_field = fields
            .next()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| malformed("missing return type"))?;
        let name = fields.next().ok_or_else(|| malformed("missing function name"))?;
        let ret = Self::decode_type(ret_field).map_err(|e| match e {
            OffloadError::MalformedSignature { message, .. } => malformed(&message),
            other => other,
        })?;

        let params = fields
            .map(|field| {
                Self::decode_type(field).map_err(|e| match e {
                    OffloadError::MalformedSignature { message, .. } => malformed(&message),
                    other => other,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        FunctionSignature::new(ret, name, params)
    }

    /// Decode one `;`-separated type field.
    pub fn decode_type(field: &str) -> Result<ValueType> {
        let mut parts = field.split(';').map(|part| {
            part.parse::<u32>().map_err(|_| OffloadError::MalformedSignature {
                token: field.to_string(),
                message: format!("'{}' is not a type number", part),
            })
        });
        let ty = Self::decode_chain(field, &mut parts)?;
        if parts.next().is_some() {
            return Err(OffloadError::MalformedSignature {
                token: field.to_string(),
                message: "trailing sub-fields".to_string(),
            });
        }
        Ok(ty)
    }

    fn decode_chain<I>(field: &str, parts: &mut I) -> Result<ValueType>
    where
        I: Iterator<Item = Result<u32>>,
    {
        let tag = parts.next().ok_or_else(|| OffloadError::MalformedSignature {
            token: field.to_string(),
            message: "missing type tag".to_string(),
        })??;

        let ty = match tag {
            TAG_VOID => ValueType::Void,
            TAG_FLOAT => ValueType::Scalar(ScalarType::Float),
            TAG_DOUBLE => ValueType::Scalar(ScalarType::Double),
            TAG_X86_FP80 => ValueType::Scalar(ScalarType::X86Fp80),
            TAG_FP128 => ValueType::Scalar(ScalarType::Fp128),
            TAG_INTEGER => {
                let bits = parts.next().ok_or_else(|| OffloadError::MalformedSignature {
                    token: field.to_string(),
                    message: "integer without bit width".to_string(),
                })??;
                if bits == 0 {
                    return Err(OffloadError::MalformedSignature {
                        token: field.to_string(),
                        message: "integer of zero bits".to_string(),
                    });
                }
                ValueType::Scalar(ScalarType::Integer(bits))
            }
            TAG_ARRAY => ValueType::Array(Box::new(Self::decode_chain(field, parts)?)),
            TAG_POINTER => ValueType::Pointer(Box::new(Self::decode_chain(field, parts)?)),
            other => return Err(OffloadError::UnsupportedType(format!("type tag {}", other))),
        };
        Ok(ty)
    }
}
