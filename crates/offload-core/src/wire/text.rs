//! Hexadecimal text encoding used on the stream transport.
//!
//! Scalars are `:`-prefixed tokens, array elements `;`-prefixed tokens.
//! Integers are the hex of their width-truncated bit pattern, floats are
//! exact hex-float text.

use super::{ArgReader, ArgWriter};
use crate::error::{OffloadError, Result};
use crate::hexfloat::{format_bits, format_f32, format_f64, parse_bits, parse_f32, parse_f64};
use crate::types::{ExtendedFloat, Scalar, ScalarType};

fn format_token(value: &Scalar) -> String {
    match value {
        Scalar::Int { value, .. } => format!("{:x}", value),
        Scalar::Float(v) => format_f32(*v),
        Scalar::Double(v) => format_f64(*v),
        Scalar::Extended(e) => format_bits(e.format.layout(), e.bits),
    }
}

fn parse_token(token: &str, ty: ScalarType) -> Result<Scalar> {
    match ty {
        ScalarType::Integer(bits) => {
            let (neg, digits) = match token.strip_prefix('-') {
                Some(d) => (true, d),
                None => (false, token),
            };
            let magnitude = u64::from_str_radix(digits, 16).map_err(|_| {
                OffloadError::protocol(format!("invalid hex integer '{}'", token))
            })?;
            let value = if neg {
                (magnitude as i64).wrapping_neg()
            } else {
                magnitude as i64
            };
            Ok(Scalar::int(bits, value))
        }
        ScalarType::Float => Ok(Scalar::Float(parse_f32(token)?)),
        ScalarType::Double => Ok(Scalar::Double(parse_f64(token)?)),
        ScalarType::X86Fp80 | ScalarType::Fp128 => {
            let format = ty
                .extended_format()
                .ok_or_else(|| OffloadError::UnsupportedType(ty.to_string()))?;
            let bits = parse_bits(format.layout(), token)?;
            Ok(Scalar::Extended(ExtendedFloat::from_bits(format, bits)))
        }
    }
}

/// Appends hex text tokens.
#[derive(Debug, Default)]
pub struct TextWriter {
    buf: Vec<u8>,
}

impl TextWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArgWriter for TextWriter {
    fn write_name(&mut self, name: &str) {
        self.buf.extend_from_slice(name.as_bytes());
    }

    fn write_scalar(&mut self, value: &Scalar) {
        self.buf.push(b':');
        self.buf.extend_from_slice(format_token(value).as_bytes());
    }

    fn write_array_len(&mut self, len: usize) {
        self.buf.push(b':');
        self.buf.extend_from_slice(len.to_string().as_bytes());
    }

    fn write_element(&mut self, value: &Scalar) {
        self.buf.push(b';');
        self.buf.extend_from_slice(format_token(value).as_bytes());
    }

    fn write_exec_time(&mut self, micros: i64) {
        self.buf.push(b';');
        self.buf.extend_from_slice(micros.to_string().as_bytes());
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn into_bytes(self: Box<Self>) -> Vec<u8> {
        self.buf
    }
}

/// Reads hex text tokens.
#[derive(Debug)]
pub struct TextReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TextReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn expect(&mut self, delimiter: u8) -> Result<()> {
        match self.data.get(self.pos) {
            Some(&b) if b == delimiter => {
                self.pos += 1;
                Ok(())
            }
            Some(&b) => Err(OffloadError::protocol(format!(
                "expected '{}' at offset {}, found '{}'",
                delimiter as char,
                self.pos,
                b.escape_ascii()
            ))),
            None => Err(OffloadError::protocol(format!(
                "expected '{}' at offset {}, found end of message",
                delimiter as char, self.pos
            ))),
        }
    }

    /// Bytes up to the next delimiter or the end of the message.
    fn token(&mut self) -> Result<&'a str> {
        let start = self.pos;
        let len = self.data[start..]
            .iter()
            .position(|&b| b == b':' || b == b';')
            .unwrap_or(self.data.len() - start);
        self.pos += len;
        if len == 0 {
            return Err(OffloadError::protocol(format!("empty token at offset {}", start)));
        }
        std::str::from_utf8(&self.data[start..start + len])
            .map_err(|_| OffloadError::protocol("token is not ASCII"))
    }

    fn decimal<T: std::str::FromStr>(&mut self) -> Result<T> {
        let token = self.token()?;
        token
            .parse::<T>()
            .map_err(|_| OffloadError::protocol(format!("invalid decimal '{}'", token)))
    }
}

impl ArgReader for TextReader<'_> {
    fn read_scalar(&mut self, ty: ScalarType) -> Result<Scalar> {
        self.expect(b':')?;
        parse_token(self.token()?, ty)
    }

    fn read_array_len(&mut self, _element: ScalarType) -> Result<usize> {
        self.expect(b':')?;
        let len: usize = self.decimal()?;
        // Every element needs at least a delimiter and one digit.
        if len > self.remaining() / 2 {
            return Err(OffloadError::protocol(format!(
                "array of {} elements exceeds message",
                len
            )));
        }
        Ok(len)
    }

    fn read_element(&mut self, ty: ScalarType) -> Result<Scalar> {
        self.expect(b';')?;
        parse_token(self.token()?, ty)
    }

    fn read_exec_time(&mut self) -> Result<i64> {
        self.expect(b';')?;
        self.decimal()
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}
