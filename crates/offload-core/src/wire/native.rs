//! Raw native-endian encoding used on the shared segment.
//!
//! Both ends share one machine, so values travel as their in-memory bit
//! patterns: integers at storage width, `f32`/`f64` as-is, extended floats
//! in 16 bytes, array lengths as `u64`, execution time as `i64`.

use super::{ArgReader, ArgWriter};
use crate::error::{OffloadError, Result};
use crate::types::{int_storage_bits, ExtendedFloat, Scalar, ScalarType};

/// Appends raw native bytes.
#[derive(Debug, Default)]
pub struct NativeWriter {
    buf: Vec<u8>,
}

impl NativeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn put(&mut self, value: &Scalar) {
        match value {
            Scalar::Int { bits, value } => match int_storage_bits(*bits) {
                8 => self.buf.push(*value as u8),
                16 => self.buf.extend_from_slice(&(*value as u16).to_ne_bytes()),
                64 => self.buf.extend_from_slice(&value.to_ne_bytes()),
                _ => self.buf.extend_from_slice(&(*value as u32).to_ne_bytes()),
            },
            Scalar::Float(v) => self.buf.extend_from_slice(&v.to_ne_bytes()),
            Scalar::Double(v) => self.buf.extend_from_slice(&v.to_ne_bytes()),
            Scalar::Extended(e) => self.buf.extend_from_slice(&e.bits.to_ne_bytes()),
        }
    }
}

impl ArgWriter for NativeWriter {
    fn write_name(&mut self, name: &str) {
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(b':');
    }

    fn write_scalar(&mut self, value: &Scalar) {
        self.put(value);
    }

    fn write_array_len(&mut self, len: usize) {
        self.buf.extend_from_slice(&(len as u64).to_ne_bytes());
    }

    fn write_element(&mut self, value: &Scalar) {
        self.put(value);
    }

    fn write_exec_time(&mut self, micros: i64) {
        self.buf.extend_from_slice(&micros.to_ne_bytes());
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn into_bytes(self: Box<Self>) -> Vec<u8> {
        self.buf
    }
}

/// Reads raw native bytes.
#[derive(Debug)]
pub struct NativeReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> NativeReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos + N;
        let bytes = self.data.get(self.pos..end).ok_or_else(|| {
            OffloadError::protocol(format!(
                "need {} bytes at offset {}, message has {}",
                N,
                self.pos,
                self.data.len()
            ))
        })?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn get(&mut self, ty: ScalarType) -> Result<Scalar> {
        let value = match ty {
            ScalarType::Integer(bits) => {
                let raw = match int_storage_bits(bits) {
                    8 => self.take::<1>()?[0] as u64,
                    16 => u16::from_ne_bytes(self.take()?) as u64,
                    64 => u64::from_ne_bytes(self.take()?),
                    _ => u32::from_ne_bytes(self.take()?) as u64,
                };
                Scalar::Int { bits, value: raw }
            }
            ScalarType::Float => Scalar::Float(f32::from_ne_bytes(self.take()?)),
            ScalarType::Double => Scalar::Double(f64::from_ne_bytes(self.take()?)),
            ScalarType::X86Fp80 | ScalarType::Fp128 => {
                let format = ty
                    .extended_format()
                    .ok_or_else(|| OffloadError::UnsupportedType(ty.to_string()))?;
                let mut bits = u128::from_ne_bytes(self.take()?);
                if format == crate::types::ExtendedFormat::X87 {
                    // Bytes past the 80-bit value are padding.
                    bits &= (1u128 << 80) - 1;
                }
                Scalar::Extended(ExtendedFloat::from_bits(format, bits))
            }
        };
        Ok(value)
    }
}

impl ArgReader for NativeReader<'_> {
    fn read_scalar(&mut self, ty: ScalarType) -> Result<Scalar> {
        self.get(ty)
    }

    fn read_array_len(&mut self, element: ScalarType) -> Result<usize> {
        let len = u64::from_ne_bytes(self.take()?);
        let needed = len.saturating_mul(element.storage_bytes() as u64);
        if needed > self.remaining() as u64 {
            return Err(OffloadError::protocol(format!(
                "array of {} {} elements exceeds message",
                len, element
            )));
        }
        Ok(len as usize)
    }

    fn read_element(&mut self, ty: ScalarType) -> Result<Scalar> {
        self.get(ty)
    }

    fn read_exec_time(&mut self) -> Result<i64> {
        Ok(i64::from_ne_bytes(self.take()?))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_call_native_layout() {
        let mut w = Box::new(NativeWriter::new());
        w.write_name("add");
        w.write_scalar(&Scalar::i32(3));
        w.write_scalar(&Scalar::i32(4));
        let bytes = w.into_bytes();

        let mut expected = b"add:".to_vec();
        expected.extend_from_slice(&3i32.to_ne_bytes());
        expected.extend_from_slice(&4i32.to_ne_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_integer_widths() {
        let mut w = Box::new(NativeWriter::new());
        w.write_scalar(&Scalar::int(8, -1));
        w.write_scalar(&Scalar::int(16, -1));
        w.write_scalar(&Scalar::int(17, -1));
        w.write_scalar(&Scalar::int(64, -1));
        assert_eq!(w.len(), 1 + 2 + 4 + 8);
        let bytes = w.into_bytes();

        let mut r = NativeReader::new(&bytes);
        for bits in [8, 16, 17, 64] {
            let v = r.read_scalar(ScalarType::Integer(bits)).unwrap();
            assert_eq!(v.as_i64(), Some(-1), "i{}", bits);
        }
        r.finish().unwrap();
    }

    #[test]
    fn test_extended_takes_sixteen_bytes() {
        let value = Scalar::Extended(ExtendedFloat::from_f64(
            crate::types::ExtendedFormat::X87,
            1.0,
        ));
        let mut w = Box::new(NativeWriter::new());
        w.write_scalar(&value);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 16);
        assert!(NativeReader::new(&bytes)
            .read_scalar(ScalarType::X86Fp80)
            .unwrap()
            .bit_eq(&value));
    }

    #[test]
    fn test_short_read_is_protocol_error() {
        let mut r = NativeReader::new(&[1, 2, 3]);
        let err = r.read_scalar(ScalarType::Integer(32)).unwrap_err();
        assert!(matches!(err, OffloadError::Protocol { .. }));
    }
}
