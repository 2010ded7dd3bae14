//! Wire encodings for call and reply payloads.
//!
//! The stream transport carries exact hexadecimal text; the shared segment
//! carries raw native bit patterns. Both are typed cursors behind the same
//! `ArgWriter` / `ArgReader` interface, so marshaling code never touches
//! byte offsets.
//!
//! ```text
//! HexText call:       add:3:4               scale:3;0x1p+0;0x1p+1;0x1.8p+1:3
//! HexText reply:      ;12:7                 ;12:3;0x1p+1;0x1p+2;0x1.8p+2
//! NativeBinary call:  add:<i32><i32>        scale:<u64 n><f64 * n><i32>
//! NativeBinary reply: <i64 µs><i32>         <i64 µs><u64 n><f64 * n>
//! ```

mod native;
mod text;

pub use native::{NativeReader, NativeWriter};
pub use text::{TextReader, TextWriter};

use crate::config::CommType;
use crate::error::{OffloadError, Result};
use crate::types::{ArrayBuffer, ArrayMut, Scalar, ScalarType};

/// Which encoding a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFormat {
    HexText,
    NativeBinary,
}

impl WireFormat {
    /// Encoding used by each transport.
    pub fn for_comm(comm: CommType) -> Self {
        match comm {
            CommType::Socket => WireFormat::HexText,
            CommType::SharedMem => WireFormat::NativeBinary,
        }
    }

    pub fn writer(&self) -> Box<dyn ArgWriter> {
        match self {
            WireFormat::HexText => Box::new(TextWriter::new()),
            WireFormat::NativeBinary => Box::new(NativeWriter::new()),
        }
    }

    pub fn reader<'a>(&self, data: &'a [u8]) -> Box<dyn ArgReader + 'a> {
        match self {
            WireFormat::HexText => Box::new(TextReader::new(data)),
            WireFormat::NativeBinary => Box::new(NativeReader::new(data)),
        }
    }

    /// Split a call payload into the function name and its argument bytes.
    pub fn split_call<'a>(&self, payload: &'a [u8]) -> Result<(&'a str, &'a [u8])> {
        let colon = payload.iter().position(|&b| b == b':');
        let (name, rest) = match (self, colon) {
            (WireFormat::HexText, Some(i)) => (&payload[..i], &payload[i..]),
            (WireFormat::HexText, None) => (payload, &payload[payload.len()..]),
            (WireFormat::NativeBinary, Some(i)) => (&payload[..i], &payload[i + 1..]),
            (WireFormat::NativeBinary, None) => {
                return Err(OffloadError::protocol("call without name terminator"))
            }
        };
        let name = std::str::from_utf8(name)
            .map_err(|_| OffloadError::protocol("function name is not UTF-8"))?;
        if name.is_empty() {
            return Err(OffloadError::protocol("call without function name"));
        }
        Ok((name, rest))
    }
}

/// Typed cursor appending to a payload.
pub trait ArgWriter: Send {
    /// Leading function name of a call.
    fn write_name(&mut self, name: &str);

    fn write_scalar(&mut self, value: &Scalar);

    fn write_array_len(&mut self, len: usize);

    fn write_element(&mut self, value: &Scalar);

    /// Leading execution time of a reply.
    fn write_exec_time(&mut self, micros: i64);

    fn len(&self) -> usize;

    fn into_bytes(self: Box<Self>) -> Vec<u8>;

    /// Element count followed by the first `count` elements of `array`.
    fn write_array(&mut self, element: ScalarType, array: &ArrayMut<'_>, count: usize) {
        self.write_array_len(count);
        for i in 0..count {
            self.write_element(&array.get(i, element));
        }
    }
}

/// Typed cursor over a received payload.
pub trait ArgReader {
    fn read_scalar(&mut self, ty: ScalarType) -> Result<Scalar>;

    /// Element count of an array; bounded by the bytes left in the payload.
    fn read_array_len(&mut self, element: ScalarType) -> Result<usize>;

    fn read_element(&mut self, ty: ScalarType) -> Result<Scalar>;

    fn read_exec_time(&mut self) -> Result<i64>;

    fn remaining(&self) -> usize;

    /// Fail if any bytes were left unread.
    fn finish(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(OffloadError::protocol(format!(
                "{} unexpected trailing bytes",
                n
            ))),
        }
    }

    /// Read an array into a freshly allocated buffer.
    fn read_array(&mut self, element: ScalarType) -> Result<ArrayBuffer> {
        let len = self.read_array_len(element)?;
        let mut buffer = ArrayBuffer::zeroed(element, len);
        let mut view = buffer.view_mut();
        for i in 0..len {
            let value = self.read_element(element)?;
            view.set(i, value)?;
        }
        Ok(buffer)
    }

    /// Read an array of exactly `expected` elements into caller memory.
    fn read_array_into(
        &mut self,
        element: ScalarType,
        target: &mut ArrayMut<'_>,
        expected: usize,
    ) -> Result<()> {
        let len = self.read_array_len(element)?;
        if len != expected {
            return Err(OffloadError::protocol(format!(
                "reply carries {} elements, {} were sent",
                len, expected
            )));
        }
        for i in 0..len {
            let value = self.read_element(element)?;
            target.set(i, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExtendedFloat, ExtendedFormat};

    fn formats() -> [WireFormat; 2] {
        [WireFormat::HexText, WireFormat::NativeBinary]
    }

    #[test]
    fn test_scalar_roundtrip_bit_exact() {
        let values = [
            Scalar::int(32, 0),
            Scalar::int(32, -1),
            Scalar::int(8, -128),
            Scalar::int(16, 0x7fff),
            Scalar::int(64, i64::MIN),
            Scalar::int(1, 1),
            Scalar::Float(f32::NAN),
            Scalar::Float(-0.0),
            Scalar::Float(f32::from_bits(1)),
            Scalar::Double(f64::NEG_INFINITY),
            Scalar::Double(f64::from_bits(0x000f_ffff_ffff_ffff)),
            Scalar::Double(-1.0),
            Scalar::Extended(ExtendedFloat::from_f64(ExtendedFormat::X87, -2.75)),
            Scalar::Extended(ExtendedFloat::from_bits(
                ExtendedFormat::Quad,
                0x3fff_8000_0000_0000_0000_0000_0000_0001,
            )),
        ];
        for format in formats() {
            for value in values {
                let mut writer = format.writer();
                writer.write_scalar(&value);
                let bytes = writer.into_bytes();

                let mut reader = format.reader(&bytes);
                let back = reader.read_scalar(value.scalar_type()).unwrap();
                reader.finish().unwrap();
                assert!(back.bit_eq(&value), "{:?}: {:?} != {:?}", format, back, value);
            }
        }
    }

    #[test]
    fn test_array_roundtrip_sizes() {
        for format in formats() {
            for n in [0usize, 1, 1000] {
                let mut data: Vec<f64> = (0..n).map(|i| i as f64 * 0.5 - 3.0).collect();
                let view = ArrayMut::from(&mut data);

                let mut writer = format.writer();
                writer.write_array(ScalarType::Double, &view, n);
                let bytes = writer.into_bytes();

                let mut reader = format.reader(&bytes);
                let mut buffer = reader.read_array(ScalarType::Double).unwrap();
                reader.finish().unwrap();
                assert_eq!(buffer.as_f64_mut().unwrap(), data.as_slice());
            }
        }
    }

    #[test]
    fn test_read_array_into_checks_count() {
        for format in formats() {
            let mut src = vec![1i32, 2, 3];
            let view = ArrayMut::from(&mut src);
            let mut writer = format.writer();
            writer.write_array(ScalarType::Integer(32), &view, 3);
            let bytes = writer.into_bytes();

            let mut dst = vec![0i32; 3];
            let mut target = ArrayMut::from(&mut dst);
            format
                .reader(&bytes)
                .read_array_into(ScalarType::Integer(32), &mut target, 3)
                .unwrap();
            assert_eq!(dst, vec![1, 2, 3]);

            let mut target = ArrayMut::from(&mut src);
            assert!(format
                .reader(&bytes)
                .read_array_into(ScalarType::Integer(32), &mut target, 2)
                .is_err());
        }
    }

    #[test]
    fn test_split_call() {
        let (name, rest) = WireFormat::HexText.split_call(b"add:3:4").unwrap();
        assert_eq!(name, "add");
        assert_eq!(rest, b":3:4");

        let (name, rest) = WireFormat::HexText.split_call(b"noop").unwrap();
        assert_eq!(name, "noop");
        assert!(rest.is_empty());

        let (name, rest) = WireFormat::NativeBinary.split_call(b"add:\x03").unwrap();
        assert_eq!(name, "add");
        assert_eq!(rest, b"\x03");

        assert!(WireFormat::NativeBinary.split_call(b"add").is_err());
        assert!(WireFormat::HexText.split_call(b":3").is_err());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        for format in formats() {
            let mut writer = format.writer();
            writer.write_scalar(&Scalar::Double(1.5));
            let mut bytes = writer.into_bytes();
            bytes.pop();
            let mut reader = format.reader(&bytes);
            // Text may still parse a shorter token; it must not equal the original.
            match reader.read_scalar(ScalarType::Double) {
                Ok(v) => assert_ne!(v, Scalar::Double(1.5)),
                Err(_) => {}
            }
        }
    }

    #[test]
    fn test_oversized_array_len_rejected() {
        for format in formats() {
            let mut writer = format.writer();
            writer.write_array_len(1 << 40);
            let bytes = writer.into_bytes();
            assert!(format
                .reader(&bytes)
                .read_array_len(ScalarType::Double)
                .is_err());
        }
    }
}
