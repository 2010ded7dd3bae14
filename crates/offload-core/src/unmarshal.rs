//! Server-side unmarshaling.
//!
//! The server's declared signature is authoritative: arguments are read as
//! the declared types, pointer arguments become fresh buffers, and after
//! execution those buffers travel back ahead of the return value.

use crate::error::{OffloadError, Result};
use crate::signature::FunctionSignature;
use crate::types::{Value, ValueType};
use crate::wire::WireFormat;

/// Arguments reconstructed from a call payload.
#[derive(Debug, Clone, PartialEq)]
pub struct UnmarshaledCall {
    pub args: Vec<Value>,
    /// Indices of pointer arguments whose buffers go back in the reply.
    pub pending: Vec<usize>,
}

/// Decodes calls and encodes replies for one wire format.
#[derive(Debug, Clone, Copy)]
pub struct Unmarshaler {
    format: WireFormat,
}

impl Unmarshaler {
    pub fn new(format: WireFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Read the arguments following the function name.
    pub fn unmarshal(&self, sig: &FunctionSignature, data: &[u8]) -> Result<UnmarshaledCall> {
        let mut reader = self.format.reader(data);
        let mut args = Vec::with_capacity(sig.params().len());
        let mut pending = Vec::new();

        for (index, param) in sig.params().iter().enumerate() {
            match param {
                ValueType::Scalar(ty) => args.push(Value::Scalar(reader.read_scalar(*ty)?)),
                ValueType::Pointer(_) => {
                    let element = sig
                        .pointee(index)
                        .ok_or_else(|| OffloadError::UnsupportedType(format!("{:?}", param)))?;
                    args.push(Value::Array(reader.read_array(element)?));
                    pending.push(index);
                }
                other => {
                    return Err(OffloadError::UnsupportedType(format!(
                        "parameter {} of {}: {:?}",
                        index,
                        sig.name(),
                        other
                    )))
                }
            }
        }
        reader.finish()?;

        for &index in &pending {
            let sent = match &args[index] {
                Value::Array(buffer) => buffer.len() as i64,
                _ => continue,
            };
            let declared = args.get(index + 1).and_then(Value::as_i64);
            if declared != Some(sent) {
                return Err(OffloadError::protocol(format!(
                    "array argument {} of {} carries {} elements but its count is {:?}",
                    index,
                    sig.name(),
                    sent,
                    declared
                )));
            }
        }

        Ok(UnmarshaledCall { args, pending })
    }

    /// Encode the reply: execution time, every pending buffer, return value.
    ///
    /// Consumes the arguments; their buffers are released once encoded.
    pub fn remarshal_results(
        &self,
        sig: &FunctionSignature,
        ret: Value,
        mut call: UnmarshaledCall,
        exec_micros: i64,
    ) -> Result<Vec<u8>> {
        let mut writer = self.format.writer();
        writer.write_exec_time(exec_micros);

        for &index in &call.pending {
            let element = sig
                .pointee(index)
                .ok_or_else(|| {
                    OffloadError::protocol(format!("argument {} is not a pointer", index))
                })?;
            let buffer = call
                .args
                .get_mut(index)
                .and_then(Value::array_mut)
                .ok_or_else(|| OffloadError::Backend {
                    function: sig.name().to_string(),
                    message: format!("array argument {} was replaced", index),
                })?;
            let len = buffer.len();
            writer.write_array(element, &buffer.view_mut(), len);
        }

        if let Some(ty) = sig.ret_scalar() {
            let value = ret.as_scalar().ok_or_else(|| OffloadError::Backend {
                function: sig.name().to_string(),
                message: format!("expected a {} return value, got {:?}", ty, ret),
            })?;
            writer.write_scalar(&value.coerce(ty)?);
        }

        Ok(writer.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::Marshaler;
    use crate::signature::SignatureCodec;
    use crate::types::{Arg, ArrayBuffer, Scalar};

    #[test]
    fn test_unmarshal_add() {
        let sig = SignatureCodec::decode("5;32:add:5;32:5;32").unwrap();
        let call = Unmarshaler::new(WireFormat::HexText)
            .unmarshal(&sig, b":3:4")
            .unwrap();
        assert_eq!(
            call.args,
            vec![Value::Scalar(Scalar::i32(3)), Value::Scalar(Scalar::i32(4))]
        );
        assert!(call.pending.is_empty());
    }

    #[test]
    fn test_unmarshal_scale_allocates_buffer() {
        let sig = SignatureCodec::decode("0:scale:9;2:5;32").unwrap();
        let call = Unmarshaler::new(WireFormat::HexText)
            .unmarshal(&sig, b":3;0x1p+0;0x1p+1;0x1.8p+1:3")
            .unwrap();
        assert_eq!(call.pending, vec![0]);
        assert_eq!(call.args[0], Value::Array(ArrayBuffer::F64(vec![1.0, 2.0, 3.0])));
    }

    #[test]
    fn test_count_disagreeing_with_array_rejected() {
        let sig = SignatureCodec::decode("0:scale:9;2:5;32").unwrap();
        let err = Unmarshaler::new(WireFormat::HexText)
            .unmarshal(&sig, b":1;0x1p+0:2")
            .unwrap_err();
        assert!(matches!(err, OffloadError::Protocol { .. }));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let sig = SignatureCodec::decode("5;32:add:5;32:5;32").unwrap();
        assert!(Unmarshaler::new(WireFormat::HexText)
            .unmarshal(&sig, b":3:4:5")
            .is_err());
    }

    #[test]
    fn test_void_reply_has_no_return_field() {
        let sig = SignatureCodec::decode("0:scale:9;2:5;32").unwrap();
        let unmarshaler = Unmarshaler::new(WireFormat::HexText);
        let mut call = unmarshaler
            .unmarshal(&sig, b":2;0x1p+0;0x1p+1:2")
            .unwrap();
        for v in call.args[0].array_mut().unwrap().as_f64_mut().unwrap() {
            *v *= 2.0;
        }
        let reply = unmarshaler
            .remarshal_results(&sig, Value::Void, call, 5)
            .unwrap();
        assert_eq!(reply, b";5:2;0x1p+1;0x1p+2");
    }

    #[test]
    fn test_full_roundtrip_both_formats() {
        let sig = SignatureCodec::decode("2:axpy:2:9;2:5;32:9;2:5;32").unwrap();
        for format in [WireFormat::HexText, WireFormat::NativeBinary] {
            let marshaler = Marshaler::new(format);
            let unmarshaler = Unmarshaler::new(format);

            let mut x = vec![1.0f64, 2.0, 3.0];
            let mut y = vec![10.0f64, 20.0, 30.0];
            let mut args = [
                Arg::scalar(2.0),
                Arg::array(&mut x),
                Arg::count(3),
                Arg::array(&mut y),
                Arg::count(3),
            ];
            let sent = marshaler.marshal(&sig, &args).unwrap();

            let (name, rest) = format.split_call(&sent.payload).unwrap();
            assert_eq!(name, "axpy");
            let mut call = unmarshaler.unmarshal(&sig, rest).unwrap();
            assert_eq!(call.pending, vec![1, 3]);

            let a = call.args[0].as_f64().unwrap();
            let xs = call.args[1].array_mut().unwrap().as_f64_mut().unwrap().to_vec();
            let ys = call.args[3].array_mut().unwrap().as_f64_mut().unwrap();
            for (y, x) in ys.iter_mut().zip(&xs) {
                *y += a * x;
            }
            let total: f64 = ys.iter().sum();

            let reply = unmarshaler
                .remarshal_results(&sig, Value::Scalar(Scalar::Double(total)), call, 7)
                .unwrap();
            let result = marshaler
                .apply_reply(&sig, &mut args, &sent.pending, &reply)
                .unwrap();
            assert_eq!(result.exec_micros, 7);
            assert_eq!(result.value, Some(Scalar::Double(72.0)));
            drop(args);
            assert_eq!(x, vec![1.0, 2.0, 3.0]);
            assert_eq!(y, vec![12.0, 24.0, 36.0]);
        }
    }

    #[test]
    fn test_missing_return_value_is_backend_error() {
        let sig = SignatureCodec::decode("5;32:add:5;32:5;32").unwrap();
        let unmarshaler = Unmarshaler::new(WireFormat::HexText);
        let call = unmarshaler.unmarshal(&sig, b":1:2").unwrap();
        let err = unmarshaler
            .remarshal_results(&sig, Value::Void, call, 0)
            .unwrap_err();
        assert!(matches!(err, OffloadError::Backend { .. }));
    }
}
