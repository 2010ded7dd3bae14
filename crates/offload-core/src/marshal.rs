//! Client-side marshaling.
//!
//! Turns a signature plus caller arguments into a call payload, remembers
//! which arguments point at caller memory, and writes the reply back into
//! that memory once the server answers.

use crate::error::{OffloadError, Result};
use crate::signature::FunctionSignature;
use crate::types::{Arg, Scalar, ScalarType, ValueType};
use crate::wire::WireFormat;

/// Caller memory to refresh from the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingArrayUpdate {
    /// Index of the pointer argument.
    pub arg_index: usize,
    pub element: ScalarType,
    /// Elements sent, and expected back.
    pub count: usize,
}

/// An encoded call ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarshaledCall {
    pub payload: Vec<u8>,
    pub pending: Vec<PendingArrayUpdate>,
}

/// Decoded reply of one call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallReply {
    /// Server-side execution time of the function body.
    pub exec_micros: i64,
    /// Return value, `None` for void functions.
    pub value: Option<Scalar>,
}

/// Encodes calls and applies replies for one wire format.
#[derive(Debug, Clone, Copy)]
pub struct Marshaler {
    format: WireFormat,
}

impl Marshaler {
    pub fn new(format: WireFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode a call to `sig` with `args` in call-site order.
    ///
    /// Scalars are converted to the declared parameter type. A pointer
    /// argument sends the first `count` elements of its memory, where
    /// `count` is the integer argument that follows it.
    pub fn marshal(&self, sig: &FunctionSignature, args: &[Arg<'_>]) -> Result<MarshaledCall> {
        let params = sig.params();
        if args.len() != params.len() {
            return Err(OffloadError::argument(format!(
                "{} takes {} arguments, {} given",
                sig.name(),
                params.len(),
                args.len()
            )));
        }

        let mut writer = self.format.writer();
        let mut pending = Vec::new();
        writer.write_name(sig.name());

        for (index, (param, arg)) in params.iter().zip(args).enumerate() {
            match (param, arg) {
                (ValueType::Scalar(ty), Arg::Scalar(value)) => {
                    writer.write_scalar(&value.coerce(*ty)?);
                }
                (ValueType::Pointer(_), Arg::Array(memory)) => {
                    let element = sig
                        .pointee(index)
                        .ok_or_else(|| OffloadError::UnsupportedType(format!("{:?}", param)))?;
                    if !memory.holds(element) {
                        return Err(OffloadError::argument(format!(
                            "argument {} of {} does not hold {} elements",
                            index,
                            sig.name(),
                            element
                        )));
                    }
                    let count = element_count(sig, args, index)?;
                    if count > memory.len() {
                        return Err(OffloadError::argument(format!(
                            "argument {} of {} claims {} elements but holds {}",
                            index,
                            sig.name(),
                            count,
                            memory.len()
                        )));
                    }
                    writer.write_array(element, memory, count);
                    pending.push(PendingArrayUpdate {
                        arg_index: index,
                        element,
                        count,
                    });
                }
                (ValueType::Pointer(_), Arg::Scalar(_)) => {
                    return Err(OffloadError::argument(format!(
                        "argument {} of {} must be an array",
                        index,
                        sig.name()
                    )))
                }
                (_, _) => {
                    return Err(OffloadError::argument(format!(
                        "argument {} of {} must be a scalar",
                        index,
                        sig.name()
                    )))
                }
            }
        }

        Ok(MarshaledCall {
            payload: writer.into_bytes(),
            pending,
        })
    }

    /// Decode a reply, overwriting caller memory for every pending update.
    pub fn apply_reply(
        &self,
        sig: &FunctionSignature,
        args: &mut [Arg<'_>],
        pending: &[PendingArrayUpdate],
        reply: &[u8],
    ) -> Result<CallReply> {
        let mut reader = self.format.reader(reply);
        let exec_micros = reader.read_exec_time()?;

        for update in pending {
            match args.get_mut(update.arg_index) {
                Some(Arg::Array(memory)) => {
                    reader.read_array_into(update.element, memory, update.count)?
                }
                _ => {
                    return Err(OffloadError::argument(format!(
                        "pending update for argument {} has no caller memory",
                        update.arg_index
                    )))
                }
            }
        }

        let value = match sig.ret_scalar() {
            Some(ty) => Some(reader.read_scalar(ty)?),
            None => None,
        };
        reader.finish()?;

        Ok(CallReply { exec_micros, value })
    }
}

/// Value of the count argument following the pointer at `index`.
fn element_count(sig: &FunctionSignature, args: &[Arg<'_>], index: usize) -> Result<usize> {
    let count = match args.get(index + 1) {
        Some(Arg::Scalar(value)) => value.as_i64(),
        _ => None,
    }
    .ok_or(OffloadError::MissingElementCount { index })?;

    usize::try_from(count).map_err(|_| {
        OffloadError::argument(format!(
            "negative element count {} for argument {} of {}",
            count,
            index,
            sig.name()
        ))
    })
}
