//! Runtime offload decision embedded at a call site.
//!
//! A rewritten caller keeps both paths: the original local body and a remote
//! call through an [`OffloadClient`]. The site compares the bytes a remote
//! call would move with the function's profitability score and takes the
//! remote path only when the score covers them.

use crate::client::OffloadClient;
use crate::error::{OffloadError, Result};
use crate::signature::{FunctionSignature, SignatureCodec};
use crate::transport::ClientTransport;
use crate::types::{Arg, Scalar, ScalarType, ValueType};
use std::time::Instant;
use tracing::info;

/// Which body ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPath {
    Remote,
    Local,
}

impl CallPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallPath::Remote => "remote",
            CallPath::Local => "local",
        }
    }
}

impl std::fmt::Display for CallPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of running a decision site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionOutcome {
    pub path: CallPath,
    /// Return value, `None` for void functions.
    pub value: Option<Scalar>,
    /// Server execution time; `None` on the local path.
    pub exec_micros: Option<i64>,
    /// Wall time of the whole call as seen by the caller.
    pub call_micros: i64,
}

/// One offloadable call site.
#[derive(Debug, Clone)]
pub struct OffloadDecisionSite {
    signature: FunctionSignature,
    token: String,
    score: u64,
}

impl OffloadDecisionSite {
    pub fn new(token: &str, score: u64) -> Result<Self> {
        Ok(Self {
            signature: SignatureCodec::decode(token)?,
            token: token.to_string(),
            score,
        })
    }

    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn score(&self) -> u64 {
        self.score
    }

    /// Bytes a remote call moves for `args`.
    ///
    /// Return value plus every scalar parameter, plus every array twice (it
    /// travels out and back). The pointer itself counts for nothing.
    pub fn argument_bytes(&self, args: &[Arg<'_>]) -> Result<u64> {
        let params = self.signature.params();
        if args.len() != params.len() {
            return Err(OffloadError::argument(format!(
                "{} takes {} arguments, {} given",
                self.signature.name(),
                params.len(),
                args.len()
            )));
        }

        let mut total = self
            .signature
            .ret_scalar()
            .map(scalar_bytes)
            .unwrap_or(0);

        for (index, param) in params.iter().enumerate() {
            let bytes = match param {
                ValueType::Scalar(ty) => scalar_bytes(*ty),
                ValueType::Pointer(_) => {
                    let element = self
                        .signature
                        .pointee(index)
                        .ok_or_else(|| OffloadError::UnsupportedType(param_name(param)))?;
                    let count = args
                        .get(index + 1)
                        .and_then(Arg::as_i64)
                        .ok_or(OffloadError::MissingElementCount { index })?;
                    let count = u64::try_from(count).unwrap_or(0);
                    scalar_bytes(element).saturating_mul(2).saturating_mul(count)
                }
                other => return Err(OffloadError::UnsupportedType(param_name(other))),
            };
            total = total.saturating_add(bytes);
        }
        Ok(total)
    }

    /// True if the remote path pays off for `args`.
    pub fn should_offload(&self, args: &[Arg<'_>]) -> Result<bool> {
        let bytes = self.argument_bytes(args)?;
        let offload = self.score >= bytes;
        info!(
            "{}: {} bytes against score {}, running {}",
            self.signature.name(),
            bytes,
            self.score,
            if offload { CallPath::Remote } else { CallPath::Local }
        );
        Ok(offload)
    }

    /// Run the call on whichever side the decision picks.
    ///
    /// `local` is the original body; it receives the same arguments and
    /// returns the function's value.
    pub async fn run<T, F>(
        &self,
        client: &mut OffloadClient<T>,
        args: &mut [Arg<'_>],
        local: F,
    ) -> Result<DecisionOutcome>
    where
        T: ClientTransport,
        F: FnOnce(&mut [Arg<'_>]) -> Option<Scalar>,
    {
        let start = Instant::now();
        if self.should_offload(args)? {
            let reply = client.call(&self.token, args).await?;
            Ok(DecisionOutcome {
                path: CallPath::Remote,
                value: reply.value,
                exec_micros: Some(reply.exec_micros),
                call_micros: micros_since(start),
            })
        } else {
            let value = local(args);
            Ok(DecisionOutcome {
                path: CallPath::Local,
                value,
                exec_micros: None,
                call_micros: micros_since(start),
            })
        }
    }
}

/// Bytes of one value, by bit width.
fn scalar_bytes(ty: ScalarType) -> u64 {
    u64::from(ty.bit_width() / 8)
}

fn param_name(param: &ValueType) -> String {
    format!("parameter type {:?}", param)
}

fn micros_since(start: Instant) -> i64 {
    start.elapsed().as_micros().min(i64::MAX as u128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::kernels;

    #[test]
    fn test_argument_bytes_scalars() {
        let site = OffloadDecisionSite::new(kernels::ADD, 100).unwrap();
        // 4 bytes return + 2 * 4 bytes arguments.
        assert_eq!(site.argument_bytes(&[Arg::scalar(1), Arg::scalar(2)]).unwrap(), 12);
    }

    #[test]
    fn test_argument_bytes_array_counts_twice() {
        let site = OffloadDecisionSite::new(kernels::SCALE, 0).unwrap();
        let mut data = vec![0.0f64; 10];
        let args = [Arg::array(&mut data), Arg::count(10)];
        // 8 * 2 * 10 for the array plus 4 for the count.
        assert_eq!(site.argument_bytes(&args).unwrap(), 164);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let site = OffloadDecisionSite::new(kernels::ADD, 12).unwrap();
        assert!(site.should_offload(&[Arg::scalar(1), Arg::scalar(2)]).unwrap());
        let site = OffloadDecisionSite::new(kernels::ADD, 11).unwrap();
        assert!(!site.should_offload(&[Arg::scalar(1), Arg::scalar(2)]).unwrap());
    }

    #[test]
    fn test_argument_bytes_saturate() {
        let site = OffloadDecisionSite::new("0:wide:9;2:5;64:9;2:5;64", u64::MAX).unwrap();
        let mut a = vec![0.0f64; 1];
        let mut b = vec![0.0f64; 1];
        let args = [
            Arg::array(&mut a),
            Arg::scalar(i64::MAX),
            Arg::array(&mut b),
            Arg::scalar(i64::MAX),
        ];
        assert_eq!(site.argument_bytes(&args).unwrap(), u64::MAX);
        assert!(site.should_offload(&args).unwrap());
    }

    #[test]
    fn test_argument_count_mismatch() {
        let site = OffloadDecisionSite::new(kernels::ADD, 0).unwrap();
        assert!(site.argument_bytes(&[Arg::scalar(1)]).is_err());
    }
}
