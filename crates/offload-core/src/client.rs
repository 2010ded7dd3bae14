//! Client end of an offload session.
//!
//! An [`OffloadClient`] owns one transport and one module. Calls are
//! strictly sequential: `call` takes `&mut self`, so a session can never have
//! two calls in flight.

use crate::error::{OffloadError, Result};
use crate::marshal::{CallReply, Marshaler};
use crate::signature::{FunctionSignature, SignatureCodec};
use crate::transport::{ClientTransport, ReadySignal};
use crate::types::Arg;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Session with an offload server.
pub struct OffloadClient<T> {
    transport: T,
    marshaler: Marshaler,
    signatures: HashMap<String, Arc<FunctionSignature>>,
    ready: Option<ReadySignal>,
    last_exec_micros: Option<i64>,
    calls_made: u64,
}

impl<T: ClientTransport> OffloadClient<T> {
    pub fn new(transport: T) -> Self {
        let marshaler = Marshaler::new(transport.wire_format());
        Self {
            transport,
            marshaler,
            signatures: HashMap::new(),
            ready: None,
            last_exec_micros: None,
            calls_made: 0,
        }
    }

    /// Hand the module to the server and wait for its ready signal.
    pub async fn initialise(&mut self, module_text: &str) -> Result<ReadySignal> {
        if self.ready.is_some() {
            return Err(OffloadError::protocol("session already initialised"));
        }
        let ready = self.transport.send_module(module_text).await?;
        info!(
            "Server ready (optimize {}µs, backend init {}µs)",
            ready.optimize_micros, ready.init_micros
        );
        self.ready = Some(ready);
        Ok(ready)
    }

    /// Call the remote function described by `token`.
    ///
    /// Pointer arguments are refreshed from the reply before this returns.
    pub async fn call(&mut self, token: &str, args: &mut [Arg<'_>]) -> Result<CallReply> {
        if self.ready.is_none() {
            return Err(OffloadError::protocol("call before the module was sent"));
        }
        let sig = self.signature(token)?;

        let call = self.marshaler.marshal(&sig, args)?;
        self.transport.send_call(&call.payload).await?;
        let reply = self.transport.receive_reply().await?;
        let reply = self
            .marshaler
            .apply_reply(&sig, args, &call.pending, &reply)?;

        debug!("{} returned after {}µs on the server", sig.name(), reply.exec_micros);
        self.last_exec_micros = Some(reply.exec_micros);
        self.calls_made += 1;
        Ok(reply)
    }

    /// Decoded signature for `token`, decoding each distinct token once.
    fn signature(&mut self, token: &str) -> Result<Arc<FunctionSignature>> {
        if let Some(sig) = self.signatures.get(token) {
            return Ok(sig.clone());
        }
        let sig = Arc::new(SignatureCodec::decode(token)?);
        self.signatures.insert(token.to_string(), sig.clone());
        Ok(sig)
    }

    /// End the session.
    pub async fn close(mut self) -> Result<()> {
        debug!("Closing offload session after {} calls", self.calls_made);
        self.transport.close().await
    }

    pub fn ready_signal(&self) -> Option<ReadySignal> {
        self.ready
    }

    /// Server execution time of the most recent call.
    pub fn last_exec_micros(&self) -> Option<i64> {
        self.last_exec_micros
    }

    pub fn calls_made(&self) -> u64 {
        self.calls_made
    }
}
