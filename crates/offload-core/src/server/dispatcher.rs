//! Per-session function registry and call dispatch.

use crate::backend::{Backend, FunctionHandle};
use crate::error::{OffloadError, Result};
use crate::unmarshal::Unmarshaler;
use crate::wire::WireFormat;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

/// Resolves function names once, then serves calls from the cache.
///
/// A dispatcher is owned by exactly one session, together with its backend;
/// both are dropped when the session ends.
pub struct Dispatcher {
    backend: Box<dyn Backend>,
    cache: HashMap<String, FunctionHandle>,
    unmarshaler: Unmarshaler,
}

impl Dispatcher {
    pub fn new(backend: Box<dyn Backend>, format: WireFormat) -> Self {
        Self {
            backend,
            cache: HashMap::new(),
            unmarshaler: Unmarshaler::new(format),
        }
    }

    /// Resolve `name`, looking it up in the module only the first time.
    pub fn resolve(&mut self, name: &str) -> Result<FunctionHandle> {
        if let Some(handle) = self.cache.get(name) {
            return Ok(handle.clone());
        }
        let handle = self
            .backend
            .lookup(name)
            .ok_or_else(|| OffloadError::FunctionNotFound(name.to_string()))?;
        debug!("Resolved {} in {} backend", handle.signature(), self.backend.name());
        self.cache.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Number of functions resolved so far.
    pub fn cached_functions(&self) -> usize {
        self.cache.len()
    }

    /// Execute one call payload and produce its reply payload.
    pub fn handle_call(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let (name, data) = self.unmarshaler.format().split_call(payload)?;
        let handle = self.resolve(name)?;
        let sig = handle.signature();

        let mut call = self.unmarshaler.unmarshal(sig, data)?;

        let start = Instant::now();
        let ret = self.backend.invoke(&handle, &mut call.args)?;
        let exec_micros = start.elapsed().as_micros().min(i64::MAX as u128) as i64;

        debug!("{} executed in {}µs", name, exec_micros);
        self.unmarshaler
            .remarshal_results(sig, ret, call, exec_micros)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backend", &self.backend.name())
            .field("cached_functions", &self.cache.len())
            .field("format", &self.unmarshaler.format())
            .finish()
    }
}
