//! Built-in backend over a table of Rust functions.
//!
//! Module text lists the functions a module exports, one signature token
//! per line; lines starting with `;` are comments:
//!
//! ```text
//! ; module kernels
//! 5;32:add:5;32:5;32
//! 0:scale:9;2:5;32
//! ```
//!
//! Verification accepts a module only if every listed function exists in
//! the table with exactly the listed signature.

use super::{Backend, FunctionHandle, ModuleLoader};
use crate::error::{OffloadError, Result};
use crate::signature::{FunctionSignature, SignatureCodec};
use crate::types::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Body of a natively registered function.
pub type NativeFn = Arc<dyn Fn(&mut [Value]) -> Result<Value> + Send + Sync>;

#[derive(Clone)]
struct Entry {
    signature: Arc<FunctionSignature>,
    body: NativeFn,
}

/// Registry of functions a module may export.
#[derive(Clone, Default)]
pub struct NativeFunctionTable {
    functions: HashMap<String, Entry>,
}

impl std::fmt::Debug for NativeFunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("NativeFunctionTable")
            .field("functions", &names)
            .finish()
    }
}

impl NativeFunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `body` under the signature spelled by `token`.
    pub fn register<F>(&mut self, token: &str, body: F) -> Result<()>
    where
        F: Fn(&mut [Value]) -> Result<Value> + Send + Sync + 'static,
    {
        let signature = SignatureCodec::decode(token)?;
        self.functions.insert(
            signature.name().to_string(),
            Entry {
                signature: Arc::new(signature),
                body: Arc::new(body),
            },
        );
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<F>(mut self, token: &str, body: F) -> Result<Self>
    where
        F: Fn(&mut [Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(token, body)?;
        Ok(self)
    }

    pub fn signature(&self, name: &str) -> Option<&FunctionSignature> {
        self.functions.get(name).map(|e| e.signature.as_ref())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Module text exporting `names`, in the given order.
    pub fn module_text(&self, module_name: &str, names: &[&str]) -> Result<String> {
        let mut text = format!("; module {}\n", module_name);
        for name in names {
            let sig = self
                .signature(name)
                .ok_or_else(|| OffloadError::FunctionNotFound(name.to_string()))?;
            text.push_str(&sig.token());
            text.push('\n');
        }
        Ok(text)
    }
}

/// Verified list of exported functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeModule {
    exports: Vec<Arc<FunctionSignature>>,
}

impl NativeModule {
    pub fn exports(&self) -> impl Iterator<Item = &FunctionSignature> {
        self.exports.iter().map(|s| s.as_ref())
    }
}

impl ModuleLoader for NativeFunctionTable {
    type Module = NativeModule;

    fn optimize(&self, module_text: &str) -> Result<NativeModule> {
        let mut exports: Vec<Arc<FunctionSignature>> = Vec::new();

        for (line_no, line) in module_text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            let declared = SignatureCodec::decode(line).map_err(|e| OffloadError::ModuleRejected {
                message: format!("line {}: {}", line_no + 1, e),
            })?;
            let entry = self.functions.get(declared.name()).ok_or_else(|| {
                OffloadError::ModuleRejected {
                    message: format!("line {}: no body for {}", line_no + 1, declared.name()),
                }
            })?;
            if *entry.signature != declared {
                return Err(OffloadError::ModuleRejected {
                    message: format!(
                        "line {}: {} is declared as {} but implemented as {}",
                        line_no + 1,
                        declared.name(),
                        declared,
                        entry.signature
                    ),
                });
            }
            if exports.iter().any(|s| s.name() == declared.name()) {
                return Err(OffloadError::ModuleRejected {
                    message: format!("line {}: {} exported twice", line_no + 1, declared.name()),
                });
            }
            exports.push(entry.signature.clone());
        }

        debug!("Verified module exporting {} functions", exports.len());
        Ok(NativeModule { exports })
    }

    fn init_backend(&self, module: NativeModule) -> Result<Box<dyn Backend>> {
        let mut slots = Vec::with_capacity(module.exports.len());
        for signature in module.exports {
            let entry = self
                .functions
                .get(signature.name())
                .ok_or_else(|| OffloadError::FunctionNotFound(signature.name().to_string()))?;
            slots.push(entry.clone());
        }
        Ok(Box::new(NativeBackend { slots }))
    }
}

/// Backend instance bound to one module.
pub struct NativeBackend {
    slots: Vec<Entry>,
}

impl Backend for NativeBackend {
    fn name(&self) -> &str {
        "native"
    }

    fn lookup(&self, name: &str) -> Option<FunctionHandle> {
        self.slots
            .iter()
            .position(|e| e.signature.name() == name)
            .map(|index| FunctionHandle::new(index, self.slots[index].signature.clone()))
    }

    fn invoke(&mut self, function: &FunctionHandle, args: &mut [Value]) -> Result<Value> {
        let entry = self
            .slots
            .get(function.index())
            .filter(|e| e.signature.name() == function.name())
            .ok_or_else(|| OffloadError::FunctionNotFound(function.name().to_string()))?;
        (entry.body)(args)
    }
}
