//! Execution backends.
//!
//! The runtime only needs two things from a backend strategy: turn module
//! text into something executable (`ModuleLoader`), and run a resolved
//! function over a list of values (`Backend`). How the body actually runs
//! is the strategy's business.

pub mod kernels;
mod native;

pub use native::{NativeBackend, NativeFn, NativeFunctionTable, NativeModule};

use crate::error::Result;
use crate::signature::FunctionSignature;
use crate::types::Value;
use std::sync::Arc;

/// A function resolved inside a backend.
///
/// Carries the declared signature, which is authoritative when
/// unmarshaling the arguments of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionHandle {
    index: usize,
    signature: Arc<FunctionSignature>,
}

impl FunctionHandle {
    pub fn new(index: usize, signature: Arc<FunctionSignature>) -> Self {
        Self { index, signature }
    }

    /// Backend-specific slot of the function.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }

    pub fn name(&self) -> &str {
        self.signature.name()
    }
}

/// An initialised backend owned by exactly one session.
pub trait Backend: Send {
    /// Strategy name for logging.
    fn name(&self) -> &str;

    /// Resolve an exported function by name.
    fn lookup(&self, name: &str) -> Option<FunctionHandle>;

    /// Run `function` over `args`; pointer arguments may be mutated in place.
    fn invoke(&mut self, function: &FunctionHandle, args: &mut [Value]) -> Result<Value>;
}

/// Turns module text into a backend, in two separately timed steps.
pub trait ModuleLoader: Send + Sync + 'static {
    type Module: Send + 'static;

    /// Parse, verify and optimize the module text.
    fn optimize(&self, module_text: &str) -> Result<Self::Module>;

    /// Prepare a backend instance for an optimized module.
    fn init_backend(&self, module: Self::Module) -> Result<Box<dyn Backend>>;
}
