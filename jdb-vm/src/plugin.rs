//! Native module/plugin interface (§4.11). The original ABI passes
//! `FunctionInfo` records across a C boundary with out-parameter
//! pointers; SPEC_FULL's Rust-native supplement expresses the same
//! contract as a trait a plugin crate implements and an in-process
//! closure registry, dropping the pointer ABI entirely.

use crate::value::Value;
use jdb_compiler::{FunctionInfo, ScriptError};
use std::sync::Arc;

pub type NativeImpl = Arc<dyn Fn(&[Value]) -> Result<Value, ScriptError> + Send + Sync>;

pub struct NativeFunction {
    pub info: FunctionInfo,
    pub implementation: NativeImpl,
}

/// A native plugin registers one or more `FunctionInfo` + implementation
/// pairs into the VM's function table (§4.11).
pub trait Module: Send + Sync {
    fn name(&self) -> &str;
    fn functions(&self) -> Vec<NativeFunction>;
}

/// Accumulates native functions from one or more `Module`s before they're
/// installed into a `Vm`.
#[derive(Default)]
pub struct Registry {
    pub entries: Vec<NativeFunction>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self, module: &dyn Module) {
        self.entries.extend(module.functions());
    }
}
