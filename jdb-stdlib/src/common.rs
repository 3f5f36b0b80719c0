//! Shared argument-coercion helpers and the native-function builder used
//! by every module in this crate.

use arcstr::ArcStr;
use jdb_compiler::{errors, FunctionInfo, ScriptError};
use jdb_vm::{to_display_string, to_number, NativeFunction, TensorRef, Value};
use std::sync::Arc;

/// Build one native entry: a `FunctionInfo` (fixed arity, or `-1` for
/// variadic) paired with the closure that implements it.
pub fn native<F>(name: &str, arity: i32, f: F) -> NativeFunction
where
    F: Fn(&[Value]) -> Result<Value, ScriptError> + Send + Sync + 'static,
{
    NativeFunction {
        info: FunctionInfo {
            name: ArcStr::from(name),
            arity,
            is_procedure: false,
            is_exported: true,
            is_async: false,
            module_name: None,
            start_bytecode_offset: 0,
            parameter_names: Vec::new(),
        },
        implementation: Arc::new(f),
    }
}

pub fn type_mismatch() -> ScriptError {
    ScriptError::new(errors::TYPE_MISMATCH, 0)
}

pub fn wrong_args() -> ScriptError {
    ScriptError::new(errors::WRONG_ARG_COUNT, 0)
}

pub fn arg_number(args: &[Value], i: usize) -> Result<f64, ScriptError> {
    args.get(i).map(to_number).ok_or_else(wrong_args)
}

pub fn arg_string(args: &[Value], i: usize) -> Result<ArcStr, ScriptError> {
    args.get(i).map(to_display_string).ok_or_else(wrong_args)
}

pub fn arg_tensor(args: &[Value], i: usize) -> Result<TensorRef, ScriptError> {
    match args.get(i) {
        Some(Value::Tensor(t)) => Ok(t.clone()),
        _ => Err(type_mismatch()),
    }
}
