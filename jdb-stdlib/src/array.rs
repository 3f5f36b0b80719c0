//! Array builtins (`SUM`, `TRANSPOSE`, `UBOUND`, `LBOUND`, `RESHAPE`),
//! grounded on `original_source/include/BuiltinFunctions.hpp`'s
//! `builtin_transpose`/`array_sum` declarations and
//! `original_source/source/AIFunctions.cpp`'s `register_func("SUM", -1, ...)`.

use crate::common::{arg_number, native, type_mismatch};
use jdb_vm::{to_number, Module, NativeFunction, Registry, Value};

pub struct ArrayModule;

impl Module for ArrayModule {
    fn name(&self) -> &str {
        "array"
    }

    fn functions(&self) -> Vec<NativeFunction> {
        vec![
            native("SUM", -1, |a| {
                let mut total = 0.0;
                for v in a {
                    match v {
                        Value::Array(arr) => total += arr.lock().data.iter().map(to_number).sum::<f64>(),
                        other => total += to_number(other),
                    }
                }
                Ok(Value::Double(total))
            }),
            native("UBOUND", 1, |a| match &a[0] {
                Value::Array(arr) => {
                    let g = arr.lock();
                    Ok(Value::Integer(*g.shape.first().unwrap_or(&0) as i64 - 1))
                }
                _ => Err(type_mismatch()),
            }),
            native("LBOUND", 1, |_a| Ok(Value::Integer(0))),
            native("TRANSPOSE", 1, |a| match &a[0] {
                Value::Array(arr) => {
                    let g = arr.lock();
                    if g.shape.len() != 2 {
                        return Err(type_mismatch());
                    }
                    let (rows, cols) = (g.shape[0], g.shape[1]);
                    let mut data = vec![Value::Bool(false); rows * cols];
                    for r in 0..rows {
                        for c in 0..cols {
                            data[c * rows + r] = g.data[r * cols + c].clone();
                        }
                    }
                    Ok(Value::array(vec![cols, rows], data))
                }
                _ => Err(type_mismatch()),
            }),
            native("RESHAPE", 2, |a| match &a[0] {
                Value::Array(arr) => {
                    let shape_arr = match &a[1] {
                        Value::Array(s) => s.lock().data.iter().map(|v| to_number(v) as usize).collect::<Vec<_>>(),
                        other => vec![arg_number(std::slice::from_ref(other), 0)? as usize],
                    };
                    let g = arr.lock();
                    let expected: usize = shape_arr.iter().product();
                    if expected != g.data.len() {
                        return Err(type_mismatch());
                    }
                    Ok(Value::array(shape_arr, g.data.clone()))
                }
                _ => Err(type_mismatch()),
            }),
        ]
    }
}

pub fn register(registry: &mut Registry) {
    registry.install(&ArrayModule);
}
