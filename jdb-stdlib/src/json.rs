//! `JSON.PARSE$`/`JSON.STRINGIFY$`, grounded on
//! `original_source/source/BuiltinFunctions.cpp`'s `json_to_basic_value`/
//! `basic_to_json_value` helpers, re-expressed against `serde_json` (the
//! teacher's JSON crate of choice, e.g. `graphix-stdlib`'s `netidx_value`
//! interop) rather than `nlohmann::json`.

use crate::common::{arg_string, native, type_mismatch};
use arcstr::ArcStr;
use jdb_vm::{to_display_string, Module, NativeFunction, Registry, Value};
use triomphe::Arc;

pub struct JsonModule;

impl Module for JsonModule {
    fn name(&self) -> &str {
        "json"
    }

    fn functions(&self) -> Vec<NativeFunction> {
        vec![
            native("JSON.PARSE$", 1, |a| {
                let s = arg_string(a, 0)?;
                let parsed: serde_json::Value = serde_json::from_str(&s).map_err(|_| type_mismatch())?;
                Ok(Value::Json(Arc::new(parsed)))
            }),
            native("JSON.STRINGIFY$", 1, |a| {
                let j = basic_to_json(&a[0]);
                Ok(Value::Str(ArcStr::from(j.to_string())))
            }),
        ]
    }
}

/// Every `Value` variant has a JSON rendering; containers recurse,
/// process-local handles stringify.
fn basic_to_json(v: &Value) -> serde_json::Value {
    match v {
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Double(d) => serde_json::json!(d),
        Value::Str(s) => serde_json::Value::String(s.to_string()),
        Value::Array(arr) => serde_json::Value::Array(arr.lock().data.iter().map(basic_to_json).collect()),
        Value::Map(m) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in m.lock().entries.iter() {
                obj.insert(k.to_string(), basic_to_json(v));
            }
            serde_json::Value::Object(obj)
        }
        Value::Json(j) => (**j).clone(),
        other => serde_json::Value::String(to_display_string(other).to_string()),
    }
}

pub fn register(registry: &mut Registry) {
    registry.install(&JsonModule);
}
