//! Math and scalar-conversion builtins, grounded on the keyword catalog in
//! `original_source/source/TextEditor.cpp` (`MID$, LEN, ASC, CHR$, INSTR,
//! LCASE$, UCASE$, TRIM$, INKEY$, VAL, STR$, SIN, COS, TAN, SQR, RND, TICK`)
//! and the teacher's one-module-per-concern split (`graphix-stdlib/src/core.rs`).

use crate::common::{arg_number, native, type_mismatch};
use arcstr::ArcStr;
use jdb_vm::{to_number, Module, NativeFunction, Registry, Value};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct CoreModule;

impl Module for CoreModule {
    fn name(&self) -> &str {
        "core"
    }

    fn functions(&self) -> Vec<NativeFunction> {
        vec![
            native("ABS", 1, |a| Ok(Value::Double(arg_number(a, 0)?.abs()))),
            native("SQR", 1, |a| Ok(Value::Double(arg_number(a, 0)?.sqrt()))),
            native("SIN", 1, |a| Ok(Value::Double(arg_number(a, 0)?.sin()))),
            native("COS", 1, |a| Ok(Value::Double(arg_number(a, 0)?.cos()))),
            native("TAN", 1, |a| Ok(Value::Double(arg_number(a, 0)?.tan()))),
            native("ATN", 1, |a| Ok(Value::Double(arg_number(a, 0)?.atan()))),
            native("LOG", 1, |a| Ok(Value::Double(arg_number(a, 0)?.ln()))),
            native("EXP", 1, |a| Ok(Value::Double(arg_number(a, 0)?.exp()))),
            native("INT", 1, |a| Ok(Value::Integer(arg_number(a, 0)?.floor() as i64))),
            native("SGN", 1, |a| {
                let v = arg_number(a, 0)?;
                Ok(Value::Integer(if v > 0.0 {
                    1
                } else if v < 0.0 {
                    -1
                } else {
                    0
                }))
            }),
            native("RND", -1, |a| {
                use rand::Rng;
                let mut rng = rand::thread_rng();
                match a.first() {
                    None => Ok(Value::Double(rng.gen_range(0.0..1.0))),
                    Some(_) => {
                        let max = arg_number(a, 0)? as i64;
                        Ok(Value::Integer(rng.gen_range(0..max.max(1))))
                    }
                }
            }),
            native("TICK", 0, |_| {
                let millis = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
                Ok(Value::Integer(millis as i64))
            }),
            native("VAL", 1, |a| Ok(Value::Double(arg_number(a, 0)?))),
            native("STR$", 1, |a| Ok(Value::Str(ArcStr::from(jdb_vm::to_display_string(&a[0]).to_string())))),
            native("CINT", 1, |a| Ok(Value::Integer(arg_number(a, 0)?.round() as i64))),
            native("CDBL", 1, |a| Ok(Value::Double(arg_number(a, 0)?))),
            native("MIN", -1, |a| {
                if a.is_empty() {
                    return Err(type_mismatch());
                }
                let m = a.iter().map(to_number).fold(f64::INFINITY, f64::min);
                Ok(Value::Double(m))
            }),
            native("MAX", -1, |a| {
                if a.is_empty() {
                    return Err(type_mismatch());
                }
                let m = a.iter().map(to_number).fold(f64::NEG_INFINITY, f64::max);
                Ok(Value::Double(m))
            }),
            native("TYPE$", 1, |a| Ok(Value::Str(ArcStr::from(a[0].type_name())))),
            native("DATE$", 0, |_| {
                let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
                Ok(Value::DateTime(secs as i64))
            }),
            // A blocking SLEEP would stall every cooperative task, not
            // just the caller (§4.9); a real timed suspension needs a
            // VM-level primitive rather than a plain native function, so
            // this returns immediately and relies on the scheduler's
            // one-line-per-tick round-robin for interleaving.
            native("SLEEP", 1, |a| {
                let _ = arg_number(a, 0)?;
                Ok(Value::Bool(true))
            }),
            native("LEN", 1, |a| match &a[0] {
                Value::Str(s) => Ok(Value::Integer(s.chars().count() as i64)),
                Value::Array(arr) => Ok(Value::Integer(arr.lock().len() as i64)),
                Value::Map(m) => Ok(Value::Integer(m.lock().entries.len() as i64)),
                _ => Err(type_mismatch()),
            }),
        ]
    }
}

pub fn register(registry: &mut Registry) {
    registry.install(&CoreModule);
}
